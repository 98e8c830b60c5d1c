//! Environment overrides on top of the TOML file.
//!
//! Kept in its own test binary: it mutates the process environment. The
//! other test here only checks keys the override does not touch.

use std::io::Write;

use antenna_range::config::RangeConfig;

#[test]
fn test_environment_overrides_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("range.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(
        file,
        r#"
[scan]
pause_poll_ms = 50
vna_channel = "CHAN1"

[vna]
host = "10.0.0.7"
"#
    )
    .unwrap();

    std::env::set_var("ANTENNA_RANGE_SCAN__PAUSE_POLL_MS", "20");
    std::env::set_var("ANTENNA_RANGE_VNA__HOST", "vna.lab");
    let config = RangeConfig::load_from(&path);
    std::env::remove_var("ANTENNA_RANGE_SCAN__PAUSE_POLL_MS");
    std::env::remove_var("ANTENNA_RANGE_VNA__HOST");

    let config = config.unwrap();
    assert_eq!(config.scan.pause_poll_ms, 20);
    assert_eq!(config.vna.host, "vna.lab");
    assert_eq!(config.scan.vna_channel, "CHAN1");
    assert!(config.validate().is_ok());
}

#[test]
fn test_shipped_config_is_valid() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("config/range.toml");
    let config = RangeConfig::load_from(&path).unwrap();
    config.validate().unwrap();
    assert_eq!(config.vna.gpib_address, Some(16));
    assert!(!config.rotation_stage.enabled);
}
