//! GRBL two-axis positioner driver
//!
//! Protocol Overview:
//! - Format: G-code lines terminated by `\n`, answered with `ok` or `error:<n>`
//! - Real-time status: a bare `?` byte, answered with
//!   `<State|WPos:x,y,z,a,b,c|...>` on one line
//! - Axis mapping: X carries phi, Y carries theta, A is the spare rotary axis
//!
//! # Example Usage
//!
//! ```no_run
//! use antenna_range::hardware::grbl::GrblPositioner;
//! use antenna_range::hardware::Positioner;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut positioner = GrblPositioner::open("/dev/ttyUSB0", 115200).await?;
//!     positioner.move_xy(90.0, 45.0).await?;
//!     positioner.wait_for_idle(Duration::from_secs(60)).await?;
//!     println!("{:?}", positioner.query_position().await?);
//!     Ok(())
//! }
//! ```

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, instrument};

use super::capabilities::{HomeAxes, Positioner};
use super::DynSerial;

/// Interval between `?` polls while waiting for motion to stop.
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Driver for a GRBL controller on a serial byte stream.
pub struct GrblPositioner {
    port: BufReader<DynSerial>,
    /// Timeout for a single reply line
    timeout: Duration,
    label: String,
}

impl GrblPositioner {
    /// Wrap an already-open stream.
    pub fn from_stream(stream: DynSerial, label: impl Into<String>) -> Self {
        Self {
            port: BufReader::new(stream),
            timeout: Duration::from_secs(2),
            label: label.into(),
        }
    }

    /// Open the serial port and give the controller time to boot.
    ///
    /// # Errors
    /// Returns error if the serial port cannot be opened
    #[cfg(feature = "instrument_serial")]
    pub async fn open(port_path: &str, baud_rate: u32) -> Result<Self> {
        let stream = super::open_serial(port_path, baud_rate).await?;
        // Opening the port resets most boards.
        sleep(Duration::from_millis(500)).await;
        Ok(Self::from_stream(stream, format!("GRBL@{port_path}")))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let read = timeout(self.timeout, self.port.read_line(&mut line))
            .await
            .map_err(|_| anyhow!("GRBL reply timeout"))?
            .context("Failed to read GRBL reply")?;
        if read == 0 {
            bail!("GRBL connection closed");
        }
        Ok(line.trim().to_string())
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        let port = self.port.get_mut();
        port.write_all(bytes)
            .await
            .context("Failed to write to GRBL")?;
        port.flush().await.context("Failed to flush GRBL port")
    }

    /// Send one G-code line and wait for `ok`.
    async fn send_line(&mut self, command: &str) -> Result<()> {
        debug!("GRBL write: {:?}", command);
        self.write_raw(format!("{command}\n").as_bytes()).await?;
        loop {
            let reply = self.read_line().await?;
            if reply == "ok" {
                return Ok(());
            }
            if let Some(code) = reply.strip_prefix("error:") {
                bail!("GRBL rejected '{}' (error {})", command, code.trim());
            }
            if let Some(alarm) = reply.strip_prefix("ALARM:") {
                bail!("GRBL alarm {} after '{}'", alarm.trim(), command);
            }
            // Status reports and banners can interleave with the ack.
            debug!("GRBL unsolicited: {:?}", reply);
        }
    }

    /// Request one status report and return it without the angle brackets.
    async fn status_report(&mut self) -> Result<String> {
        self.write_raw(b"?").await?;
        loop {
            let reply = self.read_line().await?;
            if reply.starts_with('<') {
                return Ok(reply
                    .trim_start_matches('<')
                    .trim_end_matches('>')
                    .to_string());
            }
            debug!("GRBL skipped while polling: {:?}", reply);
        }
    }
}

/// Machine state field of a status report (`Idle`, `Run`, `Home`, ...).
pub fn report_state(report: &str) -> &str {
    report.split('|').next().unwrap_or_default()
}

/// Extract six coordinates from the `WPos:` or `MPos:` field of a report.
pub fn parse_position(report: &str) -> Result<[f64; 6]> {
    let body = report.trim().trim_start_matches('<').trim_end_matches('>');
    let field = body
        .split('|')
        .find_map(|f| f.strip_prefix("WPos:").or_else(|| f.strip_prefix("MPos:")))
        .ok_or_else(|| anyhow!("No position data in response: {}", body))?;

    let parts: Vec<&str> = field.split(',').collect();
    if parts.len() < 6 {
        bail!("Expected 6 coords, got {} in {}", parts.len(), body);
    }
    let mut coords = [0.0; 6];
    for (slot, part) in coords.iter_mut().zip(&parts) {
        *slot = part
            .trim()
            .parse()
            .with_context(|| format!("Non-numeric coords in {}", body))?;
    }
    Ok(coords)
}

fn homing_command(axes: HomeAxes) -> &'static str {
    match axes {
        HomeAxes::X => "$HX",
        HomeAxes::Y => "$HY",
        // The rotary A axis is wired to the Z homing input.
        HomeAxes::Z | HomeAxes::A => "$HZ",
        HomeAxes::All => "$H",
    }
}

#[async_trait]
impl Positioner for GrblPositioner {
    #[instrument(skip(self), err)]
    async fn move_to(&mut self, x: f64, y: f64, z: f64, a: f64) -> Result<()> {
        self.send_line(&format!("G0 X{x} Y{y} Z{z} A{a}")).await
    }

    async fn wait_for_idle(&mut self, limit: Duration) -> Result<()> {
        let deadline = Instant::now() + limit;
        loop {
            let report = self.status_report().await?;
            if report_state(&report) == "Idle" {
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!("Timeout waiting for Idle (last state: {})", report_state(&report));
            }
            sleep(STATUS_POLL_INTERVAL).await;
        }
    }

    #[instrument(skip(self), err)]
    async fn home(&mut self, axes: HomeAxes) -> Result<()> {
        self.send_line(homing_command(axes)).await
    }

    async fn query_position(&mut self) -> Result<[f64; 6]> {
        let report = self.status_report().await?;
        parse_position(&report)
    }

    #[instrument(skip(self), err)]
    async fn save_origin(&mut self) -> Result<()> {
        self.send_line("G10 L20 P1 X0 Y0 A0").await
    }

    fn identity(&self) -> Option<String> {
        Some(self.label.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, DuplexStream};

    async fn expect_bytes(host: &mut DuplexStream, expected: &str) {
        let mut buf = vec![0u8; expected.len()];
        host.read_exact(&mut buf).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&buf), expected);
    }

    #[test]
    fn test_parse_position() {
        let coords = parse_position("<Idle|WPos:90.000,45.500,0.000,0.000,0.000,0.000|FS:0,0>")
            .unwrap();
        assert_eq!(coords, [90.0, 45.5, 0.0, 0.0, 0.0, 0.0]);
        assert!(parse_position("<Idle|MPos:1,2,3|FS:0,0>").is_err());
        assert!(parse_position("<Idle|FS:0,0>").is_err());
        assert!(parse_position("<Idle|WPos:a,b,c,d,e,f>").is_err());
        assert_eq!(report_state("Run|WPos:0,0,0,0,0,0"), "Run");
    }

    #[tokio::test]
    async fn test_move_waits_for_ok() {
        let (mut host, device) = tokio::io::duplex(256);
        let mut grbl = GrblPositioner::from_stream(Box::new(device), "test");

        let fake = tokio::spawn(async move {
            expect_bytes(&mut host, "G0 X90 Y45.5 Z0 A0\n").await;
            host.write_all(b"ok\r\n").await.unwrap();
            host
        });
        grbl.move_xy(90.0, 45.5).await.unwrap();
        fake.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_reply_fails_command() {
        let (mut host, device) = tokio::io::duplex(256);
        let mut grbl = GrblPositioner::from_stream(Box::new(device), "test");

        let fake = tokio::spawn(async move {
            expect_bytes(&mut host, "$H\n").await;
            host.write_all(b"error:9\r\n").await.unwrap();
            host
        });
        let err = grbl.home(HomeAxes::All).await.unwrap_err();
        assert!(err.to_string().contains("error 9"));
        fake.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_idle_polls_status() {
        let (mut host, device) = tokio::io::duplex(256);
        let mut grbl = GrblPositioner::from_stream(Box::new(device), "test");

        let fake = tokio::spawn(async move {
            expect_bytes(&mut host, "?").await;
            host.write_all(b"<Run|WPos:1,0,0,0,0,0>\r\n").await.unwrap();
            expect_bytes(&mut host, "?").await;
            host.write_all(b"<Idle|WPos:2,0,0,0,0,0>\r\n").await.unwrap();
            host
        });
        grbl.wait_for_idle(Duration::from_secs(2)).await.unwrap();
        fake.await.unwrap();
    }

    #[tokio::test]
    async fn test_reply_timeout() {
        let (_host, device) = tokio::io::duplex(64);
        let mut grbl = GrblPositioner::from_stream(Box::new(device), "test")
            .with_timeout(Duration::from_millis(50));
        assert!(grbl.save_origin().await.is_err());
    }
}
