//! Instrument drivers for the antenna range.
//!
//! The scan controller only sees the capability traits in [`capabilities`];
//! concrete drivers live beside them:
//!
//! - [`grbl`]: GRBL G-code positioner (phi on X, theta on Y)
//! - [`scpi`] and [`hp8720`]: network analyzer over TCP or a GPIB-LAN gateway
//! - [`arduino_stage`]: stepper-driven polarization stage
//! - [`mock`]: simulated devices for tests and `--simulate` runs

pub mod arduino_stage;
pub mod capabilities;
pub mod grbl;
pub mod hp8720;
pub mod mock;
pub mod scpi;

pub use capabilities::{
    HomeAxes, NetworkAnalyzer, Positioner, RotationStage, SParameter, Settle, StageStatus,
    Trace,
};

use tokio::io::{AsyncRead, AsyncWrite};

/// Byte stream a line-oriented driver can talk over.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Boxed stream so drivers are not generic over the transport.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Open a serial port at 8N1 without flow control.
#[cfg(feature = "instrument_serial")]
pub async fn open_serial(port_path: &str, baud_rate: u32) -> anyhow::Result<DynSerial> {
    use anyhow::Context;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();
    let port = tokio::task::spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .context(format!("Failed to open serial port: {}", port_path_owned))
    })
    .await
    .context("spawn_blocking for serial port opening failed")??;

    Ok(Box::new(port))
}
