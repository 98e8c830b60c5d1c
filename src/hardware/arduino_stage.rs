//! Arduino stepper sketch driving the polarization rotation stage
//!
//! Protocol Overview:
//! - `<steps>\n`: relative move, echoed back
//! - `a<steps>\n`: absolute move from the stored origin
//! - `r\n`: current position becomes the origin
//! - `s\n`: status, answered `BUSY` or `IDLE` by firmware that supports it
//!
//! Older sketches ignore `s`; the status query then times out and callers
//! fall back to a time-based wait.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::time::timeout;
use tracing::{debug, instrument};

use super::capabilities::{RotationStage, StageStatus};
use super::DynSerial;

/// Steps per degree of the stock stage gearing.
pub const DEFAULT_STEPS_PER_DEG: f64 = 800.0;

/// Driver for the rotation-stage sketch.
pub struct ArduinoRotationStage {
    port: BufReader<DynSerial>,
    steps_per_deg: f64,
    /// Timeout for echoes and status replies
    reply_timeout: Duration,
    label: String,
}

impl ArduinoRotationStage {
    pub fn from_stream(stream: DynSerial, steps_per_deg: f64, label: impl Into<String>) -> Self {
        Self {
            port: BufReader::new(stream),
            steps_per_deg,
            reply_timeout: Duration::from_millis(300),
            label: label.into(),
        }
    }

    /// Open the serial port and wait out the board reset.
    ///
    /// # Errors
    /// Returns error if the serial port cannot be opened
    #[cfg(feature = "instrument_serial")]
    pub async fn open(port_path: &str, baud_rate: u32, steps_per_deg: f64) -> Result<Self> {
        let stream = super::open_serial(port_path, baud_rate).await?;
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok(Self::from_stream(
            stream,
            steps_per_deg,
            format!("Arduino rotation stage@{port_path}"),
        ))
    }

    pub fn with_reply_timeout(mut self, reply_timeout: Duration) -> Self {
        self.reply_timeout = reply_timeout;
        self
    }

    pub fn steps_for(&self, degrees: f64) -> i64 {
        (degrees * self.steps_per_deg).round() as i64
    }

    async fn send(&mut self, command: &str) -> Result<()> {
        debug!("Stage write: {:?}", command);
        let port = self.port.get_mut();
        port.write_all(format!("{command}\n").as_bytes())
            .await
            .context("Failed to write to rotation stage")?;
        port.flush().await.context("Failed to flush rotation stage port")
    }

    /// One reply line, or `None` if the sketch stays silent.
    async fn read_reply(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        match timeout(self.reply_timeout, self.port.read_line(&mut line)).await {
            Ok(Ok(0)) => Err(anyhow!("Rotation stage connection closed")),
            Ok(Ok(_)) => Ok(Some(line.trim().to_string())),
            Ok(Err(e)) => Err(e).context("Failed to read rotation stage reply"),
            Err(_) => Ok(None),
        }
    }
}

#[async_trait]
impl RotationStage for ArduinoRotationStage {
    #[instrument(skip(self), err)]
    async fn move_abs_deg(&mut self, angle_deg: f64) -> Result<()> {
        let steps = self.steps_for(angle_deg);
        self.send(&format!("a{steps}")).await
    }

    #[instrument(skip(self), err)]
    async fn move_rel_deg(&mut self, delta_deg: f64) -> Result<()> {
        let steps = self.steps_for(delta_deg);
        self.send(&steps.to_string()).await?;
        if let Some(echo) = self.read_reply().await? {
            debug!("Stage echo: {:?}", echo);
        }
        Ok(())
    }

    async fn reset_origin(&mut self) -> Result<()> {
        self.send("r").await?;
        self.read_reply().await?;
        Ok(())
    }

    async fn query_status(&mut self) -> Result<Option<StageStatus>> {
        self.send("s").await?;
        Ok(self
            .read_reply()
            .await?
            .and_then(|reply| StageStatus::parse(&reply)))
    }

    fn identity(&self) -> Option<String> {
        Some(self.label.clone())
    }
}
