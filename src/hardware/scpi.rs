//! Line-oriented SCPI transport.
//!
//! Talks to an instrument either directly over a TCP socket or through a
//! Prologix-style GPIB-LAN gateway. In gateway mode every query is followed
//! by `++read eoi` so the gateway addresses the instrument to talk.

use anyhow::{bail, Context, Result};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, info};

use super::DynSerial;

/// Default command timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Pause after each write so slow instruments can parse the command.
pub const DEFAULT_WRITE_SETTLE: Duration = Duration::from_millis(100);

/// Async SCPI client over any byte stream.
pub struct ScpiClient {
    stream: BufReader<DynSerial>,
    timeout: Duration,
    write_settle: Duration,
    gateway: bool,
    endpoint: String,
}

impl ScpiClient {
    /// Connect directly to a LAN instrument.
    pub async fn connect(host: &str, port: u16, connect_timeout: Duration) -> Result<Self> {
        let stream = timeout(connect_timeout, TcpStream::connect((host, port)))
            .await
            .with_context(|| format!("Connection timeout to {}:{}", host, port))?
            .with_context(|| format!("Failed to connect to {}:{}", host, port))?;

        stream.set_nodelay(true)?;
        info!("Connected to SCPI endpoint at {}:{}", host, port);

        Ok(Self::from_stream(Box::new(stream), format!("{host}:{port}")))
    }

    /// Connect through a GPIB-LAN gateway and address `gpib_address`.
    pub async fn connect_gateway(
        host: &str,
        port: u16,
        gpib_address: u8,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let mut client = Self::connect(host, port, connect_timeout).await?;
        client.configure_gateway(gpib_address).await?;
        client.endpoint = format!("{host}:{port}/gpib{gpib_address}");
        Ok(client)
    }

    /// Wrap an already-open stream (direct mode).
    pub fn from_stream(stream: DynSerial, endpoint: impl Into<String>) -> Self {
        Self {
            stream: BufReader::new(stream),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            write_settle: DEFAULT_WRITE_SETTLE,
            gateway: false,
            endpoint: endpoint.into(),
        }
    }

    /// Set the command timeout duration.
    pub fn set_timeout(&mut self, duration: Duration) {
        self.timeout = duration;
    }

    pub fn with_write_settle(mut self, settle: Duration) -> Self {
        self.write_settle = settle;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_gateway(&self) -> bool {
        self.gateway
    }

    /// Put the gateway in controller mode with manual read-after-write.
    pub async fn configure_gateway(&mut self, gpib_address: u8) -> Result<()> {
        for command in [
            "++mode 1".to_string(),
            format!("++addr {gpib_address}"),
            "++auto 0".to_string(),
            "++eoi 1".to_string(),
        ] {
            self.send_raw(&command).await?;
        }
        self.gateway = true;
        Ok(())
    }

    async fn send_raw(&mut self, command: &str) -> Result<()> {
        let cmd = format!("{}\r\n", command);
        let port = self.stream.get_mut();
        port.write_all(cmd.as_bytes())
            .await
            .with_context(|| format!("Failed to write command: {}", command))?;
        port.flush().await.context("Failed to flush stream")
    }

    /// Send a command without expecting a response.
    pub async fn write(&mut self, command: &str) -> Result<()> {
        debug!("SCPI write: {:?}", command);
        self.send_raw(command).await?;
        if !self.write_settle.is_zero() {
            sleep(self.write_settle).await;
        }
        Ok(())
    }

    /// Send a query and read one trimmed response line.
    pub async fn query(&mut self, query: &str) -> Result<String> {
        let mut lines = self.query_lines(query, 1).await?;
        Ok(lines.pop().unwrap_or_default())
    }

    /// Send a query and read `count` response lines.
    pub async fn query_lines(&mut self, query: &str, count: usize) -> Result<Vec<String>> {
        self.discard_buffered();
        debug!("SCPI query: {:?}", query);
        self.send_raw(query).await?;
        if self.gateway {
            self.send_raw("++read eoi").await?;
        }

        let mut lines = Vec::with_capacity(count);
        for _ in 0..count {
            lines.push(self.read_line(query).await?);
        }
        debug!("SCPI response: {} line(s)", lines.len());
        Ok(lines)
    }

    /// Query a floating-point value.
    pub async fn query_f64(&mut self, query: &str) -> Result<f64> {
        let response = self.query(query).await?;
        response.parse::<f64>().with_context(|| {
            format!(
                "Failed to parse '{}' as f64 from query: {}",
                response, query
            )
        })
    }

    async fn read_line(&mut self, query: &str) -> Result<String> {
        let mut response = String::new();
        match timeout(self.timeout, self.stream.read_line(&mut response)).await {
            Ok(Ok(0)) => bail!("Connection closed by device"),
            Ok(Ok(_)) => Ok(response.trim().to_string()),
            Ok(Err(e)) => Err(e).context("Failed to read response"),
            Err(_) => bail!("Timeout waiting for response to: {}", query),
        }
    }

    /// Drop stale bytes left in the read buffer by an earlier reply.
    fn discard_buffered(&mut self) {
        let len = self.stream.buffer().len();
        if len > 0 {
            debug!("Flushing {} bytes from buffer", len);
            self.stream.consume(len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn client(device: tokio::io::DuplexStream) -> ScpiClient {
        ScpiClient::from_stream(Box::new(device), "test").with_write_settle(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_write_appends_terminator() -> Result<()> {
        let (mut host, device) = tokio::io::duplex(128);
        let mut scpi = client(device);
        scpi.write("PRES").await?;

        let mut buf = vec![0u8; 64];
        let n = host.read(&mut buf).await?;
        assert_eq!(&buf[..n], b"PRES\r\n");
        Ok(())
    }

    #[tokio::test]
    async fn test_query_reads_trimmed_line() -> Result<()> {
        let (mut host, device) = tokio::io::duplex(128);
        let mut scpi = client(device);
        host.write_all(b" 8.0E+09 \n").await?;
        assert_eq!(scpi.query_f64("STAR?").await?, 8.0e9);
        Ok(())
    }

    #[tokio::test]
    async fn test_gateway_requests_read() -> Result<()> {
        let (mut host, device) = tokio::io::duplex(256);
        let mut scpi = client(device);
        scpi.configure_gateway(16).await?;
        assert!(scpi.is_gateway());

        host.write_all(b"HEWLETT PACKARD,8720D,0,7.74\n").await?;
        let idn = scpi.query("*IDN?").await?;
        assert!(idn.contains("8720D"));

        let mut buf = vec![0u8; 256];
        let n = host.read(&mut buf).await?;
        let sent = String::from_utf8_lossy(&buf[..n]);
        assert!(sent.starts_with("++mode 1\r\n++addr 16\r\n"));
        assert!(sent.ends_with("*IDN?\r\n++read eoi\r\n"));
        Ok(())
    }

    #[tokio::test]
    async fn test_query_timeout() {
        let (_host, device) = tokio::io::duplex(64);
        let mut scpi = client(device);
        scpi.set_timeout(Duration::from_millis(30));
        let err = scpi.query("POIN?").await.unwrap_err();
        assert!(err.to_string().contains("Timeout"));
    }
}
