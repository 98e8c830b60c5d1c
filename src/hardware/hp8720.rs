//! HP/Agilent 8720-series vector network analyzer
//!
//! Trace transfer uses the ASCII `FORM4` format: after `OUTPFORM` the
//! instrument sends one `value,aux` line per sweep point. The frequency axis
//! is rebuilt from `STAR?`, `STOP?` and `POIN?` as a linear sweep.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, instrument};

use super::capabilities::{NetworkAnalyzer, Trace};
use super::scpi::ScpiClient;

/// Driver for an 8720-family analyzer.
pub struct Hp8720Vna {
    scpi: ScpiClient,
    identity: Option<String>,
}

impl Hp8720Vna {
    /// Wrap a connected client and read the instrument identity.
    pub async fn new(mut scpi: ScpiClient) -> Result<Self> {
        let identity = scpi
            .query("*IDN?")
            .await
            .context("VNA did not answer the identity query")?;
        info!("VNA connected at {}: {}", scpi.endpoint(), identity);
        Ok(Self {
            scpi,
            identity: (!identity.is_empty()).then_some(identity),
        })
    }

    /// Connect over TCP, through a GPIB gateway when `gpib_address` is set.
    pub async fn connect(
        host: &str,
        port: u16,
        gpib_address: Option<u8>,
        timeout: Duration,
    ) -> Result<Self> {
        let mut scpi = match gpib_address {
            Some(address) => ScpiClient::connect_gateway(host, port, address, timeout).await?,
            None => ScpiClient::connect(host, port, timeout).await?,
        };
        scpi.set_timeout(timeout);
        Self::new(scpi).await
    }
}

/// `count` evenly spaced values from `start` to `stop` inclusive.
pub fn linspace(start: f64, stop: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (count - 1) as f64;
            (0..count).map(|i| start + step * i as f64).collect()
        }
    }
}

/// First field of each `FORM4` data line.
pub fn parse_form4(lines: &[String]) -> Result<Vec<f64>> {
    lines
        .iter()
        .map(|line| {
            let first = line.split(',').next().unwrap_or_default().trim();
            first
                .parse::<f64>()
                .with_context(|| format!("Malformed trace line: {:?}", line))
        })
        .collect()
}

#[async_trait]
impl NetworkAnalyzer for Hp8720Vna {
    async fn write(&mut self, command: &str) -> Result<()> {
        self.scpi.write(command).await
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        self.scpi.query(command).await
    }

    #[instrument(skip(self), err)]
    async fn read_trace(&mut self, channel: &str) -> Result<Trace> {
        let start_hz = self.scpi.query_f64("STAR?").await?;
        let stop_hz = self.scpi.query_f64("STOP?").await?;
        let points = self.scpi.query_f64("POIN?").await?;
        if points.is_nan() || points < 1.0 {
            bail!("VNA reported {} sweep points", points);
        }
        let points = points.round() as usize;

        self.scpi.write("FORM4").await?;
        self.scpi.write(&format!("{channel};")).await?;
        let lines = self.scpi.query_lines("OUTPFORM;", points).await?;
        let values = parse_form4(&lines)?;

        let freqs_ghz = linspace(start_hz, stop_hz, points)
            .into_iter()
            .map(|hz| hz / 1e9)
            .collect();
        Trace::new(freqs_ghz, values)
    }

    fn identity(&self) -> Option<String> {
        self.identity.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_linspace() {
        assert_eq!(linspace(8.0, 12.0, 5), vec![8.0, 9.0, 10.0, 11.0, 12.0]);
        assert_eq!(linspace(8.0, 8.0, 1), vec![8.0]);
        assert!(linspace(1.0, 2.0, 0).is_empty());
    }

    #[test]
    fn test_parse_form4() {
        let lines = vec![" -1.25E+01, 0.0E+00".to_string(), "-3.5,0".to_string()];
        assert_eq!(parse_form4(&lines).unwrap(), vec![-12.5, -3.5]);
        assert!(parse_form4(&["garbage".to_string()]).is_err());
    }

    #[tokio::test]
    async fn test_read_trace_builds_frequency_axis() -> Result<()> {
        let (mut host, device) = tokio::io::duplex(1024);
        let scpi = ScpiClient::from_stream(Box::new(device), "test")
            .with_write_settle(Duration::ZERO);

        let fake = tokio::spawn(async move {
            let mut inbox = String::new();
            let mut buf = vec![0u8; 256];
            let replies: [(&str, &str); 5] = [
                ("*IDN?", "HEWLETT PACKARD,8720D,0,7.74\n"),
                ("STAR?", "8.0E+09\n"),
                ("STOP?", "1.2E+10\n"),
                ("POIN?", "3\n"),
                ("OUTPFORM;", "-1.0,0\n-2.0,0\n-3.0,0\n"),
            ];
            for (query, reply) in replies {
                while !inbox.contains(query) {
                    let n = host.read(&mut buf).await.unwrap();
                    inbox.push_str(&String::from_utf8_lossy(&buf[..n]));
                }
                inbox = inbox.split_once(query).unwrap().1.to_string();
                host.write_all(reply.as_bytes()).await.unwrap();
            }
        });

        let mut vna = Hp8720Vna::new(scpi).await?;
        assert!(vna.identity().unwrap().contains("8720D"));
        let trace = vna.read_trace("CHAN1").await?;
        assert_eq!(trace.freqs_ghz(), &[8.0, 10.0, 12.0]);
        assert_eq!(trace.values(), &[-1.0, -2.0, -3.0]);
        fake.await.unwrap();
        Ok(())
    }
}
