//! One-shot analog temperature report.
//!
//! Reads a single ADC channel over I2C, submits the reading to the sense
//! endpoint and, when the endpoint cannot be reached, appends the reading
//! to a local newline-delimited JSON file instead.

use std::path::Path;
use std::time::Duration;

use embedded_hal::i2c::I2c;
use hyper::{Body, Client, Method, Request};
use linux_embedded_hal::I2cdev;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

use crate::config::SenseConfig;
use crate::error::{Error, Result};

/// Single-ended command byte for each of the eight ADC inputs.
pub const CHANNEL_COMMANDS: [u8; 8] = [0x84, 0xC4, 0x94, 0xD4, 0xA4, 0xE4, 0xB4, 0xF4];

pub const DATE_FORMAT: &str = "%Y-%m-%d-%H:%M:%S";

/// A reading that could not be submitted, as stored in the fallback file.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Miss {
    pub date: String,
    pub value: u8,
}

pub fn channel_command(index: usize) -> Result<u8> {
    CHANNEL_COMMANDS
        .get(index)
        .copied()
        .ok_or(Error::ChannelOutOfRange {
            index,
            max: CHANNEL_COMMANDS.len(),
        })
}

/// Select `channel`, give the converter `settle` to sample, read one byte.
pub fn read_channel<B: I2c>(bus: &mut B, address: u8, channel: usize, settle: Duration) -> Result<u8> {
    let command = channel_command(channel)?;
    bus.write(address, &[command])
        .map_err(|e| Error::Bus(format!("write: {e:?}")))?;
    std::thread::sleep(settle);
    let mut value = [0u8; 1];
    bus.read(address, &mut value)
        .map_err(|e| Error::Bus(format!("read: {e:?}")))?;
    Ok(value[0])
}

pub fn timestamp() -> String {
    chrono::Local::now().format(DATE_FORMAT).to_string()
}

pub fn submit_url(endpoint: &str, date: &str, value: u8) -> String {
    format!("{endpoint}/sense-temp/{date}/{value}/submit")
}

/// Submit a reading. Returns the response status and body.
pub async fn report(config: &SenseConfig, date: &str, value: u8) -> Result<(u16, String)> {
    let request = Request::builder()
        .method(Method::GET)
        .uri(submit_url(&config.endpoint, date, value))
        .header("Cache-Control", "no-cache")
        .header("Pragma", "no-cache")
        .header("REQ-TOK", &config.token)
        .body(Body::empty())?;

    let client = Client::new();
    let exchange = async {
        let response = client.request(request).await?;
        let status = response.status().as_u16();
        let body = hyper::body::to_bytes(response.into_body()).await?;
        Ok::<_, Error>((status, String::from_utf8_lossy(&body).into_owned()))
    };
    tokio::time::timeout(config.request_timeout, exchange)
        .await
        .map_err(|_| Error::Timeout("submitting sense reading"))?
}

pub async fn append_miss(path: &Path, date: &str, value: u8) -> Result<()> {
    let mut line = serde_json::to_vec(&Miss {
        date: date.to_string(),
        value,
    })?;
    line.push(b'\n');

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(&line).await?;
    file.flush().await?;
    Ok(())
}

/// Report an already taken reading, falling back to the miss file.
pub async fn submit(config: &SenseConfig, date: &str, value: u8) -> Result<()> {
    info!("Registering at {} ({}/255)", date, value);
    match report(config, date, value).await {
        Ok((status, body)) => {
            info!("[{}] {}", status, body);
            Ok(())
        }
        Err(e) => {
            warn!("Report failed: {}. Writing to {}", e, config.fallback_file.display());
            append_miss(&config.fallback_file, date, value).await
        }
    }
}

/// The `temp [index]` sub-command. A failed bus read is logged and
/// nothing is reported.
pub async fn run(config: SenseConfig, channel: usize) -> Result<()> {
    channel_command(channel)?;

    let bus_config = config.clone();
    let reading = tokio::task::spawn_blocking(move || {
        let mut bus = I2cdev::new(&bus_config.i2c_bus)
            .map_err(|e| Error::Bus(format!("open {}: {e:?}", bus_config.i2c_bus.display())))?;
        read_channel(&mut bus, bus_config.address, channel, bus_config.settle)
    })
    .await
    .map_err(|e| Error::Bus(format!("reader task failed: {e}")))?;

    let value = match reading {
        Ok(value) => value,
        Err(e) => {
            error!("Failed to read channel {}: {}", channel, e);
            return Ok(());
        }
    };

    submit(&config, &timestamp(), value).await
}
