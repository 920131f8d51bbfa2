use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

pub const DEFAULT_SOCKET_PORT: u16 = 48952;
pub const DEFAULT_TOPIC_PREFIX: &str = "pimotev3";

/// Variable lookup. `from_env` passes the process environment; tests pass a map.
pub type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Configuration of the MQTT variant.
#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub device: DeviceConfig,
    pub gpio: GpioMode,
    pub timing: MqttTiming,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub username: String,
    pub password: String,
    pub topic_prefix: String,
    pub client_id: String,
    pub keep_alive: Duration,
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Human readable name published in the presence message
    pub name: String,
    /// Topic segment identifying this device
    pub tag: String,
    /// Shared secret required by the restart topic
    pub key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpioMode {
    /// No hardware access; relay changes are only logged.
    Disabled,
    Pin(u64),
}

#[derive(Debug, Clone)]
pub struct MqttTiming {
    pub restart_delay: Duration,
    pub liveness_interval: Duration,
    pub authorize_timeout: Duration,
    pub flush_timeout: Duration,
    pub blink_count: usize,
    pub blink_interval: Duration,
}

impl Default for MqttTiming {
    fn default() -> Self {
        Self {
            restart_delay: Duration::from_secs(10),
            liveness_interval: Duration::from_secs(5),
            authorize_timeout: Duration::from_secs(5),
            flush_timeout: Duration::from_secs(1),
            blink_count: 6,
            blink_interval: Duration::from_millis(500),
        }
    }
}

/// Configuration of the socket variant.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub port: u16,
    pub gpio: GpioMode,
    pub poll_interval: Duration,
    pub server_retry_delay: Duration,
    pub restart_delay: Duration,
    pub blink_count: usize,
    pub blink_interval: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_SOCKET_PORT,
            gpio: GpioMode::Pin(4),
            poll_interval: Duration::from_millis(100),
            server_retry_delay: Duration::from_secs(60),
            restart_delay: Duration::from_secs(15),
            blink_count: 10,
            blink_interval: Duration::from_secs(1),
        }
    }
}

/// Configuration of the one-shot temperature report.
#[derive(Debug, Clone)]
pub struct SenseConfig {
    pub endpoint: String,
    pub token: String,
    pub fallback_file: PathBuf,
    pub i2c_bus: PathBuf,
    pub address: u8,
    pub settle: Duration,
    pub request_timeout: Duration,
}

fn env_required(env: Lookup, key: &str) -> Result<String> {
    env(key)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| Error::Config(format!("{key} environment variable is required")))
}

fn env_optional(env: Lookup, key: &str) -> Option<String> {
    env(key).filter(|v| !v.trim().is_empty())
}

fn env_or_default<T: FromStr>(env: Lookup, key: &str, default: T) -> T {
    env(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_parsed<T: FromStr>(env: Lookup, key: &str) -> Result<Option<T>> {
    match env_optional(env, key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{key} has an invalid value: {raw}"))),
    }
}

fn env_flag(env: Lookup, key: &str) -> bool {
    env_optional(env, key)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on"))
        .unwrap_or(false)
}

/// Split `host:port`, defaulting to the standard MQTT port.
fn parse_broker(raw: &str) -> Result<(String, u16)> {
    let raw = raw.trim();
    let (host, port) = match raw.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| Error::Config(format!("MQTT_BROKER has an invalid port: {raw}")))?;
            (host, port)
        }
        None => (raw, 1883),
    };
    if host.is_empty() {
        return Err(Error::Config(format!("MQTT_BROKER has an empty host: {raw}")));
    }
    Ok((host.to_string(), port))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&|key: &str| env::var(key).ok())
    }

    pub fn from_lookup(env: Lookup) -> Result<Self> {
        let username = env_required(env, "MQTT_USER")?;
        let password = env_required(env, "MQTT_PASS")?;
        let (broker_host, broker_port) = parse_broker(&env_required(env, "MQTT_BROKER")?)?;
        // An explicitly blank prefix is an error, an absent one takes the default.
        let topic_prefix = match env("MQTT_TOPIC_PREFIX") {
            None => DEFAULT_TOPIC_PREFIX.to_string(),
            Some(_) => env_required(env, "MQTT_TOPIC_PREFIX")?.trim().to_string(),
        };
        let name = env_required(env, "PIMOTE_NAME")?;
        let tag = env_required(env, "PIMOTE_TAG")?.trim().to_string();
        let key = env_required(env, "PIMOTE_KEY")?;

        let gpio = if env_flag(env, "GPIO_DISABLED") {
            GpioMode::Disabled
        } else {
            match env_parsed(env, "GPIO_PIN")? {
                Some(pin) => GpioMode::Pin(pin),
                None => {
                    return Err(Error::Config(
                        "GPIO_PIN environment variable is required unless GPIO_DISABLED is set"
                            .into(),
                    ));
                }
            }
        };

        let client_id =
            env_optional(env, "MQTT_CLIENT_ID").unwrap_or_else(|| format!("pimote-{tag}"));

        Ok(Self {
            mqtt: MqttConfig {
                broker_host,
                broker_port,
                username,
                password,
                topic_prefix,
                client_id,
                keep_alive: Duration::from_secs(env_or_default(env, "MQTT_KEEP_ALIVE_SECS", 30)),
            },
            device: DeviceConfig { name, tag, key },
            gpio,
            timing: MqttTiming::default(),
        })
    }

    pub fn presence_topic(&self) -> String {
        format!("{}/list/{}", self.mqtt.topic_prefix, self.device.tag)
    }

    pub fn set_topic(&self) -> String {
        format!("{}/set/{}", self.mqtt.topic_prefix, self.device.tag)
    }

    pub fn restart_topic(&self) -> String {
        format!("{}/restart/{}", self.mqtt.topic_prefix, self.device.tag)
    }
}

impl SocketConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&|key: &str| env::var(key).ok())
    }

    pub fn from_lookup(env: Lookup) -> Result<Self> {
        let defaults = Self::default();
        let gpio = if env_flag(env, "GPIO_DISABLED") {
            GpioMode::Disabled
        } else {
            env_parsed(env, "GPIO_PIN")?
                .map(GpioMode::Pin)
                .unwrap_or(defaults.gpio)
        };
        let port = env_parsed(env, "SOCKET_PORT")?.unwrap_or(defaults.port);
        Ok(Self {
            port,
            gpio,
            ..defaults
        })
    }
}

impl SenseConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&|key: &str| env::var(key).ok())
    }

    pub fn from_lookup(env: Lookup) -> Result<Self> {
        let endpoint = env_or_default(
            env,
            "SENSE_ENDPOINT",
            "http://192.168.1.77:8000".to_string(),
        );
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: env_required(env, "SENSE_TOKEN")?,
            fallback_file: env_or_default(env, "SENSE_FALLBACK_FILE", PathBuf::from("misses.json")),
            i2c_bus: env_or_default(env, "SENSE_I2C_BUS", PathBuf::from("/dev/i2c-1")),
            address: 0x4B,
            settle: Duration::from_millis(500),
            request_timeout: Duration::from_secs(60),
        })
    }
}
