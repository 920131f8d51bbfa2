use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Config(String),
    #[error("GPIO error: {0}")]
    Gpio(String),
    #[error("I2C error: {0}")]
    Bus(String),
    #[error("analog input out of bounds [0, {max}): {index}")]
    ChannelOutOfRange { index: usize, max: usize },
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("broker refused connection: {0:?}")]
    Refused(rumqttc::ConnectReturnCode),
    #[error("timed out while {0}")]
    Timeout(&'static str),
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("MQTT connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),
    #[error("invalid HTTP request: {0}")]
    Request(#[from] hyper::http::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
