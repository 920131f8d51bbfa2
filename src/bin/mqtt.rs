use pimote::config::Config;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    pimote::init_tracing();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Starting pimote MQTT client (mqtt={}:{}, device={} [{}], gpio={:?})",
        config.mqtt.broker_host,
        config.mqtt.broker_port,
        config.device.name,
        config.device.tag,
        config.gpio,
    );

    if let Err(e) = pimote::mqtt::run(config, pimote::shutdown_channel()).await {
        error!("{}", e);
        std::process::exit(1);
    }
}
