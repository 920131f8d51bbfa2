use std::sync::Arc;

use pimote::config::{SenseConfig, SocketConfig};
use pimote::socket::{Shared, console};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    pimote::init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let result = match args.as_slice() {
        [] => run_server().await,
        [command, rest @ ..] if command.eq_ignore_ascii_case("temp") && rest.len() <= 1 => {
            run_sense(rest.first().map(String::as_str)).await
        }
        _ => {
            error!("Unknown command: {:?}", args);
            std::process::exit(2);
        }
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run_server() -> pimote::Result<()> {
    let config = match SocketConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Starting pimote socket server (port={}, gpio={:?})",
        config.port, config.gpio
    );
    pimote::socket::run(
        config,
        Arc::new(Shared::new()),
        console::spawn_stdin(),
        pimote::shutdown_channel(),
    )
    .await
}

async fn run_sense(channel: Option<&str>) -> pimote::Result<()> {
    let config = match SenseConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let channel = match channel {
        None => 0,
        Some(raw) => raw
            .parse()
            .map_err(|_| pimote::Error::Config(format!("invalid analog input: {raw}")))?,
    };
    pimote::sense::run(config, channel).await
}
