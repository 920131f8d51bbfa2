use std::io::BufRead;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use super::Shared;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Restart,
    Stop,
    On,
    Off,
    Clients,
    Unknown(String),
}

impl ConsoleCommand {
    /// Parse one console line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let command = match line.to_ascii_lowercase().as_str() {
            "restart" => ConsoleCommand::Restart,
            "stop" => ConsoleCommand::Stop,
            "on" => ConsoleCommand::On,
            "off" => ConsoleCommand::Off,
            "clients" => ConsoleCommand::Clients,
            _ => ConsoleCommand::Unknown(line.to_string()),
        };
        Some(command)
    }
}

pub async fn apply(command: ConsoleCommand, shared: &Shared) {
    match command {
        ConsoleCommand::Restart => {
            info!("Restart requested from console");
            shared.request_restart();
        }
        ConsoleCommand::Stop => {
            info!("Stop requested from console");
            shared.request_stop();
        }
        ConsoleCommand::On => shared.mailbox.push(true).await,
        ConsoleCommand::Off => shared.mailbox.push(false).await,
        ConsoleCommand::Clients => {
            let ids = shared.registry.ids();
            info!("Connected clients ({})", ids.len());
            for id in ids {
                info!("{}", id);
            }
        }
        ConsoleCommand::Unknown(line) => warn!("Unknown command: '{}'", line),
    }
}

/// Forward stdin lines from a dedicated thread.
///
/// Reading stdin blocks, so it stays off the runtime; the thread ends at
/// EOF or when the receiver is gone.
pub fn spawn_stdin() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

pub async fn run(mut lines: mpsc::Receiver<String>, shared: Arc<Shared>) {
    info!("Attached to console");
    while let Some(line) = lines.recv().await {
        if let Some(command) = ConsoleCommand::parse(&line) {
            apply(command, &shared).await;
        }
    }
    info!("Console input closed");
}
