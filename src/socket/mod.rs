pub mod console;
pub mod control;
pub mod server;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::config::SocketConfig;
use crate::error::Result;
use crate::mailbox::Mailbox;
use crate::registry::Registry;
use crate::relay;

/// Meaning of a single byte sent by a socket client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientByte {
    Off,
    On,
    /// Stop the accept loop of the current server round.
    StopServer,
    /// Anything else ends the sending session.
    Close,
}

impl From<u8> for ClientByte {
    fn from(byte: u8) -> Self {
        match byte {
            0 => ClientByte::Off,
            1 => ClientByte::On,
            3 => ClientByte::StopServer,
            _ => ClientByte::Close,
        }
    }
}

/// State shared between the server, the console and the control loop.
pub struct Shared {
    pub mailbox: Mailbox,
    pub registry: Registry,
    running: AtomicBool,
    restart: AtomicBool,
}

impl Default for Shared {
    fn default() -> Self {
        Self {
            mailbox: Mailbox::new(),
            registry: Registry::new(),
            running: AtomicBool::new(true),
            restart: AtomicBool::new(true),
        }
    }
}

impl Shared {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn should_restart(&self) -> bool {
        self.restart.load(Ordering::SeqCst)
    }

    /// End the control loop; the supervisor brings it back up.
    pub fn request_restart(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// End the control loop for good.
    pub fn request_stop(&self) {
        self.restart.store(false, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
    }

    /// Bring the control loop back up unless a stop has been requested.
    /// `request_stop` clears `restart` before `running`, so a stop racing
    /// this call is either seen here or lands after the store.
    fn resume(&self) -> bool {
        self.running.store(true, Ordering::SeqCst);
        if self.should_restart() {
            return true;
        }
        self.running.store(false, Ordering::SeqCst);
        false
    }
}

/// Run the socket variant until a permanent stop is requested.
///
/// The server and console outlive control loop restarts; only the relay
/// is reopened on every iteration. `shutdown` turning true acts like a
/// console `stop`.
pub async fn run(
    config: SocketConfig,
    shared: Arc<Shared>,
    console_lines: mpsc::Receiver<String>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let server = tokio::spawn(server::serve(
        Arc::clone(&shared),
        config.port,
        config.server_retry_delay,
    ));
    let console = tokio::spawn(console::run(console_lines, Arc::clone(&shared)));
    let signals = tokio::spawn({
        let shared = Arc::clone(&shared);
        async move {
            if shutdown.wait_for(|stop| *stop).await.is_ok() {
                shared.request_stop();
            }
        }
    });

    while shared.resume() {
        let mut relay = relay::open(config.gpio);
        relay
            .blink(config.blink_count, config.blink_interval, true)
            .await;

        control::run(&mut relay, &shared, config.poll_interval).await;
        relay.release();

        if !shared.should_restart() {
            break;
        }
        info!("Restarting control loop in {:?}", config.restart_delay);
        tokio::time::sleep(config.restart_delay).await;
    }

    server.abort();
    console.abort();
    signals.abort();
    info!("pimote socket server stopped");
    Ok(())
}
