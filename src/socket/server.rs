use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::{ClientByte, Shared};
use crate::error::Result;

/// Accept state of one server round.
#[derive(Default)]
pub struct Round {
    stopped: AtomicBool,
    wake: Notify,
}

impl Round {
    pub fn is_accepting(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }

    pub fn request_stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        // Stores a permit, so a stop arriving before the accept loop waits is not lost.
        self.wake.notify_one();
    }
}

/// Server supervisor: bind, serve one round, wait, repeat. Never returns.
pub async fn serve(shared: Arc<Shared>, port: u16, retry_delay: Duration) {
    loop {
        info!("Initiating server on port {}", port);
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => {
                if let Err(e) = run_round(listener, &shared).await {
                    error!("Server error: {}", e);
                }
            }
            Err(e) => error!("Failed to bind port {}: {}", port, e),
        }
        info!("Waiting {:?} before restarting server", retry_delay);
        tokio::time::sleep(retry_delay).await;
    }
}

/// Accept clients on `listener` until a session asks the server to stop.
///
/// The registry starts empty. When the round ends every session it
/// spawned is torn down, pending commands are discarded and the listener
/// is closed.
pub async fn run_round(listener: TcpListener, shared: &Arc<Shared>) -> Result<()> {
    shared.registry.clear();
    info!("Listening for clients on {}", listener.local_addr()?);

    let round = Arc::new(Round::default());
    let mut sessions = JoinSet::new();

    let result = loop {
        if !round.is_accepting() {
            info!("Server stop requested");
            break Ok(());
        }
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    sessions.spawn(session(stream, addr, Arc::clone(shared), Arc::clone(&round)));
                }
                Err(e) => break Err(e.into()),
            },
            _ = round.wake.notified() => {}
            Some(_) = sessions.join_next() => {}
        }
    };

    drop(listener);
    sessions.shutdown().await;
    // Aborted sessions never deregistered; dropping their senders ends their writers.
    shared.registry.clear();
    shared.mailbox.clear().await;
    result
}

async fn session(stream: TcpStream, addr: SocketAddr, shared: Arc<Shared>, round: Arc<Round>) {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<bool>(16);
    let id = shared.registry.register(tx);
    info!("New connection '{}' [{}]", id, addr);

    let writer_task = tokio::spawn(async move {
        while let Some(state) = rx.recv().await {
            if let Err(e) = writer.write_all(&[u8::from(state)]).await {
                debug!("Write to client failed: {}", e);
                break;
            }
        }
    });

    loop {
        let byte = match reader.read_u8().await {
            Ok(byte) => byte,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("'{}' closed the connection", id);
                break;
            }
            Err(e) => {
                warn!("Read from '{}' failed: {}", id, e);
                break;
            }
        };
        debug!("Received {} from '{}'", byte, id);

        match ClientByte::from(byte) {
            ClientByte::Off => shared.mailbox.push(false).await,
            ClientByte::On => shared.mailbox.push(true).await,
            ClientByte::StopServer => {
                info!("'{}' requested server stop", id);
                round.request_stop();
            }
            ClientByte::Close => {
                info!("'{}' sent {}, closing session", id, byte);
                break;
            }
        }
    }

    info!("Removing client '{}'", id);
    shared.registry.remove(&id);
    writer_task.abort();
}
