use std::fmt;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

const ID_LEN: usize = 12;

/// Display identifier of a socket session: 12 random mixed-case letters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self::from_uuid(Uuid::new_v4())
    }

    /// Bytes 6 and 8 of a v4 uuid carry fixed version and variant bits.
    fn from_uuid(uuid: Uuid) -> Self {
        let id = uuid
            .as_bytes()
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != 6 && *i != 8)
            .take(ID_LEN)
            .map(|(_, b)| {
                let letter = b'a' + (b & 0x7f) % 26;
                if b & 0x80 != 0 {
                    letter.to_ascii_uppercase() as char
                } else {
                    letter as char
                }
            })
            .collect();
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connected sessions and the channel each one's writer listens on.
#[derive(Default)]
pub struct Registry {
    sessions: DashMap<SessionId, mpsc::Sender<bool>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tx: mpsc::Sender<bool>) -> SessionId {
        loop {
            let id = SessionId::generate();
            if !self.sessions.contains_key(&id) {
                self.sessions.insert(id.clone(), tx);
                return id;
            }
        }
    }

    pub fn remove(&self, id: &SessionId) -> bool {
        self.sessions.remove(id).is_some()
    }

    /// Snapshot of the connected ids, sorted for stable output.
    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn clear(&self) {
        self.sessions.clear();
    }

    /// Queue `state` for every session. Returns how many accepted it.
    pub fn broadcast(&self, state: bool) -> usize {
        // Collected first so no shard lock is held while sending.
        let targets: Vec<(SessionId, mpsc::Sender<bool>)> = self
            .sessions
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut delivered = 0;
        for (id, tx) in targets {
            info!("Notifying '{}'", id);
            match tx.try_send(state) {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Could not notify '{}': {}", id, e),
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_letters() {
        let id = SessionId::generate();
        assert_eq!(id.as_str().len(), ID_LEN);
        assert!(id.as_str().chars().all(|c| c.is_ascii_alphabetic()));
    }

    #[test]
    fn ids_skip_version_and_variant_bytes() {
        let mut bytes = [0x80u8; 16];
        bytes[6] = 0x4f;
        bytes[7] = 0x01;
        bytes[8] = 0xbf;
        bytes[9] = 0x02;
        let id = SessionId::from_uuid(Uuid::from_bytes(bytes));
        assert_eq!(id.as_str(), "AAAAAAbcAAAA");
    }

    #[tokio::test]
    async fn broadcast_reaches_live_sessions_only() {
        let registry = Registry::new();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, rx_b) = mpsc::channel(4);
        let a = registry.register(tx_a);
        let b = registry.register(tx_b);
        assert_eq!(registry.len(), 2);
        drop(rx_b);

        assert_eq!(registry.broadcast(true), 1);
        assert_eq!(rx_a.recv().await, Some(true));

        assert!(registry.remove(&b));
        assert!(!registry.remove(&b));
        assert_eq!(registry.ids(), vec![a]);

        registry.clear();
        assert!(registry.is_empty());
    }
}
