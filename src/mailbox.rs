use tokio::sync::Mutex;

/// Single-slot, last-write-wins mailbox for relay commands.
///
/// Every push overwrites whatever was pending, so a burst of commands
/// between two drains collapses to its final value.
#[derive(Debug, Default)]
pub struct Mailbox {
    slot: Mutex<Option<bool>>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, state: bool) {
        *self.slot.lock().await = Some(state);
    }

    /// Take the pending value, leaving the slot empty.
    pub async fn take(&self) -> Option<bool> {
        self.slot.lock().await.take()
    }

    pub async fn clear(&self) {
        *self.slot.lock().await = None;
    }

    pub async fn is_empty(&self) -> bool {
        self.slot.lock().await.is_none()
    }
}
