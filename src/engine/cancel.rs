use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::broadcast;

/// Cancellation channels for in-flight executions and runs, keyed by id.
#[derive(Default)]
pub struct CancelRegistry {
    senders: Mutex<HashMap<String, broadcast::Sender<()>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: &str) -> broadcast::Receiver<()> {
        let (tx, rx) = broadcast::channel(1);
        self.senders.lock().insert(id.to_string(), tx);
        rx
    }

    /// Signal and forget `id`. Returns false when nothing was registered.
    pub fn cancel(&self, id: &str) -> bool {
        if let Some(tx) = self.senders.lock().remove(id) {
            let _ = tx.send(());
            return true;
        }
        false
    }

    pub fn remove(&self, id: &str) {
        self.senders.lock().remove(id);
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.senders.lock().contains_key(id)
    }
}

/// A receiver that never fires.
pub fn never() -> broadcast::Receiver<()> {
    let (_tx, rx) = broadcast::channel(1);
    rx
}
