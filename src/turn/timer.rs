//! Tokio-backed one-shot timers addressed by id.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;

pub type TimerId = u64;

/// Runs one-shot timers and reports each expiry on a channel.
///
/// Must be used from inside a tokio runtime. Cancelling is idempotent: an id
/// that already fired, was already cancelled or never existed is a no-op.
pub struct TimerWheel {
    active: HashMap<TimerId, AbortHandle>,
    fired_tx: mpsc::UnboundedSender<TimerId>,
}

impl TimerWheel {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerId>) {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let wheel = Self {
            active: HashMap::new(),
            fired_tx,
        };
        (wheel, fired_rx)
    }

    pub fn schedule(&mut self, id: TimerId, after: Duration) {
        self.cancel(id);
        let tx = self.fired_tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(id);
        });
        self.active.insert(id, task.abort_handle());
    }

    pub fn cancel(&mut self, id: TimerId) {
        if let Some(handle) = self.active.remove(&id) {
            handle.abort();
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, handle) in self.active.drain() {
            handle.abort();
        }
    }

    /// Acknowledge an expiry read from the channel. Returns false when the
    /// timer was cancelled after its expiry had already been queued.
    pub fn fired(&mut self, id: TimerId) -> bool {
        self.active.remove(&id).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.active.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

impl Drop for TimerWheel {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
