//! Shared shutdown signal for every long-running loop (spec §5
//! "Cancellation"): each loop holds a receiver and selects against it;
//! in-flight RPC calls are allowed to finish, their results discarded.
//!
//! Grounded on `task_monitor.rs`'s `RunningInstance` (a
//! `broadcast::Sender<()>` cloned into every spawned task).

use tokio::sync::broadcast;

#[derive(Clone)]
pub struct Shutdown {
    sender: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self { sender }
    }

    pub fn trigger(&self) {
        // Ignored: an error here only means no receivers are left alive,
        // which is fine during shutdown.
        let _ = self.sender.send(());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    /// Resolves once `trigger()` has been called. Safe to cancel by
    /// dropping the returned future.
    pub async fn await_shutdown(&self) {
        let mut rx = self.sender.subscribe();
        let _ = rx.recv().await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn trigger_wakes_up_waiters() {
        let shutdown = Shutdown::new();
        let waiter = shutdown.clone();
        let handle = tokio::spawn(async move {
            waiter.await_shutdown().await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.trigger();

        tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .expect("await_shutdown should resolve after trigger")
            .unwrap();
    }
}
