//! Keepalive / liveness monitor (spec section 4.6): arms a timer for
//! `keepalive_interval_ms + keepalive_grace_ms`, resets it on every
//! `emotivaKeepAlive`, and reports loss-of-contact on expiry or an explicit
//! `emotivaGoodbye`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Liveness signal surfaced to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessEvent {
    Alive,
    TimedOut,
    GoodbyeReceived,
}

/// Watches for keepalive traffic and reports when the device appears to
/// have gone away.
pub struct KeepaliveMonitor {
    tx: watch::Sender<LivenessEvent>,
    reset: Arc<tokio::sync::Notify>,
    goodbye: Arc<tokio::sync::Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
    deadline: Duration,
}

impl KeepaliveMonitor {
    pub fn new(keepalive_interval_ms: u32, keepalive_grace_ms: u32) -> Self {
        let (tx, _rx) = watch::channel(LivenessEvent::Alive);
        Self {
            tx,
            reset: Arc::new(tokio::sync::Notify::new()),
            goodbye: Arc::new(tokio::sync::Notify::new()),
            task: Mutex::new(None),
            deadline: Duration::from_millis(keepalive_interval_ms as u64 + keepalive_grace_ms as u64),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<LivenessEvent> {
        self.tx.subscribe()
    }

    /// Start the monitor loop. Idempotent.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        let tx = self.tx.clone();
        let reset = Arc::clone(&self.reset);
        let goodbye = Arc::clone(&self.goodbye);
        let deadline = self.deadline;

        *task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(deadline) => {
                        let _ = tx.send(LivenessEvent::TimedOut);
                    }
                    _ = reset.notified() => {
                        let _ = tx.send(LivenessEvent::Alive);
                        continue;
                    }
                    _ = goodbye.notified() => {
                        let _ = tx.send(LivenessEvent::GoodbyeReceived);
                        break;
                    }
                }
            }
        }));
    }

    pub async fn stop(&self) {
        let mut task = self.task.lock().await;
        if let Some(handle) = task.take() {
            handle.abort();
        }
    }

    /// Call on every `emotivaKeepAlive` frame.
    pub fn on_keepalive_received(&self) {
        self.reset.notify_one();
    }

    /// Call on an `emotivaGoodbye` frame.
    pub fn on_goodbye_received(&self) {
        self.goodbye.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn times_out_after_interval_plus_grace() {
        let monitor = KeepaliveMonitor::new(100, 50);
        let mut rx = monitor.subscribe();
        monitor.start().await;

        tokio::time::advance(Duration::from_millis(200)).await;
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), LivenessEvent::TimedOut);
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reset_keeps_it_alive() {
        let monitor = KeepaliveMonitor::new(100, 50);
        let mut rx = monitor.subscribe();
        monitor.start().await;

        tokio::time::advance(Duration::from_millis(100)).await;
        monitor.on_keepalive_received();
        tokio::task::yield_now().await;
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), LivenessEvent::Alive);
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn goodbye_reports_immediately() {
        let monitor = KeepaliveMonitor::new(10_000, 5_000);
        let mut rx = monitor.subscribe();
        monitor.start().await;

        monitor.on_goodbye_received();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), LivenessEvent::GoodbyeReceived);
        monitor.stop().await;
    }
}
