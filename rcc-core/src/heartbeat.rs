//! Keep-alive timer.
//!
//! Fires `on_fire` after `interval` of silence. Every wire write notifies
//! the shared reset handle, which restarts the countdown, so regular
//! traffic suppresses heartbeats entirely.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::trace;

/// A running heartbeat timer; stops when dropped.
#[derive(Debug)]
pub struct HeartbeatKeeper {
    handle: JoinHandle<()>,
}

impl HeartbeatKeeper {
    pub fn start<F>(interval: Duration, reset: Arc<Notify>, on_fire: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        trace!("heartbeat due");
                        on_fire();
                    }
                    _ = reset.notified() => {}
                }
            }
        });
        Self { handle }
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for HeartbeatKeeper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
