//! Periodic background tasks owned by a single module.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::{Instant, interval_at};
use tracing::debug;

/// Handle to one interval loop. Dropping it stops the loop.
pub(crate) struct BackgroundTask {
    name: &'static str,
    handle: Mutex<Option<AbortHandle>>,
}

impl BackgroundTask {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            handle: Mutex::new(None),
        }
    }

    /// Spawn `tick` every `period`, first firing one period from now.
    ///
    /// The loop ends when `tick` resolves to `false` (usually because the
    /// owning module was dropped). Replaces any loop already running.
    pub(crate) fn spawn<F, Fut>(&self, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let name = self.name;
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if !tick().await {
                    debug!(task = name, "Background task owner gone, exiting");
                    break;
                }
            }
        });

        let mut slot = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slot.replace(handle.abort_handle()) {
            previous.abort();
        }
        debug!(task = name, period_ms = period.as_millis() as u64, "Background task started");
    }

    pub(crate) fn is_running(&self) -> bool {
        let slot = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        slot.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Abort the loop. Returns whether one was running.
    pub(crate) fn stop(&self) -> bool {
        let mut slot = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        match slot.take() {
            Some(handle) => {
                handle.abort();
                debug!(task = self.name, "Background task stopped");
                true
            }
            None => false,
        }
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.stop();
    }
}
