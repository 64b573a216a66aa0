use log::error;
use std::panic::{self, AssertUnwindSafe};
use tokio::runtime::Handle;
use tokio_util::task::TaskTracker;

use crate::error::MemKeeperError;

/// Detached background work with its errors routed to the log.
///
/// Work runs on the runtime's blocking pool (all storage access is synchronous
/// rusqlite). The runtime handle is captured at construction so work can be
/// spawned from threads that are not inside the runtime. Nothing spawned here
/// ever reports back to the caller that spawned it.
pub struct BackgroundTasks {
    tracker: TaskTracker,
    runtime: Handle,
}

impl BackgroundTasks {
    /// Must be called from within a tokio runtime
    pub fn new() -> Result<Self, MemKeeperError> {
        let runtime = Handle::try_current().map_err(|e| {
            MemKeeperError::Error(format!("Background tasks require a tokio runtime: {}", e))
        })?;

        Ok(Self {
            tracker: TaskTracker::new(),
            runtime,
        })
    }

    /// Spawn `work` detached. An `Err` or a panic is logged under `label` and goes no further.
    pub fn spawn_detached<F>(&self, label: &'static str, work: F)
    where
        F: FnOnce() -> Result<(), MemKeeperError> + Send + 'static,
    {
        self.tracker.spawn_blocking_on(
            move || match panic::catch_unwind(AssertUnwindSafe(work)) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Background {} failed: {}", label, e),
                Err(payload) => error!(
                    "Background {} panicked: {}",
                    label,
                    panic_message(payload.as_ref())
                ),
            },
            &self.runtime,
        );
    }

    /// Number of background units currently in flight
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Wait until all work spawned so far, and everything that work spawns in turn, has finished.
    /// New work may still be spawned afterwards.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

/// Best-effort text of a panic payload
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
