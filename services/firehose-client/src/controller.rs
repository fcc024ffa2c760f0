//! Process-wide run flag.
//!
//! Every worker loop observes the flag via timed dequeues and exits after
//! finishing its current item; nothing is interrupted mid-request. A fatal
//! error anywhere clears the flag and marks the run failed so the process
//! exits non-zero.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tracing::error;

#[derive(Clone)]
pub struct Controller {
    active: Arc<watch::Sender<bool>>,
    failed: Arc<AtomicBool>,
}

impl Controller {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(true);
        Controller {
            active: Arc::new(tx),
            failed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_active(&self) -> bool {
        *self.active.borrow()
    }

    /// Orderly shutdown: workers drain and exit cleanly.
    pub fn stop(&self) {
        let _ = self.active.send(false);
    }

    /// Fatal shutdown: like `stop`, but the process exits non-zero.
    pub fn force_stop(&self, reason: &str) {
        error!(reason, "fatal error, stopping all workers");
        self.failed.store(true, Ordering::Release);
        let _ = self.active.send(false);
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.active.subscribe()
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_clears_the_flag() {
        let controller = Controller::new();
        assert!(controller.is_active());
        controller.stop();
        assert!(!controller.is_active());
        assert!(!controller.has_failed());
    }

    #[test]
    fn force_stop_marks_failure() {
        let controller = Controller::new();
        controller.force_stop("worker exploded");
        assert!(!controller.is_active());
        assert!(controller.has_failed());
    }

    #[tokio::test]
    async fn subscribers_observe_shutdown() {
        let controller = Controller::new();
        let mut rx = controller.subscribe();
        controller.stop();
        rx.changed().await.unwrap();
        assert!(!*rx.borrow());
    }
}
