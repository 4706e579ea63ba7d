//! Cooperative stop flag shared by the batch controller and the network
//! pipeline.
//!
//! Explicitly constructed and passed in rather than a process-wide global,
//! so tests (and multiple concurrent batches) can each own one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct ShutdownCoordinator {
    stopped: Arc<AtomicBool>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn starts_unstopped() {
        let c = ShutdownCoordinator::new();
        assert!(!c.is_stopped());
    }

    #[test]
    fn stop_is_visible_to_clones() {
        let c = ShutdownCoordinator::new();
        let c2 = c.clone();
        c.stop();
        assert!(c2.is_stopped());
    }

    #[test]
    fn stop_is_visible_across_threads() {
        let c = ShutdownCoordinator::new();
        let c2 = c.clone();
        let handle = thread::spawn(move || {
            while !c2.is_stopped() {
                thread::yield_now();
            }
        });
        c.stop();
        handle.join().unwrap();
    }
}
