//! Map shared between the threads that run optimizations.
//!
//! One coarse `RwLock` guards the whole map: drivers collect under a read
//! guard, solve without any lock and write results back under a single write
//! guard, so no reader ever observes a half-applied update. The stop flag lets
//! the owner of a long global/local BA abort it cooperatively.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::map::Map;

/// Shared map plus the cooperative stop flag.
#[derive(Debug, Default)]
pub struct SharedMap {
    pub map: RwLock<Map>,

    /// Raised to abort a running bundle adjustment.
    pub abort_ba: AtomicBool,
}

impl SharedMap {
    pub fn new(map: Map) -> Arc<Self> {
        Arc::new(Self {
            map: RwLock::new(map),
            abort_ba: AtomicBool::new(false),
        })
    }

    /// Ask running bundle adjustments to stop at their next checkpoint.
    pub fn request_stop(&self) {
        self.abort_ba.store(true, Ordering::SeqCst);
    }

    pub fn clear_stop(&self) {
        self.abort_ba.store(false, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.abort_ba.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_flag_roundtrip() {
        let shared = SharedMap::new(Map::new());
        assert!(!shared.stop_requested());

        shared.request_stop();
        assert!(shared.stop_requested());

        shared.clear_stop();
        assert!(!shared.stop_requested());
    }
}
