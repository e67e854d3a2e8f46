//! Shared state between the tracker, mapper and estimator threads.
//!
//! Holds the immutable configuration, the map store behind its lock, the
//! optimization lock serializing structural merges against the estimator,
//! and the small atomically-updated runtime state block.
//!
//! Lock order when multiple locks are held: `optimization_lock` before
//! `map`. Never acquire them in reverse order. The keyframe channel and
//! the estimator FIFO are leaves.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::camera::CameraModel;
use crate::config::Config;
use crate::map::MapStore;

/// Runtime-mutable flags, separate from the immutable [`Config`].
#[derive(Debug, Default)]
pub struct RuntimeState {
    /// Whether the vision pipeline has been initialized by parallax.
    vision_initialized: AtomicBool,

    /// Request a full pipeline reset; observed and cleared by the
    /// front-end at the next tick.
    reset_required: AtomicBool,

    /// Request all worker threads to exit.
    exit_required: AtomicBool,

    /// Set when fewer than a third of the 3D-prior tracks survived; a
    /// downstream pose-recovery consumer may observe it.
    p3p_required: AtomicBool,
}

impl RuntimeState {
    pub fn vision_initialized(&self) -> bool {
        self.vision_initialized.load(Ordering::SeqCst)
    }

    pub fn set_vision_initialized(&self, value: bool) {
        self.vision_initialized.store(value, Ordering::SeqCst);
    }

    pub fn reset_required(&self) -> bool {
        self.reset_required.load(Ordering::SeqCst)
    }

    pub fn request_reset(&self) {
        self.reset_required.store(true, Ordering::SeqCst);
    }

    /// Observe and clear the reset request (returns true if it was set).
    pub fn take_reset_required(&self) -> bool {
        self.reset_required.swap(false, Ordering::SeqCst)
    }

    pub fn exit_required(&self) -> bool {
        self.exit_required.load(Ordering::SeqCst)
    }

    pub fn request_exit(&self) {
        self.exit_required.store(true, Ordering::SeqCst);
    }

    pub fn p3p_required(&self) -> bool {
        self.p3p_required.load(Ordering::SeqCst)
    }

    pub fn set_p3p_required(&self, value: bool) {
        self.p3p_required.store(value, Ordering::SeqCst);
    }
}

/// State shared by all pipeline threads.
pub struct SharedState {
    pub config: Config,

    /// The map store. All entity mutation goes through this lock.
    pub map: RwLock<MapStore>,

    /// Serializes local-map merges against the estimator. Taken before
    /// the map lock, never after.
    pub optimization_lock: Mutex<()>,

    pub state: RuntimeState,
}

impl SharedState {
    pub fn new(
        config: Config,
        camera_left: CameraModel,
        camera_right: Option<CameraModel>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            map: RwLock::new(MapStore::new(camera_left, camera_right)),
            optimization_lock: Mutex::new(()),
            state: RuntimeState::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_reset_clears_flag() {
        let state = RuntimeState::default();
        assert!(!state.take_reset_required());

        state.request_reset();
        assert!(state.reset_required());
        assert!(state.take_reset_required());
        assert!(!state.reset_required());
    }

    #[test]
    fn test_exit_flag() {
        let state = RuntimeState::default();
        assert!(!state.exit_required());
        state.request_exit();
        assert!(state.exit_required());
    }
}
