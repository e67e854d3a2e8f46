//! Estimator handoff: a bounded FIFO of finished keyframes.
//!
//! The mapper enqueues keyframe ids once all map maintenance for them is
//! done; the estimator thread drains the queue and feeds a user-supplied
//! [`Estimator`]. The bundle adjustment itself lives outside this crate.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::map::KeyFrameId;

use super::shared::SharedState;

/// Consumer of completed keyframes.
///
/// Implementations run on the estimator thread and may take the
/// optimization lock (before the map lock) to serialize against the
/// mapper's structural merges.
pub trait Estimator: Send {
    fn process_keyframe(&mut self, kfid: KeyFrameId, shared: &Arc<SharedState>);
}

/// Default estimator that discards every keyframe.
pub struct NoopEstimator;

impl Estimator for NoopEstimator {
    fn process_keyframe(&mut self, _kfid: KeyFrameId, _shared: &Arc<SharedState>) {}
}

/// Mutex-protected keyframe FIFO with condition-variable signalling.
pub struct EstimatorQueue {
    queue: Mutex<VecDeque<KeyFrameId>>,
    available: Condvar,
    new_kf_available: AtomicBool,
    exit: AtomicBool,
}

impl EstimatorQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            new_kf_available: AtomicBool::new(false),
            exit: AtomicBool::new(false),
        })
    }

    /// Enqueue a finished keyframe (non-blocking).
    pub fn push(&self, kfid: KeyFrameId) {
        self.queue.lock().push_back(kfid);
        self.new_kf_available.store(true, Ordering::SeqCst);
        self.available.notify_one();
    }

    /// Pop the oldest keyframe, blocking up to `timeout`.
    ///
    /// Returns `None` on timeout or when shutdown was requested.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<KeyFrameId> {
        let mut queue = self.queue.lock();
        loop {
            if let Some(kfid) = queue.pop_front() {
                if queue.is_empty() {
                    self.new_kf_available.store(false, Ordering::SeqCst);
                }
                return Some(kfid);
            }
            if self.exit.load(Ordering::SeqCst) {
                return None;
            }
            if self.available.wait_for(&mut queue, timeout).timed_out() {
                return None;
            }
        }
    }

    pub fn new_kf_available(&self) -> bool {
        self.new_kf_available.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Drop all queued keyframes and clear the availability flag.
    pub fn reset(&self) {
        self.queue.lock().clear();
        self.new_kf_available.store(false, Ordering::SeqCst);
    }

    /// Wake the consumer and make it exit.
    pub fn request_exit(&self) {
        self.exit.store(true, Ordering::SeqCst);
        self.available.notify_all();
    }

    pub fn exit_requested(&self) -> bool {
        self.exit.load(Ordering::SeqCst)
    }
}

/// Estimator thread loop: drain the queue until shutdown.
pub fn run_estimator(
    queue: Arc<EstimatorQueue>,
    shared: Arc<SharedState>,
    mut estimator: Box<dyn Estimator>,
) {
    const POLL_TIMEOUT: Duration = Duration::from_millis(100);

    loop {
        if queue.exit_requested() && queue.is_empty() {
            break;
        }
        if shared.state.exit_required() && queue.is_empty() {
            break;
        }
        if let Some(kfid) = queue.pop_timeout(POLL_TIMEOUT) {
            estimator.process_keyframe(kfid, &shared);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let queue = EstimatorQueue::new();
        queue.push(KeyFrameId(0));
        queue.push(KeyFrameId(1));
        queue.push(KeyFrameId(2));

        assert!(queue.new_kf_available());
        assert_eq!(
            queue.pop_timeout(Duration::from_millis(1)),
            Some(KeyFrameId(0))
        );
        assert_eq!(
            queue.pop_timeout(Duration::from_millis(1)),
            Some(KeyFrameId(1))
        );
        assert_eq!(
            queue.pop_timeout(Duration::from_millis(1)),
            Some(KeyFrameId(2))
        );
        assert!(!queue.new_kf_available());
    }

    #[test]
    fn test_pop_times_out_when_empty() {
        let queue = EstimatorQueue::new();
        assert_eq!(queue.pop_timeout(Duration::from_millis(1)), None);
    }

    #[test]
    fn test_reset_drains_and_clears_flag() {
        let queue = EstimatorQueue::new();
        queue.push(KeyFrameId(0));
        queue.push(KeyFrameId(1));

        queue.reset();

        assert!(queue.is_empty());
        assert!(!queue.new_kf_available());
    }

    #[test]
    fn test_exit_wakes_consumer() {
        let queue = EstimatorQueue::new();
        let q2 = Arc::clone(&queue);
        let handle = std::thread::spawn(move || q2.pop_timeout(Duration::from_secs(10)));

        std::thread::sleep(Duration::from_millis(10));
        queue.request_exit();
        assert_eq!(handle.join().unwrap(), None);
    }
}
