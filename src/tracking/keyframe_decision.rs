//! Steady-state keyframe selection criteria.

/// Criteria for promoting the current frame once vision is initialized.
///
/// A keyframe is requested when the tracked-keypoint occupancy drops well
/// below the per-frame budget, or when the frame has drifted far enough
/// from the reference keyframe (parallax) while occupancy is no longer
/// saturated.
pub struct KeyframeDecision {
    /// Occupancy ratio below which a keyframe is always requested.
    min_occupancy: f64,
    /// Occupancy ratio above which parallax alone never triggers.
    max_occupancy_for_parallax: f64,
}

impl KeyframeDecision {
    pub fn new() -> Self {
        Self {
            min_occupancy: 0.65,
            max_occupancy_for_parallax: 0.85,
        }
    }

    /// Decide whether the current frame should become a keyframe.
    ///
    /// # Arguments
    /// * `nb_keypoints` - Tracked keypoints in the current frame
    /// * `max_nb_keypoints` - Per-frame keypoint budget
    /// * `parallax` - Median parallax against the reference keyframe
    /// * `parallax_threshold` - Parallax (pixels) considered "far enough"
    pub fn should_create_keyframe(
        &self,
        nb_keypoints: usize,
        max_nb_keypoints: usize,
        parallax: f64,
        parallax_threshold: f64,
    ) -> bool {
        if max_nb_keypoints == 0 {
            return false;
        }
        let occupancy = nb_keypoints as f64 / max_nb_keypoints as f64;

        if occupancy < self.min_occupancy {
            return true;
        }
        if parallax > parallax_threshold && occupancy < self.max_occupancy_for_parallax {
            return true;
        }
        false
    }
}

impl Default for KeyframeDecision {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_low_occupancy_triggers() {
        let decision = KeyframeDecision::new();
        assert!(decision.should_create_keyframe(100, 300, 0.0, 10.0));
    }

    #[test]
    fn test_saturated_frame_never_triggers() {
        let decision = KeyframeDecision::new();
        assert!(!decision.should_create_keyframe(290, 300, 50.0, 10.0));
    }

    #[test]
    fn test_parallax_triggers_at_partial_occupancy() {
        let decision = KeyframeDecision::new();
        // 75% occupancy: parallax decides.
        assert!(decision.should_create_keyframe(225, 300, 12.0, 10.0));
        assert!(!decision.should_create_keyframe(225, 300, 8.0, 10.0));
    }

    #[test]
    fn test_zero_budget_is_inert() {
        let decision = KeyframeDecision::new();
        assert!(!decision.should_create_keyframe(0, 0, 100.0, 10.0));
    }
}
