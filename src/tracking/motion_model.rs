//! Velocity-based motion model for pose prediction.

use nalgebra::{UnitQuaternion, Vector3};

use crate::geometry::SE3;

/// Constant-velocity motion model.
///
/// Keeps the last observed (timestamp, pose) pair and extrapolates
/// translation and rotation linearly in time. Returns an identity delta on
/// the first call and after a reset.
pub struct MotionModel {
    /// Last observed timestamp and pose.
    prev: Option<(f64, SE3)>,
    /// Translational velocity in world frame (per second).
    velocity: Vector3<f64>,
    /// Angular velocity (rotation per second).
    angular_velocity: UnitQuaternion<f64>,
}

impl MotionModel {
    pub fn new() -> Self {
        Self {
            prev: None,
            velocity: Vector3::zeros(),
            angular_velocity: UnitQuaternion::identity(),
        }
    }

    /// Predict the pose at `time` from the last observation.
    ///
    /// `None` before the first observation (the caller keeps the current
    /// pose, i.e. an identity delta).
    pub fn predict(&self, time: f64) -> Option<SE3> {
        let (prev_time, prev_pose) = self.prev.as_ref()?;
        let dt = time - prev_time;
        if dt <= 0.0 {
            return Some(prev_pose.clone());
        }
        Some(SE3 {
            rotation: prev_pose.rotation * self.angular_velocity.powf(dt),
            translation: prev_pose.translation + self.velocity * dt,
        })
    }

    /// Update the model with the final pose of the current frame.
    pub fn update(&mut self, pose: &SE3, time: f64) {
        if let Some((prev_time, prev_pose)) = &self.prev {
            let dt = time - prev_time;
            if dt > 1e-9 {
                self.velocity = (pose.translation - prev_pose.translation) / dt;
                let delta = prev_pose.rotation.inverse() * pose.rotation;
                self.angular_velocity = delta.powf(1.0 / dt);
            }
        }
        self.prev = Some((time, pose.clone()));
    }

    /// Forget everything; the next prediction is an identity delta.
    pub fn reset(&mut self) {
        self.prev = None;
        self.velocity = Vector3::zeros();
        self.angular_velocity = UnitQuaternion::identity();
    }
}

impl Default for MotionModel {
    fn default() -> Self {
        Self::new()
    }
}
