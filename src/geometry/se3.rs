//! SE(3) rigid-body transforms.

use nalgebra::{UnitQuaternion, Vector3};

/// A rigid-body transform (rotation + translation).
///
/// Poses are stored as `T_wc` (camera-to-world) throughout the crate:
/// `p_world = pose.transform_point(&p_cam)`.
#[derive(Debug, Clone, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// The identity transform.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Create a transform from a rotation and a translation.
    pub fn from_parts(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Specialized rigid inverse: `(R, t)^-1 = (R^-1, -R^-1 t)`.
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// Compose two transforms: `self * other`.
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// Apply the transform to a point.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}
