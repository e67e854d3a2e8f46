//! Keypoint - a tracked 2D observation in a frame.

use nalgebra::{Vector2, Vector3};

use super::types::{Descriptor, KeypointId};

/// A tracked keypoint observation.
///
/// Keypoints live inside frames and are keyed by a globally unique id
/// shared with their map point. The undistorted pixel and the bearing are
/// derived from `px` by the map store whenever the pixel is updated.
#[derive(Debug, Clone)]
pub struct Keypoint {
    pub id: KeypointId,

    /// Observed pixel position (distorted image coordinates).
    pub px: Vector2<f64>,

    /// Undistorted pixel position.
    pub unpx: Vector2<f64>,

    /// Paired right-image pixel, when stereo matching succeeded.
    pub rpx: Option<Vector2<f64>>,

    /// Unit viewing ray in the camera frame.
    pub bearing: Vector3<f64>,

    /// Whether the paired map point has been triangulated.
    pub is_3d: bool,

    /// Binary descriptor extracted at detection time.
    pub desc: Option<Descriptor>,
}

impl Keypoint {
    pub fn new(
        id: KeypointId,
        px: Vector2<f64>,
        unpx: Vector2<f64>,
        bearing: Vector3<f64>,
        desc: Option<Descriptor>,
    ) -> Self {
        Self {
            id,
            px,
            unpx,
            rpx: None,
            bearing,
            is_3d: false,
            desc,
        }
    }

    pub fn is_stereo(&self) -> bool {
        self.rpx.is_some()
    }
}
