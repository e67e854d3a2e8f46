//! Camera models and projection math.
//!
//! A camera is either a plain pinhole or a pinhole with radial-tangential
//! distortion. Each camera carries the rigid extrinsic `t_cam_ref` mapping
//! points from the reference (left) camera frame into its own frame; the
//! left camera's extrinsic is the identity.

use nalgebra::{Vector2, Vector3};

use crate::geometry::SE3;

/// Fixed-point iterations used to invert the distortion model.
const UNDISTORT_ITERATIONS: usize = 8;

/// Pinhole intrinsics.
#[derive(Debug, Clone)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub width: u32,
    pub height: u32,
}

/// Camera model: pinhole, optionally with radial-tangential distortion.
#[derive(Debug, Clone)]
pub enum CameraModel {
    Pinhole {
        intrinsics: Intrinsics,
        /// Transform from the reference (left) camera frame to this camera.
        t_cam_ref: SE3,
    },
    PinholeDistorted {
        intrinsics: Intrinsics,
        /// Radial-tangential coefficients [k1, k2, p1, p2].
        dist: [f64; 4],
        t_cam_ref: SE3,
    },
}

impl CameraModel {
    /// Pinhole camera co-located with the reference frame.
    pub fn pinhole(fx: f64, fy: f64, cx: f64, cy: f64, width: u32, height: u32) -> Self {
        Self::Pinhole {
            intrinsics: Intrinsics {
                fx,
                fy,
                cx,
                cy,
                width,
                height,
            },
            t_cam_ref: SE3::identity(),
        }
    }

    /// Replace the extrinsic transform from the reference camera frame.
    pub fn with_extrinsics(mut self, t: SE3) -> Self {
        match &mut self {
            Self::Pinhole { t_cam_ref, .. } | Self::PinholeDistorted { t_cam_ref, .. } => {
                *t_cam_ref = t;
            }
        }
        self
    }

    pub fn intrinsics(&self) -> &Intrinsics {
        match self {
            Self::Pinhole { intrinsics, .. } | Self::PinholeDistorted { intrinsics, .. } => {
                intrinsics
            }
        }
    }

    /// Transform from the reference (left) camera frame to this camera frame.
    pub fn t_cam_ref(&self) -> &SE3 {
        match self {
            Self::Pinhole { t_cam_ref, .. } | Self::PinholeDistorted { t_cam_ref, .. } => t_cam_ref,
        }
    }

    /// Project a camera-frame point to a (distorted) pixel.
    ///
    /// The caller is responsible for checking depth positivity first.
    pub fn project(&self, p_cam: &Vector3<f64>) -> Vector2<f64> {
        let k = self.intrinsics();
        let x = p_cam.x / p_cam.z;
        let y = p_cam.y / p_cam.z;

        let (xd, yd) = match self {
            Self::Pinhole { .. } => (x, y),
            Self::PinholeDistorted { dist, .. } => distort(x, y, dist),
        };

        Vector2::new(k.fx * xd + k.cx, k.fy * yd + k.cy)
    }

    /// Project a camera-frame point to an undistorted pixel.
    pub fn project_undistort(&self, p_cam: &Vector3<f64>) -> Vector2<f64> {
        let k = self.intrinsics();
        Vector2::new(
            k.fx * p_cam.x / p_cam.z + k.cx,
            k.fy * p_cam.y / p_cam.z + k.cy,
        )
    }

    /// Whether a pixel lies inside the image bounds.
    pub fn in_image(&self, px: &Vector2<f64>) -> bool {
        let k = self.intrinsics();
        px.x >= 0.0 && px.x < k.width as f64 && px.y >= 0.0 && px.y < k.height as f64
    }

    /// Map an observed (distorted) pixel to its undistorted position.
    pub fn undistort_px(&self, px: &Vector2<f64>) -> Vector2<f64> {
        match self {
            Self::Pinhole { .. } => *px,
            Self::PinholeDistorted {
                intrinsics: k,
                dist,
                ..
            } => {
                let xd = (px.x - k.cx) / k.fx;
                let yd = (px.y - k.cy) / k.fy;

                // Fixed-point inversion of the distortion model.
                let mut x = xd;
                let mut y = yd;
                for _ in 0..UNDISTORT_ITERATIONS {
                    let (dx, dy) = distort(x, y, dist);
                    x -= dx - xd;
                    y -= dy - yd;
                }

                Vector2::new(k.fx * x + k.cx, k.fy * y + k.cy)
            }
        }
    }

    /// Unproject an undistorted pixel to a unit bearing in the camera frame.
    pub fn unproject(&self, unpx: &Vector2<f64>) -> Vector3<f64> {
        self.normalized_coords(unpx).normalize()
    }

    /// Unproject an undistorted pixel onto the z = 1 plane.
    pub fn normalized_coords(&self, unpx: &Vector2<f64>) -> Vector3<f64> {
        let k = self.intrinsics();
        Vector3::new((unpx.x - k.cx) / k.fx, (unpx.y - k.cy) / k.fy, 1.0)
    }

    /// Cosine of the half field-of-view along the wider image axis.
    ///
    /// Points whose viewing-ray cosine against the optical axis falls below
    /// this value are outside the frustum.
    pub fn half_fov_cos(&self) -> f64 {
        let k = self.intrinsics();
        let half_h = (0.5 * k.width as f64 / k.fx).atan();
        let half_v = (0.5 * k.height as f64 / k.fy).atan();
        half_h.max(half_v).cos()
    }
}

/// Apply radial-tangential distortion to normalized coordinates.
fn distort(x: f64, y: f64, dist: &[f64; 4]) -> (f64, f64) {
    let [k1, k2, p1, p2] = *dist;
    let r2 = x * x + y * y;
    let radial = 1.0 + k1 * r2 + k2 * r2 * r2;
    let xd = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
    let yd = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
    (xd, yd)
}
