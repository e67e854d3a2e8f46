//! Static configuration for the tracking and mapping pipeline.
//!
//! Thresholds and budgets are fixed for the lifetime of the system and
//! shared by reference; runtime-mutable flags (`vision_initialized`,
//! `reset_required`, ...) live in [`crate::system::RuntimeState`] instead.

use serde::{Deserialize, Serialize};

/// Immutable pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Seed KLT searches for 3D keypoints by projecting their map point
    /// through the motion-model pose prior.
    pub use_prior: bool,

    /// Enable the stereo triangulation step in the mapper.
    pub stereo: bool,

    /// Median parallax (pixels) required to declare vision initialized.
    pub initial_parallax: f64,

    /// Number of levels in the optical-flow image pyramid.
    pub pyramid_levels: u32,

    /// Gaussian sigma applied when building pyramid levels.
    pub pyramid_sigma: f64,

    /// Side length (pixels) of the KLT search window.
    pub window_size: u32,

    /// Forward-backward KLT consistency tolerance (pixels).
    pub max_klt_distance: f64,

    /// Triangulation acceptance threshold (pixels, undistorted).
    pub max_reprojection_error: f64,

    /// Per-frame keypoint budget. The local map targets 10x this size.
    pub max_nb_keypoints: usize,

    /// Pixel gate for local-map matching.
    pub max_projection_distance: f64,

    /// Hamming gate for local-map descriptor matching.
    pub max_descriptor_distance: u32,

    /// Enable local-map matching in the mapper.
    pub do_local_matching: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            use_prior: true,
            stereo: false,
            initial_parallax: 20.0,
            pyramid_levels: 3,
            pyramid_sigma: 1.0,
            window_size: 9,
            max_klt_distance: 0.5,
            max_reprojection_error: 3.0,
            max_nb_keypoints: 300,
            max_projection_distance: 2.0,
            max_descriptor_distance: 80,
            do_local_matching: true,
        }
    }
}
