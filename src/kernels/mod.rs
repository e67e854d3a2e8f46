//! External kernel contracts: optical flow and feature extraction.
//!
//! The heavy image-processing kernels are not implemented by this crate.
//! The embedding application supplies them through the traits below; the
//! core only specifies their contracts and owns the pyramid buffers they
//! operate on.

use image::GrayImage;
use nalgebra::Vector2;

use crate::map::Descriptor;

/// An image pyramid owned by the tracking or mapping side.
///
/// `Empty` is the state before the first frame and after a reset; the
/// kernel fills it with `Built` levels (level 0 is the full-resolution
/// image).
#[derive(Clone, Default)]
pub enum Pyramid {
    #[default]
    Empty,
    Built {
        levels: Vec<GrayImage>,
    },
}

impl Pyramid {
    pub fn is_empty(&self) -> bool {
        matches!(self, Pyramid::Empty)
    }

    pub fn nb_levels(&self) -> usize {
        match self {
            Pyramid::Empty => 0,
            Pyramid::Built { levels } => levels.len(),
        }
    }

    /// Full-resolution level, if built.
    pub fn base(&self) -> Option<&GrayImage> {
        match self {
            Pyramid::Empty => None,
            Pyramid::Built { levels } => levels.first(),
        }
    }
}

impl std::fmt::Debug for Pyramid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Pyramid::Empty => f.write_str("Pyramid::Empty"),
            Pyramid::Built { levels } => f
                .debug_struct("Pyramid::Built")
                .field("levels", &levels.len())
                .finish(),
        }
    }
}

/// Parameters handed to the optical-flow kernel per tracking batch.
#[derive(Debug, Clone)]
pub struct KltSettings {
    /// Number of pyramid levels to descend.
    pub levels: u32,
    /// Search window side length in pixels.
    pub window_size: u32,
    /// Gaussian sigma used when the kernel builds pyramid levels.
    pub sigma: f64,
    /// Forward-backward consistency tolerance in pixels.
    pub max_fb_distance: f64,
}

/// Outcome of tracking one point.
#[derive(Debug, Clone, Copy)]
pub struct FlowStatus {
    /// Tracked position in the target image.
    pub px: Vector2<f64>,
    /// Whether the forward-backward track converged within tolerance.
    pub ok: bool,
}

/// Forward-backward pyramidal Lucas-Kanade tracking contract.
///
/// Implementations must be pure with respect to the map: they see pixels
/// and positions only. `fb_track` returns one status per input point, in
/// order; a point whose backward track lands farther than
/// `max_fb_distance` from its start must be reported with `ok = false`.
pub trait OpticalFlowKernel: Send + Sync {
    /// Build a pyramid with `levels` levels from a grayscale image.
    fn build_pyramid(&self, image: &GrayImage, levels: u32) -> Pyramid;

    /// Track `points` from `prev` into `cur`, starting each search at the
    /// corresponding entry of `priors`.
    fn fb_track(
        &self,
        prev: &Pyramid,
        cur: &Pyramid,
        points: &[Vector2<f64>],
        priors: &[Vector2<f64>],
        settings: &KltSettings,
    ) -> Vec<FlowStatus>;
}

/// Occupancy-aware corner detection contract.
///
/// `occupied` lists pixels already claimed by tracked keypoints; the
/// extractor must return at most `max_new` detections away from them,
/// each with an optional binary descriptor.
pub trait FeatureExtractor: Send {
    fn detect(
        &mut self,
        image: &GrayImage,
        occupied: &[Vector2<f64>],
        max_new: usize,
    ) -> Vec<(Vector2<f64>, Option<Descriptor>)>;
}
