//! Inter-thread message types.

use image::GrayImage;

use crate::kernels::Pyramid;
use crate::map::KeyFrameId;

/// Message sent from the front-end to the mapper when a keyframe is
/// promoted.
pub struct KeyFrameJob {
    /// The id assigned to the promoted keyframe.
    pub kfid: KeyFrameId,

    /// Left-image pyramid already built by the front-end, reused for
    /// stereo matching instead of rebuilding.
    pub pyramid: Pyramid,

    /// Right stereo image, when running in stereo mode.
    pub right_image: Option<GrayImage>,
}
