//! Background mapping: triangulation, covisibility and local-map
//! maintenance on a dedicated worker thread.

pub mod local_map;
pub mod mapper;
pub mod triangulator;

use thiserror::Error;

use crate::map::KeyFrameId;

/// Per-stage mapper failures.
///
/// These are logged and skipped by the mapper loop; none of them
/// terminates the thread.
#[derive(Debug, Error)]
pub enum MapperError {
    #[error("keyframe {0} is not in the map")]
    MissingKeyframe(KeyFrameId),

    #[error("stereo step requires a right camera")]
    MissingRightCamera,
}

pub use local_map::match_to_local_map;
pub use mapper::Mapper;
pub use triangulator::{triangulate_stereo, triangulate_temporal};
