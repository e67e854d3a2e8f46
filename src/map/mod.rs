//! The shared map: frames, keyframes, keypoints and map points.
//!
//! The map is modeled as a central store owning all entities; entities
//! refer to each other by id, never by direct reference.

pub mod frame;
pub mod keypoint;
pub mod map_point;
pub mod store;
pub mod types;

pub use frame::Frame;
pub use keypoint::Keypoint;
pub use map_point::MapPoint;
pub use store::MapStore;
pub use types::{Descriptor, FrameId, KeyFrameId, KeypointId};
