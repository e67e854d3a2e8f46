//! Front-end tracking: per-frame optical-flow tracking, initialization
//! detection and keyframe selection.

pub mod front_end;
pub mod keyframe_decision;
pub mod motion_model;
pub mod parallax;

pub use front_end::FrontEnd;
pub use keyframe_decision::KeyframeDecision;
pub use motion_model::MotionModel;
pub use parallax::compute_parallax;
