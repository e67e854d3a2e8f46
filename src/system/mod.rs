//! System orchestration and thread management.
//!
//! Contains the top-level `SlamSystem` that wires the front-end, the
//! mapper worker and the estimator handoff together, along with the
//! shared state and inter-thread message types.

pub mod estimator;
pub mod messages;
pub mod shared;
mod slam_system;

pub use estimator::{Estimator, EstimatorQueue, NoopEstimator};
pub use messages::KeyFrameJob;
pub use shared::{RuntimeState, SharedState};
pub use slam_system::SlamSystem;
