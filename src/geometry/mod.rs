//! Geometry utilities: SE3 transforms, linear triangulation.

pub mod se3;
pub mod triangulation;

pub use se3::SE3;
pub use triangulation::{projection_matrix, triangulate_linear};
