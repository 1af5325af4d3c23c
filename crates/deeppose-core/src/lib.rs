//! # DeepPose-Core
//!
//! Core types shared by the DeepPose crates: the workspace error type,
//! LineMOD dataset records (object models and pose annotations) and the
//! camera geometry used to project object cuboids into image space.

pub mod error;
pub mod geometry;
pub mod types;

pub use error::{Error, Result};
pub use geometry::*;
pub use types::*;
