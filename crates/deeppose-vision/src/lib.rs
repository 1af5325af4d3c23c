//! # DeepPose-Vision
//!
//! Neural network side of DeepPose: a VGG19 backbone whose classifier is
//! sliced off to obtain a stride-8 feature extractor, a cascade of belief
//! and affinity stages on top of it, the image transforms applied before
//! inference, and the multi-stage training loss.
//!
//! ## Architecture Overview
//!
//! 1. **Backbone**: VGG19 `features[..23]` (through conv4_2), 512 channels
//! 2. **Reducer**: 512 -> 256 -> 128 channels
//! 3. **Stages**: belief maps (8 cuboid vertices + centroid) and vector
//!    fields (16 channels), refined over several stages
//!
//! Loss: L = Σ_s MSE(belief_s) + Σ_s MSE(affinity_s)

pub mod backbone;
pub mod heads;
pub mod loss;
pub mod model;
pub mod transforms;

pub use backbone::*;
pub use heads::*;
pub use loss::*;
pub use model::*;
pub use transforms::*;
