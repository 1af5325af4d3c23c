//! # DeepPose-Data
//!
//! Training data for DeepPose: LineMOD images with COCO-style pose
//! annotations, turned into belief-map and vector-field targets on the
//! backbone's stride-8 grid.
//!
//! ## Pipeline
//!
//! ```text
//! image file ─> augmentation ─> [3, H, W] tensor
//! annotation ─> project cuboid (K [R|t]) ─> belief maps + vector fields ─> [25, H/8, W/8]
//! ```

pub mod augmentation;
pub mod dataset;
pub mod ground_truth;
pub mod loader;

pub use augmentation::{AugmentationConfig, Augmenter};
pub use dataset::{DatasetConfig, LineModDataset, PoseDataset, Sample};
pub use ground_truth::{gaussian_heatmap, vector_field, GroundTruth, GroundTruthGenerator};
pub use loader::{Batch, BatchIter, DataLoader, LoaderConfig};
