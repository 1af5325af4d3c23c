//! Dataset record types for LineMOD in COCO layout.

use std::collections::HashMap;
use std::path::Path;

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Number of cuboid vertices projected per object
pub const CUBOID_VERTICES: usize = 8;

/// Belief map channels: one per cuboid vertex plus the centroid
pub const BELIEF_CHANNELS: usize = CUBOID_VERTICES + 1;

/// Vector field channels: an (x, y) pair per cuboid vertex
pub const AFFINITY_CHANNELS: usize = CUBOID_VERTICES * 2;

/// Total ground-truth channels stacked per sample
pub const TARGET_CHANNELS: usize = BELIEF_CHANNELS + AFFINITY_CHANNELS;

/// Axis-aligned 3D extents of an object mesh, in model coordinates (mm)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObjectModel {
    pub min_x: f64,
    pub min_y: f64,
    pub min_z: f64,
    pub size_x: f64,
    pub size_y: f64,
    pub size_z: f64,
    #[serde(default)]
    pub diameter: Option<f64>,
}

impl ObjectModel {
    pub fn min_corner(&self) -> Vector3<f64> {
        Vector3::new(self.min_x, self.min_y, self.min_z)
    }

    pub fn extents(&self) -> Vector3<f64> {
        Vector3::new(self.size_x, self.size_y, self.size_z)
    }
}

/// Object models keyed by category id, as stored in `models_info.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelCatalog(HashMap<String, ObjectModel>);

impl ModelCatalog {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn insert(&mut self, category: u32, model: ObjectModel) {
        self.0.insert(category.to_string(), model);
    }

    pub fn get(&self, category: u32) -> Result<&ObjectModel> {
        self.0
            .get(&category.to_string())
            .ok_or(Error::MissingObjectModel { category })
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Image entry of a COCO annotation file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: u64,
    pub file_name: String,
    pub width: u32,
    pub height: u32,
}

/// COCO annotation extended with the LineMOD camera and pose fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseAnnotation {
    #[serde(default)]
    pub id: u64,
    pub image_id: u64,
    pub category_id: u32,
    /// Camera intrinsics, row-major 3x3
    #[serde(rename = "cam_K")]
    pub cam_k: [f64; 9],
    /// Model-to-camera rotation, row-major 3x3
    #[serde(rename = "cam_R_m2c")]
    pub cam_r_m2c: [f64; 9],
    /// Model-to-camera translation (mm)
    pub cam_t_m2c: [f64; 3],
    /// [x, y, width, height] in pixels
    #[serde(default)]
    pub bbox: Option<[f64; 4]>,
}

impl PoseAnnotation {
    pub fn intrinsics(&self) -> Matrix3<f64> {
        Matrix3::from_row_slice(&self.cam_k)
    }

    pub fn rotation(&self) -> Matrix3<f64> {
        Matrix3::from_row_slice(&self.cam_r_m2c)
    }

    pub fn translation(&self) -> Vector3<f64> {
        Vector3::from_row_slice(&self.cam_t_m2c)
    }
}

/// Category entry of a COCO annotation file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRecord {
    pub id: u32,
    #[serde(default)]
    pub name: String,
}

/// Top-level COCO annotation document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CocoDocument {
    pub images: Vec<ImageRecord>,
    pub annotations: Vec<PoseAnnotation>,
    #[serde(default)]
    pub categories: Vec<CategoryRecord>,
}

impl CocoDocument {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }
}
