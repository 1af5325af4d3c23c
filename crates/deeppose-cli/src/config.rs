//! Command-line configuration.
//!
//! Values come from built-in defaults, then an optional TOML file, then
//! `DEEPPOSE__SECTION__KEY` environment variables.

use std::path::{Path, PathBuf};

use deeppose_data::{AugmentationConfig, DatasetConfig, GroundTruthGenerator, LoaderConfig};
use deeppose_vision::{VggConfig, IMAGENET_MEAN, IMAGENET_STD, POSE_FEATURE_LAYERS};
use serde::{Deserialize, Serialize};

/// Complete configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// CUDA device ordinal; CPU when unset or unavailable
    pub cuda_device: Option<usize>,

    pub backbone: BackboneConfig,

    pub transform: TransformConfig,

    pub dataset: DatasetSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackboneConfig {
    /// torchvision VGG19 weights converted to safetensors; random init when unset
    pub weights: Option<PathBuf>,

    /// Feature layers kept when slicing off the head
    pub feature_layers: usize,

    /// Build the 1000-way classifier as well
    pub include_classifier: bool,

    /// Side of the square probe image pushed through the extractor
    pub probe_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformConfig {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,

    /// Brightness factor applied after normalization
    pub brightness: f64,

    /// Side of the square random image
    pub image_size: usize,

    pub seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSettings {
    /// Directory the COCO `file_name` entries are relative to
    pub root: PathBuf,

    /// COCO annotation file
    pub annotations: PathBuf,

    /// `models_info.json`
    pub models: PathBuf,

    pub augment: bool,

    pub augmentation: AugmentationConfig,

    pub ground_truth: GroundTruthGenerator,

    pub loader: LoaderConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cuda_device: None,
            backbone: BackboneConfig {
                weights: None,
                feature_layers: POSE_FEATURE_LAYERS,
                include_classifier: true,
                probe_size: 224,
            },
            transform: TransformConfig {
                mean: IMAGENET_MEAN.to_vec(),
                std: IMAGENET_STD.to_vec(),
                brightness: 1.5,
                image_size: 224,
                seed: 0,
            },
            dataset: DatasetSettings {
                root: PathBuf::from("data/linemod/test_data"),
                annotations: PathBuf::from("data/linemod/annotations.json"),
                models: PathBuf::from("data/linemod/models_info.json"),
                augment: true,
                augmentation: AugmentationConfig::default(),
                ground_truth: GroundTruthGenerator::default(),
                loader: LoaderConfig::default(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from file, with environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(config::File::from(path.as_ref()))
            .add_source(environment())
            .build()?;

        settings.try_deserialize()
    }

    /// Load from environment variables on top of the defaults
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(environment())
            .build()?;

        settings.try_deserialize()
    }

    /// Backbone layout for `inspect`
    pub fn vgg(&self) -> VggConfig {
        VggConfig {
            include_classifier: self.backbone.include_classifier,
            ..VggConfig::default()
        }
    }

    pub fn dataset_config(&self) -> DatasetConfig {
        DatasetConfig {
            augment: self.dataset.augment,
            augmentation: self.dataset.augmentation.clone(),
            ground_truth: self.dataset.ground_truth,
        }
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix("DEEPPOSE")
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}
