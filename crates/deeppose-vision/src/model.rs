//! Complete DeepPose network: truncated VGG19, channel reducer, stage cascade.

use std::path::Path;

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder, VarMap};
use serde::Serialize;
use tracing::{debug, info};

use crate::backbone::{FeatureExtractor, Vgg19, VggConfig, POSE_FEATURE_LAYERS};
use crate::heads::{StageCascade, StageConfig};

/// Complete model configuration
#[derive(Debug, Clone)]
pub struct DeepPoseConfig {
    /// Number of VGG19 `features` layers kept
    pub feature_layers: usize,
    /// Widths of the two 3x3 convs between backbone and stages
    pub reducer_channels: [usize; 2],
    pub stages: StageConfig,
}

impl Default for DeepPoseConfig {
    fn default() -> Self {
        Self {
            feature_layers: POSE_FEATURE_LAYERS,
            reducer_channels: [256, 128],
            stages: StageConfig::default(),
        }
    }
}

impl DeepPoseConfig {
    pub fn backbone(&self) -> VggConfig {
        VggConfig::features_only(self.feature_layers)
    }
}

/// Two 3x3 convs bringing backbone features down to the stage width
struct Reducer {
    conv1: Conv2d,
    conv2: Conv2d,
}

impl Reducer {
    fn new(in_channels: usize, widths: [usize; 2], vb: VarBuilder) -> Result<Self> {
        let padded = || Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv1 = conv2d(in_channels, widths[0], 3, padded(), vb.pp("conv1"))?;
        let conv2 = conv2d(widths[0], widths[1], 3, padded(), vb.pp("conv2"))?;
        Ok(Self { conv1, conv2 })
    }
}

impl Module for Reducer {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.conv1.forward(x)?.relu()?;
        self.conv2.forward(&x)?.relu()
    }
}

/// DeepPose object pose network
pub struct DeepPoseModel {
    extractor: FeatureExtractor,
    reducer: Reducer,
    cascade: StageCascade,
    config: DeepPoseConfig,
}

impl DeepPoseModel {
    /// Build every weight from `vb`; the backbone lives under `backbone.features.*`
    pub fn new(config: DeepPoseConfig, vb: VarBuilder) -> Result<Self> {
        let vgg = Vgg19::new(config.backbone(), vb.pp("backbone"))?;
        Self::from_backbone(vgg, config, vb)
    }

    /// Pretrained VGG19 weights from `path`, randomly initialised heads.
    ///
    /// The returned `VarMap` owns the head weights.
    pub fn with_pretrained_backbone<P: AsRef<Path>>(
        path: P,
        config: DeepPoseConfig,
        device: &Device,
    ) -> deeppose_core::Result<(Self, VarMap)> {
        let vgg = Vgg19::load_pretrained(path, config.backbone(), device)?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = Self::from_backbone(vgg, config, vb)?;

        info!(
            stages = model.cascade.n_stages(),
            "built DeepPose model on pretrained backbone"
        );
        Ok((model, varmap))
    }

    fn from_backbone(vgg: Vgg19, config: DeepPoseConfig, vb: VarBuilder) -> Result<Self> {
        let extractor = vgg.truncate(config.feature_layers)?;
        let reducer = Reducer::new(
            extractor.output_channels(),
            config.reducer_channels,
            vb.pp("reducer"),
        )?;

        let mut stage_config = config.stages.clone();
        stage_config.feature_channels = config.reducer_channels[1];
        let cascade = StageCascade::new(stage_config, vb.pp("stages"))?;

        debug!(
            feature_layers = extractor.len(),
            stride = extractor.stride(),
            "assembled DeepPose model"
        );

        Ok(Self {
            extractor,
            reducer,
            cascade,
            config,
        })
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `images` - Normalized images [batch, 3, height, width]
    ///
    /// # Returns
    /// Belief and affinity maps of every stage at 1/stride resolution
    pub fn forward(&self, images: &Tensor) -> Result<ModelOutput> {
        let features = self.extractor.forward(images)?;
        let features = self.reducer.forward(&features)?;
        let (beliefs, affinities) = self.cascade.forward(&features)?;

        Ok(ModelOutput {
            beliefs,
            affinities,
        })
    }

    /// Downsampling between image and output maps
    pub fn stride(&self) -> usize {
        self.extractor.stride()
    }

    pub fn extractor(&self) -> &FeatureExtractor {
        &self.extractor
    }

    pub fn config(&self) -> &DeepPoseConfig {
        &self.config
    }
}

/// Raw per-stage outputs
pub struct ModelOutput {
    /// Belief maps per stage [batch, 9, h, w]
    pub beliefs: Vec<Tensor>,
    /// Affinity fields per stage [batch, 16, h, w]
    pub affinities: Vec<Tensor>,
}

impl ModelOutput {
    /// Final stage belief maps
    pub fn final_belief(&self) -> Option<&Tensor> {
        self.beliefs.last()
    }

    /// Argmax of each final-stage belief map, per batch item
    pub fn peak_locations(&self, stride: usize) -> Result<Vec<Vec<BeliefPeak>>> {
        let belief = match self.final_belief() {
            Some(b) => b,
            None => return Ok(Vec::new()),
        };

        let (_, _, _, width) = belief.dims4()?;
        let flat = belief.flatten_from(2)?;
        let indices: Vec<Vec<u32>> = flat.argmax(2)?.to_vec2()?;
        let scores: Vec<Vec<f32>> = flat.max(2)?.to_dtype(DType::F32)?.to_vec2()?;

        Ok(indices
            .into_iter()
            .zip(scores)
            .map(|(idx_row, score_row)| {
                idx_row
                    .into_iter()
                    .zip(score_row)
                    .enumerate()
                    .map(|(channel, (idx, score))| {
                        let idx = idx as usize;
                        BeliefPeak {
                            channel,
                            grid_x: idx % width,
                            grid_y: idx / width,
                            stride,
                            score,
                        }
                    })
                    .collect()
            })
            .collect())
    }
}

/// Location of a belief map maximum
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BeliefPeak {
    /// Belief channel (vertex index, or 8 for the centroid)
    pub channel: usize,
    pub grid_x: usize,
    pub grid_y: usize,
    pub stride: usize,
    pub score: f32,
}

impl BeliefPeak {
    /// Approximate pixel coordinates in the input image
    pub fn pixel(&self) -> (f32, f32) {
        (
            (self.grid_x * self.stride) as f32,
            (self.grid_y * self.stride) as f32,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deeppose_core::{AFFINITY_CHANNELS, BELIEF_CHANNELS};

    fn small_config() -> DeepPoseConfig {
        DeepPoseConfig {
            feature_layers: POSE_FEATURE_LAYERS,
            reducer_channels: [32, 16],
            stages: StageConfig {
                hidden_channels: 8,
                bottleneck_channels: 16,
                n_stages: 2,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_model_output_shapes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let model = DeepPoseModel::new(small_config(), vb)?;
        assert_eq!(model.stride(), 8);

        let images = Tensor::zeros((1, 3, 32, 48), DType::F32, &device)?;
        let output = model.forward(&images)?;

        assert_eq!(output.beliefs.len(), 2);
        assert_eq!(output.beliefs[1].dims(), &[1, BELIEF_CHANNELS, 4, 6]);
        assert_eq!(output.affinities[1].dims(), &[1, AFFINITY_CHANNELS, 4, 6]);

        // Backbone weights keep torchvision names under the prefix
        let data = varmap.data().lock().unwrap();
        assert!(data.contains_key("backbone.features.0.weight"));
        assert!(data.contains_key("reducer.conv2.weight"));
        assert!(data.contains_key("stages.stage2.affinity.output.bias"));
        Ok(())
    }

    #[test]
    fn test_peak_locations() -> Result<()> {
        let device = Device::Cpu;
        let mut data = vec![0f32; BELIEF_CHANNELS * 4 * 6];
        // channel 2, y = 3, x = 1
        data[2 * 24 + 3 * 6 + 1] = 0.9;
        let belief = Tensor::from_vec(data, (1, BELIEF_CHANNELS, 4, 6), &device)?;

        let output = ModelOutput {
            beliefs: vec![belief],
            affinities: vec![],
        };
        let peaks = output.peak_locations(8)?;

        assert_eq!(peaks.len(), 1);
        assert_eq!(peaks[0].len(), BELIEF_CHANNELS);
        let peak = peaks[0][2];
        assert_eq!((peak.grid_x, peak.grid_y), (1, 3));
        assert_eq!(peak.pixel(), (8.0, 24.0));
        assert!((peak.score - 0.9).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_pretrained_backbone_loads_trunk_only() -> deeppose_core::Result<()> {
        let device = Device::Cpu;
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("vgg19_features.safetensors");

        let trunk = VarMap::new();
        let vb = VarBuilder::from_varmap(&trunk, DType::F32, &device);
        Vgg19::new(VggConfig::features_only(POSE_FEATURE_LAYERS), vb)?;
        trunk.save(&path)?;

        let (model, heads) = DeepPoseModel::with_pretrained_backbone(&path, small_config(), &device)?;
        assert_eq!(model.stride(), 8);

        {
            let data = heads.data().lock().unwrap();
            assert!(!data.is_empty());
            assert!(data
                .keys()
                .all(|k| k.starts_with("reducer.") || k.starts_with("stages.")));
        }

        let images = Tensor::zeros((1, 3, 32, 32), DType::F32, &device)?;
        let output = model.forward(&images)?;
        assert_eq!(output.beliefs.len(), 2);
        assert_eq!(output.affinities[1].dims(), &[1, AFFINITY_CHANNELS, 4, 4]);
        Ok(())
    }

    #[test]
    fn test_pretrained_backbone_missing_file() {
        let result = DeepPoseModel::with_pretrained_backbone(
            "/nonexistent/vgg19.safetensors",
            small_config(),
            &Device::Cpu,
        );
        assert!(matches!(result, Err(deeppose_core::Error::ModelLoad(_))));
    }
}
