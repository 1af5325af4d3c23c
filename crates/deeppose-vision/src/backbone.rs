//! VGG19 backbone and its truncated feature extractor.
//!
//! Layers are indexed and named exactly as in the torchvision checkpoint
//! (`features.{i}.weight`, `classifier.{i}.weight`), so converted
//! safetensors weights load without renaming.

use std::fmt;
use std::path::Path;

use candle_core::{bail, DType, Device, Module, Result, Tensor};
use candle_nn::{conv2d, linear, Conv2d, Conv2dConfig, Linear, VarBuilder};
use deeppose_core::Error;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// VGG configuration "E": conv output widths, `None` marks a 2x2 max-pool
const VGG19_LAYOUT: [Option<usize>; 21] = [
    Some(64),
    Some(64),
    None,
    Some(128),
    Some(128),
    None,
    Some(256),
    Some(256),
    Some(256),
    Some(256),
    None,
    Some(512),
    Some(512),
    Some(512),
    Some(512),
    None,
    Some(512),
    Some(512),
    Some(512),
    Some(512),
    None,
];

/// Number of entries in `vgg19.features`
pub const VGG19_FEATURE_LAYERS: usize = 37;

/// Truncation point used for pose estimation: through conv4_2 + ReLU
pub const POSE_FEATURE_LAYERS: usize = 23;

const POOLED_SIZE: usize = 7;
const HIDDEN_UNITS: usize = 4096;

/// Backbone configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VggConfig {
    /// Input image channels
    pub in_channels: usize,
    /// Number of `features` layers to build (1..=37)
    pub feature_layers: usize,
    /// Build the fully connected classifier head
    pub include_classifier: bool,
    /// Classifier output classes
    pub num_classes: usize,
}

impl Default for VggConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            feature_layers: VGG19_FEATURE_LAYERS,
            include_classifier: true,
            num_classes: 1000,
        }
    }
}

impl VggConfig {
    /// Convolutional trunk only, cut at `feature_layers`
    pub fn features_only(feature_layers: usize) -> Self {
        Self {
            feature_layers,
            include_classifier: false,
            ..Default::default()
        }
    }
}

/// Kind and shape of a single layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerKind {
    Conv2d {
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
    },
    Relu,
    MaxPool {
        kernel: usize,
    },
    AdaptiveAvgPool {
        output: usize,
    },
    Linear {
        in_features: usize,
        out_features: usize,
    },
    Dropout,
}

/// Layer description used when inspecting the network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerInfo {
    pub name: String,
    pub kind: LayerKind,
}

impl fmt::Display for LayerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            LayerKind::Conv2d {
                in_channels,
                out_channels,
                kernel,
            } => write!(
                f,
                "{:<14} Conv2d({}, {}, kernel={}x{}, padding=1)",
                self.name, in_channels, out_channels, kernel, kernel
            ),
            LayerKind::Relu => write!(f, "{:<14} ReLU", self.name),
            LayerKind::MaxPool { kernel } => {
                write!(f, "{:<14} MaxPool2d(kernel={}, stride={})", self.name, kernel, kernel)
            }
            LayerKind::AdaptiveAvgPool { output } => {
                write!(f, "{:<14} AdaptiveAvgPool2d({}x{})", self.name, output, output)
            }
            LayerKind::Linear {
                in_features,
                out_features,
            } => write!(f, "{:<14} Linear({}, {})", self.name, in_features, out_features),
            LayerKind::Dropout => write!(f, "{:<14} Dropout(p=0.5)", self.name),
        }
    }
}

/// One entry of the convolutional trunk
enum VggLayer {
    Conv {
        conv: Conv2d,
        in_channels: usize,
        out_channels: usize,
    },
    Relu,
    MaxPool,
}

impl VggLayer {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            VggLayer::Conv { conv, .. } => conv.forward(x),
            VggLayer::Relu => x.relu(),
            VggLayer::MaxPool => x.max_pool2d(2),
        }
    }

    fn info(&self, index: usize) -> LayerInfo {
        let kind = match self {
            VggLayer::Conv {
                in_channels,
                out_channels,
                ..
            } => LayerKind::Conv2d {
                in_channels: *in_channels,
                out_channels: *out_channels,
                kernel: 3,
            },
            VggLayer::Relu => LayerKind::Relu,
            VggLayer::MaxPool => LayerKind::MaxPool { kernel: 2 },
        };

        LayerInfo {
            name: format!("features.{}", index),
            kind,
        }
    }
}

fn build_features(
    in_channels: usize,
    n_layers: usize,
    vb: VarBuilder,
) -> Result<Vec<VggLayer>> {
    let mut layers = Vec::with_capacity(n_layers);
    let mut channels = in_channels;

    for entry in VGG19_LAYOUT {
        if layers.len() >= n_layers {
            break;
        }

        match entry {
            Some(out_channels) => {
                let config = Conv2dConfig {
                    padding: 1,
                    ..Default::default()
                };
                let conv = conv2d(channels, out_channels, 3, config, vb.pp(layers.len()))?;
                layers.push(VggLayer::Conv {
                    conv,
                    in_channels: channels,
                    out_channels,
                });
                channels = out_channels;

                if layers.len() < n_layers {
                    layers.push(VggLayer::Relu);
                }
            }
            None => layers.push(VggLayer::MaxPool),
        }
    }

    Ok(layers)
}

/// Fully connected head: Linear-ReLU-Dropout-Linear-ReLU-Dropout-Linear
struct Classifier {
    fc1: Linear,
    fc2: Linear,
    fc3: Linear,
    num_classes: usize,
}

impl Classifier {
    fn new(num_classes: usize, vb: VarBuilder) -> Result<Self> {
        let fc1 = linear(512 * POOLED_SIZE * POOLED_SIZE, HIDDEN_UNITS, vb.pp(0))?;
        let fc2 = linear(HIDDEN_UNITS, HIDDEN_UNITS, vb.pp(3))?;
        let fc3 = linear(HIDDEN_UNITS, num_classes, vb.pp(6))?;

        Ok(Self {
            fc1,
            fc2,
            fc3,
            num_classes,
        })
    }

    // Dropout is the identity at inference time
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.fc1.forward(x)?.relu()?;
        let x = self.fc2.forward(&x)?.relu()?;
        self.fc3.forward(&x)
    }

    fn infos(&self) -> Vec<LayerInfo> {
        let linear = |i: usize, in_features, out_features| LayerInfo {
            name: format!("classifier.{}", i),
            kind: LayerKind::Linear {
                in_features,
                out_features,
            },
        };
        let plain = |i: usize, kind| LayerInfo {
            name: format!("classifier.{}", i),
            kind,
        };

        vec![
            linear(0, 512 * POOLED_SIZE * POOLED_SIZE, HIDDEN_UNITS),
            plain(1, LayerKind::Relu),
            plain(2, LayerKind::Dropout),
            linear(3, HIDDEN_UNITS, HIDDEN_UNITS),
            plain(4, LayerKind::Relu),
            plain(5, LayerKind::Dropout),
            linear(6, HIDDEN_UNITS, self.num_classes),
        ]
    }
}

/// Adaptive average pooling to a 7x7 grid, for inputs that are exact multiples of 7
fn adaptive_avg_pool(x: &Tensor) -> Result<Tensor> {
    let (_, _, h, w) = x.dims4()?;
    if h == POOLED_SIZE && w == POOLED_SIZE {
        return Ok(x.clone());
    }
    if h % POOLED_SIZE != 0 || w % POOLED_SIZE != 0 {
        bail!(
            "adaptive pooling to {}x{} needs spatial dims divisible by {}, got {}x{}",
            POOLED_SIZE,
            POOLED_SIZE,
            POOLED_SIZE,
            h,
            w
        );
    }

    let kernel = (h / POOLED_SIZE, w / POOLED_SIZE);
    x.avg_pool2d_with_stride(kernel, kernel)
}

/// VGG19 classification network
pub struct Vgg19 {
    features: Vec<VggLayer>,
    classifier: Option<Classifier>,
    config: VggConfig,
}

impl Vgg19 {
    pub fn new(config: VggConfig, vb: VarBuilder) -> Result<Self> {
        if config.feature_layers == 0 || config.feature_layers > VGG19_FEATURE_LAYERS {
            bail!(
                "feature_layers must be in 1..={}, got {}",
                VGG19_FEATURE_LAYERS,
                config.feature_layers
            );
        }
        if config.include_classifier && config.feature_layers != VGG19_FEATURE_LAYERS {
            bail!("the classifier head needs all {} feature layers", VGG19_FEATURE_LAYERS);
        }

        let features = build_features(config.in_channels, config.feature_layers, vb.pp("features"))?;
        let classifier = if config.include_classifier {
            Some(Classifier::new(config.num_classes, vb.pp("classifier"))?)
        } else {
            None
        };

        Ok(Self {
            features,
            classifier,
            config,
        })
    }

    /// Load torchvision VGG19 weights from a safetensors file
    pub fn load_pretrained<P: AsRef<Path>>(
        path: P,
        config: VggConfig,
        device: &Device,
    ) -> deeppose_core::Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), layers = config.feature_layers, "loading VGG19 weights");

        // SAFETY: the weight file is not modified while mapped
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[path], DType::F32, device) }
            .map_err(|e| Error::ModelLoad(format!("{}: {}", path.display(), e)))?;

        Self::new(config, vb).map_err(|e| Error::ModelLoad(format!("{}: {}", path.display(), e)))
    }

    /// Forward pass: trunk, 7x7 pooling, flatten, classifier.
    ///
    /// Without a classifier the trunk output is returned unchanged.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = x.clone();
        for layer in &self.features {
            x = layer.forward(&x)?;
        }

        match &self.classifier {
            Some(classifier) => {
                let x = adaptive_avg_pool(&x)?.flatten_from(1)?;
                classifier.forward(&x)
            }
            None => Ok(x),
        }
    }

    /// Describe every layer in evaluation order
    pub fn layers(&self) -> Vec<LayerInfo> {
        let mut infos: Vec<LayerInfo> = self
            .features
            .iter()
            .enumerate()
            .map(|(i, layer)| layer.info(i))
            .collect();

        if let Some(classifier) = &self.classifier {
            infos.push(LayerInfo {
                name: "avgpool".to_string(),
                kind: LayerKind::AdaptiveAvgPool {
                    output: POOLED_SIZE,
                },
            });
            infos.extend(classifier.infos());
        }

        infos
    }

    /// Keep the first `n_layers` trunk layers and drop everything after them
    pub fn truncate(self, n_layers: usize) -> Result<FeatureExtractor> {
        if n_layers == 0 || n_layers > self.features.len() {
            bail!(
                "cannot truncate to {} layers, backbone has {}",
                n_layers,
                self.features.len()
            );
        }

        let mut features = self.features;
        features.truncate(n_layers);
        debug!(n_layers, "truncated VGG19 to feature extractor");

        Ok(FeatureExtractor {
            layers: features,
            in_channels: self.config.in_channels,
        })
    }

    pub fn config(&self) -> &VggConfig {
        &self.config
    }
}

/// Truncated convolutional trunk producing intermediate feature maps
pub struct FeatureExtractor {
    layers: Vec<VggLayer>,
    in_channels: usize,
}

impl FeatureExtractor {
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = x.clone();
        for layer in &self.layers {
            x = layer.forward(&x)?;
        }
        Ok(x)
    }

    /// Channels of the produced feature map
    pub fn output_channels(&self) -> usize {
        self.layers
            .iter()
            .rev()
            .find_map(|layer| match layer {
                VggLayer::Conv { out_channels, .. } => Some(*out_channels),
                _ => None,
            })
            .unwrap_or(self.in_channels)
    }

    /// Downsampling factor between input and feature map
    pub fn stride(&self) -> usize {
        let pools = self
            .layers
            .iter()
            .filter(|layer| matches!(layer, VggLayer::MaxPool))
            .count();
        1 << pools
    }

    pub fn layers(&self) -> Vec<LayerInfo> {
        self.layers
            .iter()
            .enumerate()
            .map(|(i, layer)| layer.info(i))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Module for FeatureExtractor {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        FeatureExtractor::forward(self, x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transforms::random_image;
    use candle_nn::VarMap;

    fn random_vb(varmap: &VarMap) -> VarBuilder<'_> {
        VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu)
    }

    #[test]
    fn test_vgg19_layer_structure() -> Result<()> {
        let varmap = VarMap::new();
        let vgg = Vgg19::new(VggConfig::default(), random_vb(&varmap))?;
        let layers = vgg.layers();

        let count = |pred: fn(&LayerKind) -> bool| layers.iter().filter(|l| pred(&l.kind)).count();
        assert_eq!(count(|k| matches!(k, LayerKind::Conv2d { .. })), 16);
        assert_eq!(count(|k| matches!(k, LayerKind::MaxPool { .. })), 5);
        assert_eq!(count(|k| matches!(k, LayerKind::Linear { .. })), 3);

        let trunk = layers.iter().filter(|l| l.name.starts_with("features.")).count();
        assert_eq!(trunk, VGG19_FEATURE_LAYERS);
        assert_eq!(layers[21].name, "features.21");
        assert_eq!(
            layers[21].kind,
            LayerKind::Conv2d {
                in_channels: 512,
                out_channels: 512,
                kernel: 3
            }
        );

        // Weight names follow the torchvision checkpoint
        let data = varmap.data().lock().unwrap();
        assert!(data.contains_key("features.0.weight"));
        assert!(data.contains_key("features.34.bias"));
        assert!(data.contains_key("classifier.6.weight"));
        assert!(!data.contains_key("features.1.weight"));
        Ok(())
    }

    #[test]
    fn test_truncated_extractor_shapes() -> Result<()> {
        let varmap = VarMap::new();
        let vgg = Vgg19::new(VggConfig::default(), random_vb(&varmap))?;
        let extractor = vgg.truncate(POSE_FEATURE_LAYERS)?;

        assert_eq!(extractor.len(), POSE_FEATURE_LAYERS);
        assert_eq!(extractor.output_channels(), 512);
        assert_eq!(extractor.stride(), 8);

        let x = Tensor::zeros((1, 3, 64, 64), DType::F32, &Device::Cpu)?;
        let features = extractor.forward(&x)?;
        assert_eq!(features.dims(), &[1, 512, 8, 8]);
        Ok(())
    }

    #[test]
    fn test_features_only_skips_unused_weights() -> Result<()> {
        let varmap = VarMap::new();
        let vgg = Vgg19::new(VggConfig::features_only(POSE_FEATURE_LAYERS), random_vb(&varmap))?;

        assert_eq!(vgg.layers().len(), POSE_FEATURE_LAYERS);
        let data = varmap.data().lock().unwrap();
        assert!(data.contains_key("features.21.weight"));
        assert!(!data.contains_key("features.23.weight"));
        Ok(())
    }

    #[test]
    fn test_adaptive_pool() -> Result<()> {
        let x = Tensor::ones((1, 4, 14, 21), DType::F32, &Device::Cpu)?;
        let pooled = adaptive_avg_pool(&x)?;
        assert_eq!(pooled.dims(), &[1, 4, 7, 7]);

        let odd = Tensor::ones((1, 4, 10, 10), DType::F32, &Device::Cpu)?;
        assert!(adaptive_avg_pool(&odd).is_err());
        Ok(())
    }

    #[test]
    fn test_invalid_truncation() -> Result<()> {
        let varmap = VarMap::new();
        let vgg = Vgg19::new(VggConfig::features_only(10), random_vb(&varmap))?;
        assert!(vgg.truncate(11).is_err());

        let varmap = VarMap::new();
        let config = VggConfig {
            feature_layers: 23,
            include_classifier: true,
            ..Default::default()
        };
        assert!(Vgg19::new(config, random_vb(&varmap)).is_err());
        Ok(())
    }

    #[test]
    fn test_classifier_forward() -> Result<()> {
        let varmap = VarMap::new();
        let config = VggConfig {
            num_classes: 10,
            ..Default::default()
        };
        let vgg = Vgg19::new(config, random_vb(&varmap))?;

        let x = Tensor::zeros((1, 3, 224, 224), DType::F32, &Device::Cpu)?;
        assert_eq!(vgg.forward(&x)?.dims(), &[1, 10]);

        // 64x64 leaves a 2x2 trunk output, which cannot pool to 7x7
        let small = Tensor::zeros((1, 3, 64, 64), DType::F32, &Device::Cpu)?;
        assert!(vgg.forward(&small).is_err());
        Ok(())
    }

    #[test]
    fn test_load_pretrained_matches_saved_weights() -> deeppose_core::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("vgg19_features.safetensors");

        let varmap = VarMap::new();
        let config = VggConfig::features_only(POSE_FEATURE_LAYERS);
        let original = Vgg19::new(config.clone(), random_vb(&varmap))?;
        varmap.save(&path)?;

        let loaded = Vgg19::load_pretrained(&path, config, &Device::Cpu)?;
        assert_eq!(loaded.layers(), original.layers());

        let x = random_image((1, 3, 32, 32), 4, &Device::Cpu)?;
        let diff = (original.forward(&x)? - loaded.forward(&x)?)?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);

        // The saved file stops at features.22; a full network cannot load from it
        let full = Vgg19::load_pretrained(&path, VggConfig::default(), &Device::Cpu);
        assert!(matches!(full, Err(Error::ModelLoad(_))));
        Ok(())
    }

    #[test]
    fn test_missing_weights_file() {
        let result = Vgg19::load_pretrained(
            "/nonexistent/vgg19.safetensors",
            VggConfig::default(),
            &Device::Cpu,
        );
        assert!(matches!(result, Err(Error::ModelLoad(_))));
    }
}
