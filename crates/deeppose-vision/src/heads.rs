//! Multi-stage belief and affinity heads.
//!
//! Each stage has two parallel branches over the same input:
//! 1. Belief branch: one heatmap per cuboid vertex plus the centroid
//! 2. Affinity branch: an (x, y) vector field per cuboid vertex
//!
//! Stage 1 sees only the reduced backbone features. Later stages also see
//! the previous stage's belief and affinity maps, which lets them refine
//! ambiguous peaks with a larger (7x7) receptive field.

use candle_core::{Module, Result, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder};
use deeppose_core::{AFFINITY_CHANNELS, BELIEF_CHANNELS};

fn same_conv(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    vb: VarBuilder,
) -> Result<Conv2d> {
    let config = Conv2dConfig {
        padding: kernel / 2,
        ..Default::default()
    };
    conv2d(in_channels, out_channels, kernel, config, vb)
}

/// Configuration for the stage heads
#[derive(Debug, Clone)]
pub struct StageConfig {
    /// Channels of the reduced backbone features
    pub feature_channels: usize,
    /// Hidden width inside each branch
    pub hidden_channels: usize,
    /// Width of the stage-1 bottleneck before the output projection
    pub bottleneck_channels: usize,
    /// Number of stages (at least 1)
    pub n_stages: usize,
    pub belief_channels: usize,
    pub affinity_channels: usize,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            feature_channels: 128,
            hidden_channels: 128,
            bottleneck_channels: 512,
            n_stages: 6,
            belief_channels: BELIEF_CHANNELS,
            affinity_channels: AFFINITY_CHANNELS,
        }
    }
}

impl StageConfig {
    /// Input channels of a refinement stage
    pub fn refine_input_channels(&self) -> usize {
        self.feature_channels + self.belief_channels + self.affinity_channels
    }
}

/// One convolutional branch: a ReLU conv stack followed by a linear projection
pub struct Branch {
    convs: Vec<Conv2d>,
    output: Conv2d,
}

impl Branch {
    /// Stage-1 branch: three 3x3 convs, 1x1 bottleneck, 1x1 output
    pub fn initial(config: &StageConfig, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        let h = config.hidden_channels;
        let convs = vec![
            same_conv(config.feature_channels, h, 3, vb.pp("conv0"))?,
            same_conv(h, h, 3, vb.pp("conv1"))?,
            same_conv(h, h, 3, vb.pp("conv2"))?,
            same_conv(h, config.bottleneck_channels, 1, vb.pp("conv3"))?,
        ];
        let output = same_conv(config.bottleneck_channels, out_channels, 1, vb.pp("output"))?;

        Ok(Self { convs, output })
    }

    /// Refinement branch: five 7x7 convs, 1x1 hidden, 1x1 output
    pub fn refine(config: &StageConfig, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        let h = config.hidden_channels;
        let mut convs = Vec::with_capacity(6);
        convs.push(same_conv(config.refine_input_channels(), h, 7, vb.pp("conv0"))?);
        for i in 1..5 {
            convs.push(same_conv(h, h, 7, vb.pp(format!("conv{}", i)))?);
        }
        convs.push(same_conv(h, h, 1, vb.pp("conv5"))?);
        let output = same_conv(h, out_channels, 1, vb.pp("output"))?;

        Ok(Self { convs, output })
    }
}

impl Module for Branch {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = x.clone();
        for conv in &self.convs {
            x = conv.forward(&x)?.relu()?;
        }
        self.output.forward(&x)
    }
}

/// A belief branch and an affinity branch sharing the stage input
pub struct Stage {
    belief: Branch,
    affinity: Branch,
}

impl Stage {
    pub fn new(config: &StageConfig, index: usize, vb: VarBuilder) -> Result<Self> {
        let (belief, affinity) = if index == 0 {
            (
                Branch::initial(config, config.belief_channels, vb.pp("belief"))?,
                Branch::initial(config, config.affinity_channels, vb.pp("affinity"))?,
            )
        } else {
            (
                Branch::refine(config, config.belief_channels, vb.pp("belief"))?,
                Branch::refine(config, config.affinity_channels, vb.pp("affinity"))?,
            )
        };

        Ok(Self { belief, affinity })
    }

    /// Returns (belief, affinity) maps at the input resolution
    pub fn forward(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        Ok((self.belief.forward(x)?, self.affinity.forward(x)?))
    }
}

/// The full cascade of stages
pub struct StageCascade {
    stages: Vec<Stage>,
    config: StageConfig,
}

impl StageCascade {
    pub fn new(config: StageConfig, vb: VarBuilder) -> Result<Self> {
        if config.n_stages == 0 {
            candle_core::bail!("stage cascade needs at least one stage");
        }

        let stages = (0..config.n_stages)
            .map(|i| Stage::new(&config, i, vb.pp(format!("stage{}", i + 1))))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { stages, config })
    }

    /// Forward pass over reduced features `[batch, feature_channels, h, w]`.
    ///
    /// # Returns
    /// Per-stage belief maps and per-stage affinity fields, first stage first
    pub fn forward(&self, features: &Tensor) -> Result<(Vec<Tensor>, Vec<Tensor>)> {
        let mut beliefs = Vec::with_capacity(self.stages.len());
        let mut affinities = Vec::with_capacity(self.stages.len());

        let (belief, affinity) = self.stages[0].forward(features)?;
        beliefs.push(belief);
        affinities.push(affinity);

        for stage in &self.stages[1..] {
            let prev_belief = &beliefs[beliefs.len() - 1];
            let prev_affinity = &affinities[affinities.len() - 1];
            let input = Tensor::cat(&[features, prev_belief, prev_affinity], 1)?;

            let (belief, affinity) = stage.forward(&input)?;
            beliefs.push(belief);
            affinities.push(affinity);
        }

        Ok((beliefs, affinities))
    }

    pub fn n_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn config(&self) -> &StageConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn small_config(n_stages: usize) -> StageConfig {
        StageConfig {
            feature_channels: 16,
            hidden_channels: 8,
            bottleneck_channels: 32,
            n_stages,
            ..Default::default()
        }
    }

    #[test]
    fn test_cascade_shapes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let cascade = StageCascade::new(small_config(3), vb)?;
        let features = Tensor::zeros((2, 16, 6, 5), DType::F32, &device)?;
        let (beliefs, affinities) = cascade.forward(&features)?;

        assert_eq!(cascade.n_stages(), 3);
        assert_eq!(beliefs.len(), 3);
        assert_eq!(affinities.len(), 3);
        for (b, a) in beliefs.iter().zip(&affinities) {
            assert_eq!(b.dims(), &[2, BELIEF_CHANNELS, 6, 5]);
            assert_eq!(a.dims(), &[2, AFFINITY_CHANNELS, 6, 5]);
        }
        Ok(())
    }

    #[test]
    fn test_refine_stage_input_width() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let config = small_config(2);
        let _cascade = StageCascade::new(config.clone(), vb)?;

        let data = varmap.data().lock().unwrap();
        let w = data.get("stage2.belief.conv0.weight").unwrap();
        assert_eq!(w.dims(), &[8, config.refine_input_channels(), 7, 7]);
        assert_eq!(config.refine_input_channels(), 16 + 9 + 16);
        Ok(())
    }

    #[test]
    fn test_zero_stages_rejected() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(StageCascade::new(small_config(0), vb).is_err());
    }
}
