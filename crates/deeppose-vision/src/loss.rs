//! Multi-stage composite loss.
//!
//! L_total = Σ_s MSE(belief_s, gt_belief) + Σ_s MSE(affinity_s, gt_affinity)
//!
//! Every stage is supervised against the same ground truth, which keeps the
//! intermediate stages from drifting away from the final objective.

use candle_core::{bail, Result, Tensor};
use candle_nn::loss::mse;

use crate::model::ModelOutput;

/// Sum of per-stage belief and affinity MSE
#[derive(Debug, Clone, Copy)]
pub struct CompositeLoss {
    stages: usize,
}

impl CompositeLoss {
    pub fn new(stages: usize) -> Self {
        Self { stages }
    }

    /// Compute the loss from per-stage predictions
    ///
    /// # Arguments
    /// * `pred_beliefs` - One belief tensor per stage [batch, 9, h, w]
    /// * `gt_belief` - Target belief maps [batch, 9, h, w]
    /// * `pred_affinities` - One affinity tensor per stage [batch, 16, h, w]
    /// * `gt_affinity` - Target vector fields [batch, 16, h, w]
    pub fn forward(
        &self,
        pred_beliefs: &[Tensor],
        gt_belief: &Tensor,
        pred_affinities: &[Tensor],
        gt_affinity: &Tensor,
    ) -> Result<LossComponents> {
        if self.stages == 0 {
            bail!("composite loss needs at least one stage");
        }
        if pred_beliefs.len() != self.stages || pred_affinities.len() != self.stages {
            bail!(
                "composite loss expects {} stages, got {} belief and {} affinity predictions",
                self.stages,
                pred_beliefs.len(),
                pred_affinities.len()
            );
        }

        let belief = stage_sum(pred_beliefs, gt_belief)?;
        let affinity = stage_sum(pred_affinities, gt_affinity)?;
        let total = (&belief + &affinity)?;

        Ok(LossComponents {
            belief,
            affinity,
            total,
        })
    }

    /// Loss of a model output against stacked targets [batch, 25, h, w]
    pub fn forward_output(&self, output: &ModelOutput, targets: &Tensor) -> Result<LossComponents> {
        let belief_channels = match output.final_belief() {
            Some(b) => b.dim(1)?,
            None => bail!("model output has no stages"),
        };
        let affinity_channels = match targets.dim(1)?.checked_sub(belief_channels) {
            Some(c) if c > 0 => c,
            _ => bail!(
                "targets have {} channels, need more than {} belief channels",
                targets.dim(1)?,
                belief_channels
            ),
        };

        let gt_belief = targets.narrow(1, 0, belief_channels)?;
        let gt_affinity = targets.narrow(1, belief_channels, affinity_channels)?;

        self.forward(&output.beliefs, &gt_belief, &output.affinities, &gt_affinity)
    }

    pub fn stages(&self) -> usize {
        self.stages
    }
}

fn stage_sum(preds: &[Tensor], target: &Tensor) -> Result<Tensor> {
    let mut total = mse(&preds[0], target)?;
    for pred in &preds[1..] {
        total = (total + mse(pred, target)?)?;
    }
    Ok(total)
}

/// Individual loss components for logging
#[derive(Debug, Clone)]
pub struct LossComponents {
    pub belief: Tensor,
    pub affinity: Tensor,
    pub total: Tensor,
}

impl LossComponents {
    pub fn total_value(&self) -> Result<f32> {
        self.total.to_scalar::<f32>()
    }
}
