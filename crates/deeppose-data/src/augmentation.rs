//! Photometric augmentation for training images.
//!
//! Only pixel intensities change; geometry is left untouched so projected
//! cuboid vertices stay valid for the augmented image.

use image::RgbImage;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// Configuration for photometric augmentation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AugmentationConfig {
    /// Standard deviation of additive Gaussian noise, in 0..255 intensity units
    pub noise_std: f32,
    /// Contrast gain range (1.0 ± contrast_delta)
    pub contrast_delta: f32,
    /// Brightness offset range (±brightness_delta of full scale)
    pub brightness_delta: f32,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            noise_std: 2.0,
            contrast_delta: 0.2,
            brightness_delta: 0.2,
        }
    }
}

impl AugmentationConfig {
    /// Disable all augmentations
    pub fn none() -> Self {
        Self {
            noise_std: 0.0,
            contrast_delta: 0.0,
            brightness_delta: 0.0,
        }
    }
}

/// Image augmenter applying noise, contrast and brightness jitter
#[derive(Clone, Debug)]
pub struct Augmenter {
    config: AugmentationConfig,
}

impl Augmenter {
    pub fn new(config: AugmentationConfig) -> Self {
        Self { config }
    }

    /// Apply `alpha * (x + noise) + beta`, clip to [0, 255] and truncate to u8
    ///
    /// # Arguments
    /// * `img` - The input image
    /// * `rng` - Random number generator for reproducibility
    pub fn augment(&self, img: &RgbImage, rng: &mut ChaCha8Rng) -> RgbImage {
        let noise = if self.config.noise_std > 0.0 {
            Normal::new(0.0f32, self.config.noise_std).ok()
        } else {
            None
        };

        let alpha = 1.0 + symmetric(rng, self.config.contrast_delta);
        let beta = symmetric(rng, self.config.brightness_delta) * 255.0;

        let mut output = img.clone();
        for value in output.iter_mut() {
            let mut v = *value as f32;
            if let Some(normal) = &noise {
                v += normal.sample(rng);
            }
            v = alpha * v + beta;
            *value = v.clamp(0.0, 255.0) as u8;
        }

        output
    }

    pub fn config(&self) -> &AugmentationConfig {
        &self.config
    }
}

impl Default for Augmenter {
    fn default() -> Self {
        Self::new(AugmentationConfig::default())
    }
}

/// Uniform sample from [-delta, delta), zero when delta is zero
fn symmetric(rng: &mut ChaCha8Rng, delta: f32) -> f32 {
    if delta > 0.0 {
        rng.gen_range(-delta..delta)
    } else {
        0.0
    }
}
