//! Image tensor transforms: normalization and brightness adjustment.
//!
//! Transforms operate on `[C, H, W]` or `[B, C, H, W]` f32 tensors with
//! values in `[0, 1]`.

use candle_core::{bail, DType, Device, Result, Shape, Tensor};
use image::RgbImage;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// ImageNet channel means (RGB)
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];

/// ImageNet channel standard deviations (RGB)
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// A tensor-to-tensor image transform
pub trait Transform {
    fn apply(&self, x: &Tensor) -> Result<Tensor>;
}

/// Channel dimension for image tensors of rank 3 or 4
fn channel_dim(x: &Tensor) -> Result<usize> {
    match x.rank() {
        3 => Ok(0),
        4 => Ok(1),
        r => bail!("expected a [C, H, W] or [B, C, H, W] tensor, got rank {}", r),
    }
}

/// Reshape a per-channel vector so it broadcasts against `x`
fn per_channel(values: &[f32], x: &Tensor) -> Result<Tensor> {
    let c = values.len();
    let shape: Shape = match x.rank() {
        3 => (c, 1, 1).into(),
        _ => (1, c, 1, 1).into(),
    };
    Tensor::from_slice(values, shape, x.device())?.to_dtype(x.dtype())
}

/// Per-channel `(x - mean) / std`
#[derive(Debug, Clone, PartialEq)]
pub struct Normalize {
    mean: Vec<f32>,
    std: Vec<f32>,
}

impl Normalize {
    pub fn new(mean: Vec<f32>, std: Vec<f32>) -> Result<Self> {
        if mean.len() != std.len() {
            bail!(
                "normalize needs as many means as stds, got {} and {}",
                mean.len(),
                std.len()
            );
        }
        if mean.is_empty() {
            bail!("normalize needs at least one channel");
        }
        if std.iter().any(|&s| s == 0.0 || !s.is_finite()) {
            bail!("normalize std must be finite and non-zero, got {:?}", std);
        }

        Ok(Self { mean, std })
    }

    pub fn imagenet() -> Self {
        Self {
            mean: IMAGENET_MEAN.to_vec(),
            std: IMAGENET_STD.to_vec(),
        }
    }

    /// Undo the normalization: `x * std + mean`
    pub fn inverse(&self, x: &Tensor) -> Result<Tensor> {
        self.check_channels(x)?;
        let mean = per_channel(&self.mean, x)?;
        let std = per_channel(&self.std, x)?;
        x.broadcast_mul(&std)?.broadcast_add(&mean)
    }

    pub fn mean(&self) -> &[f32] {
        &self.mean
    }

    pub fn std(&self) -> &[f32] {
        &self.std
    }

    fn check_channels(&self, x: &Tensor) -> Result<()> {
        let channels = x.dim(channel_dim(x)?)?;
        if channels != self.mean.len() {
            bail!(
                "normalize configured for {} channels, tensor has {}",
                self.mean.len(),
                channels
            );
        }
        Ok(())
    }
}

impl Default for Normalize {
    fn default() -> Self {
        Self::imagenet()
    }
}

impl Transform for Normalize {
    fn apply(&self, x: &Tensor) -> Result<Tensor> {
        self.check_channels(x)?;
        let mean = per_channel(&self.mean, x)?;
        let std = per_channel(&self.std, x)?;
        x.broadcast_sub(&mean)?.broadcast_div(&std)
    }
}

/// Brightness adjustment: blend with a black image, clamped to `[0, 1]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Brightness {
    factor: f64,
}

impl Brightness {
    pub fn new(factor: f64) -> Result<Self> {
        if factor < 0.0 || !factor.is_finite() {
            bail!("brightness factor must be a non-negative number, got {}", factor);
        }
        Ok(Self { factor })
    }

    /// Sample a factor uniformly from `[max(0, 1 - max_delta), 1 + max_delta]`
    pub fn jitter<R: Rng + ?Sized>(max_delta: f64, rng: &mut R) -> Result<Self> {
        if max_delta < 0.0 || !max_delta.is_finite() {
            bail!("brightness jitter must be a non-negative number, got {}", max_delta);
        }
        let low = (1.0 - max_delta).max(0.0);
        let high = 1.0 + max_delta;
        Self::new(rng.gen_range(low..=high))
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }
}

impl Transform for Brightness {
    fn apply(&self, x: &Tensor) -> Result<Tensor> {
        channel_dim(x)?;
        x.affine(self.factor, 0.0)?.clamp(0f32, 1f32)
    }
}

/// Ordered chain of transforms
#[derive(Default)]
pub struct Compose {
    transforms: Vec<Box<dyn Transform>>,
}

impl Compose {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: Transform + 'static>(mut self, transform: T) -> Self {
        self.transforms.push(Box::new(transform));
        self
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }
}

impl Transform for Compose {
    fn apply(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = x.clone();
        for transform in &self.transforms {
            x = transform.apply(&x)?;
        }
        Ok(x)
    }
}

/// HWC u8 image to a CHW f32 tensor scaled to `[0, 1]`
pub fn image_to_tensor(image: &RgbImage, device: &Device) -> Result<Tensor> {
    let (width, height) = image.dimensions();
    let data = image.as_raw().clone();

    Tensor::from_vec(data, (height as usize, width as usize, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(1.0 / 255.0, 0.0)
}

/// Uniform `[0, 1)` tensor, reproducible from `seed`
pub fn random_image<S: Into<Shape>>(shape: S, seed: u64, device: &Device) -> Result<Tensor> {
    let shape = shape.into();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let data: Vec<f32> = (0..shape.elem_count()).map(|_| rng.gen::<f32>()).collect();
    Tensor::from_vec(data, shape, device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::IndexOp;
    use image::Rgb;

    #[test]
    fn test_normalize_known_values() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::ones((3, 2, 2), DType::F32, &device)?;
        let y = Normalize::imagenet().apply(&x)?;

        let per_channel: Vec<f32> = y.mean((1, 2))?.to_vec1()?;
        for c in 0..3 {
            let expected = (1.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
            assert_abs_diff_eq!(per_channel[c], expected, epsilon = 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_normalize_inverse_roundtrip() -> Result<()> {
        let device = Device::Cpu;
        let x = random_image((2, 3, 8, 8), 7, &device)?;
        let norm = Normalize::imagenet();

        let restored = norm.inverse(&norm.apply(&x)?)?;
        let max_err: f32 = (restored - &x)?.abs()?.max_all()?.to_scalar()?;
        assert!(max_err < 1e-5);
        Ok(())
    }

    #[test]
    fn test_normalize_rejects_channel_mismatch() -> Result<()> {
        let x = Tensor::zeros((4, 8, 8), DType::F32, &Device::Cpu)?;
        assert!(Normalize::imagenet().apply(&x).is_err());

        let flat = Tensor::zeros((3, 8), DType::F32, &Device::Cpu)?;
        assert!(Normalize::imagenet().apply(&flat).is_err());

        assert!(Normalize::new(vec![0.5], vec![0.0]).is_err());
        assert!(Normalize::new(vec![0.5, 0.5], vec![1.0]).is_err());
        Ok(())
    }

    #[test]
    fn test_brightness_clamps_to_unit_range() -> Result<()> {
        let device = Device::Cpu;
        let x = random_image((3, 16, 16), 1, &device)?;
        let normalized = Normalize::imagenet().apply(&x)?;
        let y = Brightness::new(1.5)?.apply(&normalized)?;

        let min: f32 = y.min_all()?.to_scalar()?;
        let max: f32 = y.max_all()?.to_scalar()?;
        assert!(min >= 0.0);
        assert!(max <= 1.0);

        let dark = Brightness::new(0.0)?.apply(&x)?;
        assert_eq!(dark.max_all()?.to_scalar::<f32>()?, 0.0);
        Ok(())
    }

    #[test]
    fn test_brightness_jitter_range() -> Result<()> {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for _ in 0..100 {
            let b = Brightness::jitter(0.2, &mut rng)?;
            assert!((0.8..=1.2).contains(&b.factor()));
        }
        assert!(Brightness::new(-0.1).is_err());
        Ok(())
    }

    #[test]
    fn test_compose_applies_in_order() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::full(0.5f32, (3, 4, 4), &device)?;

        let pipeline = Compose::new()
            .with(Brightness::new(2.0)?)
            .with(Normalize::new(vec![0.5; 3], vec![0.5; 3])?);
        assert_eq!(pipeline.len(), 2);

        // 0.5 * 2 = 1.0, then (1.0 - 0.5) / 0.5 = 1.0
        let y = pipeline.apply(&x)?;
        assert_abs_diff_eq!(y.mean_all()?.to_scalar::<f32>()?, 1.0, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn test_image_to_tensor_layout() -> Result<()> {
        let mut img = RgbImage::new(4, 2);
        img.put_pixel(3, 1, Rgb([255, 0, 51]));

        let t = image_to_tensor(&img, &Device::Cpu)?;
        assert_eq!(t.dims(), &[3, 2, 4]);

        let pixel: Vec<f32> = t.i((.., 1, 3))?.to_vec1()?;
        assert_abs_diff_eq!(pixel[0], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(pixel[1], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(pixel[2], 0.2, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn test_random_image_is_seeded() -> Result<()> {
        let device = Device::Cpu;
        let a: Vec<f32> = random_image(16usize, 42, &device)?.to_vec1()?;
        let b: Vec<f32> = random_image(16usize, 42, &device)?.to_vec1()?;
        let c: Vec<f32> = random_image(16usize, 43, &device)?.to_vec1()?;

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.iter().all(|v| (0.0..1.0).contains(v)));
        Ok(())
    }
}
