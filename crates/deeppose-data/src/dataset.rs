//! LineMOD dataset in COCO layout.
//!
//! Each sample pairs an image tensor with the stacked belief/vector-field
//! targets of the first object annotated in that image.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use deeppose_core::{
    CocoDocument, Error, ImageRecord, ModelCatalog, PoseAnnotation, Result,
};
use deeppose_vision::{image_to_tensor, Transform};
use image::RgbImage;
use nalgebra::Point2;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::augmentation::{AugmentationConfig, Augmenter};
use crate::ground_truth::GroundTruthGenerator;

/// Anything that yields pose samples by index
pub trait PoseDataset {
    fn len(&self) -> usize;

    fn get(&self, index: usize, rng: &mut ChaCha8Rng) -> Result<Sample>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One training sample
#[derive(Debug, Clone)]
pub struct Sample {
    pub image_id: u64,
    /// Image in [0, 1], or the output of the dataset transform; [3, H, W]
    pub image: Tensor,
    /// Belief maps then vector fields, [25, H / stride, W / stride]
    pub targets: Tensor,
    /// Projected cuboid vertices in image pixels
    pub projected: Vec<Point2<f64>>,
}

/// Dataset behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Apply photometric augmentation to every loaded image
    pub augment: bool,
    pub augmentation: AugmentationConfig,
    pub ground_truth: GroundTruthGenerator,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            augment: true,
            augmentation: AugmentationConfig::default(),
            ground_truth: GroundTruthGenerator::default(),
        }
    }
}

/// LineMOD test split annotated in COCO format
pub struct LineModDataset {
    root: PathBuf,
    images: Vec<ImageRecord>,
    annotations: HashMap<u64, Vec<PoseAnnotation>>,
    models: ModelCatalog,
    augmenter: Option<Augmenter>,
    generator: GroundTruthGenerator,
    /// Applied to the image tensor after augmentation
    transform: Option<Box<dyn Transform>>,
    device: Device,
}

impl LineModDataset {
    /// Open a dataset from an image root, a COCO annotation file and `models_info.json`
    pub fn open<P, A, M>(
        root: P,
        annotation_file: A,
        models_file: M,
        config: DatasetConfig,
        device: &Device,
    ) -> Result<Self>
    where
        P: AsRef<Path>,
        A: AsRef<Path>,
        M: AsRef<Path>,
    {
        let document = CocoDocument::from_file(annotation_file.as_ref())?;
        let models = ModelCatalog::from_file(models_file.as_ref())?;
        let dataset = Self::from_parts(root, document, models, config, device);

        info!(
            images = dataset.images.len(),
            models = dataset.models.len(),
            root = %dataset.root.display(),
            "opened LineMOD dataset"
        );
        Ok(dataset)
    }

    pub fn from_parts<P: AsRef<Path>>(
        root: P,
        document: CocoDocument,
        models: ModelCatalog,
        config: DatasetConfig,
        device: &Device,
    ) -> Self {
        let mut annotations: HashMap<u64, Vec<PoseAnnotation>> = HashMap::new();
        for ann in document.annotations {
            annotations.entry(ann.image_id).or_default().push(ann);
        }

        let unannotated = document
            .images
            .iter()
            .filter(|img| !annotations.contains_key(&img.id))
            .count();
        if unannotated > 0 {
            warn!(unannotated, "images without annotations will fail to load");
        }

        Self {
            root: root.as_ref().to_path_buf(),
            images: document.images,
            annotations,
            models,
            augmenter: config
                .augment
                .then(|| Augmenter::new(config.augmentation.clone())),
            generator: config.ground_truth,
            transform: None,
            device: device.clone(),
        }
    }

    /// Run `transform` on every image tensor, e.g. ImageNet normalization
    pub fn with_transform<T: Transform + 'static>(mut self, transform: T) -> Self {
        self.transform = Some(Box::new(transform));
        self
    }

    pub fn image_path(&self, record: &ImageRecord) -> PathBuf {
        self.root.join(&record.file_name)
    }

    fn load_image(&self, record: &ImageRecord) -> Result<RgbImage> {
        let path = self.image_path(record);
        let img = image::open(&path)
            .map_err(|e| Error::Image(format!("{}: {}", path.display(), e)))?;
        Ok(img.to_rgb8())
    }
}

impl PoseDataset for LineModDataset {
    fn len(&self) -> usize {
        self.images.len()
    }

    fn get(&self, index: usize, rng: &mut ChaCha8Rng) -> Result<Sample> {
        let record = self.images.get(index).ok_or(Error::IndexOutOfRange {
            index,
            len: self.images.len(),
        })?;

        let annotation = self
            .annotations
            .get(&record.id)
            .and_then(|anns| anns.first())
            .ok_or(Error::NoAnnotations {
                image_id: record.id,
            })?;
        let model = self.models.get(annotation.category_id)?;

        let mut img = self.load_image(record)?;
        if let Some(augmenter) = &self.augmenter {
            img = augmenter.augment(&img, rng);
        }

        let (width, height) = img.dimensions();
        let gt = self.generator.generate(height, width, annotation, model)?;
        debug!(
            image_id = record.id,
            category = annotation.category_id,
            width,
            height,
            "generated ground truth"
        );

        let mut image = image_to_tensor(&img, &self.device)?;
        if let Some(transform) = &self.transform {
            image = transform.apply(&image)?;
        }

        Ok(Sample {
            image_id: record.id,
            image,
            targets: gt.to_tensor(&self.device)?,
            projected: gt.projected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deeppose_core::ObjectModel;
    use rand::SeedableRng;

    fn document() -> CocoDocument {
        CocoDocument {
            images: vec![
                ImageRecord {
                    id: 1,
                    file_name: "missing.png".into(),
                    width: 64,
                    height: 64,
                },
                ImageRecord {
                    id: 2,
                    file_name: "bare.png".into(),
                    width: 64,
                    height: 64,
                },
            ],
            annotations: vec![PoseAnnotation {
                id: 10,
                image_id: 1,
                category_id: 5,
                cam_k: [500.0, 0.0, 32.0, 0.0, 500.0, 32.0, 0.0, 0.0, 1.0],
                cam_r_m2c: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
                cam_t_m2c: [0.0, 0.0, 1000.0],
                bbox: None,
            }],
            categories: Vec::new(),
        }
    }

    fn catalog() -> ModelCatalog {
        let mut catalog = ModelCatalog::default();
        catalog.insert(
            5,
            ObjectModel {
                min_x: -10.0,
                min_y: -10.0,
                min_z: -10.0,
                size_x: 20.0,
                size_y: 20.0,
                size_z: 20.0,
                diameter: None,
            },
        );
        catalog
    }

    #[test]
    fn test_error_cases() {
        let dataset = LineModDataset::from_parts(
            "/nonexistent",
            document(),
            catalog(),
            DatasetConfig::default(),
            &Device::Cpu,
        );
        let mut rng = ChaCha8Rng::seed_from_u64(0);

        assert_eq!(dataset.len(), 2);
        assert!(matches!(
            dataset.get(5, &mut rng),
            Err(Error::IndexOutOfRange { index: 5, len: 2 })
        ));
        assert!(matches!(
            dataset.get(1, &mut rng),
            Err(Error::NoAnnotations { image_id: 2 })
        ));
        assert!(matches!(dataset.get(0, &mut rng), Err(Error::Image(_))));
    }

    #[test]
    fn test_unknown_category() {
        let dataset = LineModDataset::from_parts(
            "/nonexistent",
            document(),
            ModelCatalog::default(),
            DatasetConfig::default(),
            &Device::Cpu,
        );
        let mut rng = ChaCha8Rng::seed_from_u64(0);

        assert!(matches!(
            dataset.get(0, &mut rng),
            Err(Error::MissingObjectModel { category: 5 })
        ));
    }
}
