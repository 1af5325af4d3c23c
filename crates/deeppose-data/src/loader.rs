//! Mini-batch iteration over a [`PoseDataset`].
//!
//! Batches are assembled sequentially. Shuffling uses a permutation drawn
//! from a ChaCha8 stream seeded with `seed + epoch`, so a given
//! (seed, epoch) pair always yields the same batch order.

use candle_core::Tensor;
use deeppose_core::{Error, Result};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::dataset::PoseDataset;

/// Batching behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub shuffle: bool,
    pub seed: u64,
    /// Skip a trailing batch smaller than `batch_size`
    pub drop_last: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 128,
            shuffle: true,
            seed: 0,
            drop_last: false,
        }
    }
}

/// Stacked samples
#[derive(Debug, Clone)]
pub struct Batch {
    /// [batch, 3, H, W]
    pub images: Tensor,
    /// [batch, 25, h, w]
    pub targets: Tensor,
    pub image_ids: Vec<u64>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.image_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image_ids.is_empty()
    }
}

pub struct DataLoader<'a, D: PoseDataset> {
    dataset: &'a D,
    config: LoaderConfig,
}

impl<'a, D: PoseDataset> DataLoader<'a, D> {
    pub fn new(dataset: &'a D, config: LoaderConfig) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(Error::InvalidInput("batch size must be positive".into()));
        }
        Ok(Self { dataset, config })
    }

    /// Number of batches per epoch
    pub fn n_batches(&self) -> usize {
        let n = self.dataset.len();
        let size = self.config.batch_size;
        if self.config.drop_last {
            n / size
        } else {
            n.div_ceil(size)
        }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Iterate the batches of one epoch
    pub fn epoch(&self, epoch: u64) -> BatchIter<'_, 'a, D> {
        let seed = self.config.seed.wrapping_add(epoch);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.config.shuffle {
            order.shuffle(&mut rng);
        }

        BatchIter {
            loader: self,
            order,
            cursor: 0,
            batch: 0,
            rng,
        }
    }
}

/// Iterator returned by [`DataLoader::epoch`]
pub struct BatchIter<'l, 'a, D: PoseDataset> {
    loader: &'l DataLoader<'a, D>,
    order: Vec<usize>,
    cursor: usize,
    batch: usize,
    rng: ChaCha8Rng,
}

impl<D: PoseDataset> BatchIter<'_, '_, D> {
    fn collate(&mut self, indices: &[usize]) -> Result<Batch> {
        let mut images = Vec::with_capacity(indices.len());
        let mut targets = Vec::with_capacity(indices.len());
        let mut image_ids = Vec::with_capacity(indices.len());

        for &index in indices {
            let sample = self.loader.dataset.get(index, &mut self.rng)?;
            images.push(sample.image);
            targets.push(sample.targets);
            image_ids.push(sample.image_id);
        }

        Ok(Batch {
            images: Tensor::stack(&images, 0)?,
            targets: Tensor::stack(&targets, 0)?,
            image_ids,
        })
    }
}

impl<D: PoseDataset> Iterator for BatchIter<'_, '_, D> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let size = self.loader.config.batch_size;
        let remaining = self.order.len() - self.cursor;
        if remaining == 0 || (self.loader.config.drop_last && remaining < size) {
            return None;
        }

        let end = self.cursor + remaining.min(size);
        let indices = self.order[self.cursor..end].to_vec();
        self.cursor = end;
        self.batch += 1;

        trace!(batch = self.batch, size = indices.len(), "collating batch");
        Some(self.collate(&indices))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Sample;
    use candle_core::{DType, Device};

    /// Samples whose pixels all equal their index
    struct Synthetic {
        len: usize,
    }

    impl PoseDataset for Synthetic {
        fn len(&self) -> usize {
            self.len
        }

        fn get(&self, index: usize, _rng: &mut ChaCha8Rng) -> Result<Sample> {
            if index >= self.len {
                return Err(Error::IndexOutOfRange {
                    index,
                    len: self.len,
                });
            }
            let device = Device::Cpu;
            Ok(Sample {
                image_id: index as u64,
                image: Tensor::full(index as f32, (3, 16, 16), &device)?,
                targets: Tensor::zeros((25, 2, 2), DType::F32, &device)?,
                projected: Vec::new(),
            })
        }
    }

    fn config(batch_size: usize, shuffle: bool, drop_last: bool) -> LoaderConfig {
        LoaderConfig {
            batch_size,
            shuffle,
            seed: 7,
            drop_last,
        }
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let data = Synthetic { len: 4 };
        assert!(DataLoader::new(&data, config(0, false, false)).is_err());
    }

    #[test]
    fn test_sequential_batches() -> Result<()> {
        let data = Synthetic { len: 10 };
        let loader = DataLoader::new(&data, config(4, false, false))?;
        assert_eq!(loader.n_batches(), 3);

        let batches: Vec<Batch> = loader.epoch(0).collect::<Result<_>>()?;
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].image_ids, vec![0, 1, 2, 3]);
        assert_eq!(batches[2].image_ids, vec![8, 9]);
        assert_eq!(batches[0].images.dims(), &[4, 3, 16, 16]);
        assert_eq!(batches[2].targets.dims(), &[2, 25, 2, 2]);
        Ok(())
    }

    #[test]
    fn test_drop_last() -> Result<()> {
        let data = Synthetic { len: 10 };
        let loader = DataLoader::new(&data, config(4, false, true))?;
        assert_eq!(loader.n_batches(), 2);
        assert_eq!(loader.epoch(0).count(), 2);
        Ok(())
    }

    #[test]
    fn test_shuffle_is_seeded_permutation() -> Result<()> {
        let data = Synthetic { len: 32 };
        let loader = DataLoader::new(&data, config(8, true, false))?;

        let ids = |epoch| -> Result<Vec<u64>> {
            let mut ids = Vec::new();
            for batch in loader.epoch(epoch) {
                ids.extend(batch?.image_ids);
            }
            Ok(ids)
        };

        let first = ids(0)?;
        assert_eq!(first, ids(0)?);
        assert_ne!(first, ids(1)?);

        let mut sorted = first.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..32).collect::<Vec<u64>>());
        Ok(())
    }

    #[test]
    fn test_images_follow_ids() -> Result<()> {
        let data = Synthetic { len: 6 };
        let loader = DataLoader::new(&data, config(3, true, false))?;

        for batch in loader.epoch(2) {
            let batch = batch?;
            let means: Vec<f32> = batch.images.flatten_from(1)?.mean(1)?.to_vec1()?;
            for (id, mean) in batch.image_ids.iter().zip(means) {
                assert_eq!(*id as f32, mean);
            }
        }
        Ok(())
    }
}
