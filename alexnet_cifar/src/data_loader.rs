use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::dataset::Dataset;
use crate::error::{Error, Result};
use crate::tensor::{Precision, Tensor};

/// Images as `(N, C, H, W)` and one class index per image.
#[derive(Debug, Clone)]
pub struct Batch {
    pub images: Tensor,
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// A finite, restartable sequence of batches. Each batch is handed out once
/// per epoch.
pub trait BatchSource {
    fn num_samples(&self) -> usize;
    fn num_batches(&self) -> usize;
    /// Rewinds to the first batch, reshuffling when the source shuffles.
    fn reset_epoch(&mut self);
    fn has_batches(&self) -> bool;
    fn next_batch(&mut self) -> Result<Batch>;
}

/// Batches over a subset of a dataset, given as a list of sample indices.
pub struct DataLoader<'a, D: Dataset> {
    dataset: &'a D,
    indices: Vec<usize>,
    batch_size: usize,
    current_element: usize,
    shuffle: bool,
    augment: bool,
    rng: StdRng,
}

impl<'a, D: Dataset> DataLoader<'a, D> {
    pub fn new(dataset: &'a D, indices: Vec<usize>, batch_size: usize, seed: u64) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::Config("batch_size must be positive".into()));
        }
        if let Some(&bad) = indices.iter().find(|&&i| i >= dataset.len()) {
            return Err(Error::Dataset(format!(
                "index {bad} out of range for {} samples",
                dataset.len()
            )));
        }
        Ok(DataLoader {
            dataset,
            indices,
            batch_size,
            current_element: 0,
            shuffle: false,
            augment: false,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Every sample of `dataset`, in order.
    pub fn sequential(dataset: &'a D, batch_size: usize) -> Result<Self> {
        Self::new(dataset, (0..dataset.len()).collect(), batch_size, 0)
    }

    /// Reshuffle the index list at every `reset_epoch`.
    pub fn shuffled(mut self) -> Self {
        self.shuffle = true;
        self
    }

    /// Randomly mirror samples left to right.
    pub fn with_augmentation(mut self, augment: bool) -> Self {
        self.augment = augment;
        self
    }
}

impl<D: Dataset> BatchSource for DataLoader<'_, D> {
    fn num_samples(&self) -> usize {
        self.indices.len()
    }

    fn num_batches(&self) -> usize {
        self.indices.len().div_ceil(self.batch_size)
    }

    fn reset_epoch(&mut self) {
        self.current_element = 0;
        if self.shuffle {
            self.indices.shuffle(&mut self.rng);
        }
    }

    fn has_batches(&self) -> bool {
        self.current_element < self.indices.len()
    }

    fn next_batch(&mut self) -> Result<Batch> {
        if !self.has_batches() {
            return Err(Error::Dataset("batch source is exhausted".into()));
        }
        let end = (self.current_element + self.batch_size).min(self.indices.len());
        let chosen = &self.indices[self.current_element..end];
        // flips are drawn up front so the batch does not depend on thread scheduling
        let flips: Vec<bool> = chosen
            .iter()
            .map(|_| self.augment && self.rng.gen_bool(0.5))
            .collect();

        let [c, h, w] = self.dataset.image_shape();
        let image_size = c * h * w;
        let mut image_data = vec![0.0 as Precision; chosen.len() * image_size];
        let dataset = self.dataset;
        let labels = image_data
            .par_chunks_mut(image_size)
            .zip(chosen.par_iter().zip(flips.par_iter()))
            .map(|(output, (&index, &flip))| dataset.load_into(index, output, flip))
            .collect::<Result<Vec<usize>>>()?;

        self.current_element = end;
        let images = Tensor::new_data(image_data, vec![labels.len(), c, h, w])?;
        Ok(Batch { images, labels })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::InMemoryDataset;

    fn numbered(n: usize) -> InMemoryDataset {
        let images = (0..n).map(|i| i as Precision).collect();
        InMemoryDataset::new(images, (0..n).map(|i| i % 3).collect(), [1, 1, 1]).unwrap()
    }

    fn drain(loader: &mut impl BatchSource) -> Vec<Vec<Precision>> {
        let mut batches = Vec::new();
        while loader.has_batches() {
            batches.push(loader.next_batch().unwrap().images.to_vec());
        }
        batches
    }

    #[test]
    fn last_batch_is_partial() {
        let data = numbered(10);
        let mut loader = DataLoader::sequential(&data, 4).unwrap();
        assert_eq!(loader.num_batches(), 3);
        let batches = drain(&mut loader);
        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![4, 4, 2]);
        assert_eq!(batches[2], vec![8.0, 9.0]);
    }

    #[test]
    fn labels_follow_images() {
        let data = numbered(5);
        let mut loader = DataLoader::sequential(&data, 5).unwrap();
        let batch = loader.next_batch().unwrap();
        assert_eq!(batch.images.shape(), vec![5, 1, 1, 1]);
        assert_eq!(batch.labels, vec![0, 1, 2, 0, 1]);
    }

    #[test]
    fn shuffled_epochs_are_permutations_and_reproducible() {
        let data = numbered(20);
        let epochs = |seed| {
            let mut loader = DataLoader::new(&data, (0..20).collect(), 8, seed).unwrap().shuffled();
            (0..2)
                .map(|_| {
                    loader.reset_epoch();
                    drain(&mut loader).concat()
                })
                .collect::<Vec<_>>()
        };
        let first = epochs(9);
        assert_eq!(first, epochs(9));
        assert_ne!(first[0], first[1]);
        let mut seen = first[0].clone();
        seen.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(seen, (0..20).map(|i| i as Precision).collect::<Vec<_>>());
    }

    #[test]
    fn exhausted_source_reports_error() {
        let data = numbered(2);
        let mut loader = DataLoader::sequential(&data, 2).unwrap();
        loader.next_batch().unwrap();
        assert!(loader.next_batch().is_err());
        loader.reset_epoch();
        assert!(loader.has_batches());
    }

    #[test]
    fn out_of_range_indices_are_rejected() {
        let data = numbered(3);
        assert!(DataLoader::new(&data, vec![0, 3], 2, 0).is_err());
        assert!(DataLoader::new(&data, vec![0], 0, 0).is_err());
    }
}
