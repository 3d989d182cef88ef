use std::{
    sync::{
        Arc,
        mpsc::{self, Receiver},
    },
    thread::{self, JoinHandle},
};

use rand::{rngs::StdRng, seq::SliceRandom};

use super::dataset::{Batch, InMemoryDataset};

/// Splits a dataset into batches, optionally reshuffling it on every pass.
///
/// Batches are assembled by a producer thread that stays at most `prefetch` batches ahead of the
/// consumer, the consumer always sees them in the order of the pass.
#[derive(Debug)]
pub struct DataLoader {
    dataset: Arc<InMemoryDataset>,
    batch_size: usize,
    prefetch: usize,
    shuffle: Option<StdRng>,
}

impl DataLoader {
    /// Creates a loader that visits the dataset in order on every pass.
    ///
    /// # Panics
    /// If `batch_size` is zero.
    pub fn sequential(dataset: Arc<InMemoryDataset>, batch_size: usize, prefetch: usize) -> Self {
        assert!(batch_size > 0, "batch_size must be > 0");

        Self {
            dataset,
            batch_size,
            prefetch: prefetch.max(1),
            shuffle: None,
        }
    }

    /// Creates a loader that draws a new permutation of the dataset from `rng` on every pass.
    ///
    /// # Panics
    /// If `batch_size` is zero.
    pub fn shuffled(
        dataset: Arc<InMemoryDataset>,
        batch_size: usize,
        prefetch: usize,
        rng: StdRng,
    ) -> Self {
        Self {
            shuffle: Some(rng),
            ..Self::sequential(dataset, batch_size, prefetch)
        }
    }

    /// The amount of batches in a pass, the last one may be smaller.
    #[inline]
    pub fn len(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    pub fn dataset(&self) -> &InMemoryDataset {
        &self.dataset
    }

    /// Starts a new pass over the dataset.
    pub fn iter(&mut self) -> Batches {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if let Some(rng) = &mut self.shuffle {
            order.shuffle(rng);
        }

        let (tx, rx) = mpsc::sync_channel(self.prefetch);
        let dataset = Arc::clone(&self.dataset);
        let batch_size = self.batch_size;

        let producer = thread::spawn(move || {
            for indices in order.chunks(batch_size) {
                if tx.send(dataset.batch(indices)).is_err() {
                    break;
                }
            }
        });

        Batches {
            rx,
            _producer: producer,
        }
    }
}

/// The batches of one pass, dropping it stops the producer after its next batch.
pub struct Batches {
    rx: Receiver<Batch>,
    _producer: JoinHandle<()>,
}

impl Iterator for Batches {
    type Item = Batch;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array;
    use rand::SeedableRng;

    use super::*;

    fn dataset(n: usize) -> Arc<InMemoryDataset> {
        let images = Array::from_shape_fn((n, 1, 1, 1), |(i, _, _, _)| i as f32);
        Arc::new(InMemoryDataset::new(images, (0..n).collect()).unwrap())
    }

    #[test]
    fn sequential_batches_respect_batch_size() {
        let mut dl = DataLoader::sequential(dataset(5), 2, 1);
        assert_eq!(dl.len(), 3);

        let labels: Vec<Vec<usize>> = dl.iter().map(|b| b.y).collect();
        assert_eq!(labels, vec![vec![0, 1], vec![2, 3], vec![4]]);

        // A second pass sees the same order.
        let again: Vec<Vec<usize>> = dl.iter().map(|b| b.y).collect();
        assert_eq!(again, labels);
    }

    #[test]
    fn shuffled_passes_are_permutations_and_reproducible() {
        let rng = StdRng::seed_from_u64(5);
        let mut a = DataLoader::shuffled(dataset(20), 6, 2, rng.clone());
        let mut b = DataLoader::shuffled(dataset(20), 6, 2, rng);

        let first: Vec<usize> = a.iter().flat_map(|b| b.y).collect();
        let second: Vec<usize> = a.iter().flat_map(|b| b.y).collect();

        let mut sorted = first.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..20).collect::<Vec<_>>());
        assert_ne!(first, second);
        assert_eq!(first, b.iter().flat_map(|b| b.y).collect::<Vec<_>>());
    }

    #[test]
    fn dropping_a_pass_early_is_fine() {
        let mut dl = DataLoader::sequential(dataset(50), 1, 1);
        let first = dl.iter().next().unwrap();
        assert_eq!(first.y, vec![0]);
        assert_eq!(dl.iter().count(), 50);
    }
}
