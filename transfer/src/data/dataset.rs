use ndarray::{Array1, Array4, Axis};

use crate::{Result, TransferErr};

/// A batch of images `(n, c, h, w)` with one class label per image.
#[derive(Debug, Clone)]
pub struct Batch {
    pub x: Array4<f32>,
    pub y: Vec<usize>,
}

impl Batch {
    #[inline]
    pub fn len(&self) -> usize {
        self.y.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }
}

/// A labelled image dataset held entirely in memory.
#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    images: Array4<f32>,
    labels: Vec<usize>,
}

impl InMemoryDataset {
    /// Creates a new dataset from owned buffers.
    ///
    /// # Errors
    /// `TransferErr::Dataset` if there isn't exactly one label per image or there are no images.
    pub fn new(images: Array4<f32>, labels: Vec<usize>) -> Result<Self> {
        let n = images.len_of(Axis(0));
        if n != labels.len() {
            return Err(TransferErr::Dataset(format!(
                "{n} images but {} labels",
                labels.len()
            )));
        }

        if n == 0 {
            return Err(TransferErr::Dataset("dataset must be non-empty".into()));
        }

        Ok(Self { images, labels })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// The `(c, h, w)` shape of every image.
    pub fn image_shape(&self) -> (usize, usize, usize) {
        let (_, c, h, w) = self.images.dim();
        (c, h, w)
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// Copies the samples at `indices` into a new batch, in the given order.
    ///
    /// # Panics
    /// If any index is out of bounds.
    pub fn batch(&self, indices: &[usize]) -> Batch {
        Batch {
            x: self.images.select(Axis(0), indices),
            y: indices.iter().map(|&i| self.labels[i]).collect(),
        }
    }

    /// The per-channel mean and standard deviation over every pixel of every image.
    pub fn channel_stats(&self) -> (Array1<f32>, Array1<f32>) {
        let (mean, var) = machine_learning::arch::layers::channel_stats(self.images.view());
        (mean, var.mapv(f32::sqrt))
    }

    /// Standardizes every channel with the given statistics.
    pub fn normalize(&mut self, mean: &Array1<f32>, std: &Array1<f32>) -> Result<()> {
        let c = self.images.len_of(Axis(1));
        let mean = mean.view().into_shape_with_order((1, c, 1, 1))?;
        let std = std.view().into_shape_with_order((1, c, 1, 1))?;

        self.images -= &mean;
        self.images /= &std;
        Ok(())
    }
}

/// The three splits of a dataset and what a model needs to know to classify it.
#[derive(Debug, Clone)]
pub struct DatasetSplits {
    pub train: InMemoryDataset,
    pub valid: InMemoryDataset,
    pub test: InMemoryDataset,
    pub in_channels: usize,
    pub num_classes: usize,
}
