pub mod cifar;
mod dataloader;
mod dataset;
pub mod pbc;

use std::path::Path;

pub use dataloader::{Batches, DataLoader};
pub use dataset::{Batch, DatasetSplits, InMemoryDataset};

use crate::{Result, config::DatasetName};

/// Loads the train, validation and test splits of a target dataset found under `root`.
///
/// # Arguments
/// * `name` - The dataset to load.
/// * `root` - The directory holding the extracted datasets.
/// * `seed` - Seeds the split of datasets that don't ship one.
pub fn get_dataset(name: DatasetName, root: &Path, seed: u64) -> Result<DatasetSplits> {
    match name {
        DatasetName::Cifar10 => cifar::load(root),
        DatasetName::PbcBarcelona => pbc::load(root, seed),
    }
}
