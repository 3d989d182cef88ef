use std::{fs, path::Path};

use ndarray::{Array1, Array4};

use super::{DatasetSplits, InMemoryDataset};
use crate::{Result, TransferErr};

const SIDE: usize = 32;
const CHANNELS: usize = 3;
const RECORD: usize = 1 + CHANNELS * SIDE * SIDE;
const CLASSES: usize = 10;
const TRAIN_FILES: [&str; 5] = [
    "data_batch_1.bin",
    "data_batch_2.bin",
    "data_batch_3.bin",
    "data_batch_4.bin",
    "data_batch_5.bin",
];
const TEST_FILE: &str = "test_batch.bin";
const VALID_SIZE: usize = 5_000;

const MEAN: [f32; 3] = [0.4914, 0.4822, 0.4465];
const STD: [f32; 3] = [0.2470, 0.2435, 0.2616];

/// Loads the binary version of CIFAR-10 from `<root>/cifar-10-batches-bin`.
///
/// The last 5000 training images are held out for validation and every split is standardized
/// with the usual CIFAR-10 channel statistics.
pub fn load(root: &Path) -> Result<DatasetSplits> {
    let dir = root.join("cifar-10-batches-bin");

    let mut train = Vec::new();
    for file in TRAIN_FILES {
        train.extend(read(&dir.join(file))?);
    }
    let test = read(&dir.join(TEST_FILE))?;

    let records = train.len() / RECORD;
    if records < 2 {
        return Err(TransferErr::Dataset(format!(
            "{} holds too few training images",
            dir.display()
        )));
    }

    let valid_size = VALID_SIZE.min(records / 10).max(1);
    let split = (records - valid_size) * RECORD;

    let mean = Array1::from(MEAN.to_vec());
    let std = Array1::from(STD.to_vec());
    let dataset = |bytes: &[u8]| -> Result<InMemoryDataset> {
        let mut dataset = parse_records(bytes)?;
        dataset.normalize(&mean, &std)?;
        Ok(dataset)
    };

    Ok(DatasetSplits {
        train: dataset(&train[..split])?,
        valid: dataset(&train[split..])?,
        test: dataset(&test)?,
        in_channels: CHANNELS,
        num_classes: CLASSES,
    })
}

fn read(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| {
        TransferErr::Dataset(format!("failed to read {}: {e}", path.display()))
    })
}

/// Parses `<label byte><1024 red><1024 green><1024 blue>` records into images scaled to `[0, 1]`.
pub fn parse_records(bytes: &[u8]) -> Result<InMemoryDataset> {
    if bytes.len() % RECORD != 0 {
        return Err(TransferErr::Dataset(format!(
            "{} bytes is not a whole number of {RECORD} byte CIFAR-10 records",
            bytes.len()
        )));
    }

    let n = bytes.len() / RECORD;
    let mut labels = Vec::with_capacity(n);
    let mut pixels = Vec::with_capacity(n * (RECORD - 1));

    for record in bytes.chunks_exact(RECORD) {
        let label = record[0] as usize;
        if label >= CLASSES {
            return Err(TransferErr::Dataset(format!("invalid CIFAR-10 label {label}")));
        }

        labels.push(label);
        pixels.extend(record[1..].iter().map(|&p| p as f32 / 255.));
    }

    let images = Array4::from_shape_vec((n, CHANNELS, SIDE, SIDE), pixels)?;
    InMemoryDataset::new(images, labels)
}
