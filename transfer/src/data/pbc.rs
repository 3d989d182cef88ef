use std::{
    fs,
    path::{Path, PathBuf},
};

use image::imageops::{self, FilterType};
use ndarray::Array4;
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use rayon::prelude::*;

use super::{DatasetSplits, InMemoryDataset};
use crate::{Result, TransferErr};

const SIDE: u32 = 64;
const CHANNELS: usize = 3;
const EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// Loads the PBC peripheral blood cell images from `<root>/PBC_dataset_normal_DIB/<class>/*`.
///
/// Every class directory, in name order, becomes a label. Images are resized to 64x64, split
/// 70/15/15 with a permutation drawn from `seed`, and standardized with the training statistics.
pub fn load(root: &Path, seed: u64) -> Result<DatasetSplits> {
    let dir = root.join("PBC_dataset_normal_DIB");
    let classes = sorted_entries(&dir, |path| path.is_dir())?;
    if classes.is_empty() {
        return Err(TransferErr::Dataset(format!(
            "no class directories found in {}",
            dir.display()
        )));
    }

    let mut files = Vec::new();
    for (label, class) in classes.iter().enumerate() {
        let images = sorted_entries(class, |path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        })?;
        files.extend(images.into_iter().map(|path| (path, label)));
    }

    log::info!(
        "found {} PBC images in {} classes",
        files.len(),
        classes.len()
    );

    let pixels: Vec<Vec<f32>> = files
        .par_iter()
        .map(|(path, _)| decode(path))
        .collect::<Result<_>>()?;

    let mut order: Vec<usize> = (0..files.len()).collect();
    order.shuffle(&mut StdRng::seed_from_u64(seed));

    let train_end = files.len() * 70 / 100;
    let valid_end = files.len() * 85 / 100;
    let split = |indices: &[usize]| -> Result<InMemoryDataset> {
        let side = SIDE as usize;
        let mut flat = Vec::with_capacity(indices.len() * CHANNELS * side * side);
        for &i in indices {
            flat.extend_from_slice(&pixels[i]);
        }

        let images = Array4::from_shape_vec((indices.len(), CHANNELS, side, side), flat)?;
        let labels = indices.iter().map(|&i| files[i].1).collect();
        InMemoryDataset::new(images, labels)
    };

    let mut train = split(&order[..train_end])?;
    let mut valid = split(&order[train_end..valid_end])?;
    let mut test = split(&order[valid_end..])?;

    let (mean, std) = train.channel_stats();
    let std = std.mapv(|s| s.max(1e-6));
    for dataset in [&mut train, &mut valid, &mut test] {
        dataset.normalize(&mean, &std)?;
    }

    Ok(DatasetSplits {
        train,
        valid,
        test,
        in_channels: CHANNELS,
        num_classes: classes.len(),
    })
}

/// Decodes an image into a resized `(c, h, w)` buffer scaled to `[0, 1]`.
fn decode(path: &Path) -> Result<Vec<f32>> {
    let image = image::open(path)?.to_rgb8();
    let image = imageops::resize(&image, SIDE, SIDE, FilterType::Triangle);

    let side = SIDE as usize;
    let mut chw = vec![0.; CHANNELS * side * side];
    for (x, y, pixel) in image.enumerate_pixels() {
        for (c, &value) in pixel.0.iter().enumerate() {
            chw[(c * side + y as usize) * side + x as usize] = value as f32 / 255.;
        }
    }

    Ok(chw)
}

fn sorted_entries(dir: &Path, keep: impl Fn(&Path) -> bool) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|e| {
        TransferErr::Dataset(format!("failed to list {}: {e}", dir.display()))
    })?;

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if keep(&path) {
            paths.push(path);
        }
    }

    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};

    use super::*;

    fn write_class(root: &Path, class: &str, count: usize, color: [u8; 3]) {
        let dir = root.join("PBC_dataset_normal_DIB").join(class);
        fs::create_dir_all(&dir).unwrap();
        for i in 0..count {
            let image = RgbImage::from_pixel(8 + i as u32, 8, Rgb(color));
            image.save(dir.join(format!("{i}.png"))).unwrap();
        }
    }

    #[test]
    fn loads_class_folders_into_resized_splits() {
        let root = tempfile::tempdir().unwrap();
        write_class(root.path(), "basophil", 10, [200, 10, 10]);
        write_class(root.path(), "neutrophil", 10, [10, 10, 200]);
        fs::write(root.path().join("PBC_dataset_normal_DIB/notes.txt"), "skip me").unwrap();

        let splits = load(root.path(), 1).unwrap();

        assert_eq!(splits.num_classes, 2);
        assert_eq!(splits.in_channels, 3);
        assert_eq!(splits.train.len(), 14);
        assert_eq!(splits.valid.len(), 3);
        assert_eq!(splits.test.len(), 3);
        assert_eq!(splits.train.image_shape(), (3, 64, 64));
    }

    #[test]
    fn same_seed_same_split() {
        let root = tempfile::tempdir().unwrap();
        write_class(root.path(), "a", 5, [0, 0, 0]);
        write_class(root.path(), "b", 5, [255, 255, 255]);

        let first = load(root.path(), 9).unwrap();
        let second = load(root.path(), 9).unwrap();

        assert_eq!(first.test.labels(), second.test.labels());
    }

    #[test]
    fn empty_root_is_a_dataset_error() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("PBC_dataset_normal_DIB")).unwrap();
        assert!(matches!(load(root.path(), 0), Err(TransferErr::Dataset(_))));
    }
}
