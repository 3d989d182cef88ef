use std::{
    fmt::{self, Display},
    path::{Path, PathBuf},
};

use clap::{Parser, ValueEnum};
use machine_learning::arch::{Architecture, ResNetConfig};
use serde::{Deserialize, Serialize};

use crate::{Result, TransferErr};

/// The target datasets a model can be transferred to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum DatasetName {
    #[value(name = "CIFAR10")]
    Cifar10,
    #[value(name = "PBCBarcelona")]
    PbcBarcelona,
}

impl Display for DatasetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DatasetName::Cifar10 => "CIFAR10",
            DatasetName::PbcBarcelona => "PBCBarcelona",
        };

        f.write_str(name)
    }
}

/// The command line spelling of an `Architecture`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Network {
    Resnet18,
    Resnet34,
}

impl From<Network> for Architecture {
    fn from(value: Network) -> Self {
        match value {
            Network::Resnet18 => Architecture::Resnet18,
            Network::Resnet34 => Architecture::Resnet34,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    version,
    about = "Fine-tunes a classifier on a new dataset while pulling its batch norm inputs towards the source statistics"
)]
pub struct TransferArgs {
    /// The dataset to transfer the model to.
    #[arg(long = "dataset_to", value_enum, default_value_t = DatasetName::Cifar10)]
    pub dataset_to: DatasetName,

    #[arg(long, value_enum, default_value_t = Network::Resnet18)]
    pub network: Network,

    /// The source checkpoint, a fresh network is used when it doesn't exist.
    #[arg(long = "model_from", default_value = "models/model.ckpt")]
    pub model_from: PathBuf,

    /// Where the transferred model is saved, `auto` derives it from `--model_from`.
    #[arg(long, default_value = "auto")]
    pub ckpt: String,

    /// Accepted for compatibility, every computation runs on the CPU.
    #[arg(long)]
    pub cuda: bool,

    #[arg(long = "num_epochs", default_value_t = 3)]
    pub num_epochs: usize,

    #[arg(long, default_value_t = 0.01)]
    pub lr: f32,

    #[arg(long = "batch_size", default_value_t = 64)]
    pub batch_size: usize,

    /// Train with the batch norm penalty only, ignoring the labels.
    #[arg(long)]
    pub unsupervised: bool,

    /// Distort the training images with a fixed random convolution.
    #[arg(long = "distortion_test")]
    pub distortion_test: bool,

    /// Keep training an existing checkpoint instead of only reporting it.
    #[arg(long = "resume_training")]
    pub resume_training: bool,

    /// Ignore an existing checkpoint and start over.
    #[arg(long)]
    pub reset: bool,

    /// Only overwrite the checkpoint when the validation accuracy improves.
    #[arg(long = "save_best")]
    pub save_best: bool,

    #[arg(long = "data_root", default_value = "data")]
    pub data_root: PathBuf,

    /// Seed for initialization, shuffling and distortion, taken from the OS when missing.
    #[arg(long)]
    pub seed: Option<u64>,

    /// The amount of batches prepared ahead of the training loop.
    #[arg(long = "num_workers", default_value_t = 16)]
    pub num_workers: usize,

    /// The width of the first stage of a freshly built network.
    #[arg(long = "base_width", default_value_t = ResNetConfig::DEFAULT_BASE_WIDTH)]
    pub base_width: usize,
}

/// The validated settings of a transfer run.
#[derive(Debug, Clone, Serialize)]
pub struct TransferConfig {
    pub dataset: DatasetName,
    pub architecture: Architecture,
    pub model_from: PathBuf,
    pub ckpt: PathBuf,
    pub plot: PathBuf,
    pub num_epochs: usize,
    pub lr: f32,
    pub batch_size: usize,
    pub unsupervised: bool,
    pub distortion_test: bool,
    pub resume_training: bool,
    pub reset: bool,
    pub save_best: bool,
    pub data_root: PathBuf,
    pub seed: Option<u64>,
    pub prefetch: usize,
    pub base_width: usize,
    pub distortion_lambda: f32,
    pub log_every: usize,
    pub plot_smoothing: usize,
}

impl TransferConfig {
    pub const DISTORTION_LAMBDA: f32 = 0.1;
    pub const LOG_EVERY: usize = 50;
    pub const PLOT_SMOOTHING: usize = 50;
}

impl TryFrom<TransferArgs> for TransferConfig {
    type Error = TransferErr;

    fn try_from(args: TransferArgs) -> Result<Self> {
        if args.batch_size == 0 {
            return Err(TransferErr::InvalidConfig(
                "batch_size must be greater than zero".into(),
            ));
        }

        if !args.lr.is_finite() || args.lr <= 0. {
            return Err(TransferErr::InvalidConfig(format!(
                "lr must be a positive number, got {}",
                args.lr
            )));
        }

        if args.base_width == 0 {
            return Err(TransferErr::InvalidConfig(
                "base_width must be greater than zero".into(),
            ));
        }

        if args.cuda {
            log::warn!("--cuda was requested but only the CPU backend is available");
        }

        let ckpt = match args.ckpt.as_str() {
            "auto" => auto_ckpt_path(&args.model_from, args.dataset_to),
            path => PathBuf::from(path),
        };

        if ckpt == args.model_from {
            return Err(TransferErr::InvalidConfig(format!(
                "checkpoint {} would overwrite the source model",
                ckpt.display()
            )));
        }

        if ckpt.file_name().is_none() {
            return Err(TransferErr::InvalidConfig(format!(
                "checkpoint path {} doesn't name a file",
                ckpt.display()
            )));
        }

        Ok(Self {
            dataset: args.dataset_to,
            architecture: args.network.into(),
            model_from: args.model_from,
            plot: ckpt.with_extension("png"),
            ckpt,
            num_epochs: args.num_epochs,
            lr: args.lr,
            batch_size: args.batch_size,
            unsupervised: args.unsupervised,
            distortion_test: args.distortion_test,
            resume_training: args.resume_training,
            reset: args.reset,
            save_best: args.save_best,
            data_root: args.data_root,
            seed: args.seed,
            prefetch: args.num_workers.max(1),
            base_width: args.base_width,
            distortion_lambda: Self::DISTORTION_LAMBDA,
            log_every: Self::LOG_EVERY,
            plot_smoothing: Self::PLOT_SMOOTHING,
        })
    }
}

/// Derives the transferred checkpoint path from the source one, `models/model.ckpt` becomes
/// `models/model_transfer_CIFAR10.ckpt`. Sources without `.ckpt` get the suffix appended.
pub fn auto_ckpt_path(model_from: &Path, dataset: DatasetName) -> PathBuf {
    let source = model_from.to_string_lossy();
    let suffix = format!("_transfer_{dataset}.ckpt");

    if source.contains(".ckpt") {
        PathBuf::from(source.replace(".ckpt", &suffix))
    } else {
        PathBuf::from(format!("{source}{suffix}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(args: &[&str]) -> Result<TransferConfig> {
        let argv = std::iter::once("bn-transfer").chain(args.iter().copied());
        TransferConfig::try_from(TransferArgs::parse_from(argv))
    }

    #[test]
    fn defaults_derive_checkpoint_and_plot_paths() {
        let config = config(&[]).unwrap();

        assert_eq!(config.dataset, DatasetName::Cifar10);
        assert_eq!(config.architecture, Architecture::Resnet18);
        assert_eq!(config.ckpt, PathBuf::from("models/model_transfer_CIFAR10.ckpt"));
        assert_eq!(config.plot, PathBuf::from("models/model_transfer_CIFAR10.png"));
        assert_eq!((config.num_epochs, config.batch_size, config.lr), (3, 64, 0.01));
        assert!(!config.save_best && !config.reset && !config.resume_training);
    }

    #[test]
    fn snake_case_flags() {
        let config = config(&[
            "--dataset_to",
            "PBCBarcelona",
            "--network",
            "resnet34",
            "--model_from",
            "runs/source.ckpt",
            "--num_epochs",
            "5",
            "--save_best",
            "--resume_training",
        ])
        .unwrap();

        assert_eq!(config.architecture, Architecture::Resnet34);
        assert_eq!(config.ckpt, PathBuf::from("runs/source_transfer_PBCBarcelona.ckpt"));
        assert_eq!(config.num_epochs, 5);
        assert!(config.save_best && config.resume_training);
    }

    #[test]
    fn explicit_checkpoint_is_kept() {
        let config = config(&["--ckpt", "out/run.v2.ckpt"]).unwrap();
        assert_eq!(config.ckpt, PathBuf::from("out/run.v2.ckpt"));
        assert_eq!(config.plot, PathBuf::from("out/run.v2.png"));
    }

    #[test]
    fn auto_checkpoint_never_reuses_the_source_path() {
        let ckpt = auto_ckpt_path(Path::new("models/source.safetensors"), DatasetName::Cifar10);
        assert_eq!(ckpt, PathBuf::from("models/source.safetensors_transfer_CIFAR10.ckpt"));

        let config = config(&["--model_from", "models/source.safetensors"]).unwrap();
        assert_ne!(config.ckpt, config.model_from);
    }

    #[test]
    fn checkpoint_equal_to_source_is_rejected() {
        assert!(matches!(
            config(&["--model_from", "models/a.ckpt", "--ckpt", "models/a.ckpt"]),
            Err(TransferErr::InvalidConfig(_))
        ));
    }

    #[test]
    fn unknown_network_is_rejected() {
        let argv = ["bn-transfer", "--network", "Unet"];
        assert!(TransferArgs::try_parse_from(argv).is_err());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        assert!(matches!(
            config(&["--batch_size", "0"]),
            Err(TransferErr::InvalidConfig(_))
        ));
    }
}
