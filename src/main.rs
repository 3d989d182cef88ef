use anyhow::Context;
use clap::Parser;
use log::info;

use transfer::{
    config::{TransferArgs, TransferConfig},
    data,
    session::TrainingSession,
};

/// Splits datasets that don't ship one when no `--seed` is given, so reruns see the same split.
const DEFAULT_SPLIT_SEED: u64 = 0;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = TransferConfig::try_from(TransferArgs::parse()).context("invalid arguments")?;
    if let serde_json::Value::Object(fields) = serde_json::to_value(&config)? {
        for (name, value) in fields {
            info!("{name}={value}");
        }
    }

    let split_seed = config.seed.unwrap_or(DEFAULT_SPLIT_SEED);
    let splits = data::get_dataset(config.dataset, &config.data_root, split_seed)
        .with_context(|| format!("loading {} from {}", config.dataset, config.data_root.display()))?;
    info!(
        "{}: {} train, {} valid, {} test images, {} classes",
        config.dataset,
        splits.train.len(),
        splits.valid.len(),
        splits.test.len(),
        splits.num_classes
    );

    let ckpt = config.ckpt.clone();
    let summary = TrainingSession::new(config, splits)
        .run()
        .with_context(|| format!("transfer run for {} failed", ckpt.display()))?;

    info!(
        "done after {} epochs ({} steps this run), best valid acc {:.3}, test acc {:.3}",
        summary.epoch, summary.steps, summary.best_acc, summary.test_acc
    );

    Ok(())
}
