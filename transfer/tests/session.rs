use std::{cell::RefCell, collections::VecDeque, path::Path, rc::Rc};

use machine_learning::{
    arch::{Architecture, Model, ResNet, ResNetConfig},
    optimization::Adam,
};
use ndarray::{Array, Array1};
use rand::{SeedableRng, rngs::StdRng};
use tempfile::TempDir;

use transfer::{
    Result, TransferErr,
    checkpoint::{Checkpoint, CheckpointStore},
    config::{DatasetName, TransferConfig},
    data::{DataLoader, DatasetSplits, InMemoryDataset},
    evaluation::Evaluator,
    metrics_log::MetricsLog,
    session::{Phase, TrainingSession},
};

const BATCHES: usize = 3;

fn config(dir: &TempDir) -> TransferConfig {
    TransferConfig {
        dataset: DatasetName::Cifar10,
        architecture: Architecture::Resnet18,
        model_from: dir.path().join("source.ckpt"),
        ckpt: dir.path().join("run.ckpt"),
        plot: dir.path().join("run.png"),
        num_epochs: 1,
        lr: 0.01,
        batch_size: 4,
        unsupervised: false,
        distortion_test: false,
        resume_training: false,
        reset: false,
        save_best: false,
        data_root: dir.path().to_path_buf(),
        seed: Some(3),
        prefetch: 2,
        base_width: 2,
        distortion_lambda: TransferConfig::DISTORTION_LAMBDA,
        log_every: 1,
        plot_smoothing: 2,
    }
}

/// Class 0 images are bright on the top half, class 1 images on the bottom half.
fn halves(n: usize) -> InMemoryDataset {
    let labels: Vec<usize> = (0..n).map(|i| i % 2).collect();
    let x = Array::from_shape_fn((n, 3, 8, 8), |(k, c, i, j)| {
        let bright = (i < 4) == (labels[k] == 0);
        let noise = ((k * 7 + c * 3 + j) % 5) as f32 / 20.;
        if bright { 1. + noise } else { -1. + noise }
    });
    InMemoryDataset::new(x, labels).unwrap()
}

fn splits() -> DatasetSplits {
    DatasetSplits {
        train: halves(4 * BATCHES),
        valid: halves(4),
        test: halves(6),
        in_channels: 3,
        num_classes: 2,
    }
}

fn saved(path: &Path) -> Checkpoint {
    CheckpointStore::new(path).load().unwrap().unwrap()
}

/// Answers with a fixed sequence of accuracies: the initial validation, one per epoch and the
/// final test.
struct ScriptedEvaluator(VecDeque<f32>);

impl Evaluator for ScriptedEvaluator {
    fn evaluate(&mut self, _: &mut ResNet, _: &[f32], _: &mut DataLoader) -> Result<f32> {
        self.0
            .pop_front()
            .ok_or_else(|| TransferErr::Dataset("no more scripted accuracies".into()))
    }
}

#[test]
fn fresh_run_walks_every_phase_and_saves() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    let mut session = TrainingSession::new(config.clone(), splits());

    let mut phases = vec![session.phase()];
    while session.phase() != Phase::Done {
        phases.push(session.step_phase().unwrap());
    }

    assert_eq!(
        phases,
        vec![
            Phase::Idle,
            Phase::Resuming,
            Phase::EpochRunning { epoch: 0 },
            Phase::EpochEvaluating { epoch: 0 },
            Phase::Saving { epoch: 0 },
            Phase::Done,
        ]
    );

    let ckpt = saved(&config.ckpt);
    assert_eq!(ckpt.epoch, 1);
    assert_eq!(ckpt.logs.series_len("acc"), BATCHES);
    assert_eq!(ckpt.logs.series_len("loss_bn"), BATCHES);
    assert_eq!(ckpt.logs.series_len("loss_crit"), BATCHES);
    assert_eq!(ckpt.logs.series_len("val_acc"), BATCHES);
    assert!(ckpt.logs.get("loss_bn").unwrap().iter().all(|&l| l >= 0.));
    assert!(config.plot.exists());
}

#[test]
fn unsupervised_run_logs_no_task_loss() {
    let dir = tempfile::tempdir().unwrap();
    let config = TransferConfig {
        unsupervised: true,
        ..config(&dir)
    };

    TrainingSession::new(config.clone(), splits()).run().unwrap();

    let ckpt = saved(&config.ckpt);
    let names: Vec<_> = ckpt.logs.names().collect();
    assert_eq!(names, vec!["acc", "loss_bn", "val_acc"]);
}

#[test]
fn distorted_inputs_still_train() {
    let dir = tempfile::tempdir().unwrap();
    let config = TransferConfig {
        distortion_test: true,
        ..config(&dir)
    };

    let summary = TrainingSession::new(config, splits()).run().unwrap();
    assert_eq!(summary.steps, BATCHES);
}

#[test]
fn rerun_without_resume_trains_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    TrainingSession::new(config.clone(), splits()).run().unwrap();
    let before = saved(&config.ckpt);

    let mut session = TrainingSession::new(config.clone(), splits());
    let summary = session.run().unwrap();

    assert_eq!(summary.steps, 0);
    assert_eq!(summary.epoch, 1);
    assert_eq!(session.logs(), Some(&before.logs));

    let after = saved(&config.ckpt);
    assert_eq!(after.epoch, 1);
    assert_eq!(after.params, before.params);
}

#[test]
fn resumed_run_extends_every_series() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    TrainingSession::new(config.clone(), splits()).run().unwrap();

    let resumed = TransferConfig {
        resume_training: true,
        num_epochs: 2,
        ..config.clone()
    };
    let summary = TrainingSession::new(resumed, splits()).run().unwrap();

    assert_eq!(summary.steps, 2 * BATCHES);
    assert_eq!(summary.epoch, 3);

    let ckpt = saved(&config.ckpt);
    assert_eq!(ckpt.epoch, 3);
    for name in ["acc", "loss_bn", "loss_crit", "val_acc"] {
        assert_eq!(ckpt.logs.series_len(name), 3 * BATCHES, "{name}");
    }
}

#[test]
fn reset_starts_over() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    TrainingSession::new(config.clone(), splits()).run().unwrap();

    let reset = TransferConfig {
        reset: true,
        ..config.clone()
    };
    let summary = TrainingSession::new(reset, splits()).run().unwrap();

    assert_eq!(summary.steps, BATCHES);
    assert_eq!(saved(&config.ckpt).logs.series_len("acc"), BATCHES);
}

#[test]
fn save_best_keeps_the_best_epoch() {
    let dir = tempfile::tempdir().unwrap();
    let config = TransferConfig {
        num_epochs: 2,
        save_best: true,
        ..config(&dir)
    };

    let script = VecDeque::from([0.1, 0.6, 0.4, 0.5]);
    let mut session =
        TrainingSession::new(config.clone(), splits()).with_evaluator(ScriptedEvaluator(script));
    let summary = session.run().unwrap();

    assert_eq!(summary.best_acc, 0.6);
    assert_eq!(summary.valid_acc, 0.4);
    assert_eq!(summary.test_acc, 0.5);
    assert_eq!(summary.steps, 2 * BATCHES);
    // The best model was reloaded.
    assert_eq!(summary.epoch, 1);

    let ckpt = saved(&config.ckpt);
    assert_eq!(ckpt.epoch, 1);
    assert_eq!(ckpt.acc, 0.6);
    assert_eq!(ckpt.logs.series_len("acc"), BATCHES);

    let (_, params) = session.model().unwrap();
    assert_eq!(params, ckpt.params.as_slice());

    let val_acc = session.logs().unwrap().get("val_acc").unwrap();
    assert_eq!(val_acc.len(), 2 * BATCHES);
    assert_eq!(val_acc[0], 0.1);
    assert_eq!(val_acc[BATCHES - 1], 0.6);
    assert_eq!(val_acc[2 * BATCHES - 1], 0.4);
}

fn save_source(dir: &TempDir, config: ResNetConfig) -> Vec<f32> {
    let model = ResNet::new(config);
    let params = model
        .init_params(Rc::new(RefCell::new(StdRng::seed_from_u64(9))))
        .unwrap();
    let references: Vec<_> = model
        .norm_layers()
        .iter()
        .map(|bn| Array1::zeros(bn.channels()))
        .collect();

    let source = Checkpoint {
        optimizer: Adam::with_learning_rate(model.size(), 0.01),
        model,
        params: params.clone(),
        epoch: 4,
        acc: 0.9,
        logs: MetricsLog::default(),
        references,
    };
    CheckpointStore::new(dir.path().join("source.ckpt"))
        .save(source.view())
        .unwrap();

    params
}

#[test]
fn source_model_body_is_transferred_and_head_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let source = ResNetConfig::new(Architecture::Resnet18, 3, 5).with_base_width(2);
    let source_params = save_source(&dir, source);

    let config = TransferConfig {
        num_epochs: 0,
        ..config(&dir)
    };
    let mut session = TrainingSession::new(config.clone(), splits());
    let summary = session.run().unwrap();
    assert_eq!(summary.steps, 0);

    let (model, params) = session.model().unwrap();
    assert_eq!(model.config().num_classes, 2);

    let head = (16 + 1) * 2;
    let body = params.len() - head;
    assert_eq!(body, source_params.len() - (16 + 1) * 5);
    assert_eq!(params[..body], source_params[..body]);
}

#[test]
fn mismatched_source_model_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    save_source(
        &dir,
        ResNetConfig::new(Architecture::Resnet34, 3, 2).with_base_width(2),
    );

    let err = TrainingSession::new(config(&dir), splits()).run().unwrap_err();
    assert!(matches!(err, TransferErr::InvalidConfig(_)), "{err}");
}
