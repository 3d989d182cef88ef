use std::{cell::RefCell, rc::Rc, sync::Arc};

use machine_learning::{
    arch::{
        Mode, Model, ResNet, ResNetConfig,
        distortion::DistortionModelConv,
        loss::{CrossEntropy, LossFn},
    },
    metrics,
    optimization::{Adam, Optimizer},
};
use ndarray::Array2;
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::{
    Result, TransferErr,
    checkpoint::{Checkpoint, CheckpointRef, CheckpointStore},
    config::TransferConfig,
    data::{Batch, DataLoader, DatasetSplits},
    evaluation::{AccuracyEvaluator, Evaluator},
    metrics_log::{MetricsLog, linspace},
    plot::pretty_plot,
    regularization::BnRegularizer,
    selector::BestModelSelector,
    tap::ActivationTap,
};

/// Where a `TrainingSession` is in its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Resuming,
    EpochRunning { epoch: usize },
    EpochEvaluating { epoch: usize },
    Saving { epoch: usize },
    Done,
}

/// What a finished run reports.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
    /// The amount of epochs the final model was trained for.
    pub epoch: usize,
    pub best_acc: f32,
    pub valid_acc: f32,
    pub test_acc: f32,
    /// The training steps executed by this run.
    pub steps: usize,
}

/// Everything that exists once the model is constructed or restored.
struct TrainState {
    model: ResNet,
    params: Vec<f32>,
    grad: Vec<f32>,
    optimizer: Adam,
    tap: ActivationTap,
    regularizer: BnRegularizer,
    logs: MetricsLog,
    selector: BestModelSelector,
    init_epoch: usize,
    epoch: usize,
    valid_acc: f32,
    train: bool,
    saved: bool,
    steps: usize,
}

/// Drives one transfer run through its phases, from the checkpoint lookup to the final report.
pub struct TrainingSession {
    config: TransferConfig,
    phase: Phase,
    rng: Rc<RefCell<StdRng>>,
    store: CheckpointStore,
    train_loader: DataLoader,
    valid_loader: DataLoader,
    test_loader: DataLoader,
    in_channels: usize,
    num_classes: usize,
    evaluator: Box<dyn Evaluator>,
    loss_fn: CrossEntropy,
    distortion: Option<DistortionModelConv>,
    state: Option<TrainState>,
    test_acc: Option<f32>,
}

impl TrainingSession {
    /// Creates a new idle `TrainingSession`.
    ///
    /// # Arguments
    /// * `config` - The validated run settings.
    /// * `splits` - The target dataset, the train split is reshuffled on every epoch.
    pub fn new(config: TransferConfig, splits: DatasetSplits) -> Self {
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let shuffle = StdRng::seed_from_u64(rng.random());
        let DatasetSplits {
            train,
            valid,
            test,
            in_channels,
            num_classes,
        } = splits;

        let (batch_size, prefetch) = (config.batch_size, config.prefetch);
        Self {
            store: CheckpointStore::new(&config.ckpt),
            train_loader: DataLoader::shuffled(Arc::new(train), batch_size, prefetch, shuffle),
            valid_loader: DataLoader::sequential(Arc::new(valid), batch_size, prefetch),
            test_loader: DataLoader::sequential(Arc::new(test), batch_size, prefetch),
            config,
            phase: Phase::Idle,
            rng: Rc::new(RefCell::new(rng)),
            in_channels,
            num_classes,
            evaluator: Box::new(AccuracyEvaluator),
            loss_fn: CrossEntropy,
            distortion: None,
            state: None,
            test_acc: None,
        }
    }

    /// Replaces the accuracy measurement used on the validation and test splits.
    pub fn with_evaluator(mut self, evaluator: impl Evaluator + 'static) -> Self {
        self.evaluator = Box::new(evaluator);
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// The metrics recorded so far, `None` before the model exists.
    pub fn logs(&self) -> Option<&MetricsLog> {
        self.state.as_ref().map(|state| &state.logs)
    }

    /// The session's current model and its parameters.
    pub fn model(&self) -> Option<(&ResNet, &[f32])> {
        self.state
            .as_ref()
            .map(|state| (&state.model, state.params.as_slice()))
    }

    /// Runs every remaining phase.
    ///
    /// # Errors
    /// The first error of any phase, the run stops there.
    pub fn run(&mut self) -> Result<RunSummary> {
        while self.phase != Phase::Done {
            self.step_phase()?;
        }

        self.summary()
    }

    /// Executes the current phase and moves to the next one.
    ///
    /// # Returns
    /// The new phase, `Phase::Done` stays put.
    pub fn step_phase(&mut self) -> Result<Phase> {
        let next = match self.phase {
            Phase::Idle => {
                log::debug!("looking for checkpoint {}", self.store.path().display());
                Phase::Resuming
            }
            Phase::Resuming => self.resume()?,
            Phase::EpochRunning { epoch } => {
                self.train_epoch(epoch)?;
                Phase::EpochEvaluating { epoch }
            }
            Phase::EpochEvaluating { epoch } => self.evaluate_epoch(epoch)?,
            Phase::Saving { epoch } => {
                self.save(epoch)?;
                self.next_epoch(epoch)
            }
            Phase::Done => return Ok(Phase::Done),
        };

        if next == Phase::Done {
            self.finish()?;
        }

        self.phase = next;
        Ok(next)
    }

    fn summary(&self) -> Result<RunSummary> {
        let state = self.state()?;

        Ok(RunSummary {
            epoch: state.epoch,
            best_acc: state.selector.best_acc(),
            valid_acc: state.valid_acc,
            test_acc: self.test_acc.unwrap_or(0.),
            steps: state.steps,
        })
    }

    fn state(&self) -> Result<&TrainState> {
        self.state.as_ref().ok_or_else(not_resumed)
    }

    /// Restores the checkpoint or builds a fresh state, then decides whether there is training
    /// to do.
    fn resume(&mut self) -> Result<Phase> {
        let restored = if self.config.reset {
            None
        } else {
            self.store.load()?
        };

        let (checkpoint, fresh) = match restored {
            Some(checkpoint) => {
                self.check_restored(&checkpoint)?;
                log::info!(
                    "Loading model {} ({} epochs), valid acc {:.3}",
                    self.store.path().display(),
                    checkpoint.epoch,
                    checkpoint.acc
                );
                (checkpoint, false)
            }
            None => (self.fresh_checkpoint()?, true),
        };

        let Checkpoint {
            mut model,
            params,
            optimizer,
            epoch,
            acc,
            logs,
            references,
        } = checkpoint;

        let tap = ActivationTap::install(&mut model)?;
        let valid_acc = self
            .evaluator
            .evaluate(&mut model, &params, &mut self.valid_loader)?;
        log::info!("valid acc {valid_acc:.3}");

        let train = fresh || self.config.resume_training;
        self.state = Some(TrainState {
            grad: vec![0.; params.len()],
            model,
            params,
            optimizer,
            tap,
            regularizer: BnRegularizer::new(references),
            logs,
            selector: BestModelSelector::new(self.config.save_best, acc),
            init_epoch: epoch,
            epoch,
            valid_acc,
            train,
            saved: false,
            steps: 0,
        });

        if !train {
            log::info!("checkpoint exists and --resume_training is not set, skipping training");
            return Ok(Phase::Done);
        }

        let state = self.state()?;
        log::info!(
            "Training transfer model {}, params:\t{:.2} K",
            state.model,
            state.model.size() as f32 / 1000.
        );

        if self.config.num_epochs == 0 {
            return Ok(Phase::Done);
        }

        Ok(Phase::EpochRunning { epoch })
    }

    fn check_restored(&self, checkpoint: &Checkpoint) -> Result<()> {
        let ResNetConfig {
            architecture,
            in_channels,
            num_classes,
            ..
        } = checkpoint.model.config();

        if architecture != self.config.architecture
            || in_channels != self.in_channels
            || num_classes != self.num_classes
        {
            return Err(TransferErr::InvalidConfig(format!(
                "checkpoint {} holds a {architecture} for {in_channels} channels and {num_classes} \
                 classes, expected a {} for {} channels and {} classes, use --reset to start over",
                self.store.path().display(),
                self.config.architecture,
                self.in_channels,
                self.num_classes
            )));
        }

        Ok(())
    }

    /// The state of a run that hasn't trained yet: the source model's weights if there is one,
    /// a fresh optimizer and empty logs.
    fn fresh_checkpoint(&mut self) -> Result<Checkpoint> {
        let (model, params) = match CheckpointStore::new(&self.config.model_from).load()? {
            Some(source) => self.adapt_source(source)?,
            None => {
                log::warn!(
                    "source model {} not found, starting from random weights",
                    self.config.model_from.display()
                );

                let config =
                    ResNetConfig::new(self.config.architecture, self.in_channels, self.num_classes)
                        .with_base_width(self.config.base_width);
                let model = ResNet::new(config);
                let params = model.init_params(Rc::clone(&self.rng))?;
                (model, params)
            }
        };

        let references = BnRegularizer::from_model(&model).references().to_vec();
        Ok(Checkpoint {
            optimizer: Adam::with_learning_rate(params.len(), self.config.lr),
            model,
            params,
            epoch: 0,
            acc: 0.,
            logs: MetricsLog::default(),
            references,
        })
    }

    /// Takes the weights and normalization statistics of a source model, replacing its head
    /// when the target has another amount of classes.
    fn adapt_source(&mut self, source: Checkpoint) -> Result<(ResNet, Vec<f32>)> {
        let Checkpoint {
            mut model,
            mut params,
            ..
        } = source;
        let ResNetConfig {
            architecture,
            in_channels,
            num_classes,
            ..
        } = model.config();

        if architecture != self.config.architecture || in_channels != self.in_channels {
            return Err(TransferErr::InvalidConfig(format!(
                "source model {} is a {architecture} for {in_channels} channels, expected a {} \
                 for {} channels",
                self.config.model_from.display(),
                self.config.architecture,
                self.in_channels
            )));
        }

        log::info!(
            "Transferring {} ({num_classes} classes) to {} ({} classes)",
            self.config.model_from.display(),
            self.config.dataset,
            self.num_classes
        );

        if num_classes != self.num_classes {
            model.reinit_head(&mut params, self.num_classes, Rc::clone(&self.rng))?;
        }

        Ok((model, params))
    }

    fn train_epoch(&mut self, epoch: usize) -> Result<()> {
        let Self {
            config,
            rng,
            train_loader,
            loss_fn,
            distortion,
            state,
            ..
        } = self;
        let state = state.as_mut().ok_or_else(not_resumed)?;

        let total = state.init_epoch + config.num_epochs;
        let log_every = config.log_every.max(1);
        state.model.set_mode(Mode::Train);

        for (step, batch) in train_loader.iter().enumerate() {
            let Batch { x, y } = batch;

            let x = if config.distortion_test {
                // Built from the first batch and kept for the whole run.
                if distortion.is_none() {
                    let lambd = config.distortion_lambda;
                    let transform = DistortionModelConv::new(x.dim(), lambd, Rc::clone(rng))?;
                    log::info!(
                        "distorting inputs shaped {:?} with lambd {lambd}",
                        transform.input_shape()
                    );
                    *distortion = Some(transform);
                }

                match distortion {
                    Some(transform) => transform.apply(x.view())?,
                    None => x,
                }
            } else {
                x
            };

            let logits = state.model.forward(&state.params, x.view())?;
            let pass = state.model.passes();
            let (penalties, norm_grads) = {
                let captures = state.tap.captures();
                (
                    state.regularizer.compute(&captures, pass)?,
                    state.regularizer.input_grads(&captures, pass)?,
                )
            };
            let loss_bn: f32 = penalties.iter().sum();
            let acc = metrics::accuracy(logits.view(), &y);

            let mut step_metrics = vec![("acc", acc), ("loss_bn", loss_bn)];
            let d_logits = if config.unsupervised {
                Array2::zeros(logits.raw_dim())
            } else {
                step_metrics.push(("loss_crit", loss_fn.loss(logits.view(), &y)?));
                loss_fn.loss_prime(logits.view(), &y)?
            };

            for &(name, value) in &step_metrics {
                state.logs.push(name, value);
            }

            state.grad.fill(0.);
            state
                .model
                .backward(&state.params, &mut state.grad, d_logits, &norm_grads)?;
            state
                .optimizer
                .update_params(&state.grad, &mut state.params)?;
            state.steps += 1;

            if step % log_every == 0 {
                log::info!("{}", progress_line(epoch, total, step, &step_metrics));
            }
        }

        Ok(())
    }

    fn evaluate_epoch(&mut self, epoch: usize) -> Result<Phase> {
        let steps = self.train_loader.len();
        let Self {
            evaluator,
            valid_loader,
            state,
            ..
        } = self;
        let state = state.as_mut().ok_or_else(not_resumed)?;

        let valid_acc = evaluator.evaluate(&mut state.model, &state.params, valid_loader)?;
        log::info!("[{epoch}] valid acc {valid_acc:.3}");

        state
            .logs
            .extend("val_acc", linspace(state.valid_acc, valid_acc, steps));
        state.valid_acc = valid_acc;
        state.epoch = epoch + 1;

        if state.selector.should_save(valid_acc) {
            return Ok(Phase::Saving { epoch });
        }

        Ok(self.next_epoch(epoch))
    }

    fn save(&mut self, epoch: usize) -> Result<()> {
        let steps = self.train_loader.len();
        let Self {
            config,
            store,
            state,
            ..
        } = self;
        let state = state.as_mut().ok_or_else(not_resumed)?;

        pretty_plot(
            &state.logs,
            Some(steps),
            config.plot_smoothing,
            &config.plot,
        )?;

        log::info!("Saving model to {}", store.path().display());
        store.save(CheckpointRef {
            model: &state.model,
            params: &state.params,
            optimizer: &state.optimizer,
            epoch: epoch + 1,
            acc: state.selector.best_acc(),
            logs: &state.logs,
            references: state.regularizer.references(),
        })?;
        state.saved = true;

        Ok(())
    }

    fn next_epoch(&self, epoch: usize) -> Phase {
        let last = self
            .state
            .as_ref()
            .map_or(epoch, |state| state.init_epoch + self.config.num_epochs - 1);

        if epoch < last {
            Phase::EpochRunning { epoch: epoch + 1 }
        } else {
            Phase::Done
        }
    }

    /// Reloads the best model when only improvements were saved, then reports on the test split
    /// and plots the whole run.
    fn finish(&mut self) -> Result<()> {
        let steps = self.train_loader.len();
        let Self {
            config,
            store,
            evaluator,
            test_loader,
            state,
            test_acc,
            ..
        } = self;
        let state = state.as_mut().ok_or_else(not_resumed)?;

        // A reset run that never improved must not pick up an unrelated older checkpoint.
        let reload = state.saved || !config.reset;
        if state.train && config.save_best && reload && store.exists() {
            let best = store.load()?.ok_or_else(|| {
                TransferErr::InvalidCheckpoint(format!(
                    "best model {} disappeared",
                    store.path().display()
                ))
            })?;

            log::info!(
                "Loading best model {} ({} epochs), valid acc {:.3}",
                store.path().display(),
                best.epoch,
                best.acc
            );

            let Checkpoint {
                mut model,
                params,
                optimizer,
                epoch,
                references,
                ..
            } = best;

            state.tap = ActivationTap::install(&mut model)?;
            state.model = model;
            state.grad = vec![0.; params.len()];
            state.params = params;
            state.optimizer = optimizer;
            state.regularizer = BnRegularizer::new(references);
            state.epoch = epoch;
        }

        let acc = evaluator.evaluate(&mut state.model, &state.params, test_loader)?;
        log::info!("test acc {acc:.3}");
        *test_acc = Some(acc);

        pretty_plot(
            &state.logs,
            Some(steps),
            config.plot_smoothing,
            &config.plot,
        )
    }
}

fn not_resumed() -> TransferErr {
    TransferErr::InvalidCheckpoint("the session hasn't restored or built a model yet".into())
}

/// `[epoch/total:step] name: value, ...` with three decimals per metric.
fn progress_line(epoch: usize, total: usize, step: usize, metrics: &[(&str, f32)]) -> String {
    let values = metrics
        .iter()
        .map(|(name, value)| format!("{name}: {value:.3}"))
        .collect::<Vec<_>>()
        .join(", ");

    format!("[{epoch}/{total}:{step:3}] {values}")
}
