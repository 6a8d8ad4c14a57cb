// External imports
use burn::grad_clipping::GradientClippingConfig;
use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::cast::ToElement;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::time::Instant;

// Internal imports
use super::step_1_sequence_dataset::{batch_to_tensors, Windows};
use super::step_3_gru_model_arch::GruForecaster;
use super::step_6_model_serialization::{
    Checkpoint, CheckpointSlot, CheckpointStore, DataProfile,
};
use crate::constants::{
    BATCH_SIZE, CHECKPOINT_INTERVAL, EARLY_STOPPING_PATIENCE, EPOCHS, LEARNING_RATE, LR_DECAY,
    LR_PATIENCE, MIN_DELTA, MIN_LEARNING_RATE, SEED,
};
use crate::error::{ForecastError, Result};

/// Hyper-parameters of a training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    /// Shuffle window order every epoch (seeded, so still reproducible)
    pub shuffle: bool,
    pub seed: u64,
    /// Epochs without a significant improvement before stopping; 0 disables
    pub patience: usize,
    pub min_delta: f64,
    /// Also checkpoint every N epochs regardless of improvement; 0 disables
    pub checkpoint_interval: usize,
    pub lr_decay: f64,
    pub lr_patience: usize,
    pub min_learning_rate: f64,
    pub grad_clip_norm: Option<f32>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: EPOCHS,
            batch_size: BATCH_SIZE,
            learning_rate: LEARNING_RATE,
            shuffle: true,
            seed: SEED,
            patience: EARLY_STOPPING_PATIENCE,
            min_delta: MIN_DELTA,
            checkpoint_interval: CHECKPOINT_INTERVAL,
            lr_decay: LR_DECAY,
            lr_patience: LR_PATIENCE,
            min_learning_rate: MIN_LEARNING_RATE,
            grad_clip_norm: None,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 || self.batch_size == 0 {
            return Err(ForecastError::Config(format!(
                "epochs ({}) and batch_size ({}) must be at least 1",
                self.epochs, self.batch_size
            )));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(ForecastError::Config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(self.lr_decay > 0.0 && self.lr_decay <= 1.0) {
            return Err(ForecastError::Config(format!(
                "lr_decay must lie in (0, 1], got {}",
                self.lr_decay
            )));
        }
        if self.min_learning_rate < 0.0 || self.min_delta < 0.0 {
            return Err(ForecastError::Config(
                "min_learning_rate and min_delta must not be negative".into(),
            ));
        }
        if let Some(norm) = self.grad_clip_norm {
            if !(norm.is_finite() && norm > 0.0) {
                return Err(ForecastError::Config(format!(
                    "grad_clip_norm must be positive, got {}",
                    norm
                )));
            }
        }
        Ok(())
    }
}

/// Lifecycle of a training run.
///
/// `Initialized -> Training -> (Checkpointed -> Training)* -> Converged | MaxEpochsReached`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainingState {
    Initialized,
    Training { epoch: usize },
    Checkpointed { epoch: usize },
    /// Stopped early: the monitored loss stopped improving
    Converged { epoch: usize },
    MaxEpochsReached { epoch: usize },
}

impl TrainingState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TrainingState::Converged { .. } | TrainingState::MaxEpochsReached { .. }
        )
    }
}

/// One row of the training history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub loss: f64,
    pub val_loss: Option<f64>,
    pub lr: f64,
    pub duration_secs: f64,
    pub checkpointed: bool,
}

/// Mutable progress of a run, owned by the caller.
///
/// The history is kept even when the run fails. [`TrainingContext::resume_from`]
/// restores the counters of a checkpoint.
#[derive(Debug, Clone)]
pub struct TrainingContext {
    pub state: TrainingState,
    /// Completed epochs
    pub epoch: usize,
    /// Optimizer updates applied so far
    pub step: u64,
    pub best_loss: f64,
    pub best_epoch: Option<usize>,
    pub epochs_without_improvement: usize,
    /// `None` until the first epoch picks up the configured rate
    pub learning_rate: Option<f64>,
    pub history: Vec<EpochRecord>,
    pub checkpoints_written: usize,
}

impl Default for TrainingContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TrainingContext {
    pub fn new() -> Self {
        Self {
            state: TrainingState::Initialized,
            epoch: 0,
            step: 0,
            best_loss: f64::INFINITY,
            best_epoch: None,
            epochs_without_improvement: 0,
            learning_rate: None,
            history: Vec::new(),
            checkpoints_written: 0,
        }
    }

    /// Continue counting from a restored checkpoint
    pub fn resume_from(step: u64, epoch: usize, best_val_loss: Option<f64>) -> Self {
        Self {
            step,
            epoch,
            best_loss: best_val_loss.unwrap_or(f64::INFINITY),
            best_epoch: best_val_loss.map(|_| epoch),
            ..Self::new()
        }
    }

    /// Continue from a checkpoint's counters, best loss and decayed learning rate
    pub fn from_checkpoint<B: Backend>(checkpoint: &Checkpoint<B>) -> Self {
        let mut context =
            Self::resume_from(checkpoint.step, checkpoint.epoch, checkpoint.best_val_loss);
        if checkpoint.best_epoch.is_some() {
            context.best_epoch = checkpoint.best_epoch;
        }
        context.learning_rate = checkpoint.learning_rate;
        context
    }

    fn transition(&mut self, next: TrainingState) {
        debug!("Training state {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

/// Summary of a finished run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingReport {
    pub final_state: TrainingState,
    pub epochs_run: usize,
    pub steps: u64,
    /// Loss on the training windows before the first update
    pub initial_loss: f64,
    pub train_losses: Vec<f64>,
    pub val_losses: Vec<f64>,
    pub learning_rates: Vec<f64>,
    pub best_val_loss: Option<f64>,
    pub best_epoch: Option<usize>,
    pub checkpoints_written: usize,
}

impl TrainingReport {
    pub fn final_train_loss(&self) -> Option<f64> {
        self.train_losses.last().copied()
    }
}

/// The model after the last epoch, with the run summary.
///
/// The best model by validation loss is in the store's `Best` slot.
#[derive(Debug)]
pub struct TrainedModel<B: AutodiffBackend> {
    pub model: GruForecaster<B>,
    pub report: TrainingReport,
}

/// Multiplies the learning rate by `factor` once the monitored loss has
/// failed to improve for more than `patience` epochs.
#[derive(Debug, Clone)]
pub struct PlateauScheduler {
    lr: f64,
    factor: f64,
    patience: usize,
    min_lr: f64,
    best: f64,
    bad_epochs: usize,
}

impl PlateauScheduler {
    pub fn new(lr: f64, factor: f64, patience: usize, min_lr: f64) -> Self {
        Self {
            lr,
            factor,
            patience,
            min_lr,
            best: f64::INFINITY,
            bad_epochs: 0,
        }
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    /// Record one epoch's loss and return the learning rate for the next one
    pub fn step(&mut self, loss: f64) -> f64 {
        if loss < self.best {
            self.best = loss;
            self.bad_epochs = 0;
        } else {
            self.bad_epochs += 1;
            if self.bad_epochs > self.patience {
                let reduced = (self.lr * self.factor).max(self.min_lr);
                if reduced < self.lr {
                    info!("Reducing learning rate to {:.3e}", reduced);
                }
                self.lr = reduced;
                self.bad_epochs = 0;
            }
        }
        self.lr
    }
}

/// Mean squared error over every window, step and feature, without gradients
pub fn evaluate_loss<B: Backend>(
    model: &GruForecaster<B>,
    windows: &Windows,
    batch_size: usize,
    device: &B::Device,
) -> Result<f64> {
    if windows.num_features() != model.input_size() {
        return Err(ForecastError::shape(
            "evaluation windows",
            model.input_size(),
            windows.num_features(),
        ));
    }
    let target_len = windows.spec().target_len;
    let indices: Vec<usize> = (0..windows.len()).collect();

    let mut weighted_sum = 0.0;
    for chunk in indices.chunks(batch_size.max(1)) {
        let (inputs, targets) = batch_to_tensors::<B>(windows, chunk, device);
        let predictions = model.rollout(inputs, target_len)?;
        let loss = model.mse_loss(predictions, targets).into_scalar().to_f64();
        weighted_sum += loss * chunk.len() as f64;
    }
    Ok(weighted_sum / windows.len().max(1) as f64)
}

/// # Trainer
///
/// Minimizes the multi-step MSE of [`GruForecaster::rollout`] over the
/// training windows with Adam:
///
/// 1. Shuffle window order (seeded) and split into mini-batches
/// 2. Roll out `target_len` steps per batch and back-propagate through the
///    whole rollout
/// 3. After each epoch evaluate on the validation windows and adapt the
///    learning rate on plateaus. An improved validation loss writes both
///    checkpoint slots; a due interval writes only `Latest`, so `Best`
///    always holds the best weights seen
/// 4. Stop after `epochs` or once `patience` epochs pass without improvement
///
/// A NaN or infinite loss aborts the run immediately with
/// [`ForecastError::Divergence`]; the optimizer never sees such a batch.
pub struct Trainer<B: AutodiffBackend> {
    config: TrainingConfig,
    device: B::Device,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn new(config: TrainingConfig, device: B::Device) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, device })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Train `model` on `train`, monitoring `valid` when given (the training
    /// loss is monitored otherwise).
    pub fn run(
        &self,
        mut model: GruForecaster<B>,
        train: &Windows,
        valid: Option<&Windows>,
        profile: &DataProfile,
        context: &mut TrainingContext,
        store: &mut dyn CheckpointStore,
    ) -> Result<TrainedModel<B>> {
        let config = &self.config;
        if train.num_features() != model.input_size() {
            return Err(ForecastError::shape(
                "training windows",
                model.input_size(),
                train.num_features(),
            ));
        }
        if profile.num_features() != model.input_size() {
            return Err(ForecastError::shape(
                "data profile",
                model.input_size(),
                profile.num_features(),
            ));
        }
        let target_len = train.spec().target_len;

        let mut optimizer = AdamConfig::new()
            .with_grad_clipping(config.grad_clip_norm.map(GradientClippingConfig::Norm))
            .init::<B, GruForecaster<B>>();
        let mut scheduler = PlateauScheduler::new(
            context.learning_rate.unwrap_or(config.learning_rate),
            config.lr_decay,
            config.lr_patience,
            config.min_learning_rate,
        );
        let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(context.epoch as u64));

        let initial_loss = evaluate_loss(&model.valid(), train, config.batch_size, &self.device)?;
        info!(
            "Training on {} windows ({} validation), {} features, initial loss {:.6}",
            train.len(),
            valid.map_or(0, |v| v.len()),
            train.num_features(),
            initial_loss
        );

        let mut order: Vec<usize> = (0..train.len()).collect();
        let first_epoch = context.epoch + 1;

        for epoch in first_epoch..=config.epochs {
            context.transition(TrainingState::Training { epoch });
            let started = Instant::now();
            let lr = scheduler.lr();

            if config.shuffle {
                order.shuffle(&mut rng);
            }

            let mut loss_sum = 0.0;
            for (batch, chunk) in order.chunks(config.batch_size).enumerate() {
                let (inputs, targets) = batch_to_tensors::<B>(train, chunk, &self.device);
                let predictions = model.rollout(inputs, target_len)?;
                let loss = model.mse_loss(predictions, targets);
                let loss_value = loss.clone().into_scalar().to_f64();

                if !loss_value.is_finite() {
                    warn!("Non-finite loss at epoch {}, batch {}", epoch, batch + 1);
                    return Err(ForecastError::Divergence {
                        epoch,
                        batch: batch + 1,
                        loss: loss_value,
                    });
                }

                let grads = GradientsParams::from_grads(loss.backward(), &model);
                model = optimizer.step(lr, model, grads);
                context.step += 1;
                loss_sum += loss_value * chunk.len() as f64;
                debug!(
                    "epoch {} batch {} loss {:.6} (step {})",
                    epoch,
                    batch + 1,
                    loss_value,
                    context.step
                );
            }
            let train_loss = loss_sum / train.len() as f64;

            let val_loss = match valid {
                Some(windows) if !windows.is_empty() => Some(evaluate_loss(
                    &model.valid(),
                    windows,
                    config.batch_size,
                    &self.device,
                )?),
                _ => None,
            };
            if let Some(loss) = val_loss.filter(|l| !l.is_finite()) {
                // batch 0: the validation pass
                return Err(ForecastError::Divergence {
                    epoch,
                    batch: 0,
                    loss,
                });
            }

            let monitored = val_loss.unwrap_or(train_loss);
            let improved = monitored < context.best_loss;
            let significant = monitored < context.best_loss - config.min_delta;
            if improved {
                context.best_loss = monitored;
                context.best_epoch = Some(epoch);
            }
            if significant {
                context.epochs_without_improvement = 0;
            } else {
                context.epochs_without_improvement += 1;
            }
            context.epoch = epoch;

            let next_lr = scheduler.step(train_loss);
            context.learning_rate = Some(next_lr);

            let interval_due =
                config.checkpoint_interval > 0 && epoch % config.checkpoint_interval == 0;
            let checkpointed = improved || interval_due;
            if checkpointed {
                let checkpoint = Checkpoint {
                    model: model.valid(),
                    data: profile.clone(),
                    step: context.step,
                    epoch,
                    val_loss: Some(monitored),
                    best_val_loss: Some(context.best_loss),
                    best_epoch: context.best_epoch,
                    learning_rate: context.learning_rate,
                };
                let blob = checkpoint.to_blob()?;
                if improved {
                    store.write(CheckpointSlot::Best, &blob)?;
                    info!(
                        "Monitored loss improved to {:.6}, saved checkpoint to {}",
                        monitored,
                        store.location()
                    );
                }
                store.write(CheckpointSlot::Latest, &blob)?;
                context.checkpoints_written += 1;
                context.transition(TrainingState::Checkpointed { epoch });
            }

            let duration_secs = started.elapsed().as_secs_f64();
            context.history.push(EpochRecord {
                epoch,
                loss: train_loss,
                val_loss,
                lr,
                duration_secs,
                checkpointed,
            });

            match val_loss {
                Some(v) => info!(
                    "Epoch {}/{} - loss: {:.6} - val_loss: {:.6} - lr: {:.3e} - {:.1}s",
                    epoch, config.epochs, train_loss, v, lr, duration_secs
                ),
                None => info!(
                    "Epoch {}/{} - loss: {:.6} - lr: {:.3e} - {:.1}s",
                    epoch, config.epochs, train_loss, lr, duration_secs
                ),
            }

            if config.patience > 0 && context.epochs_without_improvement >= config.patience {
                info!(
                    "Early stopping at epoch {} (best monitored loss {:.6} at epoch {:?})",
                    epoch, context.best_loss, context.best_epoch
                );
                context.transition(TrainingState::Converged { epoch });
                break;
            }
        }

        if !context.state.is_terminal() {
            context.transition(TrainingState::MaxEpochsReached {
                epoch: context.epoch,
            });
        }

        let report = TrainingReport {
            final_state: context.state,
            epochs_run: context.epoch.saturating_sub(first_epoch - 1),
            steps: context.step,
            initial_loss,
            train_losses: context.history.iter().map(|r| r.loss).collect(),
            val_losses: context.history.iter().filter_map(|r| r.val_loss).collect(),
            learning_rates: context.history.iter().map(|r| r.lr).collect(),
            best_val_loss: context.best_loss.is_finite().then_some(context.best_loss),
            best_epoch: context.best_epoch,
            checkpoints_written: context.checkpoints_written,
        };
        info!(
            "Training finished in state {:?} after {} optimizer steps",
            report.final_state, report.steps
        );

        Ok(TrainedModel { model, report })
    }
}
