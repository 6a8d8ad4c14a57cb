// External imports
use burn::backend::Autodiff;
use burn::module::AutodiffModule;
use burn::tensor::backend::Backend;
use burn_ndarray::{NdArray, NdArrayDevice};
use ndarray::Array2;

// Internal imports
use crate::error::ForecastError;
use crate::gru::step_1_sequence_dataset::{
    fit_normalization, make_windows, NormalizationStats, RawSeries, WindowSpec, Windows,
};
use crate::gru::step_3_gru_model_arch::{GruForecaster, GruForecasterConfig};
use crate::gru::step_4_train_model::{
    evaluate_loss, Trainer, TrainingConfig, TrainingContext, TrainingState,
};
use crate::gru::step_6_model_serialization::{
    Checkpoint, CheckpointSlot, CheckpointStore, DataProfile, MemoryCheckpointStore,
};
use crate::util::test_utils::{sine_series, univariate_sine};

type TrainBackend = Autodiff<NdArray<f32>>;
type EvalBackend = NdArray<f32>;

fn profile_for(raw: &RawSeries, stats: &NormalizationStats, window: WindowSpec) -> DataProfile {
    DataProfile {
        feature_names: raw.feature_names().to_vec(),
        stats: stats.clone(),
        window,
    }
}

fn small_model(input_size: usize, hidden_size: usize) -> GruForecaster<TrainBackend> {
    TrainBackend::seed(7);
    GruForecasterConfig::new(input_size)
        .with_hidden_size(hidden_size)
        .init::<TrainBackend>(&NdArrayDevice::Cpu)
        .unwrap()
}

fn quick_config(epochs: usize) -> TrainingConfig {
    TrainingConfig {
        epochs,
        batch_size: 8,
        learning_rate: 5e-3,
        checkpoint_interval: 0,
        ..TrainingConfig::default()
    }
}

/// Train and validation windows over a short two-feature series
fn small_dataset(window: WindowSpec) -> (Windows, Windows, DataProfile) {
    let raw = sine_series(120, 24.0, 0.05, 3);
    let (train, valid, _) = raw.split(0.75, 0.25).unwrap();
    let stats = fit_normalization(&train, &window).unwrap();
    let train_windows = make_windows(&train, &stats, &window).unwrap();
    let valid_windows = make_windows(&valid, &stats, &window).unwrap();
    let profile = profile_for(&raw, &stats, window);
    (train_windows, valid_windows, profile)
}

#[test]
fn test_infinite_loss_is_divergence() {
    // squared errors of this size overflow f32
    let values = Array2::from_shape_fn((40, 2), |(t, f)| 1.0e30 * (1.0 + (t + f) as f64));
    let raw = RawSeries::new(vec!["q".into(), "theta".into()], values).unwrap();
    let window = WindowSpec::new(5, 2, 1).unwrap();
    let stats = NormalizationStats::identity(2);
    let windows = make_windows(&raw, &stats, &window).unwrap();

    let trainer = Trainer::<TrainBackend>::new(quick_config(3), NdArrayDevice::Cpu).unwrap();
    let mut context = TrainingContext::new();
    let mut store = MemoryCheckpointStore::new();
    let result = trainer.run(
        small_model(2, 4),
        &windows,
        None,
        &profile_for(&raw, &stats, window),
        &mut context,
        &mut store,
    );

    match result {
        Err(ForecastError::Divergence { epoch, batch, loss }) => {
            assert_eq!(epoch, 1);
            assert_eq!(batch, 1);
            assert!(!loss.is_finite());
        }
        other => panic!("expected divergence, got {:?}", other.map(|t| t.report)),
    }
    assert_eq!(context.step, 0, "no update may follow a non-finite loss");
    assert!(store.is_empty());
    assert!(!context.state.is_terminal());
}

#[test]
fn test_one_epoch_lowers_loss_on_sine() {
    let raw = univariate_sine(1000, 40.0);
    let window = WindowSpec::new(50, 1, 1).unwrap();
    let stats = fit_normalization(&raw, &window).unwrap();
    let windows = make_windows(&raw, &stats, &window).unwrap();

    let config = TrainingConfig {
        epochs: 1,
        batch_size: 32,
        learning_rate: 5e-3,
        ..TrainingConfig::default()
    };
    let trainer = Trainer::<TrainBackend>::new(config, NdArrayDevice::Cpu).unwrap();
    let mut context = TrainingContext::new();
    let mut store = MemoryCheckpointStore::new();
    let trained = trainer
        .run(
            small_model(1, 16),
            &windows,
            None,
            &profile_for(&raw, &stats, window),
            &mut context,
            &mut store,
        )
        .unwrap();

    let after = evaluate_loss(&trained.model.valid(), &windows, 64, &NdArrayDevice::Cpu).unwrap();
    assert!(
        after < trained.report.initial_loss,
        "loss {} did not drop below the initial {}",
        after,
        trained.report.initial_loss
    );
    assert_eq!(trained.report.steps, windows.len().div_ceil(32) as u64);
    assert_eq!(trained.report.final_state, TrainingState::MaxEpochsReached { epoch: 1 });
    // first epoch always improves on an infinite best
    assert_eq!(store.writes(CheckpointSlot::Best), 1);
    assert_eq!(store.writes(CheckpointSlot::Latest), 1);
}

#[test]
fn test_runs_to_max_epochs_with_interval_checkpoints() {
    let window = WindowSpec::new(10, 2, 2).unwrap();
    let (train, valid, profile) = small_dataset(window);

    let config = TrainingConfig {
        patience: 0,
        checkpoint_interval: 2,
        ..quick_config(4)
    };
    let trainer = Trainer::<TrainBackend>::new(config, NdArrayDevice::Cpu).unwrap();
    let mut context = TrainingContext::new();
    let mut store = MemoryCheckpointStore::new();
    let trained = trainer
        .run(small_model(2, 8), &train, Some(&valid), &profile, &mut context, &mut store)
        .unwrap();
    let report = trained.report;

    assert_eq!(report.final_state, TrainingState::MaxEpochsReached { epoch: 4 });
    assert_eq!(report.epochs_run, 4);
    assert_eq!(report.train_losses.len(), 4);
    assert_eq!(report.val_losses.len(), 4);
    assert_eq!(report.learning_rates.len(), 4);

    let checkpointed: Vec<usize> = context
        .history
        .iter()
        .filter(|r| r.checkpointed)
        .map(|r| r.epoch)
        .collect();
    assert!(checkpointed.contains(&1));
    assert!(checkpointed.contains(&2));
    assert!(checkpointed.contains(&4));
    assert_eq!(report.checkpoints_written, checkpointed.len());
    assert_eq!(store.writes(CheckpointSlot::Latest), checkpointed.len());

    let best = report.best_val_loss.unwrap();
    let min_val = report.val_losses.iter().cloned().fold(f64::INFINITY, f64::min);
    assert_eq!(best, min_val);

    let latest = store.read(CheckpointSlot::Latest).unwrap();
    assert_eq!(latest.metadata.step, report.steps);
    assert_eq!(latest.metadata.epoch, 4);
    assert_eq!(latest.metadata.data, profile);
    assert_eq!(latest.metadata.val_loss, Some(report.val_losses[3]));
    assert_eq!(latest.metadata.learning_rate, context.learning_rate);

    let best = store.read(CheckpointSlot::Best).unwrap();
    assert_eq!(best.metadata.epoch, report.best_epoch.unwrap());
    assert_eq!(best.metadata.val_loss, report.best_val_loss);
}

#[test]
fn test_interval_checkpoint_keeps_best_weights() {
    let window = WindowSpec::new(10, 2, 2).unwrap();
    let (train, valid, profile) = small_dataset(window);

    let config = TrainingConfig {
        patience: 0,
        checkpoint_interval: 5,
        learning_rate: 0.2,
        ..quick_config(5)
    };
    let trainer = Trainer::<TrainBackend>::new(config, NdArrayDevice::Cpu).unwrap();
    let mut context = TrainingContext::new();
    let mut store = MemoryCheckpointStore::new();
    let trained = trainer
        .run(small_model(2, 8), &train, Some(&valid), &profile, &mut context, &mut store)
        .unwrap();
    let report = trained.report;
    let best_loss = report.best_val_loss.unwrap();
    let best_epoch = report.best_epoch.unwrap();

    let best = store.read(CheckpointSlot::Best).unwrap();
    assert_eq!(best.metadata.epoch, best_epoch);
    assert_eq!(best.metadata.val_loss, Some(best_loss));
    let restored = Checkpoint::<EvalBackend>::from_blob(best, &NdArrayDevice::Cpu).unwrap();
    let restored_loss = evaluate_loss(&restored.model, &valid, 8, &NdArrayDevice::Cpu).unwrap();
    assert!(
        (restored_loss - best_loss).abs() <= 1e-6 * best_loss.max(1.0),
        "best slot scores {} but the best validation loss was {}",
        restored_loss,
        best_loss
    );

    // the interval snapshot describes its own weights, not the best ones
    let latest = store.read(CheckpointSlot::Latest).unwrap();
    assert_eq!(latest.metadata.epoch, 5);
    assert_eq!(latest.metadata.val_loss, Some(report.val_losses[4]));
    assert_eq!(latest.metadata.best_val_loss, Some(best_loss));
    assert_eq!(latest.metadata.best_epoch, Some(best_epoch));
}

#[test]
fn test_non_improving_epoch_off_interval_writes_nothing() {
    let window = WindowSpec::new(10, 2, 2).unwrap();
    let (train, valid, profile) = small_dataset(window);

    let config = TrainingConfig {
        patience: 0,
        checkpoint_interval: 2,
        ..quick_config(3)
    };
    let trainer = Trainer::<TrainBackend>::new(config, NdArrayDevice::Cpu).unwrap();
    // a zero best loss can never be beaten
    let mut context = TrainingContext::resume_from(0, 0, Some(0.0));
    let mut store = MemoryCheckpointStore::new();
    trainer
        .run(small_model(2, 8), &train, Some(&valid), &profile, &mut context, &mut store)
        .unwrap();

    let flags: Vec<bool> = context.history.iter().map(|r| r.checkpointed).collect();
    assert_eq!(flags, vec![false, true, false]);
    assert_eq!(context.checkpoints_written, 1);
    assert_eq!(store.writes(CheckpointSlot::Best), 0);
    assert_eq!(store.writes(CheckpointSlot::Latest), 1);

    let latest = store.read(CheckpointSlot::Latest).unwrap();
    assert_eq!(latest.metadata.epoch, 2);
    assert_eq!(latest.metadata.val_loss, context.history[1].val_loss);
}

#[test]
fn test_plateau_converges_early() {
    let window = WindowSpec::new(10, 2, 2).unwrap();
    let (train, valid, profile) = small_dataset(window);

    // only the first epoch can count as a significant improvement
    let config = TrainingConfig {
        patience: 1,
        min_delta: 1.0e9,
        ..quick_config(10)
    };
    let trainer = Trainer::<TrainBackend>::new(config, NdArrayDevice::Cpu).unwrap();
    let mut context = TrainingContext::new();
    let mut store = MemoryCheckpointStore::new();
    let trained = trainer
        .run(small_model(2, 8), &train, Some(&valid), &profile, &mut context, &mut store)
        .unwrap();

    assert_eq!(trained.report.final_state, TrainingState::Converged { epoch: 2 });
    assert_eq!(trained.report.epochs_run, 2);
    assert_eq!(context.history.len(), 2);
}

#[test]
fn test_resumed_context_past_last_epoch_does_nothing() {
    let window = WindowSpec::new(10, 2, 2).unwrap();
    let (train, valid, profile) = small_dataset(window);

    let trainer = Trainer::<TrainBackend>::new(quick_config(3), NdArrayDevice::Cpu).unwrap();
    let mut context = TrainingContext::resume_from(42, 3, Some(0.5));
    let mut store = MemoryCheckpointStore::new();
    let trained = trainer
        .run(small_model(2, 8), &train, Some(&valid), &profile, &mut context, &mut store)
        .unwrap();

    assert_eq!(trained.report.final_state, TrainingState::MaxEpochsReached { epoch: 3 });
    assert_eq!(trained.report.epochs_run, 0);
    assert_eq!(trained.report.steps, 42);
    assert!(store.is_empty());
}

#[test]
fn test_window_width_must_match_model() {
    let window = WindowSpec::new(10, 2, 2).unwrap();
    let (train, _, profile) = small_dataset(window);

    let trainer = Trainer::<TrainBackend>::new(quick_config(1), NdArrayDevice::Cpu).unwrap();
    let result = trainer.run(
        small_model(3, 4),
        &train,
        None,
        &profile,
        &mut TrainingContext::new(),
        &mut MemoryCheckpointStore::new(),
    );
    assert!(matches!(result, Err(ForecastError::Shape { .. })));
}

#[test]
fn test_invalid_training_config_is_rejected() {
    let config = TrainingConfig {
        batch_size: 0,
        ..TrainingConfig::default()
    };
    assert!(matches!(
        Trainer::<TrainBackend>::new(config, NdArrayDevice::Cpu),
        Err(ForecastError::Config(_))
    ));
}
