//! Train and predict entry points.
//!
//! [`train`] and [`predict`] wire the file-backed collaborators together;
//! [`train_with`] and [`predict_with`] take them as trait objects.

// External imports
use anyhow::{Context, Result};
use burn::backend::Autodiff;
use burn::tensor::backend::Backend;
use burn_ndarray::{NdArray, NdArrayDevice};
use log::{info, warn};
use std::time::Instant;

// Internal imports
use crate::config::ForecastConfig;
use crate::error::ForecastError;
use crate::gru::step_1_sequence_dataset::{fit_normalization, make_windows, RawSeries};
use crate::gru::step_4_train_model::{Trainer, TrainingContext, TrainingReport};
use crate::gru::step_5_prediction::{ForecastComparison, ForecastSink, MemorySink, Predictor};
use crate::gru::step_6_model_serialization::{
    Checkpoint, CheckpointSlot, CheckpointStore, DataProfile, FileCheckpointStore,
};
use crate::util::file_utils::{CsvForecastExporter, FileSeriesSource, SeriesSource};
use crate::util::model_logger::TrainingHistory;

pub type InferenceBackend = NdArray<f32>;
pub type TrainBackend = Autodiff<InferenceBackend>;

/// Result of a successful training run
#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub report: TrainingReport,
    pub profile: DataProfile,
}

fn file_source(config: &ForecastConfig) -> FileSeriesSource {
    FileSeriesSource::new(&config.data_path)
        .with_time_column(config.time_column.clone())
        .with_features(config.features.clone())
}

fn file_store(config: &ForecastConfig) -> FileCheckpointStore {
    FileCheckpointStore::new(&config.checkpoint_dir, &config.checkpoint_name)
}

/// Train from the configured data file into the configured checkpoint
/// directory, then write the epoch history next to the checkpoint.
///
/// The history is written even when training fails.
pub fn train(config: &ForecastConfig) -> Result<TrainOutcome> {
    let source = file_source(config);
    let mut store = file_store(config);
    let mut context = TrainingContext::new();
    let started = Instant::now();

    let result = train_with(config, &source, &mut store, &mut context);

    let mut history =
        TrainingHistory::new(&source.describe(), config.window, config.training.clone());
    history.record(&context);
    history.set_training_time(started.elapsed().as_secs_f64());
    match &result {
        Ok(outcome) => {
            history.set_initial_loss(outcome.report.initial_loss);
            history.set_model(config.model_config(outcome.profile.num_features()));
            history.window = outcome.profile.window;
        }
        Err(e) => history.set_error(&format!("{:#}", e)),
    }
    if config.resume {
        let resumed_epoch = context
            .history
            .first()
            .map_or(context.epoch, |r| r.epoch.saturating_sub(1));
        if let Ok(previous) = TrainingHistory::load(&config.history_path()) {
            history.continue_from(previous, resumed_epoch);
        }
        history.add_note(&format!("resumed after epoch {}", resumed_epoch));
    }
    if !context.history.is_empty() || result.is_ok() {
        let path = history.save(&config.history_path())?;
        info!("Wrote training history to {}", path.display());
    }

    result
}

/// Train with injected collaborators.
///
/// Refuses to replace an existing checkpoint unless `force` is set; with
/// `resume` it continues from the `Latest` checkpoint using its frozen
/// normalization statistics, window geometry, step counter and learning rate.
pub fn train_with(
    config: &ForecastConfig,
    source: &dyn SeriesSource,
    store: &mut dyn CheckpointStore,
    context: &mut TrainingContext,
) -> Result<TrainOutcome> {
    config.validate()?;

    if !store.is_empty() && !config.force && !config.resume {
        return Err(ForecastError::Config(format!(
            "a checkpoint already exists at {}; use force to overwrite it or resume to continue",
            store.location()
        ))
        .into());
    }

    let raw = source
        .load()
        .with_context(|| format!("Failed to load series from {}", source.describe()))?;
    info!(
        "Loaded {} time steps of {} features from {}",
        raw.len(),
        raw.num_features(),
        source.describe()
    );

    let device = NdArrayDevice::Cpu;
    TrainBackend::seed(config.training.seed);

    let (model, profile) = if config.resume && store.exists(CheckpointSlot::Latest) {
        let metadata = store.metadata(CheckpointSlot::Latest)?;
        let expected = config.model_config(metadata.data.num_features());
        metadata.ensure_compatible(&expected)?;
        let checkpoint = Checkpoint::<TrainBackend>::from_blob_expecting(
            store.read(CheckpointSlot::Latest)?,
            &expected,
            &device,
        )?;
        if checkpoint.data.window != config.window {
            warn!(
                "Resuming with the checkpoint's window {:?} instead of {:?}",
                checkpoint.data.window, config.window
            );
        }
        info!(
            "Resuming from step {} (epoch {})",
            checkpoint.step, checkpoint.epoch
        );
        *context = TrainingContext::from_checkpoint(&checkpoint);
        (checkpoint.model, checkpoint.data)
    } else {
        let (train_raw, _, _) = raw.split(config.train_fraction, config.valid_fraction)?;
        let stats = fit_normalization(&train_raw, &config.window)?;
        let profile = DataProfile {
            feature_names: raw.feature_names().to_vec(),
            stats,
            window: config.window,
        };
        let model = config
            .model_config(raw.num_features())
            .init::<TrainBackend>(&device)?;
        (model, profile)
    };

    let raw = align_features(&raw, &profile)?;
    let (train_raw, valid_raw, _) = raw.split(config.train_fraction, config.valid_fraction)?;
    let train_windows = make_windows(&train_raw, &profile.stats, &profile.window)?;
    let valid_windows = if profile.window.count(valid_raw.len()) > 0 {
        Some(make_windows(&valid_raw, &profile.stats, &profile.window)?)
    } else {
        warn!(
            "Validation split has {} steps, fewer than one window of {}; monitoring training loss",
            valid_raw.len(),
            profile.window.span()
        );
        None
    };

    let trainer = Trainer::<TrainBackend>::new(config.training.clone(), device)?;
    let trained = trainer.run(
        model,
        &train_windows,
        valid_windows.as_ref(),
        &profile,
        context,
        store,
    )?;

    Ok(TrainOutcome {
        report: trained.report,
        profile,
    })
}

/// Forecast from the configured checkpoint, exporting to `export_path` when set
pub fn predict(config: &ForecastConfig) -> Result<Vec<ForecastComparison>> {
    let source = file_source(config);
    let store = file_store(config);
    match &config.export_path {
        Some(dir) => {
            let mut exporter = CsvForecastExporter::new(dir);
            predict_with(config, &source, &store, &mut exporter)
        }
        None => predict_with(config, &source, &store, &mut MemorySink::default()),
    }
}

/// Forecast `horizon` steps from every configured window start of the
/// evaluation series and hand each comparison to `sink`
pub fn predict_with(
    config: &ForecastConfig,
    source: &dyn SeriesSource,
    store: &dyn CheckpointStore,
    sink: &mut dyn ForecastSink,
) -> Result<Vec<ForecastComparison>> {
    config.validate()?;
    if !store.exists(CheckpointSlot::Best) {
        return Err(ForecastError::CheckpointNotFound(store.location().into()))
            .context("Could not find required checkpoints");
    }

    let metadata = store.metadata(CheckpointSlot::Best)?;
    let expected = config.model_config(metadata.data.num_features());
    let predictor =
        Predictor::<InferenceBackend>::from_checkpoint_expecting(store, &expected, NdArrayDevice::Cpu)?;
    info!(
        "Predicting with the epoch {} checkpoint (monitored loss {:?})",
        metadata.epoch, metadata.val_loss
    );

    let raw = source
        .load()
        .with_context(|| format!("Failed to load series from {}", source.describe()))?;

    let mut comparisons = Vec::with_capacity(config.forecast_starts.len());
    for &start in &config.forecast_starts {
        let comparison = predictor.compare(&raw, start, config.horizon)?;
        if comparison.truth.is_none() {
            warn!(
                "Series ends before step {}; forecast from {} has no ground truth",
                comparison.trajectory.start + config.horizon,
                start
            );
        }
        sink.write(&comparison)?;
        comparisons.push(comparison);
    }
    info!("Produced {} forecasts of {} steps", comparisons.len(), config.horizon);

    Ok(comparisons)
}

/// Reorder the columns of `raw` to the checkpoint's feature order
fn align_features(raw: &RawSeries, profile: &DataProfile) -> Result<RawSeries> {
    if raw.feature_names() == profile.feature_names.as_slice() {
        return Ok(raw.clone());
    }
    if raw.num_features() != profile.num_features()
        && !profile
            .feature_names
            .iter()
            .all(|f| raw.feature_names().contains(f))
    {
        return Err(ForecastError::shape(
            "series features",
            profile.num_features(),
            raw.num_features(),
        )
        .into());
    }
    Ok(raw.select(&profile.feature_names)?)
}
