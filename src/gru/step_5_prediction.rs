// External imports
use burn::tensor::backend::Backend;
use log::{debug, info};
use ndarray::{s, Array2, ArrayView1, ArrayView2, Axis};
use std::borrow::Cow;

// Internal imports
use super::step_1_sequence_dataset::{array_to_tensor, tensor_to_array, RawSeries};
use super::step_3_gru_model_arch::{GruForecaster, GruForecasterConfig};
use super::step_6_model_serialization::{
    Checkpoint, CheckpointSlot, CheckpointStore, DataProfile,
};
use crate::error::{ForecastError, Result};

/// A forecast in physical units, one row per future time step
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastTrajectory {
    /// Index in the source series of the first forecast step
    pub start: usize,
    pub feature_names: Vec<String>,
    pub values: Array2<f64>,
}

impl ForecastTrajectory {
    pub fn horizon(&self) -> usize {
        self.values.nrows()
    }

    pub fn feature(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        let index = self.feature_names.iter().position(|f| f == name)?;
        Some(self.values.column(index))
    }
}

/// A forecast next to the observations it tried to predict.
///
/// `truth` is `None` when the forecast runs past the end of the series.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastComparison {
    pub trajectory: ForecastTrajectory,
    pub truth: Option<Array2<f64>>,
}

impl ForecastComparison {
    /// Per-feature mean squared error in physical units
    pub fn mse(&self) -> Option<Vec<f64>> {
        let truth = self.truth.as_ref()?;
        let diff = &self.trajectory.values - truth;
        let squared = diff.mapv(|d| d * d);
        squared.mean_axis(Axis(0)).map(|m| m.to_vec())
    }

    pub fn rmse(&self) -> Option<Vec<f64>> {
        self.mse().map(|m| m.into_iter().map(f64::sqrt).collect())
    }
}

/// Destination for finished forecasts
pub trait ForecastSink {
    fn write(&mut self, forecast: &ForecastComparison) -> Result<()>;
}

/// Collects forecasts in memory
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    pub forecasts: Vec<ForecastComparison>,
}

impl ForecastSink for MemorySink {
    fn write(&mut self, forecast: &ForecastComparison) -> Result<()> {
        self.forecasts.push(forecast.clone());
        Ok(())
    }
}

/// # Predictor
///
/// Wraps a trained [`GruForecaster`] together with the [`DataProfile`] it was
/// trained against. Raw observations go in and physical-unit trajectories
/// come out; normalization uses the frozen training statistics only.
///
/// Prediction never mutates the model: the same window always gives the
/// same trajectory, whatever was predicted before.
#[derive(Debug)]
pub struct Predictor<B: Backend> {
    model: GruForecaster<B>,
    profile: DataProfile,
    device: B::Device,
}

impl<B: Backend> Predictor<B> {
    pub fn new(model: GruForecaster<B>, profile: DataProfile, device: B::Device) -> Result<Self> {
        if profile.num_features() != model.input_size() {
            return Err(ForecastError::shape(
                "data profile",
                model.input_size(),
                profile.num_features(),
            ));
        }
        if profile.stats.num_features() != model.input_size() {
            return Err(ForecastError::shape(
                "normalization stats",
                model.input_size(),
                profile.stats.num_features(),
            ));
        }
        Ok(Self {
            model,
            profile,
            device,
        })
    }

    /// Restore the best checkpoint from `store`
    pub fn from_checkpoint(store: &dyn CheckpointStore, device: B::Device) -> Result<Self> {
        let checkpoint = Checkpoint::<B>::from_blob(store.read(CheckpointSlot::Best)?, &device)?;
        info!(
            "Restored model from {} (step {}, epoch {})",
            store.location(),
            checkpoint.step,
            checkpoint.epoch
        );
        Self::new(checkpoint.model, checkpoint.data, device)
    }

    /// Restore the best checkpoint, requiring a specific architecture.
    ///
    /// The architecture is compared before any weights are decoded.
    pub fn from_checkpoint_expecting(
        store: &dyn CheckpointStore,
        expected: &GruForecasterConfig,
        device: B::Device,
    ) -> Result<Self> {
        store.metadata(CheckpointSlot::Best)?.ensure_compatible(expected)?;
        let checkpoint =
            Checkpoint::<B>::from_blob_expecting(store.read(CheckpointSlot::Best)?, expected, &device)?;
        info!(
            "Restored model from {} (step {}, epoch {})",
            store.location(),
            checkpoint.step,
            checkpoint.epoch
        );
        Self::new(checkpoint.model, checkpoint.data, device)
    }

    pub fn model(&self) -> &GruForecaster<B> {
        &self.model
    }

    pub fn profile(&self) -> &DataProfile {
        &self.profile
    }

    /// Forecast `horizon` steps after a raw `[steps, features]` window
    pub fn predict_window(&self, window: ArrayView2<'_, f64>, horizon: usize) -> Result<Array2<f64>> {
        if horizon == 0 {
            return Err(ForecastError::Config("horizon must be at least 1".into()));
        }
        let n_features = self.model.input_size();
        if window.ncols() != n_features {
            return Err(ForecastError::shape("prediction window", n_features, window.ncols()));
        }
        if window.nrows() == 0 {
            return Err(ForecastError::InsufficientData {
                required: 1,
                available: 0,
            });
        }

        let normalized = self.profile.stats.normalize(window)?;
        let input = array_to_tensor::<B>(normalized.view(), &self.device);
        let predictions = self
            .model
            .rollout(input, horizon)?
            .reshape([horizon, n_features]);
        let predictions = tensor_to_array(predictions)?;
        debug!("Rolled out {} steps from a {}-step window", horizon, window.nrows());

        self.profile.stats.denormalize(predictions.view())
    }

    /// Forecast `horizon` steps past the end of `raw`, conditioned on its
    /// last `input_len` observations
    pub fn forecast(&self, raw: &RawSeries, horizon: usize) -> Result<ForecastTrajectory> {
        let input_len = self.profile.window.input_len;
        if raw.len() < input_len {
            return Err(ForecastError::InsufficientData {
                required: input_len,
                available: raw.len(),
            });
        }
        self.forecast_from(raw, raw.len() - input_len, horizon)
    }

    /// Forecast `horizon` steps after the window `raw[start..start + input_len]`
    pub fn forecast_from(
        &self,
        raw: &RawSeries,
        start: usize,
        horizon: usize,
    ) -> Result<ForecastTrajectory> {
        let raw = self.align(raw)?;
        let input_len = self.profile.window.input_len;
        let end = start + input_len;
        if end > raw.len() {
            return Err(ForecastError::InsufficientData {
                required: end,
                available: raw.len(),
            });
        }
        let values = self.predict_window(raw.values().slice(s![start..end, ..]), horizon)?;
        Ok(ForecastTrajectory {
            start: end,
            feature_names: self.profile.feature_names.clone(),
            values,
        })
    }

    /// Forecast from `start` and attach the observed continuation, when the
    /// series is long enough to hold all `horizon` steps
    pub fn compare(&self, raw: &RawSeries, start: usize, horizon: usize) -> Result<ForecastComparison> {
        let trajectory = self.forecast_from(raw, start, horizon)?;
        let raw = self.align(raw)?;
        let truth_end = trajectory.start + horizon;
        let truth = (truth_end <= raw.len())
            .then(|| raw.values().slice(s![trajectory.start..truth_end, ..]).to_owned());
        let comparison = ForecastComparison { trajectory, truth };
        if let Some(rmse) = comparison.rmse() {
            info!("Forecast RMSE per feature: {:?}", rmse);
        }
        Ok(comparison)
    }

    /// Put the columns of `raw` into training order
    fn align<'a>(&self, raw: &'a RawSeries) -> Result<Cow<'a, RawSeries>> {
        let expected = &self.profile.feature_names;
        if raw.feature_names() == expected.as_slice() {
            return Ok(Cow::Borrowed(raw));
        }
        if expected.iter().all(|name| raw.feature_names().contains(name)) {
            return Ok(Cow::Owned(raw.select(expected)?));
        }
        if raw.num_features() != expected.len() {
            return Err(ForecastError::shape(
                "series features",
                expected.len(),
                raw.num_features(),
            ));
        }
        Err(ForecastError::Data(format!(
            "series columns {:?} do not match the trained features {:?}",
            raw.feature_names(),
            expected
        )))
    }
}
