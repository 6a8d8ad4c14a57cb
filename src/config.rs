// External imports
use anyhow::{Context, Result as AnyResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

// Internal imports
use crate::constants::{
    CHECKPOINT_NAME, CHECKPOINT_PATH, DATA_PATH, HIDDEN_SIZE, HISTORY_FILE_NAME, HORIZON,
    INPUT_LEN, NUM_LAYERS, STRIDE, TARGET_LEN, TRAIN_SPLIT_RATIO, VALIDATION_SPLIT_RATIO,
};
use crate::error::{ForecastError, Result};
use crate::gru::step_1_sequence_dataset::WindowSpec;
use crate::gru::step_3_gru_model_arch::{ForecastHead, GruForecasterConfig};
use crate::gru::step_4_train_model::TrainingConfig;

/// Everything a train or predict run needs, loadable from JSON.
///
/// Missing keys fall back to the defaults in [`crate::constants`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastConfig {
    pub data_path: PathBuf,
    /// Column excluded from the features
    pub time_column: Option<String>,
    /// Feature columns in model order; all numeric columns when absent
    pub features: Option<Vec<String>>,
    pub window: WindowSpec,
    /// Steps rolled out per forecast in predict mode
    pub horizon: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub head: ForecastHead,
    pub training: TrainingConfig,
    pub train_fraction: f64,
    pub valid_fraction: f64,
    /// Window starts (in the evaluation series) to forecast from
    pub forecast_starts: Vec<usize>,
    pub checkpoint_dir: PathBuf,
    pub checkpoint_name: String,
    /// Directory for exported forecasts; nothing is exported when absent
    pub export_path: Option<PathBuf>,
    /// Overwrite an existing checkpoint
    pub force: bool,
    /// Continue training from an existing checkpoint
    pub resume: bool,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from(DATA_PATH),
            time_column: None,
            features: None,
            window: WindowSpec {
                input_len: INPUT_LEN,
                target_len: TARGET_LEN,
                stride: STRIDE,
            },
            horizon: HORIZON,
            hidden_size: HIDDEN_SIZE,
            num_layers: NUM_LAYERS,
            head: ForecastHead::default(),
            training: TrainingConfig::default(),
            train_fraction: TRAIN_SPLIT_RATIO,
            valid_fraction: VALIDATION_SPLIT_RATIO,
            forecast_starts: vec![0],
            checkpoint_dir: PathBuf::from(CHECKPOINT_PATH),
            checkpoint_name: CHECKPOINT_NAME.to_string(),
            export_path: None,
            force: false,
            resume: false,
        }
    }
}

impl ForecastConfig {
    /// Load a configuration from a JSON file
    pub fn from_json_file(path: &Path) -> AnyResult<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&json)
            .map_err(ForecastError::from)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.window.validate()?;
        self.training.validate()?;
        if self.horizon == 0 {
            return Err(ForecastError::Config("horizon must be at least 1".into()));
        }
        if self.hidden_size == 0 || self.num_layers == 0 {
            return Err(ForecastError::Config(format!(
                "hidden_size ({}) and num_layers ({}) must be at least 1",
                self.hidden_size, self.num_layers
            )));
        }
        if !(self.train_fraction > 0.0 && self.train_fraction <= 1.0)
            || !(0.0..1.0).contains(&self.valid_fraction)
            || self.train_fraction + self.valid_fraction > 1.0 + 1e-9
        {
            return Err(ForecastError::Config(format!(
                "train_fraction ({}) and valid_fraction ({}) must be fractions summing to at most 1",
                self.train_fraction, self.valid_fraction
            )));
        }
        if self.forecast_starts.is_empty() {
            return Err(ForecastError::Config("forecast_starts must not be empty".into()));
        }
        if self.force && self.resume {
            return Err(ForecastError::Config(
                "force and resume cannot be combined".into(),
            ));
        }
        if self.checkpoint_name.is_empty() {
            return Err(ForecastError::Config("checkpoint_name must not be empty".into()));
        }
        Ok(())
    }

    /// Model architecture for `input_size` features
    pub fn model_config(&self, input_size: usize) -> GruForecasterConfig {
        GruForecasterConfig::new(input_size)
            .with_hidden_size(self.hidden_size)
            .with_num_layers(self.num_layers)
            .with_head(self.head)
    }

    pub fn history_path(&self) -> PathBuf {
        self.checkpoint_dir.join(HISTORY_FILE_NAME)
    }
}
