use anyhow::{Context, Result};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::gru::step_1_sequence_dataset::WindowSpec;
use crate::gru::step_3_gru_model_arch::GruForecasterConfig;
use crate::gru::step_4_train_model::{EpochRecord, TrainingConfig, TrainingContext, TrainingState};

/// One training run as written to `history.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub timestamp: String,
    pub data_source: String,
    /// Known once the feature count has been read from the data
    pub model: Option<GruForecasterConfig>,
    pub window: WindowSpec,
    pub training: TrainingConfig,
    pub initial_loss: Option<f64>,
    pub epochs: Vec<EpochRecord>,
    pub final_state: Option<TrainingState>,
    pub best_val_loss: Option<f64>,
    pub training_time_seconds: Option<f64>,
    pub error: Option<String>,
    pub notes: String,
}

impl TrainingHistory {
    pub fn new(data_source: &str, window: WindowSpec, training: TrainingConfig) -> Self {
        Self {
            timestamp: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            data_source: data_source.to_string(),
            model: None,
            window,
            training,
            initial_loss: None,
            epochs: Vec::new(),
            final_state: None,
            best_val_loss: None,
            training_time_seconds: None,
            error: None,
            notes: String::new(),
        }
    }

    /// Copy the progress of a (possibly failed) run
    pub fn record(&mut self, context: &TrainingContext) {
        self.epochs = context.history.clone();
        self.final_state = Some(context.state);
        self.best_val_loss = context.best_loss.is_finite().then_some(context.best_loss);
    }

    /// Prepend the epochs of an earlier run up to `resumed_epoch`, the
    /// epoch the resumed checkpoint was taken after
    pub fn continue_from(&mut self, previous: TrainingHistory, resumed_epoch: usize) {
        let mut epochs: Vec<EpochRecord> = previous
            .epochs
            .into_iter()
            .filter(|r| r.epoch <= resumed_epoch)
            .collect();
        epochs.append(&mut self.epochs);
        self.epochs = epochs;
        self.initial_loss = previous.initial_loss.or(self.initial_loss);
        if !previous.notes.is_empty() {
            let notes = std::mem::take(&mut self.notes);
            self.notes = previous.notes;
            if !notes.is_empty() {
                self.add_note(&notes);
            }
        }
    }

    pub fn set_model(&mut self, model: GruForecasterConfig) {
        self.model = Some(model);
    }

    pub fn set_initial_loss(&mut self, loss: f64) {
        self.initial_loss = Some(loss);
    }

    pub fn set_training_time(&mut self, seconds: f64) {
        self.training_time_seconds = Some(seconds);
    }

    pub fn set_error(&mut self, error: &str) {
        self.error = Some(error.to_string());
    }

    pub fn add_note(&mut self, note: &str) {
        if !self.notes.is_empty() {
            self.notes.push('\n');
        }
        self.notes.push_str(note);
    }

    /// Write the history as pretty JSON to `path`, creating parent directories
    pub fn save(&self, path: &Path) -> Result<PathBuf> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self)?;
        let mut file = fs::File::create(path)
            .with_context(|| format!("Failed to create history file {}", path.display()))?;
        file.write_all(json.as_bytes())?;
        Ok(path.to_path_buf())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read history file {}", path.display()))?;
        Ok(serde_json::from_str(&json)?)
    }
}
