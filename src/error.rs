use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the forecasting core.
///
/// Nothing is retried inside the crate; every failure travels up to the
/// orchestrator.
#[derive(Error, Debug)]
pub enum ForecastError {
    /// Invalid window, stride, horizon or hyper-parameter settings.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The series is too short for the requested windows.
    #[error("insufficient data: need at least {required} time steps, got {available}")]
    InsufficientData { required: usize, available: usize },

    /// Feature dimensionality disagrees between data, stats and model.
    #[error("shape mismatch in {context}: expected {expected}, got {actual}")]
    Shape {
        context: String,
        expected: usize,
        actual: usize,
    },

    /// Training produced a NaN or infinite loss.
    #[error("training diverged at epoch {epoch}, batch {batch}: loss = {loss}")]
    Divergence { epoch: usize, batch: usize, loss: f64 },

    /// The checkpoint does not fit the current model configuration.
    #[error("checkpoint mismatch: {0}")]
    CheckpointMismatch(String),

    #[error("no checkpoint found at {0}")]
    CheckpointNotFound(PathBuf),

    #[error("tabular data error: {0}")]
    Data(String),

    #[error("model record error: {0}")]
    Record(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl ForecastError {
    pub(crate) fn shape(context: impl Into<String>, expected: usize, actual: usize) -> Self {
        ForecastError::Shape {
            context: context.into(),
            expected,
            actual,
        }
    }

    /// Short name of the variant, printed by the CLI in front of the message.
    pub fn kind(&self) -> &'static str {
        match self {
            ForecastError::Config(_) => "ConfigError",
            ForecastError::InsufficientData { .. } => "InsufficientDataError",
            ForecastError::Shape { .. } => "ShapeError",
            ForecastError::Divergence { .. } => "DivergenceError",
            ForecastError::CheckpointMismatch(_) => "CheckpointMismatchError",
            ForecastError::CheckpointNotFound(_) => "CheckpointNotFoundError",
            ForecastError::Data(_) => "DataError",
            ForecastError::Record(_) => "RecordError",
            ForecastError::Io(_) => "IoError",
            ForecastError::Serialization(_) => "SerializationError",
        }
    }
}

pub type Result<T> = std::result::Result<T, ForecastError>;
