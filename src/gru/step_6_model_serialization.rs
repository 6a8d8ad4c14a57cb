// External imports
use burn::module::Module;
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::Backend;
use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

// Internal imports
use super::step_1_sequence_dataset::{NormalizationStats, WindowSpec};
use super::step_3_gru_model_arch::{GruForecaster, GruForecasterConfig};
use crate::built_info;
use crate::constants::CHECKPOINT_FORMAT_VERSION;
use crate::error::{ForecastError, Result};

type WeightsRecorder = BinBytesRecorder<FullPrecisionSettings>;

/// Everything about the data a model was trained on that prediction must
/// reproduce: feature order, frozen normalization and window geometry.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DataProfile {
    pub feature_names: Vec<String>,
    pub stats: NormalizationStats,
    pub window: WindowSpec,
}

impl DataProfile {
    pub fn num_features(&self) -> usize {
        self.feature_names.len()
    }
}

/// # Checkpoint Metadata
///
/// Self-describing header stored next to the weights. It is read and
/// validated before any weight bytes are decoded, so an incompatible
/// checkpoint is rejected with a clear message instead of a decoding error.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CheckpointMetadata {
    pub format_version: u32,

    /// Architecture needed to rebuild the model before loading weights
    pub model: GruForecasterConfig,

    pub data: DataProfile,

    /// Number of optimizer updates applied so far
    pub step: u64,

    /// Epoch (1-based) after which the snapshot was taken
    pub epoch: usize,

    /// Monitored loss of these weights
    #[serde(default)]
    pub val_loss: Option<f64>,

    /// Best monitored loss of the run when the snapshot was taken
    pub best_val_loss: Option<f64>,

    #[serde(default)]
    pub best_epoch: Option<usize>,

    /// Learning rate for the next epoch, after any plateau decay
    #[serde(default)]
    pub learning_rate: Option<f64>,

    /// File name of the weights, relative to the checkpoint directory
    #[serde(default)]
    pub weights_file: String,

    /// Unix timestamp of the snapshot
    pub timestamp: i64,

    pub crate_version: String,
}

impl CheckpointMetadata {
    /// Internal consistency of the header itself
    pub fn validate(&self) -> Result<()> {
        if self.format_version != CHECKPOINT_FORMAT_VERSION {
            return Err(ForecastError::CheckpointMismatch(format!(
                "unsupported format version {} (expected {})",
                self.format_version, CHECKPOINT_FORMAT_VERSION
            )));
        }
        self.model
            .validate()
            .map_err(|e| ForecastError::CheckpointMismatch(e.to_string()))?;
        let width = self.model.input_size;
        let stats = &self.data.stats;
        if stats.mean.len() != width || stats.scale.len() != width {
            return Err(ForecastError::CheckpointMismatch(format!(
                "normalization stats cover {} features but the model expects {}",
                stats.mean.len(),
                width
            )));
        }
        if self.data.num_features() != width {
            return Err(ForecastError::CheckpointMismatch(format!(
                "{} feature names recorded for a model with {} inputs",
                self.data.num_features(),
                width
            )));
        }
        Ok(())
    }

    /// Check the checkpoint against the architecture the caller wants
    pub fn ensure_compatible(&self, expected: &GruForecasterConfig) -> Result<()> {
        if &self.model != expected {
            return Err(ForecastError::CheckpointMismatch(format!(
                "checkpoint holds {:?} but {:?} was requested",
                self.model, expected
            )));
        }
        Ok(())
    }
}

/// A serialized checkpoint: metadata plus opaque weight bytes.
///
/// Independent of the tensor backend, which is what lets stores move
/// checkpoints around without knowing about burn.
#[derive(Debug, Clone)]
pub struct CheckpointBlob {
    pub metadata: CheckpointMetadata,
    pub weights: Vec<u8>,
}

/// # Checkpoint
///
/// A trained model together with the data profile it was trained against
/// and the training-step counter at the time of the snapshot.
#[derive(Debug, Clone)]
pub struct Checkpoint<B: Backend> {
    pub model: GruForecaster<B>,
    pub data: DataProfile,
    pub step: u64,
    pub epoch: usize,
    pub val_loss: Option<f64>,
    pub best_val_loss: Option<f64>,
    pub best_epoch: Option<usize>,
    pub learning_rate: Option<f64>,
}

impl<B: Backend> Checkpoint<B> {
    /// Serialize into a blob ready for a [`CheckpointStore`]
    pub fn to_blob(&self) -> Result<CheckpointBlob> {
        let recorder = WeightsRecorder::default();
        let weights = <WeightsRecorder as Recorder<B>>::record(
            &recorder,
            self.model.clone().into_record(),
            (),
        )
        .map_err(|e| ForecastError::Record(format!("{:?}", e)))?;

        let metadata = CheckpointMetadata {
            format_version: CHECKPOINT_FORMAT_VERSION,
            model: self.model.config(),
            data: self.data.clone(),
            step: self.step,
            epoch: self.epoch,
            val_loss: self.val_loss.filter(|l| l.is_finite()),
            best_val_loss: self.best_val_loss.filter(|l| l.is_finite()),
            best_epoch: self.best_epoch,
            learning_rate: self.learning_rate,
            weights_file: String::new(),
            timestamp: Utc::now().timestamp(),
            crate_version: built_info::PKG_VERSION.to_string(),
        };
        Ok(CheckpointBlob { metadata, weights })
    }

    /// Rebuild a checkpoint, validating the header before decoding weights
    pub fn from_blob(blob: CheckpointBlob, device: &B::Device) -> Result<Self> {
        let CheckpointBlob { metadata, weights } = blob;
        metadata.validate()?;

        let recorder = WeightsRecorder::default();
        let record = <WeightsRecorder as Recorder<B>>::load(&recorder, weights, device).map_err(|e| {
            ForecastError::CheckpointMismatch(format!(
                "weights do not match the recorded architecture: {:?}",
                e
            ))
        })?;
        let model = metadata.model.init::<B>(device)?.load_record(record);

        Ok(Self {
            model,
            data: metadata.data,
            step: metadata.step,
            epoch: metadata.epoch,
            val_loss: metadata.val_loss,
            best_val_loss: metadata.best_val_loss,
            best_epoch: metadata.best_epoch,
            learning_rate: metadata.learning_rate,
        })
    }

    /// Like [`Checkpoint::from_blob`], but also require a specific architecture
    pub fn from_blob_expecting(
        blob: CheckpointBlob,
        expected: &GruForecasterConfig,
        device: &B::Device,
    ) -> Result<Self> {
        blob.metadata.ensure_compatible(expected)?;
        Self::from_blob(blob, device)
    }
}

/// The two checkpoints a run keeps.
///
/// `Best` holds the weights with the lowest monitored loss and is what
/// prediction loads. `Latest` holds the most recent snapshot and is what
/// training resumes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckpointSlot {
    Best,
    Latest,
}

impl CheckpointSlot {
    pub fn name(&self) -> &'static str {
        match self {
            CheckpointSlot::Best => "best",
            CheckpointSlot::Latest => "latest",
        }
    }
}

/// Where checkpoints are persisted.
///
/// Training writes through this trait and prediction reads through it, so
/// tests can swap the filesystem for [`MemoryCheckpointStore`].
pub trait CheckpointStore {
    fn write(&mut self, slot: CheckpointSlot, blob: &CheckpointBlob) -> Result<()>;
    fn read(&self, slot: CheckpointSlot) -> Result<CheckpointBlob>;
    fn exists(&self, slot: CheckpointSlot) -> bool;
    /// Human-readable location for log messages
    fn location(&self) -> String;

    /// Only the header of a checkpoint, without its weights
    fn metadata(&self, slot: CheckpointSlot) -> Result<CheckpointMetadata> {
        self.read(slot).map(|blob| blob.metadata)
    }

    fn is_empty(&self) -> bool {
        !self.exists(CheckpointSlot::Best) && !self.exists(CheckpointSlot::Latest)
    }
}

/// # Filesystem Checkpoint Store
///
/// Layout inside `dir`, per slot (`best` or `latest`):
///
/// - `{name}.{slot}.meta.json`: the [`CheckpointMetadata`], naming the weights file
/// - `{name}-{slot}-{step}.bin`: the weights of that step
///
/// Both files are written to a temporary file in the same directory and then
/// atomically renamed into place, weights first. A reader that has already
/// parsed the old metadata still finds the weights it references, because
/// the previous weights file of the slot is kept until the next write.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    name: String,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            name: name.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn metadata_path(&self, slot: CheckpointSlot) -> PathBuf {
        self.dir.join(format!("{}.{}.meta.json", self.name, slot.name()))
    }

    fn weights_prefix(&self, slot: CheckpointSlot) -> String {
        format!("{}-{}-", self.name, slot.name())
    }

    fn weights_file_name(&self, slot: CheckpointSlot, step: u64) -> String {
        format!("{}{:08}.bin", self.weights_prefix(slot), step)
    }

    fn write_atomically(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Remove weights files of `slot` that neither the current nor the
    /// previous metadata refers to
    fn prune(&self, slot: CheckpointSlot, keep: &[&str]) {
        let prefix = self.weights_prefix(slot);
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };
        for entry in entries.filter_map(std::result::Result::ok) {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if file_name.starts_with(&prefix)
                && file_name.ends_with(".bin")
                && !keep.contains(&&*file_name)
            {
                if let Err(e) = fs::remove_file(entry.path()) {
                    warn!("Could not remove stale weights {}: {}", entry.path().display(), e);
                }
            }
        }
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn write(&mut self, slot: CheckpointSlot, blob: &CheckpointBlob) -> Result<()> {
        fs::create_dir_all(&self.dir)?;

        let previous = self.metadata(slot).ok().map(|m| m.weights_file);
        let weights_file = self.weights_file_name(slot, blob.metadata.step);
        self.write_atomically(&self.dir.join(&weights_file), &blob.weights)?;

        let mut metadata = blob.metadata.clone();
        metadata.weights_file = weights_file.clone();
        let metadata_json = serde_json::to_vec_pretty(&metadata)?;
        self.write_atomically(&self.metadata_path(slot), &metadata_json)?;

        let mut keep = vec![weights_file.as_str()];
        if let Some(previous) = previous.as_deref() {
            keep.push(previous);
        }
        self.prune(slot, &keep);

        debug!(
            "Wrote {} checkpoint step {} ({} bytes of weights) to {}",
            slot.name(),
            metadata.step,
            blob.weights.len(),
            self.dir.display()
        );
        Ok(())
    }

    fn read(&self, slot: CheckpointSlot) -> Result<CheckpointBlob> {
        let metadata = self.metadata(slot)?;
        let weights_path = self.dir.join(&metadata.weights_file);
        if metadata.weights_file.is_empty() || !weights_path.exists() {
            return Err(ForecastError::CheckpointNotFound(weights_path));
        }
        let weights = fs::read(&weights_path)?;
        info!(
            "Loaded {} checkpoint from {} (step {}, epoch {})",
            slot.name(),
            weights_path.display(),
            metadata.step,
            metadata.epoch
        );
        Ok(CheckpointBlob { metadata, weights })
    }

    fn exists(&self, slot: CheckpointSlot) -> bool {
        self.metadata_path(slot).exists()
    }

    fn location(&self) -> String {
        self.dir.display().to_string()
    }

    fn metadata(&self, slot: CheckpointSlot) -> Result<CheckpointMetadata> {
        let path = self.metadata_path(slot);
        if !path.exists() {
            return Err(ForecastError::CheckpointNotFound(path));
        }
        let bytes = fs::read(&path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Keeps both checkpoint slots in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    best: Option<CheckpointBlob>,
    latest: Option<CheckpointBlob>,
    best_writes: usize,
    latest_writes: usize,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times `slot` has been written
    pub fn writes(&self, slot: CheckpointSlot) -> usize {
        match slot {
            CheckpointSlot::Best => self.best_writes,
            CheckpointSlot::Latest => self.latest_writes,
        }
    }

    pub fn get(&self, slot: CheckpointSlot) -> Option<&CheckpointBlob> {
        match slot {
            CheckpointSlot::Best => self.best.as_ref(),
            CheckpointSlot::Latest => self.latest.as_ref(),
        }
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn write(&mut self, slot: CheckpointSlot, blob: &CheckpointBlob) -> Result<()> {
        match slot {
            CheckpointSlot::Best => {
                self.best = Some(blob.clone());
                self.best_writes += 1;
            }
            CheckpointSlot::Latest => {
                self.latest = Some(blob.clone());
                self.latest_writes += 1;
            }
        }
        Ok(())
    }

    fn read(&self, slot: CheckpointSlot) -> Result<CheckpointBlob> {
        self.get(slot).cloned().ok_or_else(|| {
            ForecastError::CheckpointNotFound(PathBuf::from(format!("<memory>/{}", slot.name())))
        })
    }

    fn exists(&self, slot: CheckpointSlot) -> bool {
        self.get(slot).is_some()
    }

    fn location(&self) -> String {
        "<memory>".to_string()
    }
}
