// External crates
use anyhow::{Context, Result};
use log::{debug, info, warn};
use polars::prelude::*;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

// Internal imports
use crate::error::ForecastError;
use crate::gru::step_1_sequence_dataset::RawSeries;
use crate::gru::step_5_prediction::{ForecastComparison, ForecastSink};

/// Where the orchestrator gets its raw series from
pub trait SeriesSource {
    fn load(&self) -> Result<RawSeries>;
    /// Human-readable origin for log messages
    fn describe(&self) -> String;
}

impl SeriesSource for RawSeries {
    fn load(&self) -> Result<RawSeries> {
        Ok(self.clone())
    }

    fn describe(&self) -> String {
        format!("<memory: {} steps>", self.len())
    }
}

/// A CSV or Parquet file of simulation output, one row per time step
#[derive(Debug, Clone)]
pub struct FileSeriesSource {
    path: PathBuf,
    time_column: Option<String>,
    features: Option<Vec<String>>,
}

impl FileSeriesSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            time_column: None,
            features: None,
        }
    }

    /// Column holding the time stamp; never used as a feature
    pub fn with_time_column(mut self, name: Option<String>) -> Self {
        self.time_column = name;
        self
    }

    /// Restrict to these feature columns, in this order
    pub fn with_features(mut self, features: Option<Vec<String>>) -> Self {
        self.features = features;
        self
    }
}

impl SeriesSource for FileSeriesSource {
    fn load(&self) -> Result<RawSeries> {
        let df = read_data_file(&self.path)?;
        dataframe_to_series(&df, self.time_column.as_deref(), self.features.as_deref())
            .with_context(|| format!("Invalid simulation data in {}", self.path.display()))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Read a CSV file into a DataFrame
///
/// # Arguments
///
/// * `file_path` - Path to the CSV file (with a header row)
pub fn read_csv_file<P: AsRef<Path>>(file_path: P) -> Result<DataFrame> {
    let path = file_path.as_ref();
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .try_into_reader_with_file_path(Some(path.to_path_buf()))
        .with_context(|| format!("Failed to open CSV file {}", path.display()))?
        .finish()
        .with_context(|| format!("Failed to parse CSV file {}", path.display()))?;
    Ok(df)
}

/// Read a Parquet file into a DataFrame
pub fn read_parquet_file<P: AsRef<Path>>(file_path: P) -> Result<DataFrame> {
    let path = file_path.as_ref();
    let file = File::open(path)
        .with_context(|| format!("Failed to open Parquet file {}", path.display()))?;
    let df = ParquetReader::new(file)
        .finish()
        .with_context(|| format!("Failed to parse Parquet file {}", path.display()))?;
    Ok(df)
}

/// Read a data file, choosing the format by extension
///
/// `.parquet` files go through the Parquet reader, everything else is
/// treated as CSV.
pub fn read_data_file<P: AsRef<Path>>(file_path: P) -> Result<DataFrame> {
    let path = file_path.as_ref();
    if !path.exists() {
        return Err(ForecastError::Data(format!("data file not found: {}", path.display())).into());
    }
    let is_parquet = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("parquet"));

    let df = if is_parquet {
        read_parquet_file(path)?
    } else {
        read_csv_file(path)?
    };
    info!(
        "Loaded {} rows x {} columns from {}",
        df.height(),
        df.width(),
        path.display()
    );
    Ok(df)
}

fn is_numeric(dtype: &DataType) -> bool {
    matches!(
        dtype,
        DataType::Float64
            | DataType::Float32
            | DataType::Int64
            | DataType::Int32
            | DataType::Int16
            | DataType::Int8
            | DataType::UInt64
            | DataType::UInt32
            | DataType::UInt16
            | DataType::UInt8
    )
}

/// Convert a DataFrame into a [`RawSeries`]
///
/// Without an explicit feature list every numeric column except the time
/// column becomes a feature, in file order. Null values are rejected.
pub fn dataframe_to_series(
    df: &DataFrame,
    time_column: Option<&str>,
    features: Option<&[String]>,
) -> Result<RawSeries> {
    if let Some(time) = time_column {
        if df.column(time).is_err() {
            return Err(ForecastError::Data(format!("missing time column: {}", time)).into());
        }
    }

    let feature_names: Vec<String> = match features {
        Some(names) => names.to_vec(),
        None => df
            .get_columns()
            .iter()
            .filter(|c| Some(c.name().as_str()) != time_column)
            .filter(|c| {
                let numeric = is_numeric(c.dtype());
                if !numeric {
                    warn!("Skipping non-numeric column {} ({})", c.name(), c.dtype());
                }
                numeric
            })
            .map(|c| c.name().to_string())
            .collect(),
    };
    if feature_names.is_empty() {
        return Err(ForecastError::Data("no numeric feature columns found".into()).into());
    }

    let n_rows = df.height();
    let mut columns = Vec::with_capacity(feature_names.len());
    for name in &feature_names {
        let column = df
            .column(name)
            .map_err(|_| ForecastError::Data(format!("missing feature column: {}", name)))?;
        if !is_numeric(column.dtype()) {
            return Err(ForecastError::Data(format!(
                "feature column {} is not numeric ({})",
                name,
                column.dtype()
            ))
            .into());
        }
        if column.null_count() > 0 {
            return Err(ForecastError::Data(format!(
                "feature column {} has {} missing values",
                name,
                column.null_count()
            ))
            .into());
        }
        let values: Vec<f64> = column
            .cast(&DataType::Float64)?
            .f64()?
            .into_iter()
            .map(|v| v.unwrap_or(f64::NAN))
            .collect();
        columns.push(values);
    }

    let mut flat = Vec::with_capacity(n_rows * feature_names.len());
    for row in 0..n_rows {
        flat.extend(columns.iter().map(|c| c[row]));
    }
    let values = ndarray::Array2::from_shape_vec((n_rows, feature_names.len()), flat)?;
    debug!("Features: {:?}", feature_names);

    Ok(RawSeries::new(feature_names, values)?)
}

/// Build the export table: `time_step`, then `predicted_<f>` and `truth_<f>`
/// for every feature
pub fn comparison_to_dataframe(comparison: &ForecastComparison) -> Result<DataFrame> {
    let trajectory = &comparison.trajectory;
    let horizon = trajectory.horizon();

    let time_steps: Vec<u64> = (0..horizon).map(|i| (trajectory.start + i) as u64).collect();
    let mut columns = vec![Column::new("time_step".into(), time_steps)];
    for (index, name) in trajectory.feature_names.iter().enumerate() {
        let predicted: Vec<f64> = trajectory.values.column(index).to_vec();
        columns.push(Column::new(format!("predicted_{}", name).into(), predicted));
        if let Some(truth) = &comparison.truth {
            let observed: Vec<f64> = truth.column(index).to_vec();
            columns.push(Column::new(format!("truth_{}", name).into(), observed));
        }
    }
    Ok(DataFrame::new(columns)?)
}

/// Writes each forecast as `forecast_<start>.csv` into a directory
#[derive(Debug, Clone)]
pub struct CsvForecastExporter {
    dir: PathBuf,
    written: Vec<PathBuf>,
}

impl CsvForecastExporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            written: Vec::new(),
        }
    }

    /// Files written so far
    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }

    fn export(&mut self, comparison: &ForecastComparison) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create export directory {}", self.dir.display()))?;
        let path = self
            .dir
            .join(format!("forecast_{:06}.csv", comparison.trajectory.start));

        let mut df = comparison_to_dataframe(comparison)?;
        let mut file = File::create(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        CsvWriter::new(&mut file).include_header(true).finish(&mut df)?;
        Ok(path)
    }
}

impl ForecastSink for CsvForecastExporter {
    fn write(&mut self, forecast: &ForecastComparison) -> crate::error::Result<()> {
        let path = self
            .export(forecast)
            .map_err(|e| ForecastError::Data(format!("{:#}", e)))?;
        info!("Exported forecast to {}", path.display());
        self.written.push(path);
        Ok(())
    }
}
