// External imports
use burn::tensor::{backend::Backend, Tensor};
use log::debug;
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::ops::Range;

// Internal imports
use crate::constants::MIN_SCALE;
use crate::error::{ForecastError, Result};

/// # Raw Simulation Series
///
/// An ordered multivariate time series with one row per simulation time step
/// and one column per physical quantity (heat flux, temperature, velocity...).
/// The series is immutable once built; every transformation returns a new one.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSeries {
    feature_names: Vec<String>,
    values: Array2<f64>,
}

impl RawSeries {
    /// Wrap a `[time_steps, features]` array together with its column names
    pub fn new(feature_names: Vec<String>, values: Array2<f64>) -> Result<Self> {
        if feature_names.is_empty() {
            return Err(ForecastError::Config(
                "a series needs at least one feature".into(),
            ));
        }
        if feature_names.len() != values.ncols() {
            return Err(ForecastError::shape(
                "feature names",
                values.ncols(),
                feature_names.len(),
            ));
        }
        Ok(Self {
            feature_names,
            values,
        })
    }

    /// Build a series from row-major observations
    pub fn from_rows(feature_names: Vec<String>, rows: &[Vec<f64>]) -> Result<Self> {
        let n_features = feature_names.len();
        let mut flat = Vec::with_capacity(rows.len() * n_features);
        for row in rows {
            if row.len() != n_features {
                return Err(ForecastError::shape("observation", n_features, row.len()));
            }
            flat.extend_from_slice(row);
        }
        let values = Array2::from_shape_vec((rows.len(), n_features), flat)
            .map_err(|e| ForecastError::Data(e.to_string()))?;
        Self::new(feature_names, values)
    }

    pub fn len(&self) -> usize {
        self.values.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.values.nrows() == 0
    }

    pub fn num_features(&self) -> usize {
        self.values.ncols()
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn values(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    pub fn row(&self, index: usize) -> ArrayView1<'_, f64> {
        self.values.row(index)
    }

    /// Contiguous sub-series covering `range` (in time steps)
    pub fn slice(&self, range: Range<usize>) -> Result<Self> {
        if range.start > range.end || range.end > self.len() {
            return Err(ForecastError::Config(format!(
                "slice {}..{} is out of bounds for a series of length {}",
                range.start,
                range.end,
                self.len()
            )));
        }
        Ok(Self {
            feature_names: self.feature_names.clone(),
            values: self.values.slice(s![range, ..]).to_owned(),
        })
    }

    /// Keep only the named features, in the order given
    pub fn select(&self, names: &[String]) -> Result<Self> {
        let indices = names
            .iter()
            .map(|name| {
                self.feature_names
                    .iter()
                    .position(|f| f == name)
                    .ok_or_else(|| ForecastError::Data(format!("unknown feature column: {}", name)))
            })
            .collect::<Result<Vec<_>>>()?;
        let values = self.values.select(Axis(1), &indices);
        Self::new(names.to_vec(), values)
    }

    /// Chronological train / validation / test split.
    ///
    /// Each part is contiguous in time; whatever the two fractions leave over
    /// becomes the test part.
    pub fn split(
        &self,
        train_fraction: f64,
        valid_fraction: f64,
    ) -> Result<(RawSeries, RawSeries, RawSeries)> {
        let valid_range = 0.0..=1.0;
        if !valid_range.contains(&train_fraction)
            || !valid_range.contains(&valid_fraction)
            || train_fraction + valid_fraction > 1.0 + 1e-9
        {
            return Err(ForecastError::Config(format!(
                "split fractions ({}, {}) must lie in [0, 1] and sum to at most 1",
                train_fraction, valid_fraction
            )));
        }

        let n = self.len();
        let train_end = ((n as f64) * train_fraction).round() as usize;
        let train_end = train_end.min(n);
        let valid_end = (train_end + ((n as f64) * valid_fraction).round() as usize).min(n);

        Ok((
            self.slice(0..train_end)?,
            self.slice(train_end..valid_end)?,
            self.slice(valid_end..n)?,
        ))
    }
}

/// Window geometry: how many steps go in, how many are predicted, and how far
/// consecutive windows are apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSpec {
    pub input_len: usize,
    pub target_len: usize,
    pub stride: usize,
}

impl WindowSpec {
    pub fn new(input_len: usize, target_len: usize, stride: usize) -> Result<Self> {
        let spec = Self {
            input_len,
            target_len,
            stride,
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_len == 0 || self.target_len == 0 || self.stride == 0 {
            return Err(ForecastError::Config(format!(
                "input_len ({}), target_len ({}) and stride ({}) must all be at least 1",
                self.input_len, self.target_len, self.stride
            )));
        }
        Ok(())
    }

    /// Time steps covered by one window
    pub fn span(&self) -> usize {
        self.input_len + self.target_len
    }

    /// Number of windows that fit into a series of `len` steps
    pub fn count(&self, len: usize) -> usize {
        if len < self.span() {
            0
        } else {
            (len - self.span()) / self.stride + 1
        }
    }
}

/// Per-feature `(mean, scale)` fitted on the training split.
///
/// Stored in every checkpoint so prediction normalizes exactly like training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationStats {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl NormalizationStats {
    /// Stats that leave values untouched
    pub fn identity(num_features: usize) -> Self {
        Self {
            mean: vec![0.0; num_features],
            scale: vec![1.0; num_features],
        }
    }

    pub fn num_features(&self) -> usize {
        self.mean.len()
    }

    fn check_width(&self, width: usize, context: &str) -> Result<()> {
        if self.mean.len() != self.scale.len() {
            return Err(ForecastError::shape(
                "normalization stats",
                self.mean.len(),
                self.scale.len(),
            ));
        }
        if width != self.num_features() {
            return Err(ForecastError::shape(context, self.num_features(), width));
        }
        Ok(())
    }

    /// `(x - mean) / scale`, column-wise
    pub fn normalize(&self, values: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        self.check_width(values.ncols(), "normalize")?;
        let mean = Array1::from(self.mean.clone());
        let scale = Array1::from(self.scale.clone());
        Ok((&values - &mean) / &scale)
    }

    /// `x * scale + mean`, column-wise
    pub fn denormalize(&self, values: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        self.check_width(values.ncols(), "denormalize")?;
        let mean = Array1::from(self.mean.clone());
        let scale = Array1::from(self.scale.clone());
        Ok(&values * &scale + &mean)
    }
}

/// Fit normalization stats on the training portion of a series.
///
/// Fails with `InsufficientData` if not even one window fits.
pub fn fit_normalization(raw: &RawSeries, spec: &WindowSpec) -> Result<NormalizationStats> {
    spec.validate()?;
    if raw.len() < spec.span() {
        return Err(ForecastError::InsufficientData {
            required: spec.span(),
            available: raw.len(),
        });
    }

    let n = raw.len() as f64;
    let (mean, scale): (Vec<f64>, Vec<f64>) = (0..raw.num_features())
        .into_par_iter()
        .map(|j| {
            let column = raw.values.column(j);
            let mean = column.sum() / n;
            let variance = column.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
            let std = variance.sqrt();
            // Constant features would otherwise divide by zero
            let scale = if std.is_finite() && std > MIN_SCALE { std } else { 1.0 };
            (mean, scale)
        })
        .unzip();

    debug!(
        "Fitted normalization over {} steps and {} features",
        raw.len(),
        raw.num_features()
    );
    Ok(NormalizationStats { mean, scale })
}

/// Free-function form of [`NormalizationStats::normalize`]
pub fn normalize(values: ArrayView2<'_, f64>, stats: &NormalizationStats) -> Result<Array2<f64>> {
    stats.normalize(values)
}

/// Free-function form of [`NormalizationStats::denormalize`]
pub fn denormalize(values: ArrayView2<'_, f64>, stats: &NormalizationStats) -> Result<Array2<f64>> {
    stats.denormalize(values)
}

/// One supervised example: `input_len` steps followed immediately by
/// `target_len` steps, both normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    /// Index of the first input step in the source series
    pub start: usize,
    pub input: Array2<f64>,
    pub target: Array2<f64>,
}

/// Normalized windows over a series.
///
/// The series is normalized once; windows are sliced on demand, so iterating
/// is lazy and can be restarted any number of times via [`Windows::iter`].
#[derive(Debug, Clone)]
pub struct Windows {
    normalized: Array2<f64>,
    spec: WindowSpec,
    count: usize,
}

/// Slice `raw` into normalized windows
pub fn make_windows(
    raw: &RawSeries,
    stats: &NormalizationStats,
    spec: &WindowSpec,
) -> Result<Windows> {
    spec.validate()?;
    if stats.num_features() != raw.num_features() {
        return Err(ForecastError::shape(
            "normalization stats",
            raw.num_features(),
            stats.num_features(),
        ));
    }
    let count = spec.count(raw.len());
    if count == 0 {
        return Err(ForecastError::InsufficientData {
            required: spec.span(),
            available: raw.len(),
        });
    }
    let normalized = stats.normalize(raw.values())?;
    debug!(
        "Prepared {} windows (input {}, target {}, stride {})",
        count, spec.input_len, spec.target_len, spec.stride
    );
    Ok(Windows {
        normalized,
        spec: *spec,
        count,
    })
}

impl Windows {
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn spec(&self) -> &WindowSpec {
        &self.spec
    }

    pub fn num_features(&self) -> usize {
        self.normalized.ncols()
    }

    fn start_of(&self, index: usize) -> usize {
        index * self.spec.stride
    }

    pub(crate) fn input_view(&self, index: usize) -> ArrayView2<'_, f64> {
        let start = self.start_of(index);
        self.normalized
            .slice(s![start..start + self.spec.input_len, ..])
    }

    pub(crate) fn target_view(&self, index: usize) -> ArrayView2<'_, f64> {
        let start = self.start_of(index) + self.spec.input_len;
        self.normalized
            .slice(s![start..start + self.spec.target_len, ..])
    }

    pub fn get(&self, index: usize) -> Option<Window> {
        if index >= self.count {
            return None;
        }
        Some(Window {
            start: self.start_of(index),
            input: self.input_view(index).to_owned(),
            target: self.target_view(index).to_owned(),
        })
    }

    pub fn iter(&self) -> WindowIter<'_> {
        WindowIter {
            windows: self,
            next: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WindowIter<'a> {
    windows: &'a Windows,
    next: usize,
}

impl Iterator for WindowIter<'_> {
    type Item = Window;

    fn next(&mut self) -> Option<Window> {
        let window = self.windows.get(self.next)?;
        self.next += 1;
        Some(window)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.windows.len().saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for WindowIter<'_> {}

impl<'a> IntoIterator for &'a Windows {
    type Item = Window;
    type IntoIter = WindowIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Stack the windows at `indices` into `(inputs, targets)` tensors of shape
/// [batch, input_len, features] and [batch, target_len, features]
pub fn batch_to_tensors<B: Backend>(
    windows: &Windows,
    indices: &[usize],
    device: &B::Device,
) -> (Tensor<B, 3>, Tensor<B, 3>) {
    let spec = windows.spec();
    let n_features = windows.num_features();

    let mut input_data = Vec::with_capacity(indices.len() * spec.input_len * n_features);
    let mut target_data = Vec::with_capacity(indices.len() * spec.target_len * n_features);
    for &index in indices {
        input_data.extend(windows.input_view(index).iter().map(|&v| v as f32));
        target_data.extend(windows.target_view(index).iter().map(|&v| v as f32));
    }

    let inputs = Tensor::<B, 1>::from_floats(input_data.as_slice(), device).reshape([
        indices.len(),
        spec.input_len,
        n_features,
    ]);
    let targets = Tensor::<B, 1>::from_floats(target_data.as_slice(), device).reshape([
        indices.len(),
        spec.target_len,
        n_features,
    ]);
    (inputs, targets)
}

/// A single `[steps, features]` block as a batch of one: [1, steps, features]
pub fn array_to_tensor<B: Backend>(values: ArrayView2<'_, f64>, device: &B::Device) -> Tensor<B, 3> {
    let (steps, n_features) = values.dim();
    let data: Vec<f32> = values.iter().map(|&v| v as f32).collect();
    Tensor::<B, 1>::from_floats(data.as_slice(), device).reshape([1, steps, n_features])
}

/// Copy a [steps, features] tensor back to the host
pub fn tensor_to_array<B: Backend>(tensor: Tensor<B, 2>) -> Result<Array2<f64>> {
    let [steps, n_features] = tensor.dims();
    let data = tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| ForecastError::Data(format!("{:?}", e)))?;
    let values = data.into_iter().map(f64::from).collect();
    Array2::from_shape_vec((steps, n_features), values).map_err(|e| ForecastError::Data(e.to_string()))
}
