// External imports
use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::prelude::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

// Internal imports
use super::step_2_gru_cell::Gru;
use crate::constants::{HIDDEN_SIZE, NUM_LAYERS};
use crate::error::{ForecastError, Result};

/// How the multi-step rollout continues after the input window has been read
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForecastHead {
    /// Keep stepping the encoder GRU, feeding back each prediction
    #[default]
    Shared,
    /// A second GRU seeded with the encoder state and fed the last observation
    /// first, then its own predictions
    EncoderDecoder,
}

/// Architecture of a [`GruForecaster`]; also the shape checked when a
/// checkpoint is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GruForecasterConfig {
    pub input_size: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    #[serde(default)]
    pub head: ForecastHead,
}

impl GruForecasterConfig {
    pub fn new(input_size: usize) -> Self {
        Self {
            input_size,
            hidden_size: HIDDEN_SIZE,
            num_layers: NUM_LAYERS,
            head: ForecastHead::default(),
        }
    }

    pub fn with_hidden_size(mut self, hidden_size: usize) -> Self {
        self.hidden_size = hidden_size;
        self
    }

    pub fn with_num_layers(mut self, num_layers: usize) -> Self {
        self.num_layers = num_layers;
        self
    }

    pub fn with_head(mut self, head: ForecastHead) -> Self {
        self.head = head;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_size == 0 || self.hidden_size == 0 || self.num_layers == 0 {
            return Err(ForecastError::Config(format!(
                "input_size ({}), hidden_size ({}) and num_layers ({}) must all be at least 1",
                self.input_size, self.hidden_size, self.num_layers
            )));
        }
        Ok(())
    }

    /// Initialize a model with freshly sampled parameters
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<GruForecaster<B>> {
        self.validate()?;
        Ok(GruForecaster::new(self, device))
    }
}

/// # GRU Forecaster
///
/// Maps a window of past observations to the next observation, and by
/// feeding predictions back in, to an arbitrary number of future steps.
///
/// ## Architecture Overview
///
/// 1. **Encoder**: stacked GRU reading the window from a zero state
/// 2. **Decoder** (optional): second stacked GRU continuing from the encoder state
/// 3. **Output Layer**: linear projection from the top hidden state back to
///    feature space, so predictions can be fed back as inputs
///
/// The forward pass has no dropout, no clamping and no random state, so it
/// is a pure function of the parameters and the input window.
#[derive(Module, Debug)]
pub struct GruForecaster<B: Backend> {
    input_size: usize,
    hidden_size: usize,
    encoder: Gru<B>,
    decoder: Option<Gru<B>>,
    output: Linear<B>,
}

impl<B: Backend> GruForecaster<B> {
    fn new(config: &GruForecasterConfig, device: &B::Device) -> Self {
        let encoder = Gru::new(
            config.input_size,
            config.hidden_size,
            config.num_layers,
            device,
        );
        let decoder = match config.head {
            ForecastHead::Shared => None,
            ForecastHead::EncoderDecoder => Some(Gru::new(
                config.input_size,
                config.hidden_size,
                config.num_layers,
                device,
            )),
        };
        let output = LinearConfig::new(config.hidden_size, config.input_size).init(device);

        Self {
            input_size: config.input_size,
            hidden_size: config.hidden_size,
            encoder,
            decoder,
            output,
        }
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// The configuration this model was built from
    pub fn config(&self) -> GruForecasterConfig {
        GruForecasterConfig {
            input_size: self.input_size,
            hidden_size: self.hidden_size,
            num_layers: self.encoder.num_layers(),
            head: if self.decoder.is_some() {
                ForecastHead::EncoderDecoder
            } else {
                ForecastHead::Shared
            },
        }
    }

    fn check_input(&self, input: &Tensor<B, 3>) -> Result<()> {
        let [batch_size, seq_len, features] = input.dims();
        if features != self.input_size {
            return Err(ForecastError::shape("model input features", self.input_size, features));
        }
        if seq_len == 0 {
            return Err(ForecastError::shape("input window length", 1, 0));
        }
        if batch_size == 0 {
            return Err(ForecastError::shape("batch size", 1, 0));
        }
        Ok(())
    }

    /// Predict the step that follows each input window
    ///
    /// # Arguments
    ///
    /// * `input` - Tensor of shape [batch_size, seq_len, input_size]
    ///
    /// # Returns
    ///
    /// Predictions of shape [batch_size, input_size]
    pub fn forward(&self, input: Tensor<B, 3>) -> Result<Tensor<B, 2>> {
        let [batch_size, _, _] = input.dims();
        let predictions = self.rollout(input, 1)?;
        Ok(predictions.reshape([batch_size, self.input_size]))
    }

    /// Autoregressive multi-step forecast
    ///
    /// The recurrent state starts at zero for every call, reads the window,
    /// and is then carried across the rollout with each prediction fed back
    /// as the next input. Errors compound over the horizon by construction.
    ///
    /// # Returns
    ///
    /// Predictions of shape [batch_size, steps, input_size]
    pub fn rollout(&self, input: Tensor<B, 3>, steps: usize) -> Result<Tensor<B, 3>> {
        self.check_input(&input)?;
        if steps == 0 {
            return Err(ForecastError::Config("rollout needs at least one step".into()));
        }
        let [batch_size, seq_len, features] = input.dims();

        let (encoded, mut state) = self.encoder.forward(input.clone(), None);
        let mut predictions = Vec::with_capacity(steps);

        match &self.decoder {
            None => {
                let last_hidden = encoded
                    .narrow(1, seq_len - 1, 1)
                    .reshape([batch_size, self.hidden_size]);
                let mut prediction = self.output.forward(last_hidden);
                for _ in 1..steps {
                    let (h, next_state) = self.encoder.step(prediction.clone(), state);
                    state = next_state;
                    predictions.push(prediction);
                    prediction = self.output.forward(h);
                }
                predictions.push(prediction);
            }
            Some(decoder) => {
                let mut next_input = input
                    .narrow(1, seq_len - 1, 1)
                    .reshape([batch_size, features]);
                for _ in 0..steps {
                    let (h, next_state) = decoder.step(next_input, state);
                    state = next_state;
                    let prediction = self.output.forward(h);
                    predictions.push(prediction.clone());
                    next_input = prediction;
                }
            }
        }

        Ok(Tensor::stack(predictions, 1))
    }

    /// Mean squared error averaged over batch, steps and features
    pub fn mse_loss(&self, predictions: Tensor<B, 3>, targets: Tensor<B, 3>) -> Tensor<B, 1> {
        let diff = predictions - targets;
        (diff.clone() * diff).mean()
    }
}
