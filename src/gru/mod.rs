/// # GRU Heat-Flux Forecaster
///
/// Forecasts local turbulent heat flux (and the other recorded quantities of a
/// Rayleigh-Bénard simulation) with a Gated Recurrent Unit network.
///
/// ## Module Structure:
///
/// 1. **step_1_sequence_dataset**: Raw series, normalization, windowing and tensor conversion
/// 2. **step_2_gru_cell**: GRU layer with packed gates and the stacked recurrence
/// 3. **step_3_gru_model_arch**: The forecaster: encoder, optional decoder, output projection
/// 4. **step_4_train_model**: Adam training loop with validation, plateau decay and early stopping
/// 5. **step_5_prediction**: Autoregressive forecasts in physical units and the export boundary
/// 6. **step_6_model_serialization**: Self-describing checkpoints and their stores
///
/// Every forecast starts from a zero hidden state, reads the input window and
/// then feeds its own predictions back in, one step at a time.
pub mod step_1_sequence_dataset;
pub mod step_2_gru_cell;
pub mod step_3_gru_model_arch;
pub mod step_4_train_model;
pub mod step_5_prediction;
pub mod step_6_model_serialization;
