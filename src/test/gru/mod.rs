/// Tests for the GRU forecaster
///
/// * Forward pass and rollout shapes, hidden-state reset, determinism
/// * Training: divergence detection, loss reduction, state machine, checkpoints
/// * Prediction in physical units from restored checkpoints
pub mod test_gru;
pub mod test_prediction;
pub mod test_training;
