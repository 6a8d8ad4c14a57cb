// External imports
use burn::tensor::{Distribution, Tensor};
use burn_ndarray::{NdArray, NdArrayDevice};

// Internal imports
use crate::error::ForecastError;
use crate::gru::step_3_gru_model_arch::{ForecastHead, GruForecaster, GruForecasterConfig};

type TestBackend = NdArray<f32>;

fn model(input_size: usize, hidden_size: usize, head: ForecastHead) -> GruForecaster<TestBackend> {
    GruForecasterConfig::new(input_size)
        .with_hidden_size(hidden_size)
        .with_num_layers(2)
        .with_head(head)
        .init::<TestBackend>(&NdArrayDevice::Cpu)
        .unwrap()
}

fn random_window(batch: usize, steps: usize, features: usize) -> Tensor<TestBackend, 3> {
    Tensor::random(
        [batch, steps, features],
        Distribution::Normal(0.0, 1.0),
        &NdArrayDevice::Cpu,
    )
}

fn to_vec(tensor: Tensor<TestBackend, 2>) -> Vec<f32> {
    tensor.into_data().to_vec::<f32>().unwrap()
}

fn assert_close(a: &[f32], b: &[f32], tolerance: f32) {
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b) {
        assert!((x - y).abs() <= tolerance, "{} vs {}", x, y);
    }
}

#[test]
fn test_forward_shape() {
    let model = model(3, 8, ForecastHead::Shared);
    let prediction = model.forward(random_window(4, 12, 3)).unwrap();
    assert_eq!(prediction.dims(), [4, 3]);
}

#[test]
fn test_wrong_feature_count_is_shape_error() {
    let model = model(3, 8, ForecastHead::Shared);
    let result = model.forward(random_window(1, 12, 2));
    assert!(matches!(
        result,
        Err(ForecastError::Shape {
            expected: 3,
            actual: 2,
            ..
        })
    ));
}

#[test]
fn test_zero_steps_is_config_error() {
    let model = model(2, 4, ForecastHead::Shared);
    assert!(matches!(
        model.rollout(random_window(1, 5, 2), 0),
        Err(ForecastError::Config(_))
    ));
}

#[test]
fn test_rollout_length_matches_horizon() {
    for head in [ForecastHead::Shared, ForecastHead::EncoderDecoder] {
        let model = model(2, 6, head);
        for steps in [1, 2, 7, 30] {
            let predictions = model.rollout(random_window(3, 10, 2), steps).unwrap();
            assert_eq!(predictions.dims(), [3, steps, 2], "{:?} {}", head, steps);
        }
    }
}

#[test]
fn test_forward_is_first_rollout_step() {
    let model = model(2, 6, ForecastHead::Shared);
    let window = random_window(2, 9, 2);
    let single = to_vec(model.forward(window.clone()).unwrap());
    let first = to_vec(
        model
            .rollout(window, 5)
            .unwrap()
            .narrow(1, 0, 1)
            .reshape([2, 2]),
    );
    assert_close(&single, &first, 1e-6);
}

#[test]
fn test_hidden_state_resets_between_windows() {
    for head in [ForecastHead::Shared, ForecastHead::EncoderDecoder] {
        let model = model(3, 8, head);
        let window_a = random_window(1, 10, 3);
        let window_b = random_window(1, 10, 3);

        let alone = to_vec(model.rollout(window_b.clone(), 4).unwrap().reshape([4, 3]));

        model.rollout(window_a.clone(), 4).unwrap();
        let after_other = to_vec(model.rollout(window_b.clone(), 4).unwrap().reshape([4, 3]));
        assert_eq!(alone, after_other);

        let batched = model
            .rollout(Tensor::cat(vec![window_a, window_b], 0), 4)
            .unwrap()
            .narrow(0, 1, 1)
            .reshape([4, 3]);
        assert_close(&alone, &to_vec(batched), 1e-5);
    }
}

#[test]
fn test_forward_is_deterministic() {
    let model = model(2, 6, ForecastHead::EncoderDecoder);
    let window = random_window(2, 8, 2);
    let first = to_vec(model.rollout(window.clone(), 6).unwrap().reshape([12, 2]));
    let second = to_vec(model.rollout(window, 6).unwrap().reshape([12, 2]));
    assert_eq!(first, second);
}

#[test]
fn test_large_inputs_are_not_clamped() {
    let model = model(2, 4, ForecastHead::Shared);
    let window = Tensor::<TestBackend, 3>::full([1, 5, 2], 1.0e6, &NdArrayDevice::Cpu);
    let prediction = to_vec(model.forward(window).unwrap());
    assert!(prediction.iter().all(|v| v.is_finite()));
}

#[test]
fn test_config_round_trip_and_validation() {
    let model = model(3, 8, ForecastHead::EncoderDecoder);
    let config = model.config();
    assert_eq!(config.input_size, 3);
    assert_eq!(config.hidden_size, 8);
    assert_eq!(config.num_layers, 2);
    assert_eq!(config.head, ForecastHead::EncoderDecoder);

    let invalid = GruForecasterConfig::new(3).with_hidden_size(0);
    assert!(matches!(
        invalid.init::<TestBackend>(&NdArrayDevice::Cpu),
        Err(ForecastError::Config(_))
    ));
}

#[test]
fn test_mse_loss() {
    let model = model(1, 2, ForecastHead::Shared);
    let device = NdArrayDevice::Cpu;
    let predictions = Tensor::<TestBackend, 3>::from_floats([[[1.0], [2.0]], [[3.0], [4.0]]], &device);
    let targets = Tensor::<TestBackend, 3>::from_floats([[[1.0], [0.0]], [[3.0], [2.0]]], &device);
    let loss = model.mse_loss(predictions, targets).into_scalar();
    // (0 + 4 + 0 + 4) / 4
    assert!((loss - 2.0).abs() < 1e-6);
}
