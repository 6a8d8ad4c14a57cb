// External imports
use burn::backend::Autodiff;
use burn::module::AutodiffModule;
use burn_ndarray::{NdArray, NdArrayDevice};
use ndarray::{s, Array2};
use tempfile::tempdir;

// Internal imports
use crate::error::ForecastError;
use crate::gru::step_1_sequence_dataset::{
    array_to_tensor, fit_normalization, make_windows, tensor_to_array, NormalizationStats,
    WindowSpec,
};
use crate::gru::step_3_gru_model_arch::{ForecastHead, GruForecasterConfig};
use crate::gru::step_4_train_model::{Trainer, TrainingConfig, TrainingContext};
use crate::gru::step_5_prediction::{ForecastSink, MemorySink, Predictor};
use crate::gru::step_6_model_serialization::{DataProfile, FileCheckpointStore};
use crate::util::test_utils::sine_series;

type TestBackend = NdArray<f32>;

fn untrained_predictor(stats: NormalizationStats, input_len: usize) -> Predictor<TestBackend> {
    let model = GruForecasterConfig::new(2)
        .with_hidden_size(8)
        .init::<TestBackend>(&NdArrayDevice::Cpu)
        .unwrap();
    let profile = DataProfile {
        feature_names: vec!["q".into(), "theta".into()],
        stats,
        window: WindowSpec::new(input_len, 3, 1).unwrap(),
    };
    Predictor::new(model, profile, NdArrayDevice::Cpu).unwrap()
}

#[test]
fn test_forecast_has_exact_horizon() {
    let raw = sine_series(200, 25.0, 0.0, 1);
    let predictor = untrained_predictor(NormalizationStats::identity(2), 20);

    for horizon in [1, 5, 64] {
        let trajectory = predictor.forecast(&raw, horizon).unwrap();
        assert_eq!(trajectory.horizon(), horizon);
        assert_eq!(trajectory.values.dim(), (horizon, 2));
        assert_eq!(trajectory.start, 200);
        assert!(trajectory.feature("theta").is_some());
    }
}

#[test]
fn test_forecast_is_deterministic() {
    let raw = sine_series(200, 25.0, 0.1, 2);
    let predictor = untrained_predictor(NormalizationStats::identity(2), 20);

    let first = predictor.forecast_from(&raw, 30, 40).unwrap();
    predictor.forecast_from(&raw, 90, 40).unwrap();
    let second = predictor.forecast_from(&raw, 30, 40).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_predictions_are_denormalized_with_frozen_stats() {
    let stats = NormalizationStats {
        mean: vec![100.0, -3.0],
        scale: vec![10.0, 0.5],
    };
    let raw = sine_series(60, 25.0, 0.0, 4);
    let predictor = untrained_predictor(stats.clone(), 20);
    let trajectory = predictor.forecast_from(&raw, 10, 6).unwrap();

    let window = raw.values().slice(s![10..30, ..]).to_owned();
    let normalized = stats.normalize(window.view()).unwrap();
    let input = array_to_tensor::<TestBackend>(normalized.view(), &NdArrayDevice::Cpu);
    let raw_output = predictor.model().rollout(input, 6).unwrap().reshape([6, 2]);
    let expected = stats
        .denormalize(tensor_to_array(raw_output).unwrap().view())
        .unwrap();

    for (a, b) in trajectory.values.iter().zip(expected.iter()) {
        assert!((a - b).abs() < 1e-9, "{} vs {}", a, b);
    }
}

#[test]
fn test_window_feature_mismatch_is_shape_error() {
    let predictor = untrained_predictor(NormalizationStats::identity(2), 5);
    let window = Array2::<f64>::zeros((5, 3));
    assert!(matches!(
        predictor.predict_window(window.view(), 4),
        Err(ForecastError::Shape {
            expected: 2,
            actual: 3,
            ..
        })
    ));
}

#[test]
fn test_zero_horizon_is_config_error() {
    let raw = sine_series(40, 25.0, 0.0, 5);
    let predictor = untrained_predictor(NormalizationStats::identity(2), 5);
    assert!(matches!(predictor.forecast(&raw, 0), Err(ForecastError::Config(_))));
}

#[test]
fn test_short_series_is_insufficient_data() {
    let raw = sine_series(10, 25.0, 0.0, 6);
    let predictor = untrained_predictor(NormalizationStats::identity(2), 20);
    assert!(matches!(
        predictor.forecast(&raw, 3),
        Err(ForecastError::InsufficientData {
            required: 20,
            available: 10
        })
    ));
}

#[test]
fn test_compare_aligns_ground_truth() {
    let raw = sine_series(100, 25.0, 0.0, 7);
    let predictor = untrained_predictor(NormalizationStats::identity(2), 20);

    let comparison = predictor.compare(&raw, 10, 15).unwrap();
    let truth = comparison.truth.as_ref().unwrap();
    assert_eq!(truth.dim(), (15, 2));
    assert_eq!(truth.row(0), raw.row(30));
    assert_eq!(comparison.rmse().unwrap().len(), 2);

    // runs past the end of the series
    let comparison = predictor.compare(&raw, 70, 15).unwrap();
    assert!(comparison.truth.is_none());
    assert!(comparison.mse().is_none());

    let mut sink = MemorySink::default();
    sink.write(&comparison).unwrap();
    assert_eq!(sink.forecasts.len(), 1);
}

#[test]
fn test_reordered_columns_are_aligned() {
    let raw = sine_series(80, 25.0, 0.0, 8);
    let swapped = raw.select(&["theta".to_string(), "q".to_string()]).unwrap();
    let predictor = untrained_predictor(NormalizationStats::identity(2), 20);

    let expected = predictor.forecast(&raw, 5).unwrap();
    let actual = predictor.forecast(&swapped, 5).unwrap();
    assert_eq!(expected, actual);
}

#[test]
fn test_restored_checkpoint_predicts_like_trained_model() {
    type TrainBackend = Autodiff<TestBackend>;

    let dir = tempdir().unwrap();
    let raw = sine_series(150, 30.0, 0.02, 9);
    let window = WindowSpec::new(12, 3, 3).unwrap();
    let stats = fit_normalization(&raw, &window).unwrap();
    let windows = make_windows(&raw, &stats, &window).unwrap();
    let profile = DataProfile {
        feature_names: raw.feature_names().to_vec(),
        stats,
        window,
    };

    let config = GruForecasterConfig::new(2)
        .with_hidden_size(6)
        .with_head(ForecastHead::EncoderDecoder);
    let model = config.init::<TrainBackend>(&NdArrayDevice::Cpu).unwrap();
    let trainer = Trainer::<TrainBackend>::new(
        TrainingConfig {
            epochs: 1,
            batch_size: 16,
            ..TrainingConfig::default()
        },
        NdArrayDevice::Cpu,
    )
    .unwrap();
    let mut store = FileCheckpointStore::new(dir.path(), "model");
    let trained = trainer
        .run(model, &windows, None, &profile, &mut TrainingContext::new(), &mut store)
        .unwrap();

    let live = Predictor::new(trained.model.valid(), profile, NdArrayDevice::Cpu).unwrap();
    let restored = Predictor::<TestBackend>::from_checkpoint(&store, NdArrayDevice::Cpu).unwrap();
    assert_eq!(restored.model().config(), config);
    assert_eq!(restored.profile(), live.profile());

    let expected = live.forecast(&raw, 20).unwrap();
    let actual = restored.forecast(&raw, 20).unwrap();
    for (a, b) in expected.values.iter().zip(actual.values.iter()) {
        assert!((a - b).abs() < 1e-9);
    }

    let mismatched = config.with_hidden_size(7);
    assert!(matches!(
        Predictor::<TestBackend>::from_checkpoint_expecting(&store, &mismatched, NdArrayDevice::Cpu),
        Err(ForecastError::CheckpointMismatch(_))
    ));
}
