// External imports
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;

// Internal imports
use crate::gru::step_1_sequence_dataset::RawSeries;

/// Two-feature periodic series: a heat-flux-like signal and a phase-shifted
/// temperature-like signal, with a little seeded noise
pub fn sine_series(len: usize, period: f64, noise: f64, seed: u64) -> RawSeries {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut values = Array2::zeros((len, 2));
    for t in 0..len {
        let phase = 2.0 * PI * t as f64 / period;
        values[[t, 0]] = 3.0 + 2.0 * phase.sin() + noise * (rng.random::<f64>() - 0.5);
        values[[t, 1]] = -1.0 + 0.5 * (phase + 0.7).cos() + noise * (rng.random::<f64>() - 0.5);
    }
    RawSeries::new(vec!["q".to_string(), "theta".to_string()], values)
        .expect("two names for two columns")
}

/// Single-feature noiseless sine wave
pub fn univariate_sine(len: usize, period: f64) -> RawSeries {
    let rows: Vec<Vec<f64>> = (0..len)
        .map(|t| vec![(2.0 * PI * t as f64 / period).sin()])
        .collect();
    RawSeries::from_rows(vec!["q".to_string()], &rows).expect("one name for one column")
}
