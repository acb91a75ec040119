use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};

use super::calibration::CalibrationConstants;
use super::error::SignalError;

const MIN_CROSSINGS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MutualInductanceResult {
    /// Inductance in the reporting unit set by `CalibrationConstants::inductance_scale`
    pub inductance: f64,
    /// Stimulus at the first crossing, in microamps
    pub first_crossing: f64,
    /// Stimulus one flux period later (crossing index 2), in microamps
    pub period_crossing: f64,
}

/// Indices where the mean-centred trace changes sign.
///
/// The index reported is the last sample before the change. A sample exactly on the mean
/// counts as positive so that it is not seen as two crossings.
pub fn zero_crossings(trace: ArrayView1<f64>) -> Vec<usize> {
    let Some(mean) = trace.mean() else {
        return vec![];
    };
    let positive: Vec<bool> = trace.iter().map(|v| *v - mean >= 0.0).collect();
    positive
        .windows(2)
        .enumerate()
        .filter(|(_, pair)| pair[0] != pair[1])
        .map(|(idx, _)| idx)
        .collect()
}

/// Mutual inductance from a Vphi taken with a triangle on one line.
///
/// Crossings 0 and 2 of the response are one full flux quantum apart; the stimulus
/// difference between them is the current that couples one Φ0 into the SQUID.
/// `scale_factor` converts stimulus units to amperes.
pub fn extract_mutual_inductance(
    response: ArrayView1<f64>,
    stimulus: ArrayView1<f64>,
    scale_factor: f64,
    constants: &CalibrationConstants,
) -> Result<MutualInductanceResult, SignalError> {
    if response.is_empty() || stimulus.len() < response.len() {
        return Err(SignalError::EmptyTrace);
    }
    let crossings = zero_crossings(response);
    if crossings.len() < MIN_CROSSINGS {
        return Err(SignalError::InsufficientModulation {
            found: crossings.len(),
        });
    }
    let first = stimulus[crossings[0]];
    let period = stimulus[crossings[2]];
    let delta = period - first;
    if delta == 0.0 {
        return Err(SignalError::ZeroDeviation);
    }
    Ok(MutualInductanceResult {
        inductance: constants.flux_quantum / (delta * scale_factor) * constants.inductance_scale,
        first_crossing: first * scale_factor * constants.current_scale,
        period_crossing: period * scale_factor * constants.current_scale,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;
    use std::f64::consts::PI;

    #[test]
    fn test_crossings_of_square_wave() {
        let trace = Array1::from(vec![1.0, 1.0, -1.0, -1.0, 1.0, 1.0, -1.0]);
        assert_eq!(zero_crossings(trace.view()), vec![1, 3, 5]);
    }

    #[test]
    fn test_sinusoid_matches_hand_computed_value() {
        let period = 100;
        let periods = 3;
        let slope = 2.5;
        let scale_factor = 1.0e-7;
        let response = Array1::from_shape_fn(period * periods, |i| {
            (2.0 * PI * i as f64 / period as f64 + 0.3).sin()
        });
        let stimulus = Array1::from_shape_fn(period * periods, |i| 40.0 + slope * i as f64);
        let constants = CalibrationConstants::default();
        let result =
            extract_mutual_inductance(response.view(), stimulus.view(), scale_factor, &constants)
                .unwrap();

        // One full period of response spans `period` samples of the ramp
        let delta = slope * period as f64;
        let expected = constants.flux_quantum / (delta * scale_factor) * 1.0e18;
        assert!((result.inductance - expected).abs() / expected < 0.01);
        let span = result.period_crossing - result.first_crossing;
        assert!((span - delta * scale_factor * 1.0e6).abs() < 1e-9);
    }

    #[test]
    fn test_monotonic_response_is_insufficient() {
        let response = Array1::from_shape_fn(200, |i| i as f64);
        let stimulus = response.clone();
        let result = extract_mutual_inductance(
            response.view(),
            stimulus.view(),
            1.0,
            &CalibrationConstants::default(),
        );
        assert!(matches!(
            result,
            Err(SignalError::InsufficientModulation { found: 1 })
        ));
    }

    #[test]
    fn test_single_period_is_insufficient() {
        // one full period of response has only two crossings
        let response = Array1::from_shape_fn(100, |i| (2.0 * PI * i as f64 / 100.0 + 0.3).sin());
        let stimulus = Array1::from_shape_fn(100, |i| i as f64);
        assert!(matches!(
            extract_mutual_inductance(
                response.view(),
                stimulus.view(),
                1.0,
                &CalibrationConstants::default()
            ),
            Err(SignalError::InsufficientModulation { .. })
        ));
    }
}
