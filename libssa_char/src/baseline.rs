use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use super::error::SignalError;

/// Noise statistics of a column taken at zero bias
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineStats {
    pub std: f64,
    pub range: f64,
    pub mean: f64,
    /// mean / std
    pub snr: f64,
    /// The `[row, sample]` data the statistics were computed from
    pub trace: Array2<f64>,
}

/// Computes baseline statistics and flags noisy columns
#[derive(Debug, Clone, Copy)]
pub struct BaselineCharacterizer {
    std_warning: f64,
}

impl BaselineCharacterizer {
    pub fn new(std_warning: f64) -> Self {
        Self { std_warning }
    }

    /// Statistics over every sample of every row.
    ///
    /// A zero standard deviation means the channel is broken or disconnected and is
    /// returned as an error rather than an infinite SNR.
    pub fn characterize(
        &self,
        column: usize,
        response: ArrayView2<f64>,
    ) -> Result<BaselineStats, SignalError> {
        if response.is_empty() {
            return Err(SignalError::EmptyTrace);
        }
        let mean = response.mean().ok_or(SignalError::EmptyTrace)?;
        let std = response.std(0.0);
        if std == 0.0 || !std.is_finite() {
            return Err(SignalError::ZeroDeviation);
        }
        let max = response.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let min = response.iter().cloned().fold(f64::INFINITY, f64::min);
        if std > self.std_warning {
            log::warn!(
                "The standard deviation for column {column} is high: {std:.3} (warning level {:.3})",
                self.std_warning
            );
        }
        Ok(BaselineStats {
            std,
            range: max - min,
            mean,
            snr: mean / std,
            trace: response.to_owned(),
        })
    }
}
