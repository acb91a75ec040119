use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::sync::mpsc::Sender;
use std::time::Duration;

use super::acquisition::{Acquisition, AcquisitionWindow, SynchronizedAcquisition};
use super::calibration::Stimulus;
use super::error::{AcquisitionError, SessionError, SignalError};
use super::ramp::ramp;
use super::sweep_status::{Phase, SweepStatus};
use super::tower::Actuator;

/// A Vphi captured with the SA bias held at Ic_max and a triangle on one line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedBiasTrace {
    pub stimulus: Stimulus,
    pub bias_dac: i32,
    pub stimulus_trace: Array1<f64>,
    pub response_trace: Array1<f64>,
}

/// A column taking part in a fixed bias acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBiasTarget {
    pub column: usize,
    /// Bias to hold the column at, or None to leave it at zero
    pub bias_dac: Option<i32>,
}

/// Outcome for one column of a fixed bias acquisition
#[derive(Debug, Clone, PartialEq)]
pub enum FixedBiasOutcome {
    Captured(FixedBiasTrace),
    Skipped,
    Faulted(SignalError),
}

/// Holds every column at its operating point and records one Vphi per column
#[derive(Debug, Clone, Copy)]
pub struct FixedBiasAcquisition {
    stimulus: Stimulus,
    settle_time: Duration,
    window: AcquisitionWindow,
    ramp_step: u32,
}

impl FixedBiasAcquisition {
    pub fn new(
        stimulus: Stimulus,
        settle_time: Duration,
        window: AcquisitionWindow,
        ramp_step: u32,
    ) -> Self {
        Self {
            stimulus,
            settle_time,
            window,
            ramp_step,
        }
    }

    /// Zero every column, ramp each to its target, settle and acquire with row averaging.
    ///
    /// `applied` follows the bias of each target as in the scanner. Outcomes are returned
    /// in the order of `targets`.
    pub fn run<T: Actuator + ?Sized, D: Acquisition + ?Sized>(
        &self,
        targets: &[FixedBiasTarget],
        applied: &mut [i32],
        tower: &mut T,
        daq: &mut D,
        tx: &Sender<SweepStatus>,
    ) -> Result<Vec<FixedBiasOutcome>, SessionError> {
        let phase = Phase::for_stimulus(self.stimulus);
        tx.send(SweepStatus::new(0.0, phase, 0))?;
        daq.configure(self.window, self.stimulus)
            .map_err(|e| SessionError::AcquisitionError(e.into()))?;

        for (idx, target) in targets.iter().enumerate() {
            self.ramp_column(tower, target.column, 0, applied, idx)?;
        }
        tx.send(SweepStatus::new(0.25, phase, 0))?;

        let mut any_biased = false;
        for (idx, target) in targets.iter().enumerate() {
            match target.bias_dac {
                Some(dac) => {
                    self.ramp_column(tower, target.column, dac, applied, idx)?;
                    any_biased = true;
                }
                None => log::warn!(
                    "Column {} has no Ic_max; it stays at zero for the {phase} acquisition",
                    target.column
                ),
            }
        }
        if !any_biased {
            log::warn!("No column could be biased to Ic_max, skipping the {phase} acquisition");
            tx.send(SweepStatus::new(1.0, phase, 0))?;
            return Ok(vec![FixedBiasOutcome::Skipped; targets.len()]);
        }
        tx.send(SweepStatus::new(0.5, phase, 0))?;

        if !self.settle_time.is_zero() {
            std::thread::sleep(self.settle_time);
        }
        let frame = SynchronizedAcquisition::new(self.window).acquire_frame(daq, true)?;
        tx.send(SweepStatus::new(1.0, phase, 0))?;

        let mut outcomes = Vec::with_capacity(targets.len());
        for target in targets.iter() {
            let Some(bias_dac) = target.bias_dac else {
                outcomes.push(FixedBiasOutcome::Skipped);
                continue;
            };
            let outcome = match frame.get(target.column) {
                Some(Ok(waveform)) => FixedBiasOutcome::Captured(FixedBiasTrace {
                    stimulus: self.stimulus,
                    bias_dac,
                    stimulus_trace: waveform.stimulus_trace(0).to_owned(),
                    response_trace: waveform.response_trace(0).to_owned(),
                }),
                Some(Err(e)) => {
                    log::warn!("Column {} gave no {phase}: {e}", target.column);
                    FixedBiasOutcome::Faulted(e.clone())
                }
                None => {
                    return Err(SessionError::AcquisitionError(
                        AcquisitionError::MissingColumn(target.column),
                    ))
                }
            };
            outcomes.push(outcome);
        }
        log::info!("Finished the {phase} acquisition");
        Ok(outcomes)
    }

    /// Ramp from the tracked bias, keeping `applied` at the last step reached
    fn ramp_column<T: Actuator + ?Sized>(
        &self,
        tower: &mut T,
        column: usize,
        to: i32,
        applied: &mut [i32],
        idx: usize,
    ) -> Result<(), SessionError> {
        let from = applied.get(idx).copied().unwrap_or(0);
        let result = ramp(tower, column, from, to, self.ramp_step);
        let reached = match &result {
            Ok(at) => Some(*at),
            Err(e) => e.last_applied(),
        };
        if let (Some(at), Some(slot)) = (reached, applied.get_mut(idx)) {
            *slot = at;
        }
        result.map(|_| ()).map_err(|source| SessionError::RampError {
            channel: column,
            source,
        })
    }
}
