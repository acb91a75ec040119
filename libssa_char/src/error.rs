use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use super::sweep_status::SweepStatus;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Could not find {0} in any of the searched locations")]
    NotFound(String),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Column {0} is selected for testing but has no entry in the system col_map")]
    MissingColumn(usize),
    #[error("Card {0} is referenced by the col_map but is not defined in the system config")]
    MissingCard(String),
    #[error("Tower card {card} has no calibration for tower column {column}")]
    BadTowerColumn { card: String, column: usize },
    #[error("Config list {field} has {actual} entries but {expected} columns are selected")]
    LengthMismatch {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("Config value {field} is invalid: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Error)]
pub enum HardwareError {
    #[error("Tower communication failed on column {channel}: {reason}")]
    Communication { channel: usize, reason: String },
    #[error("DAQ acquisition failed: {0}")]
    Acquisition(String),
}

#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum SignalError {
    #[error("Stimulus is constant on column {column}, row {row}; phase alignment is impossible")]
    ConstantSignal { column: usize, row: usize },
    #[error("Response completes less than one flux period; found {found} zero crossings, need 4")]
    InsufficientModulation { found: usize },
    #[error("Trace has zero standard deviation; channel is likely disconnected")]
    ZeroDeviation,
    #[error("Trace is empty")]
    EmptyTrace,
}

#[derive(Debug, Error)]
pub enum RampError {
    #[error("Ramp step magnitude must be a positive integer")]
    ZeroStep,
    #[error("Ramp aborted with the bias at {last_applied} due to hardware error: {source}")]
    Hardware {
        last_applied: i32,
        source: HardwareError,
    },
}

impl RampError {
    /// The bias the channel was left at. None if the ramp was rejected before any call
    pub fn last_applied(&self) -> Option<i32> {
        match self {
            Self::Hardware { last_applied, .. } => Some(*last_applied),
            Self::ZeroStep => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("Acquisition failed due to hardware error: {0}")]
    Hardware(#[from] HardwareError),
    #[error("DAQ returned an array of shape {found:?}; expected [columns, rows, >= {min_points}, 2]")]
    BadShape {
        found: Vec<usize>,
        min_points: usize,
    },
    #[error("DAQ returned no data for column {0}")]
    MissingColumn(usize),
    #[error("Acquisition window must contain at least one sample per period and one period")]
    EmptyWindow,
    #[error("Acquisition failed due to signal error: {0}")]
    Signal(#[from] SignalError),
}

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("Sweep aborted while zeroing column {channel}: {source}")]
    Zeroing { channel: usize, source: RampError },
    #[error("Sweep aborted during the baseline acquisition: {0}")]
    Baseline(AcquisitionError),
    #[error("Sweep aborted at step {step} while ramping column {channel}: {source}")]
    Ramp {
        channel: usize,
        step: usize,
        source: RampError,
    },
    #[error("Sweep aborted at step {step} during acquisition: {source}")]
    Acquisition {
        step: usize,
        source: AcquisitionError,
    },
    #[error("Sweep failed to report status: {0}")]
    SendError(#[from] std::sync::mpsc::SendError<SweepStatus>),
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Could not load record as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Record failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Record failed to convert to/from YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Record could not format its timestamp: {0}")]
    TimestampError(#[from] time::error::Format),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session failed due to Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Session failed due to Ramp error on column {channel}: {source}")]
    RampError { channel: usize, source: RampError },
    #[error("Session failed due to Acquisition error: {0}")]
    AcquisitionError(#[from] AcquisitionError),
    #[error("Session failed due to Sweep error: {0}")]
    SweepError(#[from] SweepError),
    #[error("Session failed due to Record error: {0}")]
    RecordError(#[from] RecordError),
    #[error("Session failed due to Send error: {0}")]
    SendError(#[from] std::sync::mpsc::SendError<SweepStatus>),
}
