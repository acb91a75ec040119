use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::baseline::BaselineStats;
use super::calibration::{CalibrationConstants, ChannelCalibration, Stimulus};
use super::config::{ConfigPaths, TestConfig};
use super::critical_current::CriticalCurrents;
use super::error::RecordError;
use super::fixed_bias::FixedBiasTrace;
use super::mutual_inductance::MutualInductanceResult;
use super::scanner::{BiasSweepResult, ChannelFault};

pub const RECORD_EXTENSION: &str = "yml";

/// Timestamp of a test run as used in record file names, local time when available
pub fn timestamp_now() -> Result<String, RecordError> {
    let format = time::macros::format_description!("[year]_[month]_[day]_[hour][minute]");
    let now = time::OffsetDateTime::now_local().unwrap_or_else(|_| time::OffsetDateTime::now_utc());
    Ok(now.format(format)?)
}

/// Who tested which chip, where and when
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestBookkeeping {
    pub chip_id: String,
    pub qa_name: String,
    pub system_name: String,
    pub chip_flavor: String,
    pub ssa_type: String,
    pub timestamp: String,
    pub file_name: String,
    pub channel: usize,
    pub config_paths: ConfigPaths,
}

impl TestBookkeeping {
    /// Bookkeeping of the `idx`th selected column of a validated test config
    pub fn from_config(
        test: &TestConfig,
        idx: usize,
        timestamp: &str,
        config_paths: &ConfigPaths,
    ) -> Self {
        let pick = |list: &Vec<String>| list.get(idx).cloned().unwrap_or_default();
        let chip_id = pick(&test.info.chip_ids);
        let channel = test.test_globals.columns.get(idx).copied().unwrap_or(idx);
        Self {
            file_name: record_file_name(&chip_id, timestamp, channel),
            chip_id,
            qa_name: test.info.user.clone(),
            system_name: test.info.system.clone(),
            chip_flavor: pick(&test.info.chip_flavor),
            ssa_type: pick(&test.info.ssa_type),
            timestamp: timestamp.to_string(),
            channel,
            config_paths: config_paths.clone(),
        }
    }
}

/// `<chip>_<timestamp>_chanNN`
pub fn record_file_name(chip_id: &str, timestamp: &str, channel: usize) -> String {
    format!("{chip_id}_{timestamp}_chan{channel:02}")
}

/// Everything measured on one column during a test run.
///
/// Saved as YAML with serde_yaml; loading a saved record gives back an identical record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub info: TestBookkeeping,
    pub calibration: ChannelCalibration,
    pub constants: CalibrationConstants,
    pub sweep: Option<BiasSweepResult>,
    pub baseline: Option<BaselineStats>,
    pub feedback_vphi: Option<FixedBiasTrace>,
    pub input_vphi: Option<FixedBiasTrace>,
    pub m_fb: Option<MutualInductanceResult>,
    pub m_in: Option<MutualInductanceResult>,
    pub fault: Option<ChannelFault>,
}

impl ChannelRecord {
    pub fn new(
        info: TestBookkeeping,
        calibration: ChannelCalibration,
        constants: CalibrationConstants,
    ) -> Self {
        Self {
            info,
            calibration,
            constants,
            sweep: None,
            baseline: None,
            feedback_vphi: None,
            input_vphi: None,
            m_fb: None,
            m_in: None,
            fault: None,
        }
    }

    pub fn channel(&self) -> usize {
        self.info.channel
    }

    pub fn critical_currents(&self) -> Option<&CriticalCurrents> {
        self.sweep.as_ref().and_then(|s| s.critical_currents.as_ref())
    }

    pub fn fixed_bias(&self, stimulus: Stimulus) -> Option<&FixedBiasTrace> {
        match stimulus {
            Stimulus::Feedback => self.feedback_vphi.as_ref(),
            Stimulus::Input => self.input_vphi.as_ref(),
        }
    }

    pub fn set_fixed_bias(&mut self, trace: Option<FixedBiasTrace>, stimulus: Stimulus) {
        match stimulus {
            Stimulus::Feedback => self.feedback_vphi = trace,
            Stimulus::Input => self.input_vphi = trace,
        }
    }

    pub fn mutual_inductance(&self, stimulus: Stimulus) -> Option<&MutualInductanceResult> {
        match stimulus {
            Stimulus::Feedback => self.m_fb.as_ref(),
            Stimulus::Input => self.m_in.as_ref(),
        }
    }

    pub fn set_mutual_inductance(&mut self, result: Option<MutualInductanceResult>, stimulus: Stimulus) {
        match stimulus {
            Stimulus::Feedback => self.m_fb = result,
            Stimulus::Input => self.m_in = result,
        }
    }

    /// Write the record to `<dir>/<file_name>.yml`, creating the directory if needed
    pub fn save(&self, dir: &Path) -> Result<PathBuf, RecordError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.{RECORD_EXTENSION}", self.info.file_name));
        let yaml_str = serde_yaml::to_string(self)?;
        let mut file = File::create(&path)?;
        file.write_all(yaml_str.as_bytes())?;
        log::info!(
            "Saved column {} to {} ({})",
            self.info.channel,
            path.to_string_lossy(),
            human_bytes::human_bytes(yaml_str.len() as f64)
        );
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self, RecordError> {
        if !path.exists() {
            return Err(RecordError::BadFilePath(path.to_path_buf()));
        }
        let yaml_str = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }
}
