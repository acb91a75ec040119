use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::acquisition::AcquisitionWindow;
use super::calibration::CalibrationConstants;
use super::column_map::ColumnMap;
use super::error::ConfigError;

pub const SYSTEM_CONFIG_NAME: &str = "system_config.yaml";
pub const SSA_TEST_CONFIG_NAME: &str = "ssa_test_config.yaml";
/// Last place searched for the system config
pub const SYSTEM_CONFIG_FALLBACK: &str = "/etc/system_config.yaml";

/// Largest tri_steps + tri_dwell, a triangle of 2^21 samples
pub const MAX_TRIANGLE_BITS: u32 = 20;

const DEFAULT_SLEW_RATE: u32 = 8;
const DEFAULT_BASELINE_STD_WARNING: f64 = 20.0;

fn default_slew_rate() -> u32 {
    DEFAULT_SLEW_RATE
}

fn default_baseline_std_warning() -> f64 {
    DEFAULT_BASELINE_STD_WARNING
}

fn default_output_path() -> PathBuf {
    PathBuf::from(".")
}

/// Read any YAML config struct from a file
fn read_yaml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::BadFilePath(path.to_path_buf()));
    }
    let yaml_str = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str::<T>(&yaml_str)?)
}

/// Find the system config.
///
/// Precedence is: the explicit path, the current working directory, then /etc.
pub fn locate_system_config(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return if path.exists() {
            Ok(path.to_path_buf())
        } else {
            Err(ConfigError::BadFilePath(path.to_path_buf()))
        };
    }
    [
        PathBuf::from(SYSTEM_CONFIG_NAME),
        PathBuf::from(SYSTEM_CONFIG_FALLBACK),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| ConfigError::NotFound(SYSTEM_CONFIG_NAME.to_string()))
}

/// Find the test config: the explicit path or the current working directory
pub fn locate_test_config(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    let path = explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(SSA_TEST_CONFIG_NAME));
    if path.exists() {
        Ok(path)
    } else if explicit.is_some() {
        Err(ConfigError::BadFilePath(path))
    } else {
        Err(ConfigError::NotFound(SSA_TEST_CONFIG_NAME.to_string()))
    }
}

/// Where the configs of a run were loaded from, kept with the results
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigPaths {
    pub system: Option<PathBuf>,
    pub test: Option<PathBuf>,
}

/// A line driven by a tower card (SA bias, SA feedback or SA input)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TowerLine {
    pub tower_card: String,
    pub tower_col_n: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaqLine {
    pub card: String,
}

/// The wiring of a single column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnEntry {
    #[serde(rename = "SA_Bias")]
    pub sa_bias: TowerLine,
    #[serde(rename = "SA_FB")]
    pub sa_fb: TowerLine,
    #[serde(rename = "SA_Input")]
    pub sa_input: TowerLine,
    #[serde(rename = "DAQ")]
    pub daq: DaqLine,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TowerCard {
    pub addr: u8,
    #[serde(rename = "bias_R")]
    pub bias_r: Vec<f64>,
    pub gain_effective: Vec<f64>,
    pub dac_ref_v: f64,
    pub dac_nbits: u32,
    pub dac_gain: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrateCard {
    pub adc_n_bits: u32,
    pub adc_vin_range: f64,
    pub input_gain: f64,
    pub dac_n_bits: u32,
    pub dac_vout_range: f64,
    pub dac_gain: f64,
}

/// Hardware description of the test system: column wiring and card calibration.
/// Serializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    pub col_map: BTreeMap<String, ColumnEntry>,
    pub tower: BTreeMap<String, TowerCard>,
    #[serde(rename = "crate")]
    pub crate_cards: BTreeMap<String, CrateCard>,
    #[serde(default)]
    pub constants: CalibrationConstants,
}

impl Default for SystemConfig {
    /// A single column system with one card of each kind
    fn default() -> Self {
        let line = |n| TowerLine {
            tower_card: String::from("sa_bias"),
            tower_col_n: n,
        };
        let mut col_map = BTreeMap::new();
        col_map.insert(
            column_key(0),
            ColumnEntry {
                sa_bias: line(0),
                sa_fb: TowerLine {
                    tower_card: String::from("sa_fb"),
                    tower_col_n: 0,
                },
                sa_input: TowerLine {
                    tower_card: String::from("sa_input"),
                    tower_col_n: 0,
                },
                daq: DaqLine {
                    card: String::from("daq0"),
                },
            },
        );
        let card = |addr| TowerCard {
            addr,
            bias_r: vec![10_000.0; 8],
            gain_effective: vec![100.0; 8],
            dac_ref_v: 2.5,
            dac_nbits: 16,
            dac_gain: 1.0,
        };
        let mut tower = BTreeMap::new();
        tower.insert(String::from("sa_bias"), card(3));
        tower.insert(String::from("sa_fb"), card(4));
        tower.insert(String::from("sa_input"), card(5));
        let mut crate_cards = BTreeMap::new();
        crate_cards.insert(
            String::from("daq0"),
            CrateCard {
                adc_n_bits: 14,
                adc_vin_range: 1.0,
                input_gain: 1.0,
                dac_n_bits: 14,
                dac_vout_range: 1.0,
                dac_gain: 1.0,
            },
        );
        Self {
            col_map,
            tower,
            crate_cards,
            constants: CalibrationConstants::default(),
        }
    }
}

/// Key of a column in the system col_map
pub fn column_key(column: usize) -> String {
    format!("col{column}")
}

impl SystemConfig {
    /// Read the system configuration from a YAML file
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        read_yaml(config_path)
    }

    pub fn column(&self, column: usize) -> Result<&ColumnEntry, ConfigError> {
        self.col_map
            .get(&column_key(column))
            .ok_or(ConfigError::MissingColumn(column))
    }

    pub fn tower_card(&self, name: &str) -> Result<&TowerCard, ConfigError> {
        self.tower
            .get(name)
            .ok_or_else(|| ConfigError::MissingCard(name.to_string()))
    }

    pub fn crate_card(&self, name: &str) -> Result<&CrateCard, ConfigError> {
        self.crate_cards
            .get(name)
            .ok_or_else(|| ConfigError::MissingCard(name.to_string()))
    }
}

/// Bookkeeping for the chips under test. Lists are indexed like `test_globals.columns`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestInfo {
    pub user: String,
    pub system: String,
    pub chip_ids: Vec<String>,
    pub chip_flavor: Vec<String>,
    #[serde(rename = "SSA_type")]
    pub ssa_type: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestGlobals {
    pub n_rows: usize,
    pub columns: Vec<usize>,
    pub bias_change_wait_ms: u64,
    /// Ramp step is 2^slew_rate DAC units
    #[serde(default = "default_slew_rate")]
    pub slew_rate: u32,
    #[serde(default = "default_baseline_std_warning")]
    pub baseline_std_warning: f64,
    #[serde(default = "default_output_path")]
    pub output_path: PathBuf,
}

impl TestGlobals {
    pub fn ramp_step(&self) -> u32 {
        1u32.checked_shl(self.slew_rate).unwrap_or(u32::MAX)
    }

    pub fn settle_time(&self) -> Duration {
        Duration::from_millis(self.bias_change_wait_ms)
    }
}

/// Triangle settings of the crate; one triangle lasts 2^tri_steps * 2^tri_dwell * 2 samples
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CrateTriangle {
    pub tri_steps: u32,
    pub tri_dwell: u32,
}

impl CrateTriangle {
    /// None when tri_steps + tri_dwell exceeds MAX_TRIANGLE_BITS
    pub fn points_per_period(&self) -> Option<usize> {
        let bits = self.tri_steps.checked_add(self.tri_dwell)?;
        if bits > MAX_TRIANGLE_BITS {
            return None;
        }
        // plus one because of triangle no sawtooth
        1usize.checked_shl(bits + 1)
    }

    /// The acquisition window of `n_avg` triangles
    pub fn window(&self, n_avg: usize, field: &'static str) -> Result<AcquisitionWindow, ConfigError> {
        let window = self
            .points_per_period()
            .map(|points| AcquisitionWindow::new(points, n_avg))
            .filter(|w| w.points_per_period.checked_mul(w.period_count).is_some());
        window.ok_or_else(|| ConfigError::InvalidValue {
            field,
            reason: format!(
                "a triangle of 2^({} + {} + 1) samples averaged {n_avg} times is too long (tri_steps + tri_dwell must be at most {MAX_TRIANGLE_BITS})",
                self.tri_steps, self.tri_dwell
            ),
        })
    }
}

/// Phase 0.0: SA bias sweep with a triangle on the feedback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasSweepPhase {
    pub bias_sweep_start: i32,
    pub bias_sweep_end: i32,
    pub bias_sweep_npoints: usize,
    pub n_avg: usize,
    pub bias_change_wait_ms: u64,
    pub icmin_pickoff: f64,
    #[serde(rename = "crate")]
    pub triangle: CrateTriangle,
}

impl BiasSweepPhase {
    /// Integer spaced bias values from start to end inclusive, truncated toward zero
    pub fn bias_values(&self) -> Vec<i32> {
        let start = self.bias_sweep_start as f64;
        let end = self.bias_sweep_end as f64;
        match self.bias_sweep_npoints {
            0 => vec![],
            1 => vec![self.bias_sweep_start],
            n => {
                let step = (end - start) / (n - 1) as f64;
                (0..n)
                    .map(|i| {
                        if i == n - 1 {
                            self.bias_sweep_end
                        } else {
                            (start + step * i as f64) as i32
                        }
                    })
                    .collect()
            }
        }
    }

    pub fn settle_time(&self) -> Duration {
        Duration::from_millis(self.bias_change_wait_ms)
    }

    pub fn window(&self) -> Result<AcquisitionWindow, ConfigError> {
        self.triangle.window(self.n_avg, "phase0_0.crate")
    }
}

/// Phases 0.1 and 1.0: hold the bias at Ic_max with a triangle on one line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedBiasPhase {
    pub n_avg: usize,
    pub bias_change_wait_ms: u64,
    #[serde(rename = "crate")]
    pub triangle: CrateTriangle,
}

impl FixedBiasPhase {
    pub fn settle_time(&self) -> Duration {
        Duration::from_millis(self.bias_change_wait_ms)
    }

    pub fn window(&self) -> Result<AcquisitionWindow, ConfigError> {
        self.triangle.window(self.n_avg, "crate")
    }
}

/// Structure representing a test run. Serializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestConfig {
    pub info: TestInfo,
    pub test_globals: TestGlobals,
    pub phase0_0: BiasSweepPhase,
    pub phase0_1: FixedBiasPhase,
    pub phase1_0: FixedBiasPhase,
}

impl Default for TestConfig {
    fn default() -> Self {
        let triangle = CrateTriangle {
            tri_steps: 6,
            tri_dwell: 2,
        };
        let fixed = FixedBiasPhase {
            n_avg: 10,
            bias_change_wait_ms: 100,
            triangle,
        };
        Self {
            info: TestInfo {
                user: String::from(""),
                system: String::from(""),
                chip_ids: vec![String::from("chip0")],
                chip_flavor: vec![String::from("")],
                ssa_type: vec![String::from("")],
            },
            test_globals: TestGlobals {
                n_rows: 1,
                columns: vec![0],
                bias_change_wait_ms: 100,
                slew_rate: DEFAULT_SLEW_RATE,
                baseline_std_warning: DEFAULT_BASELINE_STD_WARNING,
                output_path: default_output_path(),
            },
            phase0_0: BiasSweepPhase {
                bias_sweep_start: 0,
                bias_sweep_end: 20_000,
                bias_sweep_npoints: 100,
                n_avg: 10,
                bias_change_wait_ms: 100,
                icmin_pickoff: 4.0,
                triangle,
            },
            phase0_1: fixed.clone(),
            phase1_0: fixed,
        }
    }
}

impl TestConfig {
    /// Read the test configuration from a YAML file
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        read_yaml(config_path)
    }

    /// Check the test config against the system it will run on.
    ///
    /// Returns the ColumnMap of the selected columns so that nothing downstream
    /// needs to reach into the raw config again.
    pub fn validate(&self, system: &SystemConfig) -> Result<ColumnMap, ConfigError> {
        let columns = &self.test_globals.columns;
        if columns.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "test_globals.columns",
                reason: String::from("no columns selected"),
            });
        }
        for (field, list) in [
            ("info.chip_ids", &self.info.chip_ids),
            ("info.chip_flavor", &self.info.chip_flavor),
            ("info.SSA_type", &self.info.ssa_type),
        ] {
            if list.len() != columns.len() {
                return Err(ConfigError::LengthMismatch {
                    field,
                    expected: columns.len(),
                    actual: list.len(),
                });
            }
        }
        if self.test_globals.n_rows == 0 {
            return Err(ConfigError::InvalidValue {
                field: "test_globals.n_rows",
                reason: String::from("must be at least 1"),
            });
        }

        let sweep = &self.phase0_0;
        if sweep.bias_sweep_npoints == 0 {
            return Err(ConfigError::InvalidValue {
                field: "phase0_0.bias_sweep_npoints",
                reason: String::from("must be at least 1"),
            });
        }
        if sweep.icmin_pickoff <= 0.0 || !sweep.icmin_pickoff.is_finite() {
            return Err(ConfigError::InvalidValue {
                field: "phase0_0.icmin_pickoff",
                reason: format!("{} is not a positive number", sweep.icmin_pickoff),
            });
        }
        for (field, n_avg) in [
            ("phase0_0.n_avg", sweep.n_avg),
            ("phase0_1.n_avg", self.phase0_1.n_avg),
            ("phase1_0.n_avg", self.phase1_0.n_avg),
        ] {
            if n_avg == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: String::from("must be at least 1"),
                });
            }
        }
        sweep.triangle.window(sweep.n_avg, "phase0_0.crate")?;
        self.phase0_1.triangle.window(self.phase0_1.n_avg, "phase0_1.crate")?;
        self.phase1_0.triangle.window(self.phase1_0.n_avg, "phase1_0.crate")?;

        let column_map = ColumnMap::new(system, columns)?;
        for hardware in column_map.iter() {
            let full_scale = hardware.calibration.dac_full_scale();
            for (field, value) in [
                ("phase0_0.bias_sweep_start", sweep.bias_sweep_start),
                ("phase0_0.bias_sweep_end", sweep.bias_sweep_end),
            ] {
                if !(0..=full_scale).contains(&value) {
                    return Err(ConfigError::InvalidValue {
                        field,
                        reason: format!(
                            "{value} is outside the DAC range [0, {full_scale}] of column {}",
                            hardware.column
                        ),
                    });
                }
            }
            if self.test_globals.slew_rate >= hardware.calibration.amp_dac_nbits {
                return Err(ConfigError::InvalidValue {
                    field: "test_globals.slew_rate",
                    reason: format!(
                        "a step of 2^{} exceeds the {} bit DAC of column {}",
                        self.test_globals.slew_rate,
                        hardware.calibration.amp_dac_nbits,
                        hardware.column
                    ),
                });
            }
        }
        Ok(column_map)
    }
}
