//! # ssa_char
//!
//! ssa_char is the SQUID Series Array (SSA) screening tool, written in Rust. It drives the
//! SA bias DACs of a tower crate, takes triangle synchronized Vphi data from the DAQ crate,
//! and extracts the operating parameters of every tested column: the bias window bounded
//! by Ic_min and Ic_max and the mutual inductance of the feedback and input coils.
//!
//! ## Installation
//!
//! The only method of install is from source, which is laid out below.
//!
//! ### Rust
//!
//! If you have not used Rust before, you will most likely need to install the Rust tool
//! chain. See the [Rust docs](https://www.rust-lang.org/tools/install) for installation
//! instructions.
//!
//! ### Building & Install
//!
//! To build and install the CLI use `cargo install --path ./ssa_char_cli` from the top
//! level repository. The binary is installed to your cargo install location (typically
//! something like `~/.cargo/bin/`).
//!
//! ## Test sequence
//!
//! A test run goes through the following phases, each driven by a section of the test
//! config:
//!
//! - Phase 0.0 (`phase0_0`): all columns are zeroed and a baseline is taken. The SA bias
//! of every column is then swept from `bias_sweep_start` to `bias_sweep_end` with a
//! triangle on the feedback. At every point the Vphi, its extremes and its modulation
//! depth are stored. Ic_max is the bias with the deepest modulation; Ic_min is the last
//! bias below Ic_max whose Vphi standard deviation is under `icmin_pickoff` times the
//! baseline standard deviation.
//! - Phase 0.1 (`phase0_1`): every column is held at Ic_max and a Vphi is recorded with the
//! triangle on the feedback.
//! - Phase 1.0 (`phase1_0`): the same with the triangle on the input.
//! - The mutual inductances M_fb and M_in follow from the stimulus spacing of one flux
//! quantum in the two fixed bias Vphis.
//!
//! Bias changes are always ramped in steps of `2^slew_rate` DAC units. Acquisitions are
//! aligned to the minimum of the triangle for every row and averaged over `n_avg`
//! triangle periods.
//!
//! ## Configuration
//!
//! Two YAML files are used. The system config (`system_config.yaml`, searched in the
//! working directory and then `/etc`) describes the hardware:
//!
//! ```yml
//! col_map:
//!   col0:
//!     SA_Bias: { tower_card: sa_bias, tower_col_n: 0 }
//!     SA_FB: { tower_card: sa_fb, tower_col_n: 0 }
//!     SA_Input: { tower_card: sa_input, tower_col_n: 0 }
//!     DAQ: { card: daq0 }
//! tower:
//!   sa_bias: { addr: 3, bias_R: [...], gain_effective: [...], dac_ref_v: 2.5, dac_nbits: 16, dac_gain: 1.0 }
//! crate:
//!   daq0: { adc_n_bits: 14, adc_vin_range: 1.0, input_gain: 1.0, dac_n_bits: 14, dac_vout_range: 1.0, dac_gain: 1.0 }
//! ```
//!
//! The test config (`ssa_test_config.yaml`, searched in the working directory) describes
//! the run: who is testing which chips on which columns, and the settings of every phase.
//! Template files of both can be written with `ssa_char_cli new -p <dir>`.
//!
//! ## Output
//!
//! Every tested column is saved as a YAML record named `<chip>_<YYYY_MM_DD_HHMM>_chanNN.yml`
//! in the configured `output_path`. A record holds the test bookkeeping, the column
//! calibration, the full bias sweep, the baseline, both fixed bias Vphis and the extracted
//! parameters. `ssa_char_cli report` prints a summary table of saved records.
pub mod acquisition;
pub mod baseline;
pub mod calibration;
pub mod column_map;
pub mod config;
pub mod critical_current;
pub mod error;
pub mod fixed_bias;
pub mod mutual_inductance;
pub mod ramp;
pub mod record;
pub mod report;
pub mod scanner;
pub mod session;
pub mod simulate;
pub mod sweep_status;
pub mod tower;
