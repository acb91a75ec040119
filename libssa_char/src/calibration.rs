use serde::{Deserialize, Serialize};

use super::config::{CrateCard, TowerCard};

/// Magnetic flux quantum in webers
pub const FLUX_QUANTUM: f64 = 2.06783383e-15;

/// Physical constants and reporting scales used by the extractors
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConstants {
    pub flux_quantum: f64,
    /// Scale applied to inductances before reporting
    pub inductance_scale: f64,
    /// Amperes to microamps
    pub current_scale: f64,
}

impl Default for CalibrationConstants {
    fn default() -> Self {
        Self {
            flux_quantum: FLUX_QUANTUM,
            inductance_scale: 1.0e18,
            current_scale: 1.0e6,
        }
    }
}

/// The line a triangle stimulus is applied on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stimulus {
    Feedback,
    Input,
}

impl std::fmt::Display for Stimulus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Feedback => write!(f, "feedback"),
            Self::Input => write!(f, "input"),
        }
    }
}

/// Number of codes of an n bit converter
fn codes(nbits: u32) -> f64 {
    2f64.powi(nbits.min(i32::MAX as u32) as i32)
}

/// Per-column conversion factors copied out of the system config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelCalibration {
    // Pre-amp with SA bias DAC
    pub amp_bias_r: f64,
    pub amp_gain: f64,
    pub amp_dac_vref: f64,
    pub amp_dac_nbits: u32,
    pub amp_dac_gain: f64,
    pub fb_bias_r: f64,
    pub in_bias_r: f64,
    // Crate ADC
    pub daq_adc_nbits: u32,
    pub daq_adc_vrange: f64,
    pub daq_adc_gain: f64,
    // Crate DAC, drives the triangles
    pub daq_dac_nbits: u32,
    pub daq_dac_vrange: f64,
    pub daq_dac_gain: f64,
}

impl ChannelCalibration {
    /// Assemble the calibration of one column from its cards.
    ///
    /// Tower column indices must already be checked against the card lists.
    pub fn from_cards(
        bias_card: &TowerCard,
        bias_column: usize,
        fb_card: &TowerCard,
        fb_column: usize,
        input_card: &TowerCard,
        input_column: usize,
        daq_card: &CrateCard,
    ) -> Self {
        Self {
            amp_bias_r: bias_card.bias_r[bias_column],
            amp_gain: bias_card.gain_effective[bias_column],
            amp_dac_vref: bias_card.dac_ref_v,
            amp_dac_nbits: bias_card.dac_nbits,
            amp_dac_gain: bias_card.dac_gain,
            fb_bias_r: fb_card.bias_r[fb_column],
            in_bias_r: input_card.bias_r[input_column],
            daq_adc_nbits: daq_card.adc_n_bits,
            daq_adc_vrange: daq_card.adc_vin_range,
            daq_adc_gain: daq_card.input_gain,
            daq_dac_nbits: daq_card.dac_n_bits,
            daq_dac_vrange: daq_card.dac_vout_range,
            daq_dac_gain: daq_card.dac_gain,
        }
    }

    /// Largest value the SA bias DAC accepts, saturating at i32::MAX
    pub fn dac_full_scale(&self) -> i32 {
        1i32.checked_shl(self.amp_dac_nbits)
            .map_or(i32::MAX, |range| range.wrapping_sub(1))
    }

    pub fn bias_dac_to_volts(&self, dac_value: i32) -> f64 {
        dac_value as f64 / codes(self.amp_dac_nbits) * self.amp_dac_vref * self.amp_dac_gain
    }

    pub fn bias_dac_to_microamps(&self, dac_value: i32, constants: &CalibrationConstants) -> f64 {
        self.bias_dac_to_volts(dac_value) / self.amp_bias_r * constants.current_scale
    }

    /// ADC counts to millivolts referred to the SSA output
    pub fn adc_to_millivolts(&self, counts: f64) -> f64 {
        counts * self.daq_adc_vrange / codes(self.daq_adc_nbits)
            / (self.daq_adc_gain * self.amp_gain)
            * 1.0e3
    }

    /// Amperes per crate DAC unit on the given stimulus line
    pub fn stimulus_scale_factor(&self, stimulus: Stimulus) -> f64 {
        let resistance = match stimulus {
            Stimulus::Feedback => self.fb_bias_r,
            Stimulus::Input => self.in_bias_r,
        };
        self.daq_dac_vrange * self.daq_dac_gain / codes(self.daq_dac_nbits) / resistance
    }
}
