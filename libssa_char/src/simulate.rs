// A software stand-in for the tower and the crate. The tower sets the SA bias of each
// column; the crate plays a triangle on the feedback or input line and reads back
// stimulus and SSA response for every row. Both halves share one model so that the
// response always follows the bias last written by the tower.
use ndarray::Array4;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;
use std::sync::{Arc, Mutex};

use super::acquisition::{Acquisition, AcquisitionWindow, RESPONSE, STIMULUS};
use super::calibration::Stimulus;
use super::error::HardwareError;
use super::tower::Actuator;

/// How the modulation depth of one column depends on its SA bias.
///
/// No modulation up to `onset`, a linear rise to `amplitude` at `peak`, and a linear fall
/// back to zero over the same distance past the peak.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SsaColumnModel {
    pub onset: i32,
    pub peak: i32,
    /// Half of the peak to peak response at `peak`, in ADC counts
    pub amplitude: f64,
    /// DC level of the response in ADC counts
    pub offset: f64,
}

impl SsaColumnModel {
    pub fn new(onset: i32, peak: i32, amplitude: f64) -> Self {
        Self {
            onset,
            peak,
            amplitude,
            offset: 0.0,
        }
    }

    pub fn amplitude_at(&self, bias: i32) -> f64 {
        if bias <= self.onset {
            return 0.0;
        }
        let width = (self.peak - self.onset).max(1) as f64;
        let distance = (bias as i64 - self.peak as i64).abs() as f64;
        (self.amplitude * (1.0 - distance / width)).max(0.0)
    }
}

/// Instrument settings shared by every column
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulationSettings {
    pub n_rows: usize,
    /// Half width of the uniform noise added to each response sample
    pub noise: f64,
    /// Peak to peak triangle height in crate DAC units
    pub stimulus_span: f64,
    /// Crate DAC units per flux quantum on the feedback line
    pub feedback_period: f64,
    /// Crate DAC units per flux quantum on the input line
    pub input_period: f64,
    /// Triangle delay between consecutive rows, in samples
    pub row_delay: usize,
    /// Largest value the SA bias DAC accepts
    pub dac_full_scale: i32,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            n_rows: 2,
            noise: 2.0,
            stimulus_span: 4000.0,
            feedback_period: 1000.0,
            input_period: 1500.0,
            row_delay: 5,
            dac_full_scale: 65535,
        }
    }
}

#[derive(Debug)]
struct SsaModel {
    columns: Vec<SsaColumnModel>,
    settings: SimulationSettings,
    bias: Vec<i32>,
    window: AcquisitionWindow,
    stimulus: Stimulus,
    rng: StdRng,
}

impl SsaModel {
    fn triangle(&self, sample: usize, row: usize) -> f64 {
        let points = self.window.points_per_period.max(2);
        let half = (points / 2) as f64;
        let phase = (sample + points - (row * self.settings.row_delay) % points) % points;
        let height = if phase < points / 2 {
            phase as f64
        } else {
            (points - phase) as f64
        };
        height / half * self.settings.stimulus_span
    }

    fn flux_period(&self) -> f64 {
        match self.stimulus {
            Stimulus::Feedback => self.settings.feedback_period,
            Stimulus::Input => self.settings.input_period,
        }
    }

    fn sample(&mut self, min_points: usize) -> Array4<f64> {
        let shape = (self.columns.len(), self.settings.n_rows, min_points, 2);
        let mut data = Array4::<f64>::zeros(shape);
        let period = self.flux_period();
        for (column, model) in self.columns.iter().enumerate() {
            let amplitude = model.amplitude_at(self.bias[column]);
            for row in 0..self.settings.n_rows {
                for sample in 0..min_points {
                    let stimulus = self.triangle(sample, row);
                    let noise = if self.settings.noise > 0.0 {
                        self.rng.gen_range(-self.settings.noise..self.settings.noise)
                    } else {
                        0.0
                    };
                    data[[column, row, sample, STIMULUS]] = stimulus;
                    data[[column, row, sample, RESPONSE]] =
                        model.offset + amplitude * (2.0 * PI * stimulus / period).sin() + noise;
                }
            }
        }
        data
    }
}

/// A simulated SSA test system. Hand out as many tower and DAQ handles as needed; they
/// all drive the same model.
#[derive(Debug, Clone)]
pub struct SimulatedInstrument {
    model: Arc<Mutex<SsaModel>>,
}

impl SimulatedInstrument {
    /// Columns are indexed by their position in `columns`
    pub fn new(columns: Vec<SsaColumnModel>, settings: SimulationSettings, seed: u64) -> Self {
        let n_columns = columns.len();
        Self {
            model: Arc::new(Mutex::new(SsaModel {
                columns,
                settings,
                bias: vec![0; n_columns],
                window: AcquisitionWindow::new(512, 1),
                stimulus: Stimulus::Feedback,
                rng: StdRng::seed_from_u64(seed),
            })),
        }
    }

    /// Spread the given columns over a bias range: each column starts modulating a little
    /// later than the previous one and peaks two thirds of the way through the range.
    /// Columns that are not listed are present but never modulate.
    pub fn for_sweep(
        columns: &[usize],
        bias_start: i32,
        bias_end: i32,
        settings: SimulationSettings,
        seed: u64,
    ) -> Self {
        let n_columns = columns.iter().max().map(|c| c + 1).unwrap_or(0);
        let span = (bias_end - bias_start) as f64;
        let mut models = vec![SsaColumnModel::new(i32::MAX, i32::MAX, 0.0); n_columns];
        for (idx, column) in columns.iter().enumerate() {
            let onset = bias_start + (span * (0.25 + 0.02 * idx as f64)) as i32;
            let peak = bias_start + (span * (2.0 / 3.0)) as i32;
            models[*column] = SsaColumnModel {
                onset,
                peak,
                amplitude: 500.0 + 50.0 * idx as f64,
                offset: 100.0 * idx as f64,
            };
        }
        Self::new(models, settings, seed)
    }

    pub fn tower(&self) -> SimulatedTower {
        SimulatedTower {
            model: self.model.clone(),
        }
    }

    pub fn daq(&self) -> SimulatedDaq {
        SimulatedDaq {
            model: self.model.clone(),
        }
    }

    /// Current SA bias of a column
    pub fn bias(&self, column: usize) -> Option<i32> {
        self.model
            .lock()
            .ok()
            .and_then(|model| model.bias.get(column).copied())
    }
}

/// The tower half of a SimulatedInstrument
#[derive(Debug, Clone)]
pub struct SimulatedTower {
    model: Arc<Mutex<SsaModel>>,
}

impl Actuator for SimulatedTower {
    fn set_channel_voltage(&mut self, channel: usize, dac_value: i32) -> Result<(), HardwareError> {
        let mut model = self
            .model
            .lock()
            .map_err(|e| HardwareError::Communication {
                channel,
                reason: e.to_string(),
            })?;
        if !(0..=model.settings.dac_full_scale).contains(&dac_value) {
            return Err(HardwareError::Communication {
                channel,
                reason: format!("DAC value {dac_value} is out of range"),
            });
        }
        match model.bias.get_mut(channel) {
            Some(bias) => {
                *bias = dac_value;
                Ok(())
            }
            None => Err(HardwareError::Communication {
                channel,
                reason: String::from("no such column on the tower"),
            }),
        }
    }
}

/// The crate half of a SimulatedInstrument
#[derive(Debug, Clone)]
pub struct SimulatedDaq {
    model: Arc<Mutex<SsaModel>>,
}

impl Acquisition for SimulatedDaq {
    fn fetch_raw_samples(&mut self, min_points: usize) -> Result<Array4<f64>, HardwareError> {
        let mut model = self
            .model
            .lock()
            .map_err(|e| HardwareError::Acquisition(e.to_string()))?;
        Ok(model.sample(min_points))
    }

    fn configure(&mut self, window: AcquisitionWindow, stimulus: Stimulus) -> Result<(), HardwareError> {
        let mut model = self
            .model
            .lock()
            .map_err(|e| HardwareError::Acquisition(e.to_string()))?;
        model.window = window;
        model.stimulus = stimulus;
        Ok(())
    }
}
