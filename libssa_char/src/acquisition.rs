use ndarray::{s, Array1, Array2, Array4, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

use super::calibration::Stimulus;
use super::error::{AcquisitionError, HardwareError, SignalError};

/// Index of the response (error) signal on the last axis of a raw DAQ array
pub const RESPONSE: usize = 0;
/// Index of the stimulus (triangle) signal on the last axis of a raw DAQ array
pub const STIMULUS: usize = 1;

/// Something that can deliver raw samples from the DAQ.
///
/// The returned array has axes `[column, row, sample, {response, stimulus}]` and at least
/// `min_points` samples. The call blocks until the data is available.
pub trait Acquisition {
    fn fetch_raw_samples(&mut self, min_points: usize) -> Result<Array4<f64>, HardwareError>;

    /// Set up the crate for the acquisitions of a phase: triangle length, number of
    /// periods and the line carrying the triangle. A DAQ that is configured by hand
    /// can keep the default.
    fn configure(
        &mut self,
        _window: AcquisitionWindow,
        _stimulus: Stimulus,
    ) -> Result<(), HardwareError> {
        Ok(())
    }
}

impl<T: Acquisition + ?Sized> Acquisition for &mut T {
    fn fetch_raw_samples(&mut self, min_points: usize) -> Result<Array4<f64>, HardwareError> {
        (**self).fetch_raw_samples(min_points)
    }

    fn configure(&mut self, window: AcquisitionWindow, stimulus: Stimulus) -> Result<(), HardwareError> {
        (**self).configure(window, stimulus)
    }
}

impl<T: Acquisition + ?Sized> Acquisition for Box<T> {
    fn fetch_raw_samples(&mut self, min_points: usize) -> Result<Array4<f64>, HardwareError> {
        (**self).fetch_raw_samples(min_points)
    }

    fn configure(&mut self, window: AcquisitionWindow, stimulus: Stimulus) -> Result<(), HardwareError> {
        (**self).configure(window, stimulus)
    }
}

/// Size of an acquisition: `period_count` repeats of a `points_per_period` long triangle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionWindow {
    pub points_per_period: usize,
    pub period_count: usize,
}

impl AcquisitionWindow {
    pub fn new(points_per_period: usize, period_count: usize) -> Self {
        Self {
            points_per_period,
            period_count,
        }
    }

    pub fn total_points(&self) -> usize {
        self.points_per_period * self.period_count
    }
}

/// Phase aligned, period averaged data of one column. Axes are `[row, sample]`; a row
/// averaged waveform has a single row.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnWaveform {
    pub stimulus: Array2<f64>,
    pub response: Array2<f64>,
}

impl ColumnWaveform {
    pub fn n_rows(&self) -> usize {
        self.response.nrows()
    }

    pub fn stimulus_trace(&self, row: usize) -> ArrayView1<'_, f64> {
        self.stimulus.row(row)
    }

    pub fn response_trace(&self, row: usize) -> ArrayView1<'_, f64> {
        self.response.row(row)
    }
}

/// One acquisition split by column. Columns whose stimulus could not be aligned carry
/// the signal error instead of data, so one broken column does not hide the others.
#[derive(Debug, Clone)]
pub struct SyncedFrame {
    pub columns: Vec<Result<ColumnWaveform, SignalError>>,
}

impl SyncedFrame {
    pub fn get(&self, column: usize) -> Option<&Result<ColumnWaveform, SignalError>> {
        self.columns.get(column)
    }

    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    /// All columns, or the first signal error found
    pub fn into_checked(self) -> Result<Vec<ColumnWaveform>, SignalError> {
        self.columns.into_iter().collect()
    }
}

/// Takes triangle synchronized data from the DAQ.
///
/// Every row is rotated so that its stimulus starts at the minimum of the first
/// triangle, then repeated periods are averaged.
#[derive(Debug, Clone, Copy)]
pub struct SynchronizedAcquisition {
    window: AcquisitionWindow,
}

impl SynchronizedAcquisition {
    pub fn new(window: AcquisitionWindow) -> Self {
        Self { window }
    }

    pub fn window(&self) -> AcquisitionWindow {
        self.window
    }

    /// Acquire, align and average. Fails with a ConstantSignal error if any row of any
    /// column has a flat stimulus.
    pub fn acquire<D: Acquisition + ?Sized>(
        &self,
        daq: &mut D,
        average_over_rows: bool,
    ) -> Result<Vec<ColumnWaveform>, AcquisitionError> {
        Ok(self.acquire_frame(daq, average_over_rows)?.into_checked()?)
    }

    /// Acquire, align and average, keeping signal errors per column
    pub fn acquire_frame<D: Acquisition + ?Sized>(
        &self,
        daq: &mut D,
        average_over_rows: bool,
    ) -> Result<SyncedFrame, AcquisitionError> {
        if self.window.points_per_period == 0 || self.window.period_count == 0 {
            return Err(AcquisitionError::EmptyWindow);
        }
        let total = self.window.total_points();
        let raw = daq.fetch_raw_samples(total)?;
        let shape = raw.shape();
        if shape[2] < total || shape[3] != 2 {
            return Err(AcquisitionError::BadShape {
                found: shape.to_vec(),
                min_points: total,
            });
        }

        let columns = raw
            .axis_iter(Axis(0))
            .enumerate()
            .map(|(column, rows)| -> Result<ColumnWaveform, SignalError> {
                let n_rows = rows.len_of(Axis(0));
                let mut stimulus = Array2::<f64>::zeros((n_rows, self.window.points_per_period));
                let mut response = stimulus.clone();
                for (row, data) in rows.axis_iter(Axis(0)).enumerate() {
                    let stim = data.slice(s![..total, STIMULUS]);
                    let resp = data.slice(s![..total, RESPONSE]);
                    let shift = self.phase_origin(stim, column, row)?;
                    stimulus
                        .row_mut(row)
                        .assign(&self.average_periods(&roll(stim, shift)));
                    response
                        .row_mut(row)
                        .assign(&self.average_periods(&roll(resp, shift)));
                }
                if average_over_rows {
                    stimulus = mean_rows(&stimulus);
                    response = mean_rows(&response);
                }
                Ok(ColumnWaveform { stimulus, response })
            })
            .collect();

        Ok(SyncedFrame { columns })
    }

    /// Index of the stimulus minimum within the first period
    fn phase_origin(
        &self,
        stimulus: ArrayView1<f64>,
        column: usize,
        row: usize,
    ) -> Result<usize, SignalError> {
        let first = stimulus[0];
        if stimulus.iter().all(|v| *v == first) {
            return Err(SignalError::ConstantSignal { column, row });
        }
        let period = stimulus.slice(s![..self.window.points_per_period]);
        let mut min_idx = 0;
        for (idx, value) in period.iter().enumerate() {
            if *value < period[min_idx] {
                min_idx = idx;
            }
        }
        Ok(min_idx)
    }

    /// Mean over the repeated periods of a trace
    fn average_periods(&self, trace: &Array1<f64>) -> Array1<f64> {
        let points = self.window.points_per_period;
        let mut sum = trace.slice(s![..points]).to_owned();
        for period in 1..self.window.period_count {
            sum += &trace.slice(s![period * points..(period + 1) * points]);
        }
        sum / self.window.period_count as f64
    }
}

/// Circularly rotate a trace so that sample `shift` lands at index 0
fn roll(trace: ArrayView1<f64>, shift: usize) -> Array1<f64> {
    let len = trace.len();
    Array1::from_shape_fn(len, |i| trace[(i + shift) % len])
}

fn mean_rows(data: &Array2<f64>) -> Array2<f64> {
    match data.mean_axis(Axis(0)) {
        Some(mean) => mean.insert_axis(Axis(0)),
        None => data.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A fake DAQ that hands out a prepared array
    struct FixedDaq {
        data: Array4<f64>,
        requested: Vec<usize>,
    }

    impl Acquisition for FixedDaq {
        fn fetch_raw_samples(&mut self, min_points: usize) -> Result<Array4<f64>, HardwareError> {
            self.requested.push(min_points);
            Ok(self.data.clone())
        }
    }

    /// Triangle of period `points` whose minimum is at sample `min_at`
    fn triangle(i: usize, points: usize, min_at: usize) -> f64 {
        let d = (i + points - min_at % points) % points;
        if d < points / 2 {
            d as f64
        } else {
            (points - d) as f64
        }
    }

    fn daq_with<F: Fn(usize, usize, usize, usize) -> f64>(
        columns: usize,
        rows: usize,
        samples: usize,
        f: F,
    ) -> FixedDaq {
        FixedDaq {
            data: Array4::from_shape_fn((columns, rows, samples, 2), |(c, r, i, k)| f(c, r, i, k)),
            requested: vec![],
        }
    }

    #[test]
    fn test_minimum_moves_to_origin_per_row() {
        let points = 16;
        let offsets = [0usize, 3, 7, 12];
        let mut daq = daq_with(2, offsets.len(), points, |_, r, i, k| {
            let tri = triangle(i, points, offsets[r]);
            if k == STIMULUS {
                tri
            } else {
                10.0 * tri
            }
        });
        let acq = SynchronizedAcquisition::new(AcquisitionWindow::new(points, 1));
        let columns = acq.acquire(&mut daq, false).unwrap();
        assert_eq!(daq.requested, vec![points]);
        assert_eq!(columns.len(), 2);
        for waveform in columns.iter() {
            assert_eq!(waveform.n_rows(), offsets.len());
            for row in 0..offsets.len() {
                let stim = waveform.stimulus_trace(row);
                let min = stim.iter().cloned().fold(f64::INFINITY, f64::min);
                assert_eq!(stim[0], min);
                // Response rotated together with the stimulus
                assert_eq!(waveform.response_trace(row)[0], 10.0 * min);
            }
        }
    }

    #[test]
    fn test_constant_stimulus_is_an_error() {
        let points = 8;
        let mut daq = daq_with(2, 3, points, |c, r, i, k| {
            if k == STIMULUS && c == 1 && r == 2 {
                5.0
            } else {
                triangle(i, points, 0)
            }
        });
        let acq = SynchronizedAcquisition::new(AcquisitionWindow::new(points, 1));
        let result = acq.acquire(&mut daq, true);
        assert!(matches!(
            result,
            Err(AcquisitionError::Signal(SignalError::ConstantSignal {
                column: 1,
                row: 2
            }))
        ));

        // The frame keeps the healthy column
        let frame = acq.acquire_frame(&mut daq, true).unwrap();
        assert!(frame.get(0).unwrap().is_ok());
        assert!(frame.get(1).unwrap().is_err());
    }

    #[test]
    fn test_identical_periods_average_to_one_period() {
        let points = 10;
        let periods = 5;
        let mut daq = daq_with(1, 1, points * periods, |_, _, i, k| {
            if k == STIMULUS {
                triangle(i, points, 0)
            } else {
                ((i % points) as f64 * 0.37).sin()
            }
        });
        let acq = SynchronizedAcquisition::new(AcquisitionWindow::new(points, periods));
        let columns = acq.acquire(&mut daq, false).unwrap();
        let response = columns[0].response_trace(0);
        assert_eq!(response.len(), points);
        for (i, value) in response.iter().enumerate() {
            assert!((value - (i as f64 * 0.37).sin()).abs() < 1e-12);
        }
    }

    #[test]
    fn test_alternating_periods_average_to_mean() {
        let points = 8;
        let periods = 4;
        let v = 2.0;
        let mut daq = daq_with(1, 1, points * periods, |_, _, i, k| {
            if k == STIMULUS {
                triangle(i, points, 0)
            } else if (i / points) % 2 == 0 {
                v
            } else {
                2.0 * v
            }
        });
        let acq = SynchronizedAcquisition::new(AcquisitionWindow::new(points, periods));
        let columns = acq.acquire(&mut daq, false).unwrap();
        for value in columns[0].response_trace(0).iter() {
            assert!((value - 1.5 * v).abs() < 1e-12);
        }
    }

    #[test]
    fn test_average_over_rows() {
        let points = 8;
        let mut daq = daq_with(1, 3, points, |_, r, i, k| {
            if k == STIMULUS {
                triangle(i, points, 0)
            } else {
                r as f64
            }
        });
        let acq = SynchronizedAcquisition::new(AcquisitionWindow::new(points, 1));
        let columns = acq.acquire(&mut daq, true).unwrap();
        assert_eq!(columns[0].n_rows(), 1);
        assert!(columns[0].response_trace(0).iter().all(|v| (v - 1.0).abs() < 1e-12));
    }

    #[test]
    fn test_short_data_is_bad_shape() {
        let mut daq = daq_with(1, 1, 4, |_, _, i, _| i as f64);
        let acq = SynchronizedAcquisition::new(AcquisitionWindow::new(8, 1));
        assert!(matches!(
            acq.acquire(&mut daq, false),
            Err(AcquisitionError::BadShape { .. })
        ));
    }
}
