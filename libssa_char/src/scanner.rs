use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use std::sync::mpsc::Sender;
use std::time::Duration;

use super::acquisition::{Acquisition, AcquisitionWindow, SyncedFrame, SynchronizedAcquisition};
use super::baseline::{BaselineCharacterizer, BaselineStats};
use super::calibration::Stimulus;
use super::critical_current::CriticalCurrents;
use super::error::{AcquisitionError, RampError, SignalError, SweepError};
use super::ramp::ramp;
use super::sweep_status::{Phase, SweepStatus};
use super::tower::Actuator;

/// The result of sweeping the SA bias of one column.
///
/// Rows of `vphis` are the aligned, averaged response traces, one per bias point. All rows
/// have the length of one averaged acquisition window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasSweepResult {
    pub dac_sweep: Vec<i32>,
    pub vphis: Array2<f64>,
    pub vmod_max: Array1<f64>,
    pub vmod_min: Array1<f64>,
    /// |max - min| of each trace
    pub vmod_depth: Array1<f64>,
    /// Number of leading bias points that hold data
    pub completed_points: usize,
    /// Written once by the critical current extraction
    pub critical_currents: Option<CriticalCurrents>,
}

impl BiasSweepResult {
    pub fn new(dac_sweep: Vec<i32>, trace_len: usize) -> Self {
        let n_points = dac_sweep.len();
        Self {
            dac_sweep,
            vphis: Array2::zeros((n_points, trace_len)),
            vmod_max: Array1::zeros(n_points),
            vmod_min: Array1::zeros(n_points),
            vmod_depth: Array1::zeros(n_points),
            completed_points: 0,
            critical_currents: None,
        }
    }

    pub fn n_points(&self) -> usize {
        self.dac_sweep.len()
    }

    pub fn is_complete(&self) -> bool {
        self.completed_points == self.n_points()
    }

    /// Store the trace taken at a sweep point along with its modulation
    pub fn record(&mut self, point: usize, trace: ArrayView1<f64>) {
        let max = trace.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let min = trace.iter().cloned().fold(f64::INFINITY, f64::min);
        self.vphis.row_mut(point).assign(&trace);
        self.vmod_max[point] = max;
        self.vmod_min[point] = min;
        self.vmod_depth[point] = (max - min).abs();
        self.completed_points = self.completed_points.max(point + 1);
    }

    /// Standard deviation of each completed trace
    pub fn vphi_std(&self) -> Array1<f64> {
        self.vphis
            .slice(ndarray::s![..self.completed_points, ..])
            .std_axis(Axis(1), 0.0)
    }

    /// Annotate the sweep with its critical currents. Only the first annotation is kept
    pub fn annotate(&mut self, currents: CriticalCurrents) {
        if self.critical_currents.is_none() {
            self.critical_currents = Some(currents);
        } else {
            log::warn!("Critical currents were already extracted for this sweep, keeping the first result");
        }
    }
}

/// A signal integrity fault that removed a column from further analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelFault {
    pub phase: String,
    pub step: Option<usize>,
    pub error: SignalError,
}

/// Everything the scanner produces for one column
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSweep {
    pub column: usize,
    pub sweep: BiasSweepResult,
    pub baseline: Option<BaselineStats>,
    pub fault: Option<ChannelFault>,
}

impl ChannelSweep {
    fn set_fault(&mut self, phase: Phase, step: Option<usize>, error: SignalError) {
        log::warn!(
            "Column {} dropped during {phase}{}: {error}",
            self.column,
            step.map(|s| format!(" at step {s}")).unwrap_or_default()
        );
        if self.fault.is_none() {
            self.fault = Some(ChannelFault {
                phase: phase.to_string(),
                step,
                error,
            });
        }
    }
}

fn mark_applied(applied: &mut [i32], idx: usize, value: i32) {
    if let Some(slot) = applied.get_mut(idx) {
        *slot = value;
    }
}

/// Ramp one channel from the bias it sits at, recording how far it got even on failure
fn ramp_tracked<T: Actuator + ?Sized>(
    tower: &mut T,
    channel: usize,
    applied: &mut [i32],
    idx: usize,
    to: i32,
    step: u32,
) -> Result<i32, RampError> {
    let from = applied.get(idx).copied().unwrap_or(0);
    let result = ramp(tower, channel, from, to, step);
    match &result {
        Ok(at) => mark_applied(applied, idx, *at),
        Err(e) => {
            if let Some(at) = e.last_applied() {
                mark_applied(applied, idx, at);
            }
        }
    }
    result
}

/// Sweeps the SA bias of every selected column and records the Vphi at each point.
///
/// Columns share the tower bus, so at each point every column is ramped in turn and only
/// then is the DAQ read. Bias values are applied strictly in the order given.
#[derive(Debug, Clone)]
pub struct BiasSweepScanner {
    bias_values: Vec<i32>,
    settle_time: Duration,
    window: AcquisitionWindow,
    ramp_step: u32,
    characterizer: BaselineCharacterizer,
}

impl BiasSweepScanner {
    pub fn new(
        bias_values: Vec<i32>,
        settle_time: Duration,
        window: AcquisitionWindow,
        ramp_step: u32,
        characterizer: BaselineCharacterizer,
    ) -> Self {
        Self {
            bias_values,
            settle_time,
            window,
            ramp_step,
            characterizer,
        }
    }

    pub fn bias_values(&self) -> &[i32] {
        &self.bias_values
    }

    /// Fresh, empty sweep records for the given columns
    pub fn prepare(&self, columns: &[usize]) -> Vec<ChannelSweep> {
        columns
            .iter()
            .map(|column| ChannelSweep {
                column: *column,
                sweep: BiasSweepResult::new(self.bias_values.clone(), self.window.points_per_period),
                baseline: None,
                fault: None,
            })
            .collect()
    }

    /// Run the sweep.
    ///
    /// `applied` is the bias each channel currently sits at (same order as `channels`);
    /// channels are ramped down from it before the baseline is taken and it is kept up to
    /// date after every completed ramp. Returns the bias every channel is left at. On a
    /// hardware failure the sweep stops; the points already recorded stay in `channels`
    /// and the sweeps report themselves incomplete.
    pub fn sweep<T: Actuator + ?Sized, D: Acquisition + ?Sized>(
        &self,
        channels: &mut [ChannelSweep],
        applied: &mut [i32],
        tower: &mut T,
        daq: &mut D,
        tx: &Sender<SweepStatus>,
    ) -> Result<i32, SweepError> {
        let acquisition = SynchronizedAcquisition::new(self.window);

        // Zero everything then grab the baseline
        tx.send(SweepStatus::new(0.0, Phase::Baseline, 0))?;
        daq.configure(self.window, Stimulus::Feedback)
            .map_err(|e| SweepError::Baseline(e.into()))?;
        for (idx, channel) in channels.iter().enumerate() {
            ramp_tracked(tower, channel.column, applied, idx, 0, self.ramp_step).map_err(
                |source| SweepError::Zeroing {
                    channel: channel.column,
                    source,
                },
            )?;
        }
        self.settle();
        let frame = acquisition
            .acquire_frame(daq, false)
            .map_err(SweepError::Baseline)?;
        self.record_baselines(channels, &frame)
            .map_err(SweepError::Baseline)?;
        tx.send(SweepStatus::new(1.0, Phase::Baseline, 0))?;

        log::info!(
            "Starting bias sweep of {} points over {} columns",
            self.bias_values.len(),
            channels.len()
        );
        let n_points = self.bias_values.len();
        // Ramps always start from the last applied value
        let last = self.bias_values.iter().enumerate().try_fold(
            0,
            |_, (step, bias)| -> Result<i32, SweepError> {
                for (idx, channel) in channels.iter().enumerate() {
                    ramp_tracked(tower, channel.column, applied, idx, *bias, self.ramp_step)
                        .map_err(|source| {
                            log::error!(
                                "Ramp of column {} failed at sweep step {step}",
                                channel.column
                            );
                            SweepError::Ramp {
                                channel: channel.column,
                                step,
                                source,
                            }
                        })?;
                }
                self.settle();
                let frame = acquisition.acquire_frame(daq, true).map_err(|source| {
                    log::error!("Acquisition failed at sweep step {step}");
                    SweepError::Acquisition { step, source }
                })?;
                self.record_point(channels, step, &frame)
                    .map_err(|source| SweepError::Acquisition { step, source })?;
                tx.send(SweepStatus::new(
                    (step + 1) as f32 / n_points as f32,
                    Phase::BiasSweep,
                    step,
                ))?;
                Ok(*bias)
            },
        )?;
        log::info!("Bias sweep complete, columns left at {last}");
        Ok(last)
    }

    fn settle(&self) {
        if !self.settle_time.is_zero() {
            std::thread::sleep(self.settle_time);
        }
    }

    fn record_baselines(
        &self,
        channels: &mut [ChannelSweep],
        frame: &SyncedFrame,
    ) -> Result<(), AcquisitionError> {
        log::info!("Baseline noise data");
        log::info!("Column | Std Deviation |   Range |  Average | Std/Avg SNR");
        for channel in channels.iter_mut() {
            let waveform = match frame.get(channel.column) {
                Some(Ok(waveform)) => waveform,
                Some(Err(e)) => {
                    channel.set_fault(Phase::Baseline, None, e.clone());
                    continue;
                }
                None => return Err(AcquisitionError::MissingColumn(channel.column)),
            };
            match self
                .characterizer
                .characterize(channel.column, waveform.response.view())
            {
                Ok(stats) => {
                    log::info!(
                        "{:6} | {:13.3} | {:7.2} | {:8.3} | {:11.3}",
                        channel.column,
                        stats.std,
                        stats.range,
                        stats.mean,
                        stats.snr
                    );
                    channel.baseline = Some(stats);
                }
                Err(e) => {
                    log::error!("Column {} has a degenerate baseline", channel.column);
                    channel.set_fault(Phase::Baseline, None, e);
                }
            }
        }
        Ok(())
    }

    fn record_point(
        &self,
        channels: &mut [ChannelSweep],
        step: usize,
        frame: &SyncedFrame,
    ) -> Result<(), AcquisitionError> {
        for channel in channels.iter_mut().filter(|c| c.fault.is_none()) {
            match frame.get(channel.column) {
                Some(Ok(waveform)) => channel.sweep.record(step, waveform.response_trace(0)),
                Some(Err(e)) => channel.set_fault(Phase::BiasSweep, Some(step), e.clone()),
                None => return Err(AcquisitionError::MissingColumn(channel.column)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HardwareError;
    use ndarray::Array4;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::mpsc;

    const POINTS: usize = 16;

    /// Shared state of a fake bench: the response amplitude of each column follows its bias
    #[derive(Default)]
    struct Bench {
        bias: Vec<i32>,
        calls: Vec<(usize, i32)>,
        acquisitions: usize,
        fail_acquisition: Option<usize>,
        flat_column: Option<usize>,
        /// (channel, limit) the tower refuses to go above
        refuse_above: Option<(usize, i32)>,
    }

    struct BenchTower(Rc<RefCell<Bench>>);
    struct BenchDaq(Rc<RefCell<Bench>>);

    impl Actuator for BenchTower {
        fn set_channel_voltage(
            &mut self,
            channel: usize,
            dac_value: i32,
        ) -> Result<(), HardwareError> {
            let mut bench = self.0.borrow_mut();
            if let Some((refused, limit)) = bench.refuse_above {
                if channel == refused && dac_value > limit {
                    return Err(HardwareError::Communication {
                        channel,
                        reason: String::from("no acknowledge"),
                    });
                }
            }
            bench.calls.push((channel, dac_value));
            bench.bias[channel] = dac_value;
            Ok(())
        }
    }

    impl Acquisition for BenchDaq {
        fn fetch_raw_samples(&mut self, min_points: usize) -> Result<Array4<f64>, HardwareError> {
            let mut bench = self.0.borrow_mut();
            if bench.fail_acquisition == Some(bench.acquisitions) {
                return Err(HardwareError::Acquisition(String::from("timeout")));
            }
            bench.acquisitions += 1;
            let bias = bench.bias.clone();
            let flat = bench.flat_column;
            Ok(Array4::from_shape_fn(
                (bias.len(), 2, min_points, 2),
                |(c, _, i, k)| {
                    let phase = (i % POINTS) as f64;
                    if k == 1 {
                        if flat == Some(c) {
                            1.0
                        } else {
                            phase
                        }
                    } else {
                        // noise floor plus modulation growing with bias
                        let noise = if i % 2 == 0 { 0.5 } else { -0.5 };
                        noise + bias[c] as f64 / 100.0 * (phase * 0.7).sin()
                    }
                },
            ))
        }
    }

    fn scanner(values: Vec<i32>) -> BiasSweepScanner {
        BiasSweepScanner::new(
            values,
            Duration::ZERO,
            AcquisitionWindow::new(POINTS, 1),
            256,
            BaselineCharacterizer::new(20.0),
        )
    }

    fn bench(fail_acquisition: Option<usize>, flat_column: Option<usize>) -> Rc<RefCell<Bench>> {
        Rc::new(RefCell::new(Bench {
            bias: vec![0, 0],
            fail_acquisition,
            flat_column,
            ..Default::default()
        }))
    }

    fn run(
        scanner: &BiasSweepScanner,
        channels: &mut [ChannelSweep],
        bench: &Rc<RefCell<Bench>>,
    ) -> Result<i32, SweepError> {
        let (tx, _rx) = mpsc::channel();
        let mut tower = BenchTower(bench.clone());
        let mut daq = BenchDaq(bench.clone());
        let mut applied = [0, 0];
        scanner.sweep(channels, &mut applied, &mut tower, &mut daq, &tx)
    }

    #[test]
    fn test_sweep_records_every_point() {
        let scanner = scanner(vec![0, 300, 600, 900]);
        let mut channels = scanner.prepare(&[0, 1]);
        let bench = bench(None, None);
        let last = run(&scanner, &mut channels, &bench).unwrap();
        assert_eq!(last, 900);
        for channel in channels.iter() {
            assert!(channel.sweep.is_complete());
            assert!(channel.baseline.is_some());
            assert!(channel.fault.is_none());
            assert_eq!(channel.sweep.vphis.dim(), (4, POINTS));
            let depth = &channel.sweep.vmod_depth;
            assert!(depth[3] > depth[2] && depth[2] > depth[1] && depth[1] > depth[0]);
            for i in 0..4 {
                let expected = (channel.sweep.vmod_max[i] - channel.sweep.vmod_min[i]).abs();
                assert_eq!(depth[i], expected);
            }
        }
    }

    #[test]
    fn test_ramps_start_from_previous_value() {
        let scanner = scanner(vec![0, 300, 600]);
        let mut channels = scanner.prepare(&[0, 1]);
        let bench = bench(None, None);
        run(&scanner, &mut channels, &bench).unwrap();
        // zeroing, then one set per channel at 0, then 256/300 and 556/600 per channel
        assert_eq!(
            bench.borrow().calls,
            vec![
                (0, 0),
                (1, 0),
                (0, 0),
                (1, 0),
                (0, 256),
                (0, 300),
                (1, 256),
                (1, 300),
                (0, 556),
                (0, 600),
                (1, 556),
                (1, 600),
            ]
        );
    }

    #[test]
    fn test_acquisition_failure_keeps_partial_results() {
        let scanner = scanner(vec![0, 300, 600, 900]);
        let mut channels = scanner.prepare(&[0, 1]);
        // baseline is acquisition 0, so this fails at sweep step 2
        let bench = bench(Some(3), None);
        let result = run(&scanner, &mut channels, &bench);
        assert!(matches!(result, Err(SweepError::Acquisition { step: 2, .. })));
        for channel in channels.iter() {
            assert!(!channel.sweep.is_complete());
            assert_eq!(channel.sweep.completed_points, 2);
        }
    }

    #[test]
    fn test_applied_bias_follows_the_ramps() {
        let scanner = scanner(vec![0, 300, 600, 900]);
        let mut channels = scanner.prepare(&[0, 1]);
        let bench = bench(Some(3), None);
        let (tx, _rx) = mpsc::channel();
        // Start from a biased state so that zeroing has to ramp down
        bench.borrow_mut().bias = vec![700, 40];
        let mut applied = [700, 40];
        let result = scanner.sweep(
            &mut channels,
            &mut applied,
            &mut BenchTower(bench.clone()),
            &mut BenchDaq(bench.clone()),
            &tx,
        );
        assert!(result.is_err());
        // Step 2 was ramped before its acquisition failed
        assert_eq!(applied, [600, 600]);
        assert_eq!(&bench.borrow().calls[..4], &[(0, 444), (0, 188), (0, 0), (1, 0)]);
    }

    #[test]
    fn test_failed_ramp_records_last_step_reached() {
        let scanner = scanner(vec![0, 600]);
        let mut channels = scanner.prepare(&[0, 1]);
        let bench = bench(None, None);
        bench.borrow_mut().refuse_above = Some((1, 400));
        let (tx, _rx) = mpsc::channel();
        let mut applied = [0, 0];
        let result = scanner.sweep(
            &mut channels,
            &mut applied,
            &mut BenchTower(bench.clone()),
            &mut BenchDaq(bench.clone()),
            &tx,
        );
        assert!(matches!(
            result,
            Err(SweepError::Ramp {
                channel: 1,
                step: 1,
                ..
            })
        ));
        // Column 1 got one step in before the tower refused the next
        assert_eq!(applied, [600, 256]);
        assert_eq!(bench.borrow().bias, vec![600, 256]);

        // A second sweep ramps down from where the hardware really is
        bench.borrow_mut().refuse_above = None;
        bench.borrow_mut().calls.clear();
        let mut channels = scanner.prepare(&[0, 1]);
        scanner
            .sweep(
                &mut channels,
                &mut applied,
                &mut BenchTower(bench.clone()),
                &mut BenchDaq(bench.clone()),
                &tx,
            )
            .unwrap();
        assert_eq!(
            &bench.borrow().calls[..5],
            &[(0, 344), (0, 88), (0, 0), (1, 0), (0, 0)]
        );
    }

    #[test]
    fn test_flat_column_is_dropped_not_fatal() {
        let scanner = scanner(vec![0, 300]);
        let mut channels = scanner.prepare(&[0, 1]);
        let bench = bench(None, Some(1));
        run(&scanner, &mut channels, &bench).unwrap();
        assert!(channels[0].fault.is_none());
        assert!(channels[0].sweep.is_complete());
        let fault = channels[1].fault.as_ref().unwrap();
        assert_eq!(fault.error, SignalError::ConstantSignal { column: 1, row: 0 });
        assert_eq!(channels[1].sweep.completed_points, 0);
    }
}
