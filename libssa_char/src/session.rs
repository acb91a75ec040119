use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;

use super::acquisition::Acquisition;
use super::baseline::BaselineCharacterizer;
use super::calibration::Stimulus;
use super::column_map::ColumnMap;
use super::config::{ConfigPaths, SystemConfig, TestConfig};
use super::critical_current::{CriticalCurrentExtractor, Pickoff};
use super::error::SessionError;
use super::fixed_bias::{FixedBiasAcquisition, FixedBiasOutcome, FixedBiasTarget};
use super::mutual_inductance::extract_mutual_inductance;
use super::ramp::ramp;
use super::record::{timestamp_now, ChannelRecord, TestBookkeeping};
use super::scanner::{BiasSweepScanner, ChannelFault, ChannelSweep};
use super::sweep_status::{Phase, SweepStatus};
use super::tower::Actuator;

/// One test run over the selected columns.
///
/// The session owns a record per column and runs the measurement phases against whatever
/// tower and DAQ it is handed. It remembers the bias it last left every column at so
/// each phase can ramp down from there.
#[derive(Debug)]
pub struct Session {
    test: TestConfig,
    column_map: ColumnMap,
    records: Vec<ChannelRecord>,
    applied: Vec<i32>,
}

impl Session {
    /// Validate the configs and set up an empty record per selected column
    pub fn new(
        system: &SystemConfig,
        test: TestConfig,
        config_paths: ConfigPaths,
    ) -> Result<Self, SessionError> {
        let column_map = test.validate(system)?;
        let timestamp = timestamp_now()?;
        let records: Vec<ChannelRecord> = column_map
            .iter()
            .enumerate()
            .map(|(idx, hardware)| {
                ChannelRecord::new(
                    TestBookkeeping::from_config(&test, idx, &timestamp, &config_paths),
                    hardware.calibration.clone(),
                    system.constants,
                )
            })
            .collect();
        log::info!(
            "Session {timestamp} set up for columns {:?}",
            test.test_globals.columns
        );
        let applied = vec![0; records.len()];
        Ok(Self {
            test,
            column_map,
            records,
            applied,
        })
    }

    pub fn records(&self) -> &[ChannelRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<ChannelRecord> {
        self.records
    }

    pub fn column_map(&self) -> &ColumnMap {
        &self.column_map
    }

    /// The bias each column was last left at, in column order
    pub fn applied_bias(&self) -> &[i32] {
        &self.applied
    }

    fn columns(&self) -> Vec<usize> {
        self.records.iter().map(|r| r.channel()).collect()
    }

    /// Phase 0.0: sweep the SA bias then pick Ic_min and Ic_max of every column.
    ///
    /// If the sweep is cut short by a hardware error the points taken so far are still
    /// stored and analysed before the error is returned.
    pub fn bias_sweep<T: Actuator + ?Sized, D: Acquisition + ?Sized>(
        &mut self,
        tower: &mut T,
        daq: &mut D,
        tx: &Sender<SweepStatus>,
    ) -> Result<(), SessionError> {
        let globals = &self.test.test_globals;
        let phase = &self.test.phase0_0;
        let scanner = BiasSweepScanner::new(
            phase.bias_values(),
            phase.settle_time(),
            phase.window()?,
            globals.ramp_step(),
            BaselineCharacterizer::new(globals.baseline_std_warning),
        );
        let mut channels = scanner.prepare(&self.columns());
        let result = scanner.sweep(&mut channels, &mut self.applied, tower, daq, tx);
        if let Err(e) = &result {
            log::error!("{e}");
            log::warn!("Keeping the partial bias sweep for inspection");
        }
        self.store_sweeps(channels);
        self.calculate_ics();
        result?;
        Ok(())
    }

    /// A new sweep starts every column over: faults and fixed bias results of an earlier
    /// sweep no longer apply.
    fn store_sweeps(&mut self, channels: Vec<ChannelSweep>) {
        for (record, channel) in self.records.iter_mut().zip(channels) {
            record.sweep = Some(channel.sweep);
            record.baseline = channel.baseline;
            record.fault = channel.fault;
            for stimulus in [Stimulus::Feedback, Stimulus::Input] {
                record.set_fixed_bias(None, stimulus);
                record.set_mutual_inductance(None, stimulus);
            }
        }
    }

    fn calculate_ics(&mut self) {
        let pickoff = self.test.phase0_0.icmin_pickoff;
        log::info!("Critical currents");
        log::info!("Column | Ic_max idx | Ic_min idx | Ic_max DAC | Ic_min DAC");
        for record in self.records.iter_mut() {
            let extractor =
                CriticalCurrentExtractor::new(pickoff, record.calibration.dac_full_scale());
            let Some(sweep) = record.sweep.as_mut() else {
                continue;
            };
            let currents = match (&record.baseline, &record.fault) {
                (Some(baseline), None) => extractor.extract(sweep, baseline),
                _ => extractor.not_found(),
            };
            let index = |p: Pickoff| p.index().map(|i| i.to_string()).unwrap_or_default();
            log::info!(
                "{:6} | {:>10} | {:>10} | {:10} | {:10}",
                record.info.channel,
                index(currents.ic_max),
                index(currents.ic_min),
                currents.ic_max_dac,
                currents.ic_min_dac
            );
            if currents.ic_max == Pickoff::NotFound {
                log::warn!(
                    "Column {}: Ic_max not found, the sweep may not reach far enough",
                    record.info.channel
                );
            }
            if currents.ic_min == Pickoff::NotFound {
                log::warn!(
                    "Column {}: Ic_min not found, no quiet point below Ic_max",
                    record.info.channel
                );
            }
            sweep.annotate(currents);
        }
    }

    /// Phases 0.1 (feedback) and 1.0 (input): hold each column at Ic_max and store its Vphi.
    ///
    /// Columns without an Ic_max stay at zero and get no trace.
    pub fn fixed_bias<T: Actuator + ?Sized, D: Acquisition + ?Sized>(
        &mut self,
        stimulus: Stimulus,
        tower: &mut T,
        daq: &mut D,
        tx: &Sender<SweepStatus>,
    ) -> Result<(), SessionError> {
        let phase = match stimulus {
            Stimulus::Feedback => &self.test.phase0_1,
            Stimulus::Input => &self.test.phase1_0,
        };
        log::info!("Bias to Ic_max and save Vphi with the triangle on the {stimulus}");
        let acquisition = FixedBiasAcquisition::new(
            stimulus,
            phase.settle_time(),
            phase.window()?,
            self.test.test_globals.ramp_step(),
        );
        let targets: Vec<FixedBiasTarget> = self
            .records
            .iter()
            .map(|record| FixedBiasTarget {
                column: record.channel(),
                bias_dac: match record.critical_currents().map(|c| c.ic_max) {
                    Some(Pickoff::Found { dac, .. }) => Some(dac),
                    _ => None,
                },
            })
            .collect();
        let outcomes = acquisition.run(&targets, &mut self.applied, tower, daq, tx)?;
        for (record, outcome) in self.records.iter_mut().zip(outcomes) {
            let trace = match outcome {
                FixedBiasOutcome::Captured(trace) => Some(trace),
                FixedBiasOutcome::Skipped => None,
                FixedBiasOutcome::Faulted(error) => {
                    if record.fault.is_none() {
                        record.fault = Some(ChannelFault {
                            phase: Phase::for_stimulus(stimulus).to_string(),
                            step: None,
                            error,
                        });
                    }
                    None
                }
            };
            record.set_fixed_bias(trace, stimulus);
        }
        Ok(())
    }

    /// Mutual inductance of every stored fixed bias trace. Columns whose trace does not
    /// modulate enough get no result.
    pub fn mutual_inductances(&mut self) {
        for record in self.records.iter_mut() {
            for stimulus in [Stimulus::Feedback, Stimulus::Input] {
                let Some(trace) = record.fixed_bias(stimulus) else {
                    continue;
                };
                let scale_factor = record.calibration.stimulus_scale_factor(stimulus);
                let result = match extract_mutual_inductance(
                    trace.response_trace.view(),
                    trace.stimulus_trace.view(),
                    scale_factor,
                    &record.constants,
                ) {
                    Ok(m) => {
                        log::info!(
                            "Column {} M_{stimulus} = {:.3} pH (crossings at {:.3} uA and {:.3} uA)",
                            record.info.channel,
                            m.inductance,
                            m.first_crossing,
                            m.period_crossing
                        );
                        Some(m)
                    }
                    Err(e) => {
                        log::warn!(
                            "Column {} has no {stimulus} mutual inductance: {e}",
                            record.info.channel
                        );
                        None
                    }
                };
                record.set_mutual_inductance(result, stimulus);
            }
        }
    }

    /// Ramp every column back to zero
    pub fn zero_everything<T: Actuator + ?Sized>(&mut self, tower: &mut T) -> Result<(), SessionError> {
        let step = self.test.test_globals.ramp_step();
        for (record, applied) in self.records.iter().zip(self.applied.iter_mut()) {
            match ramp(tower, record.channel(), *applied, 0, step) {
                Ok(at) => *applied = at,
                Err(source) => {
                    if let Some(at) = source.last_applied() {
                        *applied = at;
                    }
                    return Err(SessionError::RampError {
                        channel: record.channel(),
                        source,
                    });
                }
            }
        }
        log::info!("All columns zeroed");
        Ok(())
    }

    /// Save every record to `dir`
    pub fn save(&self, dir: &Path) -> Result<Vec<PathBuf>, SessionError> {
        let mut paths = Vec::with_capacity(self.records.len());
        for record in self.records.iter() {
            paths.push(record.save(dir)?);
        }
        Ok(paths)
    }
}

fn run_phases<T: Actuator + ?Sized, D: Acquisition + ?Sized>(
    session: &mut Session,
    tower: &mut T,
    daq: &mut D,
    tx: &Sender<SweepStatus>,
) -> Result<(), SessionError> {
    session.bias_sweep(tower, daq, tx)?;
    session.fixed_bias(Stimulus::Feedback, tower, daq, tx)?;
    session.fixed_bias(Stimulus::Input, tower, daq, tx)?;
    session.mutual_inductances();
    session.zero_everything(tower)
}

/// Run every phase of a test in order and save the records to the configured output path.
///
/// This is the function to hand to a worker thread; progress arrives on `tx`. Records are
/// saved even when a phase fails, and the phase error is returned afterwards.
pub fn run_all<T: Actuator + ?Sized, D: Acquisition + ?Sized>(
    mut session: Session,
    tower: &mut T,
    daq: &mut D,
    tx: &Sender<SweepStatus>,
) -> Result<Vec<PathBuf>, SessionError> {
    let output = session.test.test_globals.output_path.clone();
    let outcome = run_phases(&mut session, tower, daq, tx);
    let paths = session.save(&output)?;
    outcome?;
    log::info!("Saved {} records to {}", paths.len(), output.to_string_lossy());
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulate::{SimulatedInstrument, SimulationSettings, SsaColumnModel};
    use std::sync::mpsc;

    fn setup() -> (Session, SimulatedInstrument) {
        let mut system = SystemConfig::default();
        let mut col1 = system.col_map["col0"].clone();
        col1.sa_bias.tower_col_n = 1;
        col1.sa_fb.tower_col_n = 1;
        col1.sa_input.tower_col_n = 1;
        system.col_map.insert(String::from("col1"), col1);

        let mut test = TestConfig::default();
        test.test_globals.columns = vec![0, 1];
        test.test_globals.bias_change_wait_ms = 0;
        test.info.chip_ids = vec![String::from("chipA"), String::from("chipB")];
        test.info.chip_flavor = vec![String::new(); 2];
        test.info.ssa_type = vec![String::new(); 2];
        test.phase0_0.bias_sweep_start = 0;
        test.phase0_0.bias_sweep_end = 9000;
        test.phase0_0.bias_sweep_npoints = 10;
        test.phase0_0.bias_change_wait_ms = 0;
        test.phase0_0.n_avg = 2;
        test.phase0_1.bias_change_wait_ms = 0;
        test.phase1_0.bias_change_wait_ms = 0;

        let session = Session::new(&system, test, ConfigPaths::default()).unwrap();
        // column 1 peaks far beyond the end of the sweep
        let instrument = SimulatedInstrument::new(
            vec![
                SsaColumnModel::new(3000, 6000, 800.0),
                SsaColumnModel::new(5000, 20_000, 800.0),
            ],
            SimulationSettings {
                noise: 1.0,
                ..Default::default()
            },
            7,
        );
        (session, instrument)
    }

    #[test]
    fn test_phases_fill_the_records() {
        let (mut session, instrument) = setup();
        let (tx, rx) = mpsc::channel();
        let mut tower = instrument.tower();
        let mut daq = instrument.daq();
        session.bias_sweep(&mut tower, &mut daq, &tx).unwrap();
        assert_eq!(session.applied_bias(), &[9000, 9000]);

        let good = session.records()[0].critical_currents().unwrap();
        assert_eq!(good.ic_max, Pickoff::Found { index: 6, dac: 6000 });
        assert_eq!(good.ic_min, Pickoff::Found { index: 3, dac: 3000 });
        let short = session.records()[1].critical_currents().unwrap();
        assert_eq!(short.ic_max, Pickoff::NotFound);
        assert_eq!(short.ic_max_dac, 0);
        assert_eq!(short.ic_min_dac, 65535);

        session
            .fixed_bias(Stimulus::Feedback, &mut tower, &mut daq, &tx)
            .unwrap();
        assert_eq!(instrument.bias(0), Some(6000));
        assert_eq!(instrument.bias(1), Some(0));
        assert!(session.records()[0].feedback_vphi.is_some());
        assert!(session.records()[1].feedback_vphi.is_none());

        session.mutual_inductances();
        assert!(session.records()[0].m_fb.is_some());
        assert!(session.records()[0].m_in.is_none());

        session.zero_everything(&mut tower).unwrap();
        assert_eq!(instrument.bias(0), Some(0));
        assert!(rx.try_iter().any(|s| s.phase == Phase::FeedbackVphi));
    }

    /// Flattens the stimulus of one column while `flat` is set
    struct FlatDaq<D> {
        inner: D,
        flat: Option<usize>,
    }

    impl<D: Acquisition> Acquisition for FlatDaq<D> {
        fn fetch_raw_samples(
            &mut self,
            min_points: usize,
        ) -> Result<ndarray::Array4<f64>, crate::error::HardwareError> {
            let mut data = self.inner.fetch_raw_samples(min_points)?;
            if let Some(column) = self.flat {
                data.slice_mut(ndarray::s![column, .., .., crate::acquisition::STIMULUS])
                    .fill(1.0);
            }
            Ok(data)
        }

        fn configure(
            &mut self,
            window: crate::acquisition::AcquisitionWindow,
            stimulus: Stimulus,
        ) -> Result<(), crate::error::HardwareError> {
            self.inner.configure(window, stimulus)
        }
    }

    #[test]
    fn test_repeated_sweep_clears_old_fault() {
        let (mut session, instrument) = setup();
        let (tx, _rx) = mpsc::channel();
        let mut tower = instrument.tower();
        let mut daq = FlatDaq {
            inner: instrument.daq(),
            flat: Some(0),
        };
        session.bias_sweep(&mut tower, &mut daq, &tx).unwrap();
        assert!(session.records()[0].fault.is_some());
        let faulted = session.records()[0].critical_currents().unwrap();
        assert_eq!(faulted.ic_max, Pickoff::NotFound);

        // The column is healthy the second time around
        daq.flat = None;
        session.bias_sweep(&mut tower, &mut daq, &tx).unwrap();
        let record = &session.records()[0];
        assert!(record.fault.is_none());
        let currents = record.critical_currents().unwrap();
        assert_eq!(currents.ic_max, Pickoff::Found { index: 6, dac: 6000 });
        assert_eq!(currents.ic_min, Pickoff::Found { index: 3, dac: 3000 });
    }

    #[test]
    fn test_run_all_saves_records() {
        let (mut session, instrument) = setup();
        let dir = std::env::temp_dir().join("libssa_char_session_test");
        session.test.test_globals.output_path = dir.clone();
        let (tx, _rx) = mpsc::channel();
        let paths = run_all(session, &mut instrument.tower(), &mut instrument.daq(), &tx).unwrap();
        assert_eq!(paths.len(), 2);
        for path in paths.iter() {
            let record = ChannelRecord::load(path).unwrap();
            assert!(record.sweep.unwrap().is_complete());
            std::fs::remove_file(path).unwrap();
        }
    }
}
