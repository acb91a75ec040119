use super::error::RampError;
use super::tower::Actuator;

/// The DAC values visited when ramping a bias from one value to another.
///
/// Every value is exactly one step further than the last in the direction of travel,
/// except the final value which snaps to the target. The starting value itself is not
/// visited; a ramp onto the value it starts from yields only the target.
#[derive(Debug, Clone)]
pub struct RampSteps {
    current: i32,
    target: i32,
    step: i32,
    done: bool,
}

impl RampSteps {
    pub fn new(from_value: i32, to_value: i32, step_magnitude: u32) -> Result<Self, RampError> {
        if step_magnitude == 0 {
            return Err(RampError::ZeroStep);
        }
        let magnitude = i32::try_from(step_magnitude).unwrap_or(i32::MAX);
        let step = if to_value >= from_value {
            magnitude
        } else {
            -magnitude
        };
        Ok(Self {
            current: from_value,
            target: to_value,
            step,
            done: false,
        })
    }
}

impl Iterator for RampSteps {
    type Item = i32;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        // i64 so that a step near the DAC rails cannot overflow
        let next = self.current as i64 + self.step as i64;
        let before_target = if self.step > 0 {
            next < self.target as i64
        } else {
            next > self.target as i64
        };
        if before_target {
            self.current = next as i32;
        } else {
            self.current = self.target;
            self.done = true;
        }
        Some(self.current)
    }
}

/// Ramp the bias of a channel, calling the actuator once per step.
///
/// Respects the slew rate limit of the bias line: the output never jumps by more than
/// `step_magnitude`. An actuator failure aborts the ramp with the bias left at the
/// last value that was applied, which the error carries. Returns the final value, which
/// is always `to_value`.
pub fn ramp<A: Actuator + ?Sized>(
    actuator: &mut A,
    channel: usize,
    from_value: i32,
    to_value: i32,
    step_magnitude: u32,
) -> Result<i32, RampError> {
    log::debug!("Ramping column {channel} from {from_value} to {to_value}");
    let mut last_applied = from_value;
    for value in RampSteps::new(from_value, to_value, step_magnitude)? {
        log::trace!("Setting column {channel} bias to {value}");
        actuator
            .set_channel_voltage(channel, value)
            .map_err(|source| RampError::Hardware {
                last_applied,
                source,
            })?;
        last_applied = value;
    }
    Ok(to_value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HardwareError;

    #[derive(Default)]
    struct RecordingTower {
        calls: Vec<(usize, i32)>,
        fail_after: Option<usize>,
    }

    impl Actuator for RecordingTower {
        fn set_channel_voltage(
            &mut self,
            channel: usize,
            dac_value: i32,
        ) -> Result<(), HardwareError> {
            if self.fail_after == Some(self.calls.len()) {
                return Err(HardwareError::Communication {
                    channel,
                    reason: String::from("no reply"),
                });
            }
            self.calls.push((channel, dac_value));
            Ok(())
        }
    }

    fn values(tower: &RecordingTower) -> Vec<i32> {
        tower.calls.iter().map(|(_, v)| *v).collect()
    }

    #[test]
    fn test_ramp_up_snaps_to_target() {
        let mut tower = RecordingTower::default();
        let end = ramp(&mut tower, 2, 0, 600, 256).unwrap();
        assert_eq!(end, 600);
        assert_eq!(values(&tower), vec![256, 512, 600]);
        assert!(tower.calls.iter().all(|(c, _)| *c == 2));
    }

    #[test]
    fn test_ramp_down() {
        let mut tower = RecordingTower::default();
        ramp(&mut tower, 0, 1000, 100, 256).unwrap();
        assert_eq!(values(&tower), vec![744, 488, 232, 100]);
    }

    #[test]
    fn test_ramp_properties() {
        for (from, to, step) in [
            (0, 20_000, 256),
            (20_000, 0, 256),
            (-300, 7_000, 7),
            (5, 6, 100),
            (65_535, 0, 4096),
            (0, 4096, 256),
        ] {
            let mut tower = RecordingTower::default();
            ramp(&mut tower, 0, from, to, step).unwrap();
            let calls = values(&tower);
            assert_eq!(*calls.last().unwrap(), to);
            let direction = (to - from).signum();
            let mut previous = from;
            for value in calls.iter() {
                assert_eq!((value - previous).signum(), direction);
                previous = *value;
            }
            // All but the final snap move by exactly one step
            for pair in calls[..calls.len() - 1].windows(2) {
                assert_eq!((pair[1] - pair[0]).abs(), step as i32);
            }
            if calls.len() >= 2 {
                let gap = (to - calls[calls.len() - 2]).abs();
                assert!(gap > 0 && gap <= step as i32);
            }
        }
    }

    #[test]
    fn test_final_snap_is_shorter_than_step() {
        let mut tower = RecordingTower::default();
        ramp(&mut tower, 0, 0, 1000, 256).unwrap();
        let calls = values(&tower);
        assert!((1000 - calls[calls.len() - 2]) < 256);
    }

    #[test]
    fn test_noop_ramp_sets_once() {
        let mut tower = RecordingTower::default();
        ramp(&mut tower, 1, 4321, 4321, 256).unwrap();
        assert_eq!(tower.calls, vec![(1, 4321)]);
    }

    #[test]
    fn test_zero_step_rejected() {
        let mut tower = RecordingTower::default();
        assert!(matches!(
            ramp(&mut tower, 0, 0, 10, 0),
            Err(RampError::ZeroStep)
        ));
        assert!(tower.calls.is_empty());
    }

    #[test]
    fn test_failure_aborts_ramp() {
        let mut tower = RecordingTower {
            fail_after: Some(2),
            ..Default::default()
        };
        let result = ramp(&mut tower, 0, 0, 2000, 256);
        assert!(matches!(
            result,
            Err(RampError::Hardware {
                last_applied: 512,
                ..
            })
        ));
        assert_eq!(values(&tower), vec![256, 512]);
    }

    #[test]
    fn test_failure_on_first_step_leaves_start_value() {
        let mut tower = RecordingTower {
            fail_after: Some(0),
            ..Default::default()
        };
        let error = ramp(&mut tower, 0, 3000, 0, 256).unwrap_err();
        assert_eq!(error.last_applied(), Some(3000));
        assert_eq!(RampError::ZeroStep.last_applied(), None);
    }
}
