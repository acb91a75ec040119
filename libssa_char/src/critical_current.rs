use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};

use super::baseline::BaselineStats;
use super::scanner::BiasSweepResult;

/// Outcome of picking a bias point off a sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Pickoff {
    Found { index: usize, dac: i32 },
    NotFound,
}

impl Pickoff {
    pub fn index(&self) -> Option<usize> {
        match self {
            Self::Found { index, .. } => Some(*index),
            Self::NotFound => None,
        }
    }

    pub fn dac_or(&self, sentinel: i32) -> i32 {
        match self {
            Self::Found { dac, .. } => *dac,
            Self::NotFound => sentinel,
        }
    }

    fn at(index: Option<usize>, dac_sweep: &[i32]) -> Self {
        match index.and_then(|i| dac_sweep.get(i).map(|dac| (i, *dac))) {
            Some((index, dac)) => Self::Found { index, dac },
            None => Self::NotFound,
        }
    }
}

/// Ic_min and Ic_max of a column, with the sentinel DAC values applied.
///
/// Ic_max not found is reported as DAC 0, Ic_min not found as DAC full scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriticalCurrents {
    pub ic_min: Pickoff,
    pub ic_max: Pickoff,
    pub ic_min_dac: i32,
    pub ic_max_dac: i32,
}

/// Index of the largest modulation depth.
///
/// None if the series is empty or the maximum sits on the final point: the sweep did not
/// reach far enough to see the peak.
pub fn ic_max_index(vmod_depth: ArrayView1<f64>) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (idx, value) in vmod_depth.iter().enumerate() {
        if value.is_nan() {
            continue;
        }
        match best {
            Some(b) if *value <= vmod_depth[b] => (),
            _ => best = Some(idx),
        }
    }
    best.filter(|idx| *idx + 1 < vmod_depth.len())
}

/// Last index at or below `ic_max_index` whose trace std is still under `threshold`.
///
/// Noise can poke above the threshold before modulation really starts, so the last quiet
/// point is taken rather than the first loud one.
pub fn ic_min_index(vphi_std: ArrayView1<f64>, ic_max_index: usize, threshold: f64) -> Option<usize> {
    vphi_std
        .iter()
        .enumerate()
        .take(ic_max_index + 1)
        .filter(|(_, std)| **std < threshold)
        .map(|(idx, _)| idx)
        .last()
}

/// Picks Ic_min and Ic_max off a bias sweep
#[derive(Debug, Clone, Copy)]
pub struct CriticalCurrentExtractor {
    pickoff_multiplier: f64,
    dac_full_scale: i32,
}

impl CriticalCurrentExtractor {
    pub fn new(pickoff_multiplier: f64, dac_full_scale: i32) -> Self {
        Self {
            pickoff_multiplier,
            dac_full_scale,
        }
    }

    /// Only the completed points of the sweep are considered
    pub fn extract(&self, sweep: &BiasSweepResult, baseline: &BaselineStats) -> CriticalCurrents {
        let n = sweep.completed_points;
        let dac_sweep = &sweep.dac_sweep[..n.min(sweep.dac_sweep.len())];
        let max_idx = ic_max_index(sweep.vmod_depth.slice(ndarray::s![..n]));
        let threshold = baseline.std * self.pickoff_multiplier;
        let min_idx = max_idx.and_then(|m| ic_min_index(sweep.vphi_std().view(), m, threshold));
        self.currents(
            Pickoff::at(min_idx, dac_sweep),
            Pickoff::at(max_idx, dac_sweep),
        )
    }

    /// The result for a column that could not be analysed
    pub fn not_found(&self) -> CriticalCurrents {
        self.currents(Pickoff::NotFound, Pickoff::NotFound)
    }

    fn currents(&self, ic_min: Pickoff, ic_max: Pickoff) -> CriticalCurrents {
        CriticalCurrents {
            ic_min,
            ic_max,
            ic_min_dac: ic_min.dac_or(self.dac_full_scale),
            ic_max_dac: ic_max.dac_or(0),
        }
    }
}
