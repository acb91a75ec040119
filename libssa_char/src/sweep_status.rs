use super::calibration::Stimulus;

/// The measurement phase a status message belongs to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Baseline,
    BiasSweep,
    FeedbackVphi,
    InputVphi,
}

impl Phase {
    /// The fixed bias phase that puts the triangle on the given line
    pub fn for_stimulus(stimulus: Stimulus) -> Self {
        match stimulus {
            Stimulus::Feedback => Self::FeedbackVphi,
            Stimulus::Input => Self::InputVphi,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Baseline => write!(f, "baseline"),
            Self::BiasSweep => write!(f, "bias sweep"),
            Self::FeedbackVphi => write!(f, "Vphi (feedback)"),
            Self::InputVphi => write!(f, "Vphi (input)"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SweepStatus {
    pub progress: f32,
    pub phase: Phase,
    pub step: usize,
}

impl SweepStatus {
    pub fn new(progress: f32, phase: Phase, step: usize) -> Self {
        Self {
            progress,
            phase,
            step,
        }
    }
}
