use std::fmt;

/// Why the optimizer stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum StopCondition {
    MaximumIterations { iterations: usize },
    Converged { mean_change: f64, threshold: f64 },
    NonDiffeomorphic { iteration: usize },
    UpdateParametersError { reason: String },
}

impl StopCondition {
    pub fn is_error(&self) -> bool {
        matches!(self, StopCondition::UpdateParametersError { .. })
    }

    pub fn description(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for StopCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopCondition::MaximumIterations { iterations } => {
                write!(f, "Maximum number of iterations ({}) reached", iterations)
            }
            StopCondition::Converged {
                mean_change,
                threshold,
            } => write!(
                f,
                "Convergence checker passed: mean change {:.3e} below {:.3e}",
                mean_change, threshold
            ),
            StopCondition::NonDiffeomorphic { iteration } => write!(
                f,
                "Deformation stopped being diffeomorphic at iteration {}",
                iteration
            ),
            StopCondition::UpdateParametersError { reason } => {
                write!(f, "Optimizer error: spectral update failed ({})", reason)
            }
        }
    }
}

/// Snapshot of one optimizer iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationRecord {
    pub iteration: usize,
    /// Convergence value: `ln(1 + mean change)` in lightweight mode, the total energy
    /// otherwise.
    pub value: f64,
    pub mean_change: f64,
    pub is_diffeomorphic: bool,
}
