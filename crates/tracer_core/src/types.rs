//! Result types returned by the tracing drivers.

use serde::{Deserialize, Serialize};

/// Counters collected by the adaptive integrator over one trace.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TraceStats {
    pub accepted_steps: usize,
    pub rejected_steps: usize,
    pub rhs_evaluations: usize,
}

/// Why a sample was recorded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind")]
pub enum SampleKind {
    Initial,
    /// The trajectory crossed the sampling plane with this index in `phis`.
    PlaneCrossing { plane: usize },
    Final,
}

/// A single recorded point of a trajectory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sample {
    pub t: f64,
    /// `[x, y, z]` for field lines, `[x, y, z, v_par]` for guiding centers and
    /// `[x, y, z, vx, vy, vz]` for full orbits.
    pub state: Vec<f64>,
    pub kind: SampleKind,
}

impl Sample {
    pub fn position(&self) -> [f64; 3] {
        [self.state[0], self.state[1], self.state[2]]
    }
}

/// Termination code of a trace.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "reason")]
pub enum StopReason {
    MaxTime,
    /// The stopping criterion at this position of the caller's list fired.
    Criterion { index: usize },
    /// The configured `max_steps` budget ran out.
    MaxIterations,
    /// The integrator could not meet the tolerance.
    NumericalFailure,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceResult {
    /// Initial sample, plane crossings in time order, final sample.
    pub trajectory: Vec<Sample>,
    pub stop_reason: StopReason,
    pub stats: TraceStats,
    /// Integrator message when `stop_reason` is `NumericalFailure`.
    #[serde(default)]
    pub failure: Option<String>,
}

impl TraceResult {
    pub fn initial(&self) -> &Sample {
        &self.trajectory[0]
    }

    /// Last recorded sample. Equals the initial sample only when the very
    /// first step failed.
    pub fn last(&self) -> &Sample {
        &self.trajectory[self.trajectory.len() - 1]
    }

    /// Plane crossings as `(plane index, sample)` pairs.
    pub fn phi_hits(&self) -> impl Iterator<Item = (usize, &Sample)> {
        self.trajectory.iter().filter_map(|sample| match sample.kind {
            SampleKind::PlaneCrossing { plane } => Some((plane, sample)),
            _ => None,
        })
    }

    pub fn times(&self) -> Vec<f64> {
        self.trajectory.iter().map(|sample| sample.t).collect()
    }
}
