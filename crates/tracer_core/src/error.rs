use thiserror::Error;

/// Input problems detected before any integration work starts.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TracingError {
    #[error("tmax must be positive and finite, got {0}")]
    InvalidTmax(f64),

    #[error("tolerance must be positive and finite, got {0}")]
    InvalidTolerance(f64),

    #[error("mass must be positive and finite, got {0}")]
    InvalidMass(f64),

    #[error("charge must be non-zero and finite, got {0}")]
    InvalidCharge(f64),

    #[error("invalid speed: {0}")]
    InvalidSpeed(String),

    #[error("invalid sampling planes: {0}")]
    InvalidPhis(String),

    #[error("initial {name} must be finite, got {value:?}")]
    NonFiniteInitialState { name: &'static str, value: [f64; 3] },

    #[error("magnetic field vanishes or is not finite at the initial position {0:?}")]
    DegenerateField([f64; 3]),

    #[error("invalid stopping criterion: {0}")]
    InvalidCriterion(String),

    #[error("invalid settings: {0}")]
    InvalidSettings(String),
}

/// Reasons the adaptive integrator gives up on a step.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IntegrationError {
    #[error("step size {h:e} fell below the minimum at t = {t}")]
    StepSizeTooSmall { t: f64, h: f64 },

    #[error("{attempts} consecutive step rejections at t = {t} (last error ratio {error:e})")]
    TooManyRejections { t: f64, attempts: usize, error: f64 },
}
