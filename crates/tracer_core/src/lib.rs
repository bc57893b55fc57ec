//! The `tracer_core` crate integrates magnetic field lines and charged
//! particle trajectories through static magnetic fields.
//!
//! Key components:
//! - **Fields**: the `MagneticField` capability plus analytic fields (uniform,
//!   toroidal, circular coil, scalar potential) and their superposition.
//! - **Integrator**: adaptive Dormand-Prince 5(4) with dense output, or RK4
//!   step doubling when the `high-precision` feature is off.
//! - **Criteria**: iteration-count, level-set and closure stopping criteria.
//! - **Tracing**: guiding-center, full-orbit and field-line drivers that
//!   record crossings of toroidal sampling planes.

pub mod autodiff;
pub mod criteria;
pub mod error;
pub mod events;
pub mod expression;
pub mod field;
pub mod fields;
pub mod integrator;
pub mod interpolation;
pub mod rhs;
pub mod solvers;
pub mod tracing;
pub mod traits;
pub mod types;

pub use criteria::{
    CriterionContext, CriterionSignal, FnStoppingCriterion, IterationStoppingCriterion,
    LevelsetStoppingCriterion, StoppingCriterion,
};
pub use error::{IntegrationError, TracingError};
pub use field::{FieldSample, MagneticField};
pub use fields::{CircularCoil, FieldSum, ScalarPotentialRZField, ToroidalField, UniformField};
pub use integrator::{IntegrationMethod, StepControl};
pub use interpolation::{GridRange, RegularGridInterpolant3D, UniformInterpolationRule};
pub use tracing::{
    compute_fieldlines, fieldline_tracing, particle_fullorbit_tracing,
    particle_guiding_center_tracing, trace_particles_fullorbit, trace_particles_guiding_center,
    GuidingCenterParams, ParticleParams, TraceSettings,
};
pub use types::{Sample, SampleKind, StopReason, TraceResult, TraceStats};

/// Whether the Dormand-Prince dense-output backend is compiled in.
pub fn has_high_precision_backend() -> bool {
    cfg!(feature = "high-precision")
}
