//! Stopping criteria evaluated by the tracing drivers after every accepted step.
//!
//! A criterion is immutable configuration. Anything that changes along a
//! trajectory (the step counter, the previous level-set value) is owned by the
//! driver for the duration of one call, so a single criterion instance can be
//! shared by any number of concurrent traces.

use crate::error::TracingError;
use crate::interpolation::RegularGridInterpolant3D;
use nalgebra::Vector3;
use std::f64::consts::TAU;
use std::sync::Arc;

/// What a criterion sees when it is evaluated.
#[derive(Debug, Clone, Copy)]
pub struct CriterionContext<'a> {
    /// Number of accepted steps so far in the current trace.
    pub iteration: usize,
    pub t: f64,
    pub state: &'a [f64],
}

impl CriterionContext<'_> {
    pub fn position(&self) -> Vector3<f64> {
        Vector3::new(self.state[0], self.state[1], self.state[2])
    }
}

/// Result of evaluating a criterion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CriterionSignal {
    Continue,
    /// Stop at the end of the current step.
    Stop,
    /// Scalar signal; the trace stops where it crosses zero from non-negative
    /// to negative, localized inside the step.
    Level(f64),
}

pub trait StoppingCriterion: Send + Sync {
    fn evaluate(&self, ctx: &CriterionContext) -> CriterionSignal;

    /// Short label used in log output.
    fn name(&self) -> &str {
        "custom"
    }
}

/// Stops once the trace has taken `max_iterations` accepted steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationStoppingCriterion {
    max_iterations: usize,
}

impl IterationStoppingCriterion {
    pub fn new(max_iterations: usize) -> Result<Self, TracingError> {
        if max_iterations == 0 {
            return Err(TracingError::InvalidCriterion(
                "iteration limit must be a positive integer".to_string(),
            ));
        }
        Ok(Self { max_iterations })
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }
}

impl StoppingCriterion for IterationStoppingCriterion {
    fn evaluate(&self, ctx: &CriterionContext) -> CriterionSignal {
        if ctx.iteration >= self.max_iterations {
            CriterionSignal::Stop
        } else {
            CriterionSignal::Continue
        }
    }

    fn name(&self) -> &str {
        "iteration"
    }
}

/// Stops where a level-set function of `(r, phi, z)` drops below zero.
///
/// The position is mapped to cylindrical coordinates with `phi` in
/// `[0, 2*pi)`. Points outside the interpolation grid count as outside the
/// level set (signal `-inf`).
///
/// The trace is localised where the interpolated value crosses zero, so the
/// level at the stop point is close to zero only when the crossing lies
/// inside the grid. Leaving the grid jumps from a finite value to `-inf`;
/// the stop is then placed at the grid boundary and the level there may be
/// far from zero.
#[derive(Debug, Clone)]
pub struct LevelsetStoppingCriterion {
    interpolant: Arc<RegularGridInterpolant3D>,
}

impl LevelsetStoppingCriterion {
    pub fn new(interpolant: Arc<RegularGridInterpolant3D>) -> Self {
        Self { interpolant }
    }

    /// For hosts that hold the interpolant behind an optional handle.
    pub fn from_shared(
        interpolant: Option<Arc<RegularGridInterpolant3D>>,
    ) -> Result<Self, TracingError> {
        interpolant.map(Self::new).ok_or_else(|| {
            let message = "level-set criterion requires an interpolant";
            TracingError::InvalidCriterion(message.to_string())
        })
    }

    pub fn interpolant(&self) -> &RegularGridInterpolant3D {
        &self.interpolant
    }

    pub fn level(&self, xyz: &Vector3<f64>) -> f64 {
        let r = xyz[0].hypot(xyz[1]);
        let phi = xyz[1].atan2(xyz[0]).rem_euclid(TAU);
        self.interpolant
            .evaluate(r, phi, xyz[2])
            .unwrap_or(f64::NEG_INFINITY)
    }
}

impl StoppingCriterion for LevelsetStoppingCriterion {
    fn evaluate(&self, ctx: &CriterionContext) -> CriterionSignal {
        CriterionSignal::Level(self.level(&ctx.position()))
    }

    fn name(&self) -> &str {
        "levelset"
    }
}

/// Adapts a closure into a criterion.
pub struct FnStoppingCriterion<F> {
    name: String,
    f: F,
}

impl<F> FnStoppingCriterion<F>
where
    F: Fn(&CriterionContext) -> CriterionSignal + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> StoppingCriterion for FnStoppingCriterion<F>
where
    F: Fn(&CriterionContext) -> CriterionSignal + Send + Sync,
{
    fn evaluate(&self, ctx: &CriterionContext) -> CriterionSignal {
        (self.f)(ctx)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpolation::{GridRange, UniformInterpolationRule};

    fn ctx(iteration: usize, state: &[f64]) -> CriterionContext<'_> {
        CriterionContext {
            iteration,
            t: 0.0,
            state,
        }
    }

    fn disk() -> Arc<RegularGridInterpolant3D> {
        Arc::new(
            RegularGridInterpolant3D::from_fn(
                UniformInterpolationRule::new(2).unwrap(),
                GridRange::new(0.0, 2.0, 4),
                GridRange::new(0.0, TAU, 4),
                GridRange::new(-1.0, 1.0, 2),
                |r, _, _| 1.0 - r,
            )
            .unwrap(),
        )
    }

    #[test]
    fn iteration_criterion_fires_at_its_limit() {
        let criterion = IterationStoppingCriterion::new(3).unwrap();
        let state = [0.0; 3];
        assert_eq!(criterion.evaluate(&ctx(2, &state)), CriterionSignal::Continue);
        assert_eq!(criterion.evaluate(&ctx(3, &state)), CriterionSignal::Stop);
        assert_eq!(criterion.name(), "iteration");
    }

    #[test]
    fn iteration_criterion_rejects_zero() {
        let err = IterationStoppingCriterion::new(0).unwrap_err();
        assert!(matches!(err, TracingError::InvalidCriterion(_)));
    }

    #[test]
    fn levelset_maps_negative_angles_and_outside_points() {
        let criterion = LevelsetStoppingCriterion::new(disk());
        // phi = -pi/2 is mapped to 3*pi/2, well inside the grid.
        let inside = [0.0, -0.25, 0.0];
        match criterion.evaluate(&ctx(0, &inside)) {
            CriterionSignal::Level(v) => assert!((v - 0.75).abs() < 1e-12),
            other => panic!("unexpected signal {other:?}"),
        }
        let outside = [3.0, 0.0, 0.0];
        assert_eq!(
            criterion.evaluate(&ctx(0, &outside)),
            CriterionSignal::Level(f64::NEG_INFINITY)
        );
    }

    #[test]
    fn levelset_requires_an_interpolant() {
        assert!(LevelsetStoppingCriterion::from_shared(None).is_err());
        assert!(LevelsetStoppingCriterion::from_shared(Some(disk())).is_ok());
    }

    #[test]
    fn closure_criterion_sees_the_context() {
        let criterion = FnStoppingCriterion::new("below-plane", |ctx: &CriterionContext| {
            CriterionSignal::Level(ctx.state[2])
        });
        let state = [0.0, 0.0, -0.5];
        assert_eq!(
            criterion.evaluate(&ctx(7, &state)),
            CriterionSignal::Level(-0.5)
        );
        assert_eq!(criterion.name(), "below-plane");
    }
}
