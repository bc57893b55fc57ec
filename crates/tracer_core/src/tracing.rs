//! Field-line, guiding-center and full-orbit tracing.
//!
//! All three drivers share one loop: advance the adaptive integrator by one
//! accepted step, evaluate the stopping criteria in caller order, localise the
//! first trigger and every sampling-plane crossing on the dense output of that
//! step, and append the samples in time order.

use crate::criteria::{CriterionContext, CriterionSignal, StoppingCriterion};
use crate::error::TracingError;
use crate::events::{refine_crossing, wrap_angle, PlaneTracker, RefineTolerance};
use crate::field::MagneticField;
use crate::integrator::{AdaptiveIntegrator, IntegrationMethod, StepControl};
use crate::rhs::{FieldlineRhs, FullorbitRhs, GuidingCenterRhs};
#[cfg(feature = "high-precision")]
use crate::solvers::DormandPrince54;
use crate::solvers::{EmbeddedKernel, Rk4Doubling};
use crate::traits::DynamicalSystem;
use crate::types::{Sample, SampleKind, StopReason, TraceResult};
use nalgebra::Vector3;
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;

/// Dense-output probes per step used to follow the toroidal angle.
const ANGLE_PROBES: usize = 4;

/// Integration settings shared by all drivers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TraceSettings {
    /// End of the integration interval `[0, tmax]`.
    pub tmax: f64,
    /// Absolute and relative tolerance of the integrator; also sets the
    /// precision of crossing localisation.
    pub tol: f64,
    /// Toroidal angles in `[0, 2*pi)`, strictly increasing, at which samples
    /// are recorded.
    pub phis: Vec<f64>,
    /// Budget of accepted steps before the trace ends with
    /// `StopReason::MaxIterations`.
    pub max_steps: usize,
    pub method: IntegrationMethod,
    pub initial_step: Option<f64>,
    pub step_control: StepControl,
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            tmax: 1.0,
            tol: 1e-9,
            phis: Vec::new(),
            max_steps: 10_000_000,
            method: IntegrationMethod::default(),
            initial_step: None,
            step_control: StepControl::default(),
        }
    }
}

impl TraceSettings {
    pub fn new(tmax: f64, tol: f64) -> Self {
        Self {
            tmax,
            tol,
            ..Self::default()
        }
    }

    pub fn with_phis(mut self, phis: impl Into<Vec<f64>>) -> Self {
        self.phis = phis.into();
        self
    }

    pub fn with_method(mut self, method: IntegrationMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn validate(&self) -> Result<(), TracingError> {
        if !(self.tmax > 0.0 && self.tmax.is_finite()) {
            return Err(TracingError::InvalidTmax(self.tmax));
        }
        if !(self.tol > 0.0 && self.tol.is_finite()) {
            return Err(TracingError::InvalidTolerance(self.tol));
        }
        if let Some(phi) = self.phis.iter().find(|phi| !(**phi >= 0.0 && **phi < TAU)) {
            return Err(TracingError::InvalidPhis(format!(
                "angles must lie in [0, 2*pi), got {phi}"
            )));
        }
        if self.phis.windows(2).any(|w| w[0] >= w[1]) {
            return Err(TracingError::InvalidPhis(format!(
                "angles must be strictly increasing, got {:?}",
                self.phis
            )));
        }
        if self.max_steps == 0 {
            return Err(TracingError::InvalidSettings(
                "max_steps must be at least 1".to_string(),
            ));
        }
        if !self.method.is_available() {
            return Err(TracingError::InvalidSettings(format!(
                "{:?} is not compiled in (enable the `high-precision` feature)",
                self.method
            )));
        }
        if let Some(h) = self.initial_step {
            if !(h > 0.0 && h.is_finite()) {
                return Err(TracingError::InvalidSettings(format!(
                    "initial_step must be positive and finite, got {h}"
                )));
            }
        }
        self.step_control
            .validate()
            .map_err(TracingError::InvalidSettings)
    }
}

/// Mass and charge of a traced particle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ParticleParams {
    pub mass: f64,
    pub charge: f64,
}

impl ParticleParams {
    pub fn new(mass: f64, charge: f64) -> Self {
        Self { mass, charge }
    }

    pub fn validate(&self) -> Result<(), TracingError> {
        if !(self.mass > 0.0 && self.mass.is_finite()) {
            return Err(TracingError::InvalidMass(self.mass));
        }
        if self.charge == 0.0 || !self.charge.is_finite() {
            return Err(TracingError::InvalidCharge(self.charge));
        }
        Ok(())
    }
}

/// Physical parameters of a guiding-center trace.
///
/// `vtang` is the initial velocity component along `B`; the perpendicular
/// part `sqrt(vtotal^2 - vtang^2)` fixes the magnetic moment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GuidingCenterParams {
    pub mass: f64,
    pub charge: f64,
    pub vtotal: f64,
    pub vtang: f64,
    /// Drop the `(curl B)_perp` drift term, exact for vacuum fields.
    pub vacuum: bool,
}

impl GuidingCenterParams {
    pub fn new(mass: f64, charge: f64, vtotal: f64, vtang: f64, vacuum: bool) -> Self {
        Self {
            mass,
            charge,
            vtotal,
            vtang,
            vacuum,
        }
    }

    pub fn with_vtang(mut self, vtang: f64) -> Self {
        self.vtang = vtang;
        self
    }

    pub fn validate(&self) -> Result<(), TracingError> {
        ParticleParams::new(self.mass, self.charge).validate()?;
        if !(self.vtotal > 0.0 && self.vtotal.is_finite()) {
            return Err(TracingError::InvalidSpeed(format!(
                "vtotal must be positive and finite, got {}",
                self.vtotal
            )));
        }
        if !self.vtang.is_finite() || self.vtang.abs() > self.vtotal {
            return Err(TracingError::InvalidSpeed(format!(
                "|vtang| must not exceed vtotal = {}, got {}",
                self.vtotal, self.vtang
            )));
        }
        Ok(())
    }
}

/// Traces the guiding center of a charged particle.
///
/// The state is `[x, y, z, v_par]` with `v_par(0) = vtang`.
pub fn particle_guiding_center_tracing(
    field: &dyn MagneticField,
    xyz_init: [f64; 3],
    params: &GuidingCenterParams,
    settings: &TraceSettings,
    criteria: &[&dyn StoppingCriterion],
) -> Result<TraceResult, TracingError> {
    settings.validate()?;
    params.validate()?;
    check_finite("position", xyz_init)?;

    let b0 = field.b(&Vector3::from(xyz_init), 0.0);
    let abs_b0 = b0.norm();
    if !(abs_b0 > 0.0 && abs_b0.is_finite()) {
        return Err(TracingError::DegenerateField(xyz_init));
    }
    let v_perp2 = params.vtotal * params.vtotal - params.vtang * params.vtang;
    let mu = v_perp2 / (2.0 * abs_b0);

    let rhs = GuidingCenterRhs::new(field, params.mass, params.charge, mu, params.vacuum);
    let y0 = [xyz_init[0], xyz_init[1], xyz_init[2], params.vtang];
    Ok(run("guiding-center", &rhs, &y0, settings, criteria))
}

/// Traces the full gyration orbit of a charged particle.
///
/// The state is `[x, y, z, vx, vy, vz]`.
pub fn particle_fullorbit_tracing(
    field: &dyn MagneticField,
    xyz_init: [f64; 3],
    v_init: [f64; 3],
    params: &ParticleParams,
    settings: &TraceSettings,
    criteria: &[&dyn StoppingCriterion],
) -> Result<TraceResult, TracingError> {
    settings.validate()?;
    params.validate()?;
    check_finite("position", xyz_init)?;
    check_finite("velocity", v_init)?;
    check_field(field, xyz_init)?;

    let rhs = FullorbitRhs::new(field, params.mass, params.charge);
    let y0 = [
        xyz_init[0],
        xyz_init[1],
        xyz_init[2],
        v_init[0],
        v_init[1],
        v_init[2],
    ];
    Ok(run("full-orbit", &rhs, &y0, settings, criteria))
}

/// Traces the field line through `xyz_init`, parametrised so that
/// `dx/dt = B(x)`.
pub fn fieldline_tracing(
    field: &dyn MagneticField,
    xyz_init: [f64; 3],
    settings: &TraceSettings,
    criteria: &[&dyn StoppingCriterion],
) -> Result<TraceResult, TracingError> {
    settings.validate()?;
    check_finite("position", xyz_init)?;
    check_field(field, xyz_init)?;

    let rhs = FieldlineRhs::new(field);
    Ok(run("field-line", &rhs, &xyz_init, settings, criteria))
}

/// Field lines starting at `(r0[i], 0, z0[i])`.
pub fn compute_fieldlines(
    field: &dyn MagneticField,
    r0: &[f64],
    z0: &[f64],
    settings: &TraceSettings,
    criteria: &[&dyn StoppingCriterion],
) -> Result<Vec<TraceResult>, TracingError> {
    if r0.len() != z0.len() {
        return Err(TracingError::InvalidSettings(format!(
            "r0 and z0 must have the same length, got {} and {}",
            r0.len(),
            z0.len()
        )));
    }
    let starts: Vec<[f64; 3]> = r0.iter().zip(z0).map(|(&r, &z)| [r, 0.0, z]).collect();
    map_traces(&starts, |&xyz| fieldline_tracing(field, xyz, settings, criteria))
}

/// Guiding-center traces sharing every parameter except the start point and
/// the initial parallel speed.
pub fn trace_particles_guiding_center(
    field: &dyn MagneticField,
    xyz_inits: &[[f64; 3]],
    vtangs: &[f64],
    params: &GuidingCenterParams,
    settings: &TraceSettings,
    criteria: &[&dyn StoppingCriterion],
) -> Result<Vec<TraceResult>, TracingError> {
    if xyz_inits.len() != vtangs.len() {
        return Err(TracingError::InvalidSettings(format!(
            "expected one vtang per particle, got {} positions and {} speeds",
            xyz_inits.len(),
            vtangs.len()
        )));
    }
    let inputs: Vec<([f64; 3], f64)> = xyz_inits
        .iter()
        .copied()
        .zip(vtangs.iter().copied())
        .collect();
    map_traces(&inputs, |&(xyz, vtang)| {
        particle_guiding_center_tracing(field, xyz, &params.with_vtang(vtang), settings, criteria)
    })
}

/// Full-orbit traces sharing mass, charge and settings.
pub fn trace_particles_fullorbit(
    field: &dyn MagneticField,
    xyz_inits: &[[f64; 3]],
    v_inits: &[[f64; 3]],
    params: &ParticleParams,
    settings: &TraceSettings,
    criteria: &[&dyn StoppingCriterion],
) -> Result<Vec<TraceResult>, TracingError> {
    if xyz_inits.len() != v_inits.len() {
        return Err(TracingError::InvalidSettings(format!(
            "expected one velocity per particle, got {} positions and {} velocities",
            xyz_inits.len(),
            v_inits.len()
        )));
    }
    let inputs: Vec<([f64; 3], [f64; 3])> =
        xyz_inits.iter().copied().zip(v_inits.iter().copied()).collect();
    map_traces(&inputs, |&(xyz, v)| {
        particle_fullorbit_tracing(field, xyz, v, params, settings, criteria)
    })
}

fn map_traces<T, F>(inputs: &[T], trace: F) -> Result<Vec<TraceResult>, TracingError>
where
    T: Sync,
    F: Fn(&T) -> Result<TraceResult, TracingError> + Sync + Send,
{
    #[cfg(feature = "parallel")]
    let results = inputs.par_iter().map(trace).collect();
    #[cfg(not(feature = "parallel"))]
    let results = inputs.iter().map(trace).collect();
    results
}

fn check_finite(name: &'static str, value: [f64; 3]) -> Result<(), TracingError> {
    if value.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(TracingError::NonFiniteInitialState { name, value })
    }
}

fn check_field(field: &dyn MagneticField, xyz: [f64; 3]) -> Result<(), TracingError> {
    let b = field.b(&Vector3::from(xyz), 0.0);
    if b.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(TracingError::DegenerateField(xyz))
    }
}

fn run<S: DynamicalSystem>(
    label: &str,
    system: &S,
    y0: &[f64],
    settings: &TraceSettings,
    criteria: &[&dyn StoppingCriterion],
) -> TraceResult {
    let dim = system.dimension();
    match settings.method {
        #[cfg(feature = "high-precision")]
        IntegrationMethod::DormandPrince54 => {
            drive(label, system, DormandPrince54::new(dim), y0, settings, criteria)
        }
        // Rejected by `TraceSettings::validate` before we get here.
        #[cfg(not(feature = "high-precision"))]
        IntegrationMethod::DormandPrince54 => {
            drive(label, system, Rk4Doubling::new(dim), y0, settings, criteria)
        }
        IntegrationMethod::Rk4Doubling => {
            drive(label, system, Rk4Doubling::new(dim), y0, settings, criteria)
        }
    }
}

fn signal_value(signal: CriterionSignal) -> f64 {
    match signal {
        CriterionSignal::Continue => f64::INFINITY,
        CriterionSignal::Stop => f64::NEG_INFINITY,
        CriterionSignal::Level(value) => value,
    }
}

fn push_sample(trajectory: &mut Vec<Sample>, t: f64, state: Vec<f64>, kind: SampleKind) {
    let last_t = trajectory.last().map_or(f64::NEG_INFINITY, |s| s.t);
    if t > last_t {
        trajectory.push(Sample { t, state, kind });
    }
}

fn drive<S: DynamicalSystem, K: EmbeddedKernel>(
    label: &str,
    system: &S,
    kernel: K,
    y0: &[f64],
    settings: &TraceSettings,
    criteria: &[&dyn StoppingCriterion],
) -> TraceResult {
    let dim = y0.len();
    let tmax = settings.tmax;
    log::debug!(
        "{label} trace from {:?}: tmax = {tmax}, tol = {:e}, {} planes, {} criteria",
        &y0[..3],
        settings.tol,
        settings.phis.len(),
        criteria.len()
    );

    let mut integrator = AdaptiveIntegrator::new(kernel, dim, settings.tol, settings.step_control);
    integrator.start(system, 0.0, y0, tmax, settings.initial_step);

    let mut trajectory = vec![Sample {
        t: 0.0,
        state: y0.to_vec(),
        kind: SampleKind::Initial,
    }];
    let mut planes = PlaneTracker::new(&settings.phis, y0[0], y0[1]);
    let initial = CriterionContext {
        iteration: 0,
        t: 0.0,
        state: y0,
    };
    let mut levels: Vec<Option<f64>> = criteria
        .iter()
        .map(|criterion| match criterion.evaluate(&initial) {
            CriterionSignal::Level(value) => Some(value),
            _ => None,
        })
        .collect();

    let mut probe = vec![0.0; dim];
    let mut iteration = 0usize;
    let mut failure = None;

    let stop_reason = loop {
        if integrator.t() >= tmax {
            break StopReason::MaxTime;
        }
        if iteration >= settings.max_steps {
            break StopReason::MaxIterations;
        }
        if let Err(err) = integrator.advance(system, tmax) {
            log::warn!(
                "{label} trace abandoned at t = {} after {iteration} steps: {err}",
                integrator.t()
            );
            failure = Some(err.to_string());
            break StopReason::NumericalFailure;
        }
        iteration += 1;

        let (t0, t1) = (integrator.previous_t(), integrator.t());
        let refine = RefineTolerance::for_step(settings.tol, t0, t1);

        let mut triggered: Option<(usize, f64)> = None;
        for (index, criterion) in criteria.iter().enumerate() {
            let ctx = CriterionContext {
                iteration,
                t: t1,
                state: integrator.state(),
            };
            match criterion.evaluate(&ctx) {
                CriterionSignal::Continue => {}
                CriterionSignal::Stop => {
                    triggered = Some((index, t1));
                    break;
                }
                CriterionSignal::Level(value) => {
                    let previous = levels[index].replace(value);
                    if let Some(previous) = previous.filter(|p| *p >= 0.0) {
                        if value < 0.0 {
                            let t_stop = refine_crossing(t0, t1, previous, refine, |t| {
                                integrator.interpolate(t, &mut probe);
                                signal_value(criterion.evaluate(&CriterionContext {
                                    iteration,
                                    t,
                                    state: &probe,
                                }))
                            });
                            triggered = Some((index, t_stop));
                            break;
                        }
                    }
                }
            }
        }
        let t_end = triggered.map_or(t1, |(_, t)| t);

        if !planes.is_empty() {
            let mut hits: Vec<(f64, usize)> = Vec::new();
            let mut s_lo = t0;
            for i in 1..=ANGLE_PROBES {
                let s_hi = if i == ANGLE_PROBES {
                    t1
                } else {
                    t0 + (t1 - t0) * i as f64 / ANGLE_PROBES as f64
                };
                integrator.interpolate(s_hi, &mut probe);
                let phi_hi = planes.unwrap(probe[0], probe[1]);
                for crossing in planes.crossings(phi_hi) {
                    let t_hit = refine_crossing(s_lo, s_hi, crossing.offset_at_start, refine, |t| {
                        integrator.interpolate(t, &mut probe);
                        wrap_angle(probe[1].atan2(probe[0]) - crossing.target)
                    });
                    if t_hit < t_end {
                        hits.push((t_hit, crossing.plane));
                    }
                }
                planes.advance(phi_hi);
                s_lo = s_hi;
            }
            hits.sort_by(|a, b| a.0.total_cmp(&b.0));
            for (t_hit, plane) in hits {
                integrator.interpolate(t_hit, &mut probe);
                log::trace!("{label} trace crossed plane {plane} at t = {t_hit}");
                push_sample(
                    &mut trajectory,
                    t_hit,
                    probe.clone(),
                    SampleKind::PlaneCrossing { plane },
                );
            }
        }

        if let Some((index, t_stop)) = triggered {
            log::debug!(
                "{label} trace: criterion {index} ({}) fired at t = {t_stop}",
                criteria[index].name()
            );
            integrator.interpolate(t_stop, &mut probe);
            push_sample(&mut trajectory, t_stop, probe.clone(), SampleKind::Final);
            break StopReason::Criterion { index };
        }
    };

    if !matches!(stop_reason, StopReason::Criterion { .. }) {
        push_sample(
            &mut trajectory,
            integrator.t(),
            integrator.state().to_vec(),
            SampleKind::Final,
        );
    }

    let stats = integrator.stats();
    log::debug!(
        "{label} trace stopped ({stop_reason:?}) at t = {} after {} accepted and {} rejected steps",
        trajectory[trajectory.len() - 1].t,
        stats.accepted_steps,
        stats.rejected_steps
    );

    TraceResult {
        trajectory,
        stop_reason,
        stats,
        failure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::{FnStoppingCriterion, IterationStoppingCriterion};
    use crate::fields::UniformField;
    use std::f64::consts::PI;

    #[test]
    fn default_settings_are_valid() {
        assert!(TraceSettings::default().validate().is_ok());
        assert!(TraceSettings::new(5.0, 1e-6)
            .with_phis(vec![0.0, 1.0])
            .validate()
            .is_ok());
    }

    #[test]
    fn settings_reject_bad_values() {
        assert_eq!(
            TraceSettings::new(0.0, 1e-9).validate(),
            Err(TracingError::InvalidTmax(0.0))
        );
        assert_eq!(
            TraceSettings::new(1.0, -1.0).validate(),
            Err(TracingError::InvalidTolerance(-1.0))
        );
        let unsorted = TraceSettings::new(1.0, 1e-9).with_phis(vec![1.0, 0.5]);
        assert!(matches!(unsorted.validate(), Err(TracingError::InvalidPhis(_))));
        let out_of_range = TraceSettings::new(1.0, 1e-9).with_phis(vec![TAU]);
        assert!(matches!(
            out_of_range.validate(),
            Err(TracingError::InvalidPhis(_))
        ));
        let no_steps = TraceSettings::new(1.0, 1e-9).with_max_steps(0);
        assert!(matches!(
            no_steps.validate(),
            Err(TracingError::InvalidSettings(_))
        ));
    }

    #[test]
    fn guiding_center_params_reject_bad_speeds() {
        let params = GuidingCenterParams::new(1.0, 1.0, 1.0, 0.5, true);
        assert!(params.validate().is_ok());
        assert!(matches!(
            params.with_vtang(1.5).validate(),
            Err(TracingError::InvalidSpeed(_))
        ));
        assert!(matches!(
            GuidingCenterParams::new(-1.0, 1.0, 1.0, 0.0, true).validate(),
            Err(TracingError::InvalidMass(_))
        ));
        assert!(matches!(
            GuidingCenterParams::new(1.0, 0.0, 1.0, 0.0, true).validate(),
            Err(TracingError::InvalidCharge(_))
        ));
    }

    #[test]
    fn guiding_center_rejects_vanishing_field() {
        let field = UniformField::new([0.0, 0.0, 0.0]);
        let params = GuidingCenterParams::new(1.0, 1.0, 1.0, 0.5, true);
        let err = particle_guiding_center_tracing(
            &field,
            [1.0, 0.0, 0.0],
            &params,
            &TraceSettings::default(),
            &[],
        )
        .unwrap_err();
        assert_eq!(err, TracingError::DegenerateField([1.0, 0.0, 0.0]));
    }

    #[test]
    fn max_steps_budget_ends_the_trace() {
        let field = UniformField::new([1.0, 0.0, 0.0]);
        let settings = TraceSettings::new(10.0, 1e-9)
            .with_method(IntegrationMethod::Rk4Doubling)
            .with_max_steps(3);
        let settings = TraceSettings {
            initial_step: Some(0.01),
            step_control: StepControl {
                max_factor: 1.5,
                ..StepControl::default()
            },
            ..settings
        };
        let result = fieldline_tracing(&field, [0.0, 0.0, 0.0], &settings, &[]).unwrap();
        assert_eq!(result.stop_reason, StopReason::MaxIterations);
        assert_eq!(result.stats.accepted_steps, 3);
        assert_eq!(result.trajectory.len(), 2);
        assert!(result.last().t < 10.0);
    }

    #[test]
    fn criterion_firing_in_an_earlier_step_stops_the_trace() {
        let field = UniformField::new([1.0, 0.0, 0.0]);
        let late = IterationStoppingCriterion::new(4).unwrap();
        let early = IterationStoppingCriterion::new(2).unwrap();
        let settings = TraceSettings::new(100.0, 1e-9).with_method(IntegrationMethod::Rk4Doubling);
        let settings = TraceSettings {
            initial_step: Some(0.1),
            ..settings
        };
        let criteria: [&dyn StoppingCriterion; 2] = [&late, &early];
        let result = fieldline_tracing(&field, [0.0, 0.0, 0.0], &settings, &criteria).unwrap();
        assert_eq!(result.stop_reason, StopReason::Criterion { index: 1 });
        assert_eq!(result.stats.accepted_steps, 2);
        assert_eq!(result.last().kind, SampleKind::Final);
    }

    /// Steps of 0.3 then 1.5 along x, so both criteria below first fire in
    /// the step ending at t = 1.8.
    fn two_step_settings() -> TraceSettings {
        TraceSettings {
            initial_step: Some(0.3),
            ..TraceSettings::new(10.0, 1e-9)
        }
    }

    #[test]
    fn first_listed_criterion_wins_within_one_step() {
        let field = UniformField::new([1.0, 0.0, 0.0]);
        let level = FnStoppingCriterion::new("x-below-half", |ctx: &CriterionContext| {
            CriterionSignal::Level(0.5 - ctx.state[0])
        });
        let stop = FnStoppingCriterion::new("x-past-half", |ctx: &CriterionContext| {
            if ctx.state[0] >= 0.5 {
                CriterionSignal::Stop
            } else {
                CriterionSignal::Continue
            }
        });
        let settings = two_step_settings();

        let criteria: [&dyn StoppingCriterion; 2] = [&level, &stop];
        let result = fieldline_tracing(&field, [0.0, 0.0, 0.0], &settings, &criteria).unwrap();
        assert_eq!(result.stop_reason, StopReason::Criterion { index: 0 });
        assert_eq!(result.stats.accepted_steps, 2);
        assert!((result.last().t - 0.5).abs() < 1e-8);
        assert!((result.last().state[0] - 0.5).abs() < 1e-8);

        // Listed first, the step-end stop wins even though the level set is
        // crossed earlier in the same step.
        let criteria: [&dyn StoppingCriterion; 2] = [&stop, &level];
        let result = fieldline_tracing(&field, [0.0, 0.0, 0.0], &settings, &criteria).unwrap();
        assert_eq!(result.stop_reason, StopReason::Criterion { index: 0 });
        assert_eq!(result.stats.accepted_steps, 2);
        assert!((result.last().t - 1.8).abs() < 1e-12);
    }

    #[test]
    fn plane_crossings_after_a_stop_in_the_same_step_are_dropped() {
        // Along y from (1, -1, 0): phi = 0 at t = 1, phi = pi/8 at t = tan(pi/8) + 1.
        let field = UniformField::new([0.0, 1.0, 0.0]);
        let stop_at = FnStoppingCriterion::new("t-past-1.2", |ctx: &CriterionContext| {
            CriterionSignal::Level(1.2 - ctx.t)
        });
        let settings = TraceSettings {
            initial_step: Some(0.5),
            ..TraceSettings::new(10.0, 1e-9).with_phis(vec![0.0, PI / 8.0])
        };

        let result = fieldline_tracing(&field, [1.0, -1.0, 0.0], &settings, &[&stop_at]).unwrap();
        // One step of 0.5 then one of 2.5 holding the stop and both planes.
        assert_eq!(result.stats.accepted_steps, 2);
        assert_eq!(result.stop_reason, StopReason::Criterion { index: 0 });
        let kinds: Vec<SampleKind> = result.trajectory.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            [
                SampleKind::Initial,
                SampleKind::PlaneCrossing { plane: 0 },
                SampleKind::Final
            ]
        );
        assert!((result.trajectory[1].t - 1.0).abs() < 1e-8);
        assert!((result.last().t - 1.2).abs() < 1e-8);
    }

    #[test]
    fn batch_helpers_check_lengths() {
        let field = UniformField::new([0.0, 1.0, 0.0]);
        let settings = TraceSettings::new(1.0, 1e-9);
        assert!(matches!(
            compute_fieldlines(&field, &[1.0, 2.0], &[0.0], &settings, &[]),
            Err(TracingError::InvalidSettings(_))
        ));
        let results = compute_fieldlines(&field, &[1.0, 2.0], &[0.0, 0.5], &settings, &[]).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].initial().position(), [2.0, 0.0, 0.5]);
    }
}
