//! Adaptive step-size control on top of an embedded kernel.
//!
//! The integrator owns the current `(t, y)` pair and only ever moves forward.
//! After every accepted step it keeps the previous endpoint so callers can ask
//! for interpolated states anywhere inside the last accepted interval.

use crate::error::IntegrationError;
use crate::solvers::EmbeddedKernel;
use crate::traits::DynamicalSystem;
use crate::types::TraceStats;
use serde::{Deserialize, Serialize};

/// Integration backends available to the tracing drivers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum IntegrationMethod {
    /// Dormand-Prince 5(4); only usable with the `high-precision` feature.
    DormandPrince54,
    /// Classic RK4 with step doubling.
    Rk4Doubling,
}

impl IntegrationMethod {
    pub fn is_available(self) -> bool {
        match self {
            IntegrationMethod::DormandPrince54 => cfg!(feature = "high-precision"),
            IntegrationMethod::Rk4Doubling => true,
        }
    }
}

impl Default for IntegrationMethod {
    fn default() -> Self {
        if cfg!(feature = "high-precision") {
            IntegrationMethod::DormandPrince54
        } else {
            IntegrationMethod::Rk4Doubling
        }
    }
}

/// Step-size controller parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StepControl {
    pub safety: f64,
    pub min_factor: f64,
    pub max_factor: f64,
    /// Consecutive rejections tolerated before the step is declared a failure.
    pub max_rejections: usize,
    /// Smallest step, relative to the magnitude of the integration interval.
    pub min_step_ratio: f64,
}

impl Default for StepControl {
    fn default() -> Self {
        Self {
            safety: 0.9,
            min_factor: 0.2,
            max_factor: 5.0,
            max_rejections: 64,
            min_step_ratio: 1e-14,
        }
    }
}

impl StepControl {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if !(self.safety > 0.0 && self.safety <= 1.0) {
            return Err(format!("safety must lie in (0, 1], got {}", self.safety));
        }
        if !(self.min_factor > 0.0 && self.min_factor < 1.0) {
            return Err(format!(
                "min_factor must lie in (0, 1), got {}",
                self.min_factor
            ));
        }
        if !(self.max_factor > 1.0 && self.max_factor.is_finite()) {
            return Err(format!(
                "max_factor must be finite and greater than 1, got {}",
                self.max_factor
            ));
        }
        if self.max_rejections == 0 {
            return Err("max_rejections must be at least 1".to_string());
        }
        if !(self.min_step_ratio > 0.0 && self.min_step_ratio < 1.0) {
            return Err(format!(
                "min_step_ratio must lie in (0, 1), got {}",
                self.min_step_ratio
            ));
        }
        Ok(())
    }

    fn grow_factor(&self, ratio: f64, exponent: f64) -> f64 {
        if ratio == 0.0 {
            return self.max_factor;
        }
        (self.safety * ratio.powf(-exponent)).clamp(self.min_factor, self.max_factor)
    }
}

pub struct AdaptiveIntegrator<K: EmbeddedKernel> {
    kernel: K,
    control: StepControl,
    tol: f64,
    t: f64,
    y: Vec<f64>,
    t_prev: f64,
    y_prev: Vec<f64>,
    y_new: Vec<f64>,
    err: Vec<f64>,
    h: f64,
    t_span: f64,
    stats: TraceStats,
}

impl<K: EmbeddedKernel> AdaptiveIntegrator<K> {
    /// `tol` is used both as absolute and as relative tolerance.
    pub fn new(kernel: K, dim: usize, tol: f64, control: StepControl) -> Self {
        Self {
            kernel,
            control,
            tol,
            t: 0.0,
            y: vec![0.0; dim],
            t_prev: 0.0,
            y_prev: vec![0.0; dim],
            y_new: vec![0.0; dim],
            err: vec![0.0; dim],
            h: 0.0,
            t_span: 0.0,
            stats: TraceStats::default(),
        }
    }

    /// Places the integrator at `(t0, y0)` and picks the first step size.
    ///
    /// Without an explicit `initial_step` the size comes from the usual
    /// two-evaluation estimate based on `|y0|`, `|f(y0)|` and the change of `f`
    /// over a trial Euler step.
    pub fn start(
        &mut self,
        system: &impl DynamicalSystem,
        t0: f64,
        y0: &[f64],
        t_end: f64,
        initial_step: Option<f64>,
    ) {
        self.kernel.reset();
        self.stats = TraceStats::default();
        self.t = t0;
        self.t_prev = t0;
        self.y.copy_from_slice(y0);
        self.y_prev.copy_from_slice(y0);
        self.t_span = (t_end - t0).abs().max(t0.abs()).max(f64::MIN_POSITIVE);

        let span = t_end - t0;
        self.h = match initial_step {
            Some(h) => h.min(span),
            None => self.estimate_initial_step(system, span),
        };
    }

    fn estimate_initial_step(&mut self, system: &impl DynamicalSystem, span: f64) -> f64 {
        let dim = self.y.len();
        let mut f0 = vec![0.0; dim];
        system.apply(self.t, &self.y, &mut f0);

        let scale: Vec<f64> = self
            .y
            .iter()
            .map(|v| self.tol + self.tol * v.abs())
            .collect();
        let d0 = rms_scaled(&self.y, &scale);
        let d1 = rms_scaled(&f0, &scale);

        let mut h0 = if d0 < 1e-5 || d1 < 1e-5 {
            1e-6
        } else {
            0.01 * d0 / d1
        };
        h0 = h0.min(span);

        let trial: Vec<f64> = self
            .y
            .iter()
            .zip(&f0)
            .map(|(y, f)| y + h0 * f)
            .collect();
        let mut f1 = vec![0.0; dim];
        system.apply(self.t + h0, &trial, &mut f1);
        self.stats.rhs_evaluations += 2;

        let diff: Vec<f64> = f1.iter().zip(&f0).map(|(a, b)| a - b).collect();
        let d2 = rms_scaled(&diff, &scale) / h0;

        let dmax = d1.max(d2);
        let h1 = if dmax <= 1e-15 || !dmax.is_finite() {
            (h0 * 1e-3).max(1e-6)
        } else {
            (0.01 / dmax).powf(K::ERROR_EXPONENT)
        };

        (100.0 * h0).min(h1).min(span)
    }

    /// Takes one accepted step towards `t_end` without passing it.
    ///
    /// Rejected attempts shrink the step and retry; the retry count and the
    /// minimum step size are both bounded by the `StepControl`.
    pub fn advance(
        &mut self,
        system: &impl DynamicalSystem,
        t_end: f64,
    ) -> Result<(), IntegrationError> {
        let remaining = t_end - self.t;
        if remaining <= 0.0 {
            return Ok(());
        }

        let min_step = self.control.min_step_ratio * self.t_span;
        let mut rejections = 0usize;

        loop {
            let remaining = t_end - self.t;
            let clipped = self.h >= remaining;
            let h = if clipped { remaining } else { self.h };

            if h < min_step && !clipped {
                return Err(IntegrationError::StepSizeTooSmall { t: self.t, h });
            }

            self.stats.rhs_evaluations +=
                self.kernel
                    .attempt(system, self.t, &self.y, h, &mut self.y_new, &mut self.err);
            let ratio = error_ratio(&self.y, &self.y_new, &self.err, self.tol);

            if ratio <= 1.0 {
                let t_new = if clipped { t_end } else { self.t + h };
                self.stats.rhs_evaluations +=
                    self.kernel
                        .accept(system, self.t, &self.y, t_new, &self.y_new);

                std::mem::swap(&mut self.y_prev, &mut self.y);
                std::mem::swap(&mut self.y, &mut self.y_new);
                self.t_prev = self.t;
                self.t = t_new;

                let mut factor = self.control.grow_factor(ratio, K::ERROR_EXPONENT);
                if rejections > 0 {
                    factor = factor.min(1.0);
                }
                // A step clipped to t_end says nothing about the natural size.
                self.h = if clipped { self.h.max(h * factor) } else { h * factor };
                self.stats.accepted_steps += 1;
                return Ok(());
            }

            rejections += 1;
            self.stats.rejected_steps += 1;
            if rejections >= self.control.max_rejections {
                return Err(IntegrationError::TooManyRejections {
                    t: self.t,
                    attempts: rejections,
                    error: ratio,
                });
            }

            let factor = if ratio.is_finite() {
                self.control
                    .grow_factor(ratio, K::ERROR_EXPONENT)
                    .min(1.0)
            } else {
                self.control.min_factor
            };
            self.h = h * factor;
            if self.h < min_step {
                return Err(IntegrationError::StepSizeTooSmall {
                    t: self.t,
                    h: self.h,
                });
            }
        }
    }

    pub fn t(&self) -> f64 {
        self.t
    }

    pub fn state(&self) -> &[f64] {
        &self.y
    }

    pub fn previous_t(&self) -> f64 {
        self.t_prev
    }

    /// Interpolates the last accepted step. `t` is clamped to
    /// `[previous_t(), t()]`.
    pub fn interpolate(&self, t: f64, out: &mut [f64]) {
        let span = self.t - self.t_prev;
        if span <= 0.0 {
            out.copy_from_slice(&self.y);
            return;
        }
        let theta = ((t - self.t_prev) / span).clamp(0.0, 1.0);
        if theta == 0.0 {
            out.copy_from_slice(&self.y_prev);
        } else if theta == 1.0 {
            out.copy_from_slice(&self.y);
        } else {
            self.kernel.dense(theta, out);
        }
    }

    pub fn stats(&self) -> TraceStats {
        self.stats
    }
}

/// Max-norm of the error scaled by `tol + tol * max(|y0|, |y1|)`.
/// Any non-finite component makes the ratio infinite.
fn error_ratio(y0: &[f64], y1: &[f64], err: &[f64], tol: f64) -> f64 {
    let mut ratio: f64 = 0.0;
    for i in 0..y0.len() {
        if !y1[i].is_finite() || !err[i].is_finite() {
            return f64::INFINITY;
        }
        let scale = tol + tol * y0[i].abs().max(y1[i].abs());
        ratio = ratio.max(err[i].abs() / scale);
    }
    ratio
}

fn rms_scaled(values: &[f64], scale: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let sum: f64 = values
        .iter()
        .zip(scale)
        .map(|(v, s)| (v / s) * (v / s))
        .sum();
    (sum / values.len() as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solvers::Rk4Doubling;

    struct Oscillator;

    impl DynamicalSystem for Oscillator {
        fn dimension(&self) -> usize {
            2
        }

        fn apply(&self, _t: f64, x: &[f64], out: &mut [f64]) {
            out[0] = x[1];
            out[1] = -x[0];
        }
    }

    /// Blows up once the state leaves the unit interval.
    struct Cliff;

    impl DynamicalSystem for Cliff {
        fn dimension(&self) -> usize {
            1
        }

        fn apply(&self, _t: f64, x: &[f64], out: &mut [f64]) {
            out[0] = if x[0] < 1.0 { 1.0 } else { f64::NAN };
        }
    }

    fn integrate<K: EmbeddedKernel>(kernel: K, tol: f64, t_end: f64) -> AdaptiveIntegrator<K> {
        let mut integrator = AdaptiveIntegrator::new(kernel, 2, tol, StepControl::default());
        integrator.start(&Oscillator, 0.0, &[1.0, 0.0], t_end, None);
        while integrator.t() < t_end {
            integrator
                .advance(&Oscillator, t_end)
                .expect("oscillator should integrate");
        }
        integrator
    }

    #[test]
    fn rk4_doubling_lands_on_t_end_within_tolerance() {
        let integrator = integrate(Rk4Doubling::new(2), 1e-10, 10.0);
        assert_eq!(integrator.t(), 10.0);
        let y = integrator.state();
        assert!((y[0] - 10.0f64.cos()).abs() < 1e-7);
        assert!((y[1] + 10.0f64.sin()).abs() < 1e-7);
        assert!(integrator.stats().accepted_steps > 10);
    }

    #[test]
    fn dense_output_matches_exact_solution_inside_last_step() {
        let integrator = integrate(Rk4Doubling::new(2), 1e-10, 3.0);
        let t0 = integrator.previous_t();
        let t1 = integrator.t();
        assert!(t0 < t1);
        let mut out = [0.0; 2];
        let mid = 0.5 * (t0 + t1);
        integrator.interpolate(mid, &mut out);
        assert!((out[0] - mid.cos()).abs() < 1e-6);

        integrator.interpolate(t1 + 1.0, &mut out);
        assert_eq!(out, [integrator.state()[0], integrator.state()[1]]);
    }

    #[test]
    fn dense_output_starts_at_the_previous_accepted_state() {
        let mut integrator =
            AdaptiveIntegrator::new(Rk4Doubling::new(2), 2, 1e-10, StepControl::default());
        integrator.start(&Oscillator, 0.0, &[1.0, 0.0], 5.0, None);
        integrator.advance(&Oscillator, 5.0).expect("first step");
        let before = [integrator.state()[0], integrator.state()[1]];
        integrator.advance(&Oscillator, 5.0).expect("second step");

        let mut out = [0.0; 2];
        integrator.interpolate(integrator.previous_t() - 1.0, &mut out);
        assert_eq!(out, before);
    }

    #[cfg(feature = "high-precision")]
    #[test]
    fn dormand_prince_tracks_oscillator() {
        use crate::solvers::DormandPrince54;
        let integrator = integrate(DormandPrince54::new(2), 1e-11, 20.0);
        let y = integrator.state();
        assert!((y[0] - 20.0f64.cos()).abs() < 1e-7);
        assert!((y[1] + 20.0f64.sin()).abs() < 1e-7);
    }

    #[test]
    fn persistent_nan_is_reported_instead_of_looping() {
        let mut integrator =
            AdaptiveIntegrator::new(Rk4Doubling::new(1), 1, 1e-8, StepControl::default());
        integrator.start(&Cliff, 0.0, &[0.0], 10.0, Some(0.5));
        let mut failure = None;
        for _ in 0..10_000 {
            if let Err(err) = integrator.advance(&Cliff, 10.0) {
                failure = Some(err);
                break;
            }
        }
        let failure = failure.expect("integration past the cliff must fail");
        assert!(integrator.t() < 1.0 + 1e-9);
        assert!(matches!(
            failure,
            IntegrationError::StepSizeTooSmall { .. } | IntegrationError::TooManyRejections { .. }
        ));
    }

    #[test]
    fn step_control_validation_rejects_bad_factors() {
        let control = StepControl {
            min_factor: 1.5,
            ..StepControl::default()
        };
        assert!(control.validate().unwrap_err().contains("min_factor"));
        let control = StepControl {
            max_rejections: 0,
            ..StepControl::default()
        };
        assert!(control.validate().unwrap_err().contains("max_rejections"));
        assert!(StepControl::default().validate().is_ok());
    }

    #[test]
    fn error_ratio_flags_non_finite_candidates() {
        assert!(error_ratio(&[1.0], &[f64::NAN], &[0.0], 1e-6).is_infinite());
        let ratio = error_ratio(&[1.0], &[1.0], &[2e-6], 1e-6);
        assert!((ratio - 1.0).abs() < 1e-12);
    }
}
