//! Equations of motion for the three tracing models.

use crate::field::MagneticField;
use crate::traits::DynamicalSystem;
use nalgebra::Vector3;

fn position(x: &[f64]) -> Vector3<f64> {
    Vector3::new(x[0], x[1], x[2])
}

/// `dx/dt = B(x)`.
pub struct FieldlineRhs<'a> {
    field: &'a dyn MagneticField,
}

impl<'a> FieldlineRhs<'a> {
    pub fn new(field: &'a dyn MagneticField) -> Self {
        Self { field }
    }
}

impl DynamicalSystem for FieldlineRhs<'_> {
    fn dimension(&self) -> usize {
        3
    }

    fn apply(&self, t: f64, x: &[f64], out: &mut [f64]) {
        let b = self.field.b(&position(x), t);
        out[..3].copy_from_slice(b.as_slice());
    }
}

/// Lorentz force on a charged particle: `dx/dt = v`, `dv/dt = (q/m) v x B`.
pub struct FullorbitRhs<'a> {
    field: &'a dyn MagneticField,
    charge_over_mass: f64,
}

impl<'a> FullorbitRhs<'a> {
    pub fn new(field: &'a dyn MagneticField, mass: f64, charge: f64) -> Self {
        Self {
            field,
            charge_over_mass: charge / mass,
        }
    }
}

impl DynamicalSystem for FullorbitRhs<'_> {
    fn dimension(&self) -> usize {
        6
    }

    fn apply(&self, t: f64, x: &[f64], out: &mut [f64]) {
        let b = self.field.b(&position(x), t);
        let v = Vector3::new(x[3], x[4], x[5]);
        let accel = self.charge_over_mass * v.cross(&b);
        out[..3].copy_from_slice(v.as_slice());
        out[3..6].copy_from_slice(accel.as_slice());
    }
}

/// Guiding-center motion with state `[x, y, z, v_par]`.
///
/// The magnetic moment `mu = v_perp^2 / (2 |B|)` is fixed at the start point.
/// The vacuum form keeps the parallel streaming, grad-B and curvature drifts
/// with the curvature written through `grad |B|`, which is exact when
/// `curl B = 0`. The non-vacuum form adds the `(curl B)_perp` part of the
/// curvature drift.
pub struct GuidingCenterRhs<'a> {
    field: &'a dyn MagneticField,
    mass: f64,
    charge: f64,
    mu: f64,
    vacuum: bool,
}

impl<'a> GuidingCenterRhs<'a> {
    pub fn new(
        field: &'a dyn MagneticField,
        mass: f64,
        charge: f64,
        mu: f64,
        vacuum: bool,
    ) -> Self {
        Self {
            field,
            mass,
            charge,
            mu,
            vacuum,
        }
    }
}

impl DynamicalSystem for GuidingCenterRhs<'_> {
    fn dimension(&self) -> usize {
        4
    }

    fn apply(&self, t: f64, x: &[f64], out: &mut [f64]) {
        let sample = self.field.sample(&position(x), t);
        let b = sample.b;
        let abs_b = sample.abs_b();
        let grad_abs_b = sample.grad_abs_b();
        let v_par = x[3];
        let v_perp2 = 2.0 * self.mu * abs_b;

        let fak1 = v_par / abs_b;
        let fak2 = self.mass / (self.charge * abs_b.powi(3)) * (0.5 * v_perp2 + v_par * v_par);
        let mut dxdt = fak1 * b + fak2 * b.cross(&grad_abs_b);

        if !self.vacuum {
            let curl = sample.curl_b();
            let b_hat = b / abs_b;
            let curl_perp = curl - curl.dot(&b_hat) * b_hat;
            let fak3 = self.mass * v_par * v_par / (self.charge * abs_b * abs_b);
            dxdt += fak3 * curl_perp;
        }

        out[..3].copy_from_slice(dxdt.as_slice());
        out[3] = -self.mu * b.dot(&grad_abs_b) / abs_b;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{ToroidalField, UniformField};
    use approx::assert_relative_eq;

    #[test]
    fn fieldline_rhs_returns_field() {
        let field = UniformField::new([0.1, -0.2, 0.3]);
        let rhs = FieldlineRhs::new(&field);
        let mut out = [0.0; 3];
        rhs.apply(0.0, &[5.0, 5.0, 5.0], &mut out);
        assert_eq!(out, [0.1, -0.2, 0.3]);
    }

    #[test]
    fn fullorbit_rhs_is_lorentz_force() {
        let field = UniformField::new([0.0, 0.0, 2.0]);
        let rhs = FullorbitRhs::new(&field, 2.0, 3.0);
        let mut out = [0.0; 6];
        rhs.apply(0.0, &[0.0, 0.0, 0.0, 1.0, 0.0, 0.5], &mut out);
        // v x B = (0, -2, 0), scaled by q/m = 1.5
        assert_eq!(&out[..3], &[1.0, 0.0, 0.5]);
        assert_relative_eq!(out[3], 0.0);
        assert_relative_eq!(out[4], -3.0);
        assert_relative_eq!(out[5], 0.0);
    }

    #[test]
    fn guiding_center_in_toroidal_field_drifts_vertically() {
        let field = ToroidalField::new(1.0, 1.0);
        let (mass, charge) = (1.0, 10.0);
        let (v_par, v_perp2) = (0.5, 0.75);
        let mu = v_perp2 / 2.0;
        let mut out = [0.0; 4];

        for vacuum in [true, false] {
            let rhs = GuidingCenterRhs::new(&field, mass, charge, mu, vacuum);
            rhs.apply(0.0, &[1.0, 0.0, 0.0, v_par], &mut out);
            let drift = mass / charge * (0.5 * v_perp2 + v_par * v_par);
            assert_relative_eq!(out[0], 0.0, epsilon = 1e-14);
            assert_relative_eq!(out[1], v_par, epsilon = 1e-14);
            assert_relative_eq!(out[2], drift, epsilon = 1e-14);
            assert_relative_eq!(out[3], 0.0, epsilon = 1e-14);
        }
    }

    #[test]
    fn non_vacuum_adds_curl_term() {
        /// B = (0, 0, 1 + x): curl B = (0, -1, 0), perpendicular to B.
        struct Sheared;
        impl MagneticField for Sheared {
            fn b(&self, xyz: &Vector3<f64>, _t: f64) -> Vector3<f64> {
                Vector3::new(0.0, 0.0, 1.0 + xyz[0])
            }
        }

        let state = [0.0, 0.0, 0.0, 2.0];
        let mut vacuum = [0.0; 4];
        let mut full = [0.0; 4];
        GuidingCenterRhs::new(&Sheared, 1.0, 1.0, 0.0, true).apply(0.0, &state, &mut vacuum);
        GuidingCenterRhs::new(&Sheared, 1.0, 1.0, 0.0, false).apply(0.0, &state, &mut full);

        // m v_par^2 / (q |B|^2) * (curl B)_perp = 4 * (0, -1, 0)
        assert_relative_eq!(full[1] - vacuum[1], -4.0, epsilon = 1e-6);
        assert_relative_eq!(full[0], vacuum[0], epsilon = 1e-9);
        assert_relative_eq!(full[2], vacuum[2], epsilon = 1e-9);
    }
}
