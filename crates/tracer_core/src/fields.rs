//! Analytic magnetic fields.

use crate::autodiff::Jet;
use crate::expression::Expression;
use crate::field::{FieldSample, MagneticField};
use anyhow::{Context, Result};
use nalgebra::{Matrix3, Vector3};
use std::f64::consts::PI;

/// Below this distance from the axis, in units of the coil radius, the coil
/// Jacobian uses its on-axis limit.
const COIL_AXIS_TOLERANCE: f64 = 1e-4;

/// Spatially constant field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UniformField {
    pub b: Vector3<f64>,
}

impl UniformField {
    pub fn new(b: [f64; 3]) -> Self {
        Self {
            b: Vector3::from(b),
        }
    }
}

impl MagneticField for UniformField {
    fn b(&self, _xyz: &Vector3<f64>, _t: f64) -> Vector3<f64> {
        self.b
    }

    fn grad_b(&self, _xyz: &Vector3<f64>, _t: f64) -> Matrix3<f64> {
        Matrix3::zeros()
    }
}

/// Purely toroidal field with modulus `b0 * r0 / R`, where `R` is the
/// cylindrical radius.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToroidalField {
    pub r0: f64,
    pub b0: f64,
}

impl ToroidalField {
    pub fn new(r0: f64, b0: f64) -> Self {
        Self { r0, b0 }
    }

    /// A vector potential with `curl A = B`: `A = b0 r0 z (x, y, 0) / R^2`.
    pub fn vector_potential(&self, xyz: &Vector3<f64>) -> Vector3<f64> {
        let (x, y, z) = (xyz[0], xyz[1], xyz[2]);
        let r2 = x * x + y * y;
        self.b0 * self.r0 * z / r2 * Vector3::new(x, y, 0.0)
    }

    /// Jacobian of [`Self::vector_potential`], `grad[(i, j)] = dA_i / dx_j`.
    pub fn vector_potential_jacobian(&self, xyz: &Vector3<f64>) -> Matrix3<f64> {
        let (x, y, z) = (xyz[0], xyz[1], xyz[2]);
        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let xyz2 = -2.0 * x * y * z / r4;
        let d = (y * y - x * x) * z / r4;
        self.b0
            * self.r0
            * Matrix3::new(d, xyz2, x / r2, xyz2, -d, y / r2, 0.0, 0.0, 0.0)
    }
}

impl MagneticField for ToroidalField {
    fn b(&self, xyz: &Vector3<f64>, _t: f64) -> Vector3<f64> {
        let (x, y) = (xyz[0], xyz[1]);
        let r2 = x * x + y * y;
        self.b0 * self.r0 / r2 * Vector3::new(-y, x, 0.0)
    }

    fn grad_b(&self, xyz: &Vector3<f64>, _t: f64) -> Matrix3<f64> {
        let (x, y) = (xyz[0], xyz[1]);
        let r2 = x * x + y * y;
        let fak = self.b0 * self.r0 / (r2 * r2);
        let xy2 = 2.0 * x * y;
        let d = y * y - x * x;
        fak * Matrix3::new(xy2, d, 0.0, d, -xy2, 0.0, 0.0, 0.0, 0.0)
    }
}

/// Field of a single circular current loop, evaluated with complete elliptic
/// integrals.
///
/// `normal = [theta, phi]` are the spherical angles of the loop normal; the
/// loop axis points along `(-sin(phi), sin(theta) cos(phi), cos(theta) cos(phi))`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircularCoil {
    pub r0: f64,
    pub center: Vector3<f64>,
    pub current: f64,
    rotation: Matrix3<f64>,
}

impl CircularCoil {
    pub fn new(r0: f64, center: [f64; 3], current: f64, normal: [f64; 2]) -> Self {
        let (st, ct) = normal[0].sin_cos();
        let (sp, cp) = normal[1].sin_cos();
        let rotation = Matrix3::new(
            cp,
            st * sp,
            ct * sp,
            0.0,
            ct,
            -st,
            -sp,
            st * cp,
            ct * cp,
        );
        Self {
            r0,
            center: Vector3::from(center),
            current,
            rotation,
        }
    }

    /// Field strength on the coil axis at signed distance `z` from its center.
    pub fn on_axis(&self, z: f64) -> f64 {
        let mu0 = 4e-7 * PI;
        mu0 * self.current * self.r0 * self.r0 / (2.0 * (self.r0 * self.r0 + z * z).powf(1.5))
    }

    // mu0 * I / pi
    fn inorm(&self) -> f64 {
        self.current * 4e-7
    }
}

/// Distances of a point in the coil frame, shared by the field and its
/// Jacobian.
struct CoilGeometry {
    rho2: f64,
    r2: f64,
    alpha2: f64,
    beta2: f64,
    beta: f64,
    ek: f64,
    ee: f64,
}

impl CoilGeometry {
    fn new(r0: f64, p: &Vector3<f64>) -> Self {
        let rho2 = p[0] * p[0] + p[1] * p[1];
        let rho = rho2.sqrt();
        let r2 = rho2 + p[2] * p[2];
        let r02 = r0 * r0;
        let alpha2 = r02 + r2 - 2.0 * r0 * rho;
        let beta2 = r02 + r2 + 2.0 * r0 * rho;
        let (ek, ee) = complete_elliptic_integrals(1.0 - alpha2 / beta2);
        Self {
            rho2,
            r2,
            alpha2,
            beta2,
            beta: beta2.sqrt(),
            ek,
            ee,
        }
    }
}

impl MagneticField for CircularCoil {
    fn b(&self, xyz: &Vector3<f64>, _t: f64) -> Vector3<f64> {
        let p = self.rotation * (xyz - self.center);
        let CoilGeometry {
            rho2,
            r2,
            alpha2,
            beta,
            ek,
            ee,
            ..
        } = CoilGeometry::new(self.r0, &p);
        let r02 = self.r0 * self.r0;
        let inorm = self.inorm();
        let (bx, by) = if rho2.sqrt() <= 1e-14 * self.r0 {
            (0.0, 0.0)
        } else {
            let fak = inorm * p[2] / (2.0 * alpha2 * beta * rho2)
                * ((r02 + r2) * ee - alpha2 * ek);
            (fak * p[0], fak * p[1])
        };
        let bz = inorm / (2.0 * alpha2 * beta) * ((r02 - r2) * ee + alpha2 * ek);

        self.rotation.transpose() * Vector3::new(bx, by, bz)
    }

    fn grad_b(&self, xyz: &Vector3<f64>, _t: f64) -> Matrix3<f64> {
        let p = self.rotation * (xyz - self.center);
        let (x, y, z) = (p[0], p[1], p[2]);
        let CoilGeometry {
            rho2,
            r2,
            alpha2,
            beta2,
            beta,
            ek,
            ee,
        } = CoilGeometry::new(self.r0, &p);
        let inorm = self.inorm();
        let r02 = self.r0 * self.r0;

        let local = if rho2.sqrt() <= COIL_AXIS_TOLERANCE * self.r0 {
            let dbz_dz = -3.0 * PI * inorm * r02 * z / (2.0 * (r02 + z * z).powf(2.5));
            Matrix3::from_diagonal(&Vector3::new(-0.5 * dbz_dz, -0.5 * dbz_dz, dbz_dz))
        } else {
            let (x2, y2, z2) = (x * x, y * y, z * z);
            let r04 = r02 * r02;
            let rho4 = rho2 * rho2;
            let g = x2 - y2;
            let den = 2.0 * alpha2 * alpha2 * beta2 * beta;

            let dxx = inorm
                * z
                * (ek * alpha2
                    * ((2.0 * x2 * x2 + g * (y2 + z2)) * r2
                        + r02 * (g * (r02 + 2.0 * z2) - (3.0 * x2 - 2.0 * y2) * rho2))
                    + ee * (-(2.0 * x2 * x2 + g * (y2 + z2)) * r2 * r2
                        + r04 * (-g * (r02 + 3.0 * z2) + (8.0 * x2 - y2) * rho2)
                        - r02
                            * (3.0 * g * z2 * z2 - 2.0 * (2.0 * x2 + y2) * z2 * rho2
                                + (5.0 * x2 + y2) * rho4)))
                / (den * rho4);
            let dyy = inorm
                * z
                * (ek * alpha2
                    * ((2.0 * y2 * y2 - g * (x2 + z2)) * r2
                        + r02 * (-g * (r02 + 2.0 * z2) - (3.0 * y2 - 2.0 * x2) * rho2))
                    + ee * (-(2.0 * y2 * y2 - g * (x2 + z2)) * r2 * r2
                        + r04 * (g * (r02 + 3.0 * z2) + (8.0 * y2 - x2) * rho2)
                        - r02
                            * (-3.0 * g * z2 * z2 - 2.0 * (x2 + 2.0 * y2) * z2 * rho2
                                + (x2 + 5.0 * y2) * rho4)))
                / (den * rho4);
            let dxy = inorm
                * x
                * y
                * z
                * (ek * alpha2
                    * (2.0 * r04 + r2 * (2.0 * r2 + rho2) - r02 * (5.0 * rho2 - 4.0 * z2))
                    + ee * (-2.0 * r04 * r02 - r2 * r2 * (2.0 * r2 + rho2)
                        + 3.0 * r04 * (3.0 * rho2 - 2.0 * z2)
                        - 2.0 * r02 * (3.0 * z2 * z2 - z2 * rho2 + 2.0 * rho4)))
                / (den * rho4);
            // dB_z/dx = dB_x/dz = s x, and likewise for y.
            let s = inorm
                * (-ek * alpha2 * ((rho2 - r02) * (rho2 - r02) + z2 * (r02 + rho2))
                    + ee * (z2 * z2 * (r02 + rho2)
                        + (rho2 - r02) * (rho2 - r02) * (r02 + rho2)
                        + 2.0 * z2 * (r04 - 6.0 * r02 * rho2 + rho4)))
                / (den * rho2);
            let dzz = inorm
                * z
                * (ek * alpha2 * (r02 - r2) + ee * (r2 * r2 - 7.0 * r04 + 6.0 * r02 * (rho2 - z2)))
                / den;

            Matrix3::new(dxx, dxy, s * x, dxy, dyy, s * y, s * x, s * y, dzz)
        };

        self.rotation.transpose() * local * self.rotation
    }
}

/// Curl-free field `B = grad(Phi)` of a scalar potential `Phi(R, phi, Z)`
/// given as an expression in the cylindrical coordinates `R`, `phi` and `Z`.
///
/// The field and its Jacobian come from a single second-order
/// forward-mode evaluation of the potential, so both are exact up to
/// rounding.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarPotentialRZField {
    potential: Expression,
}

impl ScalarPotentialRZField {
    /// Parses `source`, e.g. `"2*phi"` or `"R^2 - 2*Z^2"`.
    pub fn parse(source: &str) -> Result<Self> {
        let potential = Expression::parse(source, &["R", "phi", "Z"])
            .with_context(|| format!("invalid scalar potential '{source}'"))?;
        Ok(Self { potential })
    }

    /// Value of the potential at a Cartesian point.
    pub fn potential(&self, xyz: &Vector3<f64>) -> f64 {
        let (x, y, z) = (xyz[0], xyz[1], xyz[2]);
        self.potential.evaluate(&[x.hypot(y), y.atan2(x), z])
    }

    fn jet(&self, xyz: &Vector3<f64>) -> Jet {
        let (x, y, z) = (xyz[0], xyz[1], xyz[2]);
        let r2 = x * x + y * y;
        let r = r2.sqrt();
        let r3 = r2 * r;
        let r4 = r2 * r2;

        let big_r = Jet::new(
            r,
            Vector3::new(x / r, y / r, 0.0),
            Matrix3::new(
                y * y / r3,
                -x * y / r3,
                0.0,
                -x * y / r3,
                x * x / r3,
                0.0,
                0.0,
                0.0,
                0.0,
            ),
        );
        let mixed = (y * y - x * x) / r4;
        let phi = Jet::new(
            y.atan2(x),
            Vector3::new(-y / r2, x / r2, 0.0),
            Matrix3::new(
                2.0 * x * y / r4,
                mixed,
                0.0,
                mixed,
                -2.0 * x * y / r4,
                0.0,
                0.0,
                0.0,
                0.0,
            ),
        );
        self.potential.evaluate(&[big_r, phi, Jet::variable(z, 2)])
    }
}

impl MagneticField for ScalarPotentialRZField {
    fn b(&self, xyz: &Vector3<f64>, _t: f64) -> Vector3<f64> {
        self.jet(xyz).grad
    }

    fn grad_b(&self, xyz: &Vector3<f64>, _t: f64) -> Matrix3<f64> {
        self.jet(xyz).hess
    }

    fn sample(&self, xyz: &Vector3<f64>, _t: f64) -> FieldSample {
        let jet = self.jet(xyz);
        FieldSample {
            b: jet.grad,
            grad_b: jet.hess,
        }
    }
}

/// Superposition of fields.
#[derive(Default)]
pub struct FieldSum {
    fields: Vec<Box<dyn MagneticField>>,
}

impl FieldSum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl MagneticField + 'static) -> Self {
        self.fields.push(Box::new(field));
        self
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl MagneticField for FieldSum {
    fn b(&self, xyz: &Vector3<f64>, t: f64) -> Vector3<f64> {
        self.fields
            .iter()
            .fold(Vector3::zeros(), |acc, field| acc + field.b(xyz, t))
    }

    fn grad_b(&self, xyz: &Vector3<f64>, t: f64) -> Matrix3<f64> {
        self.fields
            .iter()
            .fold(Matrix3::zeros(), |acc, field| acc + field.grad_b(xyz, t))
    }
}

/// Complete elliptic integrals `(K(m), E(m))` of parameter `m = k^2`,
/// via the arithmetic-geometric mean.
pub fn complete_elliptic_integrals(m: f64) -> (f64, f64) {
    let mut a = 1.0;
    let mut b = (1.0 - m).sqrt();
    let mut c = m.sqrt();
    let mut sum = 0.5 * c * c;
    let mut pow = 0.5;
    for _ in 0..64 {
        if c.abs() <= f64::EPSILON * a {
            break;
        }
        let a_next = 0.5 * (a + b);
        let b_next = (a * b).sqrt();
        c = 0.5 * (a - b);
        a = a_next;
        b = b_next;
        pow *= 2.0;
        sum += pow * c * c;
    }
    let k = PI / (2.0 * a);
    (k, k * (1.0 - sum))
}
