use nalgebra::{Matrix3, Vector3};

/// A magnetic field queried by the tracing drivers.
///
/// Implementations must be side-effect free; the integrators call them many
/// times per step and from several threads when traces run in parallel.
pub trait MagneticField: Send + Sync {
    /// Field vector at `xyz` and time `t`. Static fields ignore `t`.
    fn b(&self, xyz: &Vector3<f64>, t: f64) -> Vector3<f64>;

    /// Jacobian of the field, `grad[(i, j)] = dB_i / dx_j`.
    ///
    /// Defaults to second-order central differences on `b`.
    fn grad_b(&self, xyz: &Vector3<f64>, t: f64) -> Matrix3<f64> {
        let mut grad = Matrix3::zeros();
        for j in 0..3 {
            let h = 1e-6 * (1.0 + xyz[j].abs());
            let mut plus = *xyz;
            let mut minus = *xyz;
            plus[j] += h;
            minus[j] -= h;
            let column = (self.b(&plus, t) - self.b(&minus, t)) / (2.0 * h);
            grad.set_column(j, &column);
        }
        grad
    }

    /// Field and Jacobian together.
    fn sample(&self, xyz: &Vector3<f64>, t: f64) -> FieldSample {
        FieldSample {
            b: self.b(xyz, t),
            grad_b: self.grad_b(xyz, t),
        }
    }
}

/// Field value plus Jacobian at one point, with the derived quantities the
/// guiding-center equations need.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldSample {
    pub b: Vector3<f64>,
    pub grad_b: Matrix3<f64>,
}

impl FieldSample {
    pub fn abs_b(&self) -> f64 {
        self.b.norm()
    }

    /// `∇|B|`, using `∂_j |B| = B_i ∂_j B_i / |B|`.
    pub fn grad_abs_b(&self) -> Vector3<f64> {
        self.grad_b.transpose() * self.b / self.abs_b()
    }

    pub fn curl_b(&self) -> Vector3<f64> {
        let g = &self.grad_b;
        Vector3::new(
            g[(2, 1)] - g[(1, 2)],
            g[(0, 2)] - g[(2, 0)],
            g[(1, 0)] - g[(0, 1)],
        )
    }

    pub fn divergence(&self) -> f64 {
        self.grad_b.trace()
    }
}
