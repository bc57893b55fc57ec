use nalgebra::{Matrix3, Vector3};
use std::ops::{Add, Div, Mul, Neg, Sub};

/// Number types the expression VM can evaluate on.
pub trait Scalar:
    Copy
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
{
    fn constant(value: f64) -> Self;
    fn sin(self) -> Self;
    fn cos(self) -> Self;
    fn tan(self) -> Self;
    fn exp(self) -> Self;
    fn ln(self) -> Self;
    fn sqrt(self) -> Self;
    fn pow(self, exponent: Self) -> Self;
}

impl Scalar for f64 {
    fn constant(value: f64) -> Self {
        value
    }
    fn sin(self) -> Self {
        f64::sin(self)
    }
    fn cos(self) -> Self {
        f64::cos(self)
    }
    fn tan(self) -> Self {
        f64::tan(self)
    }
    fn exp(self) -> Self {
        f64::exp(self)
    }
    fn ln(self) -> Self {
        f64::ln(self)
    }
    fn sqrt(self) -> Self {
        f64::sqrt(self)
    }
    fn pow(self, exponent: Self) -> Self {
        self.powf(exponent)
    }
}

/// Second-order forward-mode number in three variables.
///
/// Carries a value together with its gradient and Hessian, so a single
/// evaluation of a scalar potential yields the field (gradient) and its
/// Jacobian (Hessian).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Jet {
    pub val: f64,
    pub grad: Vector3<f64>,
    pub hess: Matrix3<f64>,
}

impl Jet {
    pub fn new(val: f64, grad: Vector3<f64>, hess: Matrix3<f64>) -> Self {
        Self { val, grad, hess }
    }

    /// The independent variable with index `axis`, evaluated at `val`.
    pub fn variable(val: f64, axis: usize) -> Self {
        let mut grad = Vector3::zeros();
        grad[axis] = 1.0;
        Self::new(val, grad, Matrix3::zeros())
    }

    fn is_constant(&self) -> bool {
        self.grad == Vector3::zeros() && self.hess == Matrix3::zeros()
    }

    /// Applies a univariate function with value `f`, first derivative `df`
    /// and second derivative `d2f` at `self.val`.
    fn chain(self, f: f64, df: f64, d2f: f64) -> Self {
        Self {
            val: f,
            grad: self.grad * df,
            hess: self.hess * df + self.grad * self.grad.transpose() * d2f,
        }
    }

    pub fn recip(self) -> Self {
        let inv = 1.0 / self.val;
        self.chain(inv, -inv * inv, 2.0 * inv * inv * inv)
    }
}

impl Add for Jet {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.val + rhs.val, self.grad + rhs.grad, self.hess + rhs.hess)
    }
}

impl Sub for Jet {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.val - rhs.val, self.grad - rhs.grad, self.hess - rhs.hess)
    }
}

impl Mul for Jet {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        let cross = self.grad * rhs.grad.transpose();
        Self::new(
            self.val * rhs.val,
            self.grad * rhs.val + rhs.grad * self.val,
            self.hess * rhs.val + rhs.hess * self.val + cross + cross.transpose(),
        )
    }
}

impl Div for Jet {
    type Output = Self;
    fn div(self, rhs: Self) -> Self {
        self * rhs.recip()
    }
}

impl Neg for Jet {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.val, -self.grad, -self.hess)
    }
}

impl Scalar for Jet {
    fn constant(value: f64) -> Self {
        Self::new(value, Vector3::zeros(), Matrix3::zeros())
    }

    fn sin(self) -> Self {
        let (s, c) = self.val.sin_cos();
        self.chain(s, c, -s)
    }

    fn cos(self) -> Self {
        let (s, c) = self.val.sin_cos();
        self.chain(c, -s, -c)
    }

    fn tan(self) -> Self {
        let t = self.val.tan();
        let sec2 = 1.0 + t * t;
        self.chain(t, sec2, 2.0 * t * sec2)
    }

    fn exp(self) -> Self {
        let e = self.val.exp();
        self.chain(e, e, e)
    }

    fn ln(self) -> Self {
        let inv = 1.0 / self.val;
        self.chain(self.val.ln(), inv, -inv * inv)
    }

    fn sqrt(self) -> Self {
        let s = self.val.sqrt();
        self.chain(s, 0.5 / s, -0.25 / (s * self.val))
    }

    fn pow(self, exponent: Self) -> Self {
        if exponent.is_constant() {
            // Also covers negative bases with integer exponents.
            let c = exponent.val;
            let v = self.val;
            self.chain(v.powf(c), c * v.powf(c - 1.0), c * (c - 1.0) * v.powf(c - 2.0))
        } else {
            (self.ln() * exponent).exp()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn xyz(x: f64, y: f64, z: f64) -> [Jet; 3] {
        [Jet::variable(x, 0), Jet::variable(y, 1), Jet::variable(z, 2)]
    }

    #[test]
    fn product_has_mixed_second_derivative() {
        let [x, y, z] = xyz(2.0, 3.0, 5.0);
        let f = x * y * z;
        assert_eq!(f.val, 30.0);
        assert_eq!(f.grad, Vector3::new(15.0, 10.0, 6.0));
        assert_eq!(f.hess[(0, 1)], 5.0);
        assert_eq!(f.hess[(1, 0)], 5.0);
        assert_eq!(f.hess[(0, 0)], 0.0);
    }

    #[test]
    fn quotient_and_chain_rule_match_closed_forms() {
        let [x, y, _] = xyz(0.7, 1.3, 0.0);
        // f = sin(x) / y
        let f = x.sin() / y;
        assert_relative_eq!(f.grad[0], 0.7f64.cos() / 1.3, epsilon = 1e-15);
        assert_relative_eq!(f.grad[1], -0.7f64.sin() / (1.3 * 1.3), epsilon = 1e-15);
        assert_relative_eq!(f.hess[(0, 0)], -0.7f64.sin() / 1.3, epsilon = 1e-15);
        assert_relative_eq!(f.hess[(1, 1)], 2.0 * 0.7f64.sin() / 1.3f64.powi(3), epsilon = 1e-15);
        assert_relative_eq!(f.hess[(0, 1)], -0.7f64.cos() / (1.3 * 1.3), epsilon = 1e-15);
    }

    #[test]
    fn constant_and_variable_exponents_agree_for_positive_base() {
        let [x, _, _] = xyz(1.7, 0.0, 0.0);
        let a = x.pow(Jet::constant(2.5));
        let b = x.pow(Jet::constant(2.5) + Jet::constant(0.0) * x);
        assert_relative_eq!(a.val, b.val, epsilon = 1e-12);
        assert_relative_eq!(a.grad[0], 2.5 * 1.7f64.powf(1.5), epsilon = 1e-12);
        assert_relative_eq!(a.hess[(0, 0)], 3.75 * 1.7f64.powf(0.5), epsilon = 1e-12);
        assert_relative_eq!(b.hess[(0, 0)], a.hess[(0, 0)], epsilon = 1e-12);
    }

    #[test]
    fn integer_power_of_negative_base() {
        let [x, _, _] = xyz(-2.0, 0.0, 0.0);
        let f = x.pow(Jet::constant(3.0));
        assert_eq!(f.val, -8.0);
        assert_eq!(f.grad[0], 12.0);
        assert_eq!(f.hess[(0, 0)], -12.0);
    }
}
