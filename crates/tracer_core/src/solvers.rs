use crate::traits::{DynamicalSystem, Steppable};

/// Classic Runge-Kutta 4th Order Solver
pub struct Rk4 {
    k1: Vec<f64>,
    k2: Vec<f64>,
    k3: Vec<f64>,
    k4: Vec<f64>,
    tmp: Vec<f64>,
}

impl Rk4 {
    pub fn new(dim: usize) -> Self {
        Self {
            k1: vec![0.0; dim],
            k2: vec![0.0; dim],
            k3: vec![0.0; dim],
            k4: vec![0.0; dim],
            tmp: vec![0.0; dim],
        }
    }
}

impl Steppable for Rk4 {
    fn step(&mut self, system: &impl DynamicalSystem, t: &mut f64, state: &mut [f64], dt: f64) {
        let t0 = *t;

        // k1 = f(t, y)
        system.apply(t0, state, &mut self.k1);

        // k2 = f(t + dt/2, y + dt*k1/2)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + 0.5 * dt * self.k1[i];
        }
        system.apply(t0 + 0.5 * dt, &self.tmp, &mut self.k2);

        // k3 = f(t + dt/2, y + dt*k2/2)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + 0.5 * dt * self.k2[i];
        }
        system.apply(t0 + 0.5 * dt, &self.tmp, &mut self.k3);

        // k4 = f(t + dt, y + dt*k3)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k3[i];
        }
        system.apply(t0 + dt, &self.tmp, &mut self.k4);

        // y_next = y + dt/6 * (k1 + 2k2 + 2k3 + k4)
        for i in 0..state.len() {
            state[i] += dt / 6.0 * (self.k1[i] + 2.0 * self.k2[i] + 2.0 * self.k3[i] + self.k4[i]);
        }

        *t = t0 + dt;
    }
}

/// Operations shared by the embedded error-estimating kernels.
///
/// A kernel proposes a candidate step together with a per-component error
/// estimate; once the integrator accepts the candidate, the kernel builds a
/// continuous extension over the accepted interval.
pub trait EmbeddedKernel {
    /// Exponent used by the step-size controller, `1 / (q + 1)` where `q` is
    /// the order of the error estimate's leading term minus one.
    const ERROR_EXPONENT: f64;

    /// Drops any cached stage that belongs to a previous trajectory.
    fn reset(&mut self);

    /// Proposes a step of size `h` from `(t, y)`.
    /// Writes the candidate into `y_new` and the local error estimate into `err`.
    /// Returns the number of right-hand-side evaluations spent.
    fn attempt(
        &mut self,
        system: &impl DynamicalSystem,
        t: f64,
        y: &[f64],
        h: f64,
        y_new: &mut [f64],
        err: &mut [f64],
    ) -> usize;

    /// Records the accepted step `[t, t_new]` for dense output.
    /// Returns the number of right-hand-side evaluations spent.
    fn accept(
        &mut self,
        system: &impl DynamicalSystem,
        t: f64,
        y: &[f64],
        t_new: f64,
        y_new: &[f64],
    ) -> usize;

    /// Interpolates the last accepted step at the normalized position
    /// `theta` in `[0, 1]`.
    fn dense(&self, theta: f64, out: &mut [f64]);
}

#[cfg(feature = "high-precision")]
mod dopri {
    pub(super) const C: [f64; 7] = [0.0, 1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0, 1.0];

    pub(super) const A: [[f64; 6]; 7] = [
        [0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        [1.0 / 5.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        [3.0 / 40.0, 9.0 / 40.0, 0.0, 0.0, 0.0, 0.0],
        [44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0, 0.0, 0.0, 0.0],
        [
            19372.0 / 6561.0,
            -25360.0 / 2187.0,
            64448.0 / 6561.0,
            -212.0 / 729.0,
            0.0,
            0.0,
        ],
        [
            9017.0 / 3168.0,
            -355.0 / 33.0,
            46732.0 / 5247.0,
            49.0 / 176.0,
            -5103.0 / 18656.0,
            0.0,
        ],
        [
            35.0 / 384.0,
            0.0,
            500.0 / 1113.0,
            125.0 / 192.0,
            -2187.0 / 6784.0,
            11.0 / 84.0,
        ],
    ];

    /// 5th order weights; identical to the last row of `A` (FSAL).
    pub(super) const B: [f64; 7] = [
        35.0 / 384.0,
        0.0,
        500.0 / 1113.0,
        125.0 / 192.0,
        -2187.0 / 6784.0,
        11.0 / 84.0,
        0.0,
    ];

    /// Difference between the 5th and the embedded 4th order weights.
    pub(super) const E: [f64; 7] = [
        35.0 / 384.0 - 5179.0 / 57600.0,
        0.0,
        500.0 / 1113.0 - 7571.0 / 16695.0,
        125.0 / 192.0 - 393.0 / 640.0,
        -2187.0 / 6784.0 + 92097.0 / 339200.0,
        11.0 / 84.0 - 187.0 / 2100.0,
        -1.0 / 40.0,
    ];

    /// Continuous extension (Hairer, Norsett & Wanner, dopri5).
    pub(super) const D: [f64; 7] = [
        -12715105075.0 / 11282082432.0,
        0.0,
        87487479700.0 / 32700410799.0,
        -10690763975.0 / 1880347072.0,
        701980252875.0 / 199316789632.0,
        -1453857185.0 / 822651844.0,
        69997945.0 / 29380423.0,
    ];
}

/// Dormand-Prince 5(4) pair with FSAL and a 4th order continuous extension.
#[cfg(feature = "high-precision")]
pub struct DormandPrince54 {
    k: [Vec<f64>; 7],
    tmp: Vec<f64>,
    /// Time at which `k[0]` holds `f(t, y)`.
    fsal_t: Option<f64>,
    rcont: [Vec<f64>; 5],
}

#[cfg(feature = "high-precision")]
impl DormandPrince54 {
    pub fn new(dim: usize) -> Self {
        Self {
            k: std::array::from_fn(|_| vec![0.0; dim]),
            tmp: vec![0.0; dim],
            fsal_t: None,
            rcont: std::array::from_fn(|_| vec![0.0; dim]),
        }
    }
}

#[cfg(feature = "high-precision")]
impl EmbeddedKernel for DormandPrince54 {
    const ERROR_EXPONENT: f64 = 0.2;

    fn reset(&mut self) {
        self.fsal_t = None;
    }

    fn attempt(
        &mut self,
        system: &impl DynamicalSystem,
        t: f64,
        y: &[f64],
        h: f64,
        y_new: &mut [f64],
        err: &mut [f64],
    ) -> usize {
        use dopri::{A, B, C, E};

        let mut evals = 0;
        if self.fsal_t != Some(t) {
            system.apply(t, y, &mut self.k[0]);
            self.fsal_t = Some(t);
            evals += 1;
        }

        for stage in 1..6 {
            for i in 0..y.len() {
                let mut sum = 0.0;
                for j in 0..stage {
                    sum += A[stage][j] * self.k[j][i];
                }
                self.tmp[i] = y[i] + h * sum;
            }
            system.apply(t + C[stage] * h, &self.tmp, &mut self.k[stage]);
            evals += 1;
        }

        for i in 0..y.len() {
            let mut sum = 0.0;
            for j in 0..6 {
                sum += B[j] * self.k[j][i];
            }
            y_new[i] = y[i] + h * sum;
        }

        // k7 = f(t + h, y_new), reused as k1 of the next step
        system.apply(t + h, y_new, &mut self.k[6]);
        evals += 1;

        for i in 0..y.len() {
            let mut sum = 0.0;
            for j in 0..7 {
                sum += E[j] * self.k[j][i];
            }
            err[i] = h * sum;
        }

        evals
    }

    fn accept(
        &mut self,
        _system: &impl DynamicalSystem,
        t: f64,
        y: &[f64],
        t_new: f64,
        y_new: &[f64],
    ) -> usize {
        use dopri::D;

        let h = t_new - t;
        for i in 0..y.len() {
            let ydiff = y_new[i] - y[i];
            let bspl = h * self.k[0][i] - ydiff;
            self.rcont[0][i] = y[i];
            self.rcont[1][i] = ydiff;
            self.rcont[2][i] = bspl;
            self.rcont[3][i] = ydiff - h * self.k[6][i] - bspl;
            let mut sum = 0.0;
            for j in 0..7 {
                sum += D[j] * self.k[j][i];
            }
            self.rcont[4][i] = h * sum;
        }

        self.k.swap(0, 6);
        self.fsal_t = Some(t_new);
        0
    }

    fn dense(&self, theta: f64, out: &mut [f64]) {
        let theta1 = 1.0 - theta;
        for i in 0..out.len() {
            out[i] = self.rcont[0][i]
                + theta
                    * (self.rcont[1][i]
                        + theta1
                            * (self.rcont[2][i]
                                + theta * (self.rcont[3][i] + theta1 * self.rcont[4][i])));
        }
    }
}

/// Classic RK4 with step doubling.
///
/// The difference between one full step and two half steps estimates the
/// local error; the returned candidate is the Richardson-extrapolated value.
/// Dense output is the cubic Hermite interpolant through both endpoints.
pub struct Rk4Doubling {
    rk4: Rk4,
    y_full: Vec<f64>,
    f0: Vec<f64>,
    f1: Vec<f64>,
    y0: Vec<f64>,
    y1: Vec<f64>,
    h: f64,
    /// Time at which `f1` holds the derivative of the last accepted endpoint.
    f1_t: Option<f64>,
}

impl Rk4Doubling {
    pub fn new(dim: usize) -> Self {
        Self {
            rk4: Rk4::new(dim),
            y_full: vec![0.0; dim],
            f0: vec![0.0; dim],
            f1: vec![0.0; dim],
            y0: vec![0.0; dim],
            y1: vec![0.0; dim],
            h: 0.0,
            f1_t: None,
        }
    }
}

impl EmbeddedKernel for Rk4Doubling {
    const ERROR_EXPONENT: f64 = 0.2;

    fn reset(&mut self) {
        self.f1_t = None;
    }

    fn attempt(
        &mut self,
        system: &impl DynamicalSystem,
        t: f64,
        y: &[f64],
        h: f64,
        y_new: &mut [f64],
        err: &mut [f64],
    ) -> usize {
        let mut tt = t;
        self.y_full.copy_from_slice(y);
        self.rk4.step(system, &mut tt, &mut self.y_full, h);

        tt = t;
        y_new.copy_from_slice(y);
        self.rk4.step(system, &mut tt, y_new, 0.5 * h);
        self.rk4.step(system, &mut tt, y_new, 0.5 * h);

        for i in 0..y.len() {
            err[i] = (y_new[i] - self.y_full[i]) / 15.0;
            y_new[i] += err[i];
        }
        12
    }

    fn accept(
        &mut self,
        system: &impl DynamicalSystem,
        t: f64,
        y: &[f64],
        t_new: f64,
        y_new: &[f64],
    ) -> usize {
        let mut evals = 0;
        if self.f1_t == Some(t) {
            std::mem::swap(&mut self.f0, &mut self.f1);
        } else {
            system.apply(t, y, &mut self.f0);
            evals += 1;
        }
        system.apply(t_new, y_new, &mut self.f1);
        evals += 1;

        self.y0.copy_from_slice(y);
        self.y1.copy_from_slice(y_new);
        self.h = t_new - t;
        self.f1_t = Some(t_new);
        evals
    }

    fn dense(&self, theta: f64, out: &mut [f64]) {
        let t2 = theta * theta;
        let t3 = t2 * theta;
        let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
        let h10 = t3 - 2.0 * t2 + theta;
        let h01 = -2.0 * t3 + 3.0 * t2;
        let h11 = t3 - t2;
        for i in 0..out.len() {
            out[i] = h00 * self.y0[i]
                + h10 * self.h * self.f0[i]
                + h01 * self.y1[i]
                + h11 * self.h * self.f1[i];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Decay {
        rate: f64,
    }

    impl DynamicalSystem for Decay {
        fn dimension(&self) -> usize {
            1
        }

        fn apply(&self, _t: f64, x: &[f64], out: &mut [f64]) {
            out[0] = -self.rate * x[0];
        }
    }

    /// y' = 3 t^2, exact solution t^3.
    struct Cubic;

    impl DynamicalSystem for Cubic {
        fn dimension(&self) -> usize {
            1
        }

        fn apply(&self, t: f64, _x: &[f64], out: &mut [f64]) {
            out[0] = 3.0 * t * t;
        }
    }

    fn attempt_and_accept<K: EmbeddedKernel>(
        kernel: &mut K,
        system: &impl DynamicalSystem,
        t: f64,
        y: &[f64],
        h: f64,
    ) -> (Vec<f64>, Vec<f64>) {
        let mut y_new = vec![0.0; y.len()];
        let mut err = vec![0.0; y.len()];
        kernel.attempt(system, t, y, h, &mut y_new, &mut err);
        kernel.accept(system, t, y, t + h, &y_new);
        (y_new, err)
    }

    #[test]
    fn rk4_tracks_exponential_decay() {
        let system = Decay { rate: 1.0 };
        let mut solver = Rk4::new(1);
        let mut t = 0.0;
        let mut state = vec![1.0];
        for _ in 0..100 {
            solver.step(&system, &mut t, &mut state, 0.01);
        }
        assert!((t - 1.0).abs() < 1e-12);
        assert!((state[0] - (-1.0f64).exp()).abs() < 1e-9);
    }

    #[test]
    fn rk4_doubling_is_exact_for_cubic_and_interpolates_it() {
        let mut kernel = Rk4Doubling::new(1);
        let (y_new, err) = attempt_and_accept(&mut kernel, &Cubic, 0.0, &[0.0], 1.0);
        assert!((y_new[0] - 1.0).abs() < 1e-14);
        assert!(err[0].abs() < 1e-14);

        let mut out = [0.0];
        kernel.dense(0.5, &mut out);
        assert!((out[0] - 0.125).abs() < 1e-14);
    }

    #[test]
    fn rk4_doubling_error_estimate_shrinks_with_step() {
        let system = Decay { rate: 1.0 };
        let mut kernel = Rk4Doubling::new(1);
        let (_, err_big) = attempt_and_accept(&mut kernel, &system, 0.0, &[1.0], 0.4);
        let (_, err_small) = attempt_and_accept(&mut kernel, &system, 0.0, &[1.0], 0.2);
        // Local error scales like h^5.
        let ratio = err_big[0].abs() / err_small[0].abs();
        assert!(ratio > 20.0 && ratio < 45.0, "ratio = {ratio}");
    }

    #[cfg(feature = "high-precision")]
    #[test]
    fn dormand_prince_is_exact_for_cubic_and_interpolates_it() {
        let mut kernel = DormandPrince54::new(1);
        let (y_new, err) = attempt_and_accept(&mut kernel, &Cubic, 0.0, &[0.0], 1.0);
        assert!((y_new[0] - 1.0).abs() < 1e-14);
        assert!(err[0].abs() < 1e-14);

        let mut out = [0.0];
        for &theta in &[0.0, 0.25, 0.5, 0.9, 1.0] {
            kernel.dense(theta, &mut out);
            assert!((out[0] - theta.powi(3)).abs() < 1e-13, "theta = {theta}");
        }
    }

    #[cfg(feature = "high-precision")]
    #[test]
    fn dormand_prince_reuses_last_stage_after_accept() {
        struct Counting<'a> {
            calls: &'a std::cell::Cell<usize>,
        }
        impl DynamicalSystem for Counting<'_> {
            fn dimension(&self) -> usize {
                1
            }
            fn apply(&self, _t: f64, x: &[f64], out: &mut [f64]) {
                self.calls.set(self.calls.get() + 1);
                out[0] = -x[0];
            }
        }

        let calls = std::cell::Cell::new(0);
        let system = Counting { calls: &calls };
        let mut kernel = DormandPrince54::new(1);
        let mut y_new = [0.0];
        let mut err = [0.0];

        let first = kernel.attempt(&system, 0.0, &[1.0], 0.1, &mut y_new, &mut err);
        assert_eq!(first, 7);
        kernel.accept(&system, 0.0, &[1.0], 0.1, &y_new);
        let y1 = y_new;
        let second = kernel.attempt(&system, 0.1, &y1, 0.1, &mut y_new, &mut err);
        assert_eq!(second, 6);
        assert_eq!(calls.get(), 13);
        assert!((y_new[0] - (-0.2f64).exp()).abs() < 1e-8);
    }
}
