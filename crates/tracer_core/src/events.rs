//! Bracket-and-refine localisation of events inside an accepted step.

use std::f64::consts::{PI, TAU};

/// Halving cap; the bracket is already far below the requested precision
/// long before this is reached.
const MAX_HALVINGS: usize = 200;

/// Precision targets for `refine_crossing`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefineTolerance {
    /// Stop as soon as `|g| <= value`.
    pub value: f64,
    /// Stop once the bracket is narrower than this.
    pub time: f64,
}

impl RefineTolerance {
    /// Tolerances for a step `[t0, t1]` integrated with tolerance `tol`.
    pub fn for_step(tol: f64, t0: f64, t1: f64) -> Self {
        let floor = 4.0 * f64::EPSILON * t0.abs().max(t1.abs());
        Self {
            value: tol,
            time: (tol * (t1 - t0)).max(floor),
        }
    }
}

/// Locates a sign change of `g` on `[lo, hi]` by bisection.
///
/// `g_lo` is the value at `lo`; `g(hi)` must have the opposite sign. Only the
/// sign of `g` is used to pick the half, so infinite values are fine.
pub fn refine_crossing(
    mut lo: f64,
    mut hi: f64,
    g_lo: f64,
    tol: RefineTolerance,
    mut g: impl FnMut(f64) -> f64,
) -> f64 {
    let lo_negative = g_lo < 0.0;
    for _ in 0..MAX_HALVINGS {
        let mid = 0.5 * (lo + hi);
        if hi - lo <= tol.time {
            return mid;
        }
        let value = g(mid);
        if value.abs() <= tol.value {
            return mid;
        }
        if (value < 0.0) == lo_negative {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    0.5 * (lo + hi)
}

/// Wraps an angle into `(-pi, pi]`.
pub fn wrap_angle(angle: f64) -> f64 {
    let wrapped = (angle + PI).rem_euclid(TAU) - PI;
    if wrapped == -PI {
        PI
    } else {
        wrapped
    }
}

/// A sampling plane crossed during one step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaneCrossing {
    pub plane: usize,
    /// Unwrapped angle of the crossing, `phis[plane] + 2*pi*k`.
    pub target: f64,
    /// `phi - target` at the start of the step.
    pub offset_at_start: f64,
}

/// Follows the continuous (unwrapped) toroidal angle along a trajectory and
/// reports which sampling planes each step crosses.
#[derive(Debug, Clone)]
pub struct PlaneTracker {
    phis: Vec<f64>,
    phi: f64,
}

impl PlaneTracker {
    pub fn new(phis: &[f64], x: f64, y: f64) -> Self {
        Self {
            phis: phis.to_vec(),
            phi: y.atan2(x),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.phis.is_empty()
    }

    pub fn phi(&self) -> f64 {
        self.phi
    }

    /// Unwrapped angle of `(x, y)`, taken as the branch closest to the
    /// current angle.
    pub fn unwrap(&self, x: f64, y: f64) -> f64 {
        self.phi + wrap_angle(y.atan2(x) - self.phi)
    }

    /// Planes crossed when the angle moves from the current value to
    /// `phi_new`, in the order they are reached.
    pub fn crossings(&self, phi_new: f64) -> Vec<PlaneCrossing> {
        let mut found = Vec::new();
        for (plane, &p) in self.phis.iter().enumerate() {
            let k0 = ((self.phi - p) / TAU).floor() as i64;
            let k1 = ((phi_new - p) / TAU).floor() as i64;
            let ks: Vec<i64> = if k1 > k0 {
                (k0 + 1..=k1).collect()
            } else {
                (k1 + 1..=k0).rev().collect()
            };
            for k in ks {
                let target = p + TAU * k as f64;
                found.push(PlaneCrossing {
                    plane,
                    target,
                    offset_at_start: self.phi - target,
                });
            }
        }
        let increasing = phi_new >= self.phi;
        found.sort_by(|a, b| {
            let order = a.target.total_cmp(&b.target);
            if increasing {
                order
            } else {
                order.reverse()
            }
        });
        found
    }

    pub fn advance(&mut self, phi_new: f64) {
        self.phi = phi_new;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refine_finds_root_of_monotone_function() {
        let tol = RefineTolerance::for_step(1e-12, 0.0, 2.0);
        let root = refine_crossing(0.0, 2.0, -2.0, tol, |t| t * t - 2.0);
        assert!((root - 2.0f64.sqrt()).abs() < 1e-11);
    }

    #[test]
    fn refine_handles_infinite_values() {
        let tol = RefineTolerance::for_step(1e-10, 0.0, 1.0);
        let root = refine_crossing(0.0, 1.0, 1.0, tol, |t| {
            if t < 0.3 {
                1.0
            } else {
                f64::NEG_INFINITY
            }
        });
        assert!((root - 0.3).abs() < 1e-9);
    }

    #[test]
    fn wrap_angle_stays_in_half_open_interval() {
        assert!((wrap_angle(3.0 * PI) - PI).abs() < 1e-12);
        assert!((wrap_angle(-PI) - PI).abs() < 1e-12);
        assert!((wrap_angle(0.1 - TAU) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn tracker_reports_crossings_in_travel_order() {
        let phis = [0.0, PI / 2.0];
        let tracker = PlaneTracker::new(&phis, 1.0, -1.0);
        assert!((tracker.phi() + PI / 4.0).abs() < 1e-15);

        // From -pi/4 up to 3*pi/4 crosses 0 and then pi/2.
        let crossings = tracker.crossings(3.0 * PI / 4.0);
        let planes: Vec<usize> = crossings.iter().map(|c| c.plane).collect();
        assert_eq!(planes, vec![0, 1]);
        assert!(crossings[0].offset_at_start < 0.0);

        // Going backwards across both planes reverses the order.
        let mut tracker = PlaneTracker::new(&phis, -1.0, 1.0);
        let start = tracker.phi();
        let crossings = tracker.crossings(start - PI);
        let planes: Vec<usize> = crossings.iter().map(|c| c.plane).collect();
        assert_eq!(planes, vec![1, 0]);
        assert!(crossings[0].offset_at_start > 0.0);
        tracker.advance(start - PI);
        assert!(tracker.crossings(start - PI).is_empty());
    }

    #[test]
    fn tracker_counts_every_turn_within_one_step() {
        let tracker = PlaneTracker::new(&[1.0], 1.0, 0.0);
        let crossings = tracker.crossings(2.0 * TAU + 0.5);
        let targets: Vec<f64> = crossings.iter().map(|c| c.target).collect();
        assert_eq!(targets, vec![1.0, 1.0 + TAU]);
    }

    #[test]
    fn unwrap_continues_past_the_branch_cut() {
        let mut tracker = PlaneTracker::new(&[], -1.0, 0.01);
        let next = tracker.unwrap(-1.0, -0.01);
        assert!(next > PI);
        tracker.advance(next);
        assert!(tracker.unwrap(-1.0, -0.02) > PI);
    }
}
