//! Piecewise polynomial interpolation of scalar functions on a regular grid in
//! cylindrical coordinates `(r, phi, z)`.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// One axis of the grid: `[min, max]` split into `cells` equal intervals.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "RawGridRange")]
pub struct GridRange {
    pub min: f64,
    pub max: f64,
    pub cells: usize,
}

impl GridRange {
    pub fn new(min: f64, max: f64, cells: usize) -> Self {
        Self { min, max, cells }
    }

    fn validate(&self, axis: &str) -> Result<()> {
        if !self.min.is_finite() || !self.max.is_finite() {
            bail!("{axis} range must be finite, got [{}, {}].", self.min, self.max);
        }
        if self.min >= self.max {
            bail!(
                "{axis} range must satisfy min < max, got [{}, {}].",
                self.min,
                self.max
            );
        }
        if self.cells == 0 {
            bail!("{axis} range needs at least one cell.");
        }
        Ok(())
    }

    fn nodes(&self, degree: usize) -> Option<usize> {
        self.cells.checked_mul(degree)?.checked_add(1)
    }

    fn width(&self) -> f64 {
        (self.max - self.min) / self.cells as f64
    }

    /// Cell index and local coordinate in `[0, 1]`, or `None` outside the range.
    fn locate(&self, x: f64) -> Option<(usize, f64)> {
        if !(x >= self.min && x <= self.max) {
            return None;
        }
        let scaled = (x - self.min) / self.width();
        let cell = (scaled.floor() as usize).min(self.cells - 1);
        Some((cell, scaled - cell as f64))
    }
}

#[derive(Deserialize)]
struct RawGridRange {
    min: f64,
    max: f64,
    cells: usize,
}

impl TryFrom<RawGridRange> for GridRange {
    type Error = anyhow::Error;

    fn try_from(raw: RawGridRange) -> Result<Self> {
        let range = Self::new(raw.min, raw.max, raw.cells);
        range.validate("grid")?;
        Ok(range)
    }
}

/// Lagrange interpolation on `degree + 1` equispaced nodes per cell.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "RawInterpolationRule")]
pub struct UniformInterpolationRule {
    degree: usize,
}

impl UniformInterpolationRule {
    pub fn new(degree: usize) -> Result<Self> {
        if degree == 0 {
            bail!("Interpolation degree must be at least 1.");
        }
        Ok(Self { degree })
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    fn node(&self, j: usize) -> f64 {
        j as f64 / self.degree as f64
    }

    fn basis(&self, s: f64, out: &mut [f64]) {
        for j in 0..=self.degree {
            let sj = self.node(j);
            let mut value = 1.0;
            for m in 0..=self.degree {
                if m != j {
                    let sm = self.node(m);
                    value *= (s - sm) / (sj - sm);
                }
            }
            out[j] = value;
        }
    }
}

#[derive(Deserialize)]
struct RawInterpolationRule {
    degree: usize,
}

impl TryFrom<RawInterpolationRule> for UniformInterpolationRule {
    type Error = anyhow::Error;

    fn try_from(raw: RawInterpolationRule) -> Result<Self> {
        Self::new(raw.degree)
    }
}

/// Tensor-product piecewise polynomial interpolant of a scalar function of
/// `(r, phi, z)`.
///
/// Deserialization applies the same checks as [`Self::from_fn`] and also
/// requires one value per interpolation node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "RawInterpolant")]
pub struct RegularGridInterpolant3D {
    rule: UniformInterpolationRule,
    ranges: [GridRange; 3],
    values: Vec<f64>,
}

impl RegularGridInterpolant3D {
    /// Samples `f(r, phi, z)` at every interpolation node.
    pub fn from_fn(
        rule: UniformInterpolationRule,
        r_range: GridRange,
        phi_range: GridRange,
        z_range: GridRange,
        f: impl Fn(f64, f64, f64) -> f64,
    ) -> Result<Self> {
        let ranges = [r_range, phi_range, z_range];
        let counts = node_counts(rule, &ranges)?;
        let mut values = Vec::with_capacity(counts[0] * counts[1] * counts[2]);

        let coordinate = |axis: usize, idx: usize| {
            let range = &ranges[axis];
            range.min + range.width() * idx as f64 / rule.degree as f64
        };

        for ir in 0..counts[0] {
            let r = coordinate(0, ir);
            for iphi in 0..counts[1] {
                let phi = coordinate(1, iphi);
                for iz in 0..counts[2] {
                    let z = coordinate(2, iz);
                    let value = f(r, phi, z);
                    if !value.is_finite() {
                        bail!("Interpolated function is not finite at ({r}, {phi}, {z}).");
                    }
                    values.push(value);
                }
            }
        }

        Ok(Self {
            rule,
            ranges,
            values,
        })
    }

    fn from_values(
        rule: UniformInterpolationRule,
        ranges: [GridRange; 3],
        values: Vec<f64>,
    ) -> Result<Self> {
        let counts = node_counts(rule, &ranges)?;
        let expected = counts[0] * counts[1] * counts[2];
        if values.len() != expected {
            bail!(
                "Interpolant needs {expected} node values for a {}x{}x{} grid, got {}.",
                counts[0],
                counts[1],
                counts[2],
                values.len()
            );
        }
        if let Some(idx) = values.iter().position(|v| !v.is_finite()) {
            bail!("Interpolant node value {idx} is not finite.");
        }
        Ok(Self {
            rule,
            ranges,
            values,
        })
    }

    pub fn ranges(&self) -> &[GridRange; 3] {
        &self.ranges
    }

    /// The same interpolant with every node value negated.
    pub fn negated(&self) -> Self {
        Self {
            rule: self.rule,
            ranges: self.ranges,
            values: self.values.iter().map(|v| -v).collect(),
        }
    }

    /// Interpolated value, or `None` when the point lies outside the grid.
    pub fn evaluate(&self, r: f64, phi: f64, z: f64) -> Option<f64> {
        let (cr, sr) = self.ranges[0].locate(r)?;
        let (cphi, sphi) = self.ranges[1].locate(phi)?;
        let (cz, sz) = self.ranges[2].locate(z)?;

        let p = self.rule.degree;
        let mut wr = vec![0.0; p + 1];
        let mut wphi = vec![0.0; p + 1];
        let mut wz = vec![0.0; p + 1];
        self.rule.basis(sr, &mut wr);
        self.rule.basis(sphi, &mut wphi);
        self.rule.basis(sz, &mut wz);

        let nphi = self.ranges[1].cells * p + 1;
        let nz = self.ranges[2].cells * p + 1;

        let mut result = 0.0;
        for (a, w_a) in wr.iter().enumerate() {
            let ir = cr * p + a;
            for (b, w_b) in wphi.iter().enumerate() {
                let iphi = cphi * p + b;
                let row = (ir * nphi + iphi) * nz + cz * p;
                let mut inner = 0.0;
                for (c, w_c) in wz.iter().enumerate() {
                    inner += w_c * self.values[row + c];
                }
                result += w_a * w_b * inner;
            }
        }
        Some(result)
    }
}

/// Validates the ranges and returns the node count along each axis.
fn node_counts(rule: UniformInterpolationRule, ranges: &[GridRange; 3]) -> Result<[usize; 3]> {
    let mut counts = [0; 3];
    for ((count, range), axis) in counts.iter_mut().zip(ranges).zip(["r", "phi", "z"]) {
        range.validate(axis)?;
        *count = match range.nodes(rule.degree) {
            Some(n) => n,
            None => bail!("{axis} range has too many cells."),
        };
    }
    let total = counts[0]
        .checked_mul(counts[1])
        .and_then(|n| n.checked_mul(counts[2]));
    if total.is_none() {
        bail!("Interpolation grid has too many nodes.");
    }
    Ok(counts)
}

#[derive(Deserialize)]
struct RawInterpolant {
    rule: UniformInterpolationRule,
    ranges: [GridRange; 3],
    values: Vec<f64>,
}

impl TryFrom<RawInterpolant> for RegularGridInterpolant3D {
    type Error = anyhow::Error;

    fn try_from(raw: RawInterpolant) -> Result<Self> {
        Self::from_values(raw.rule, raw.ranges, raw.values)
    }
}
