//! Natural cubic spline interpolation, with derivatives linear in the data.

use crate::errors::*;
use nalgebra::{DMatrix, DVector};

/// Interpolating cubic spline with zero second derivative at both ends
#[derive(Debug, Clone, PartialEq)]
pub struct NaturalSpline {
    x: Vec<f64>,
    y: Vec<f64>,
    /// Second derivative at each knot
    m: Vec<f64>,
}

impl NaturalSpline {
    /// Fit a spline through `(x[i], y[i])`; `x` must be strictly increasing.
    pub fn fit(x: &[f64], y: &[f64]) -> Result<Self> {
        if x.len() != y.len() {
            return Err(ThermoError::ArrayLengthMismatch(y.len(), x.len()));
        }
        if x.len() < 2 {
            return Err(ThermoError::InvalidConfiguration(
                "a spline needs at least two points".to_string(),
            ));
        }
        if x.windows(2).any(|w| !(w[1] > w[0])) {
            return Err(ThermoError::InvalidConfiguration(
                "spline knots must be strictly increasing".to_string(),
            ));
        }
        if y.iter().any(|v| !v.is_finite()) {
            return Err(ThermoError::InvalidConfiguration(
                "spline values must be finite".to_string(),
            ));
        }

        let n = x.len();
        let mut m = vec![0.0; n];
        if n > 2 {
            // Interior second derivatives from continuity of the first derivative
            let interior = n - 2;
            let mut a = DMatrix::<f64>::zeros(interior, interior);
            let mut b = DVector::<f64>::zeros(interior);
            for i in 1..n - 1 {
                let (h0, h1) = (x[i] - x[i - 1], x[i + 1] - x[i]);
                let row = i - 1;
                a[(row, row)] = (h0 + h1) / 3.0;
                if row > 0 {
                    a[(row, row - 1)] = h0 / 6.0;
                }
                if row + 1 < interior {
                    a[(row, row + 1)] = h1 / 6.0;
                }
                b[row] = (y[i + 1] - y[i]) / h1 - (y[i] - y[i - 1]) / h0;
            }
            let solution = a.lu().solve(&b).ok_or_else(|| {
                ThermoError::Numerical("singular spline system".to_string())
            })?;
            m[1..n - 1].copy_from_slice(solution.as_slice());
        }

        Ok(Self {
            x: x.to_vec(),
            y: y.to_vec(),
            m,
        })
    }

    /// Knot positions
    pub fn knots(&self) -> &[f64] {
        &self.x
    }

    /// Index of the interval containing `t`, clamped to the end intervals
    fn interval(&self, t: f64) -> usize {
        let last = self.x.len() - 2;
        match self.x.partition_point(|&knot| knot <= t) {
            0 => 0,
            i => (i - 1).min(last),
        }
    }

    /// Spline value at `t`
    pub fn value(&self, t: f64) -> f64 {
        let i = self.interval(t);
        let h = self.x[i + 1] - self.x[i];
        let a = (self.x[i + 1] - t) / h;
        let b = (t - self.x[i]) / h;
        a * self.y[i]
            + b * self.y[i + 1]
            + ((a.powi(3) - a) * self.m[i] + (b.powi(3) - b) * self.m[i + 1]) * h * h / 6.0
    }

    /// First derivative at `t`
    pub fn derivative(&self, t: f64) -> f64 {
        let i = self.interval(t);
        let h = self.x[i + 1] - self.x[i];
        let a = (self.x[i + 1] - t) / h;
        let b = (t - self.x[i]) / h;
        (self.y[i + 1] - self.y[i]) / h
            - (3.0 * a * a - 1.0) * h * self.m[i] / 6.0
            + (3.0 * b * b - 1.0) * h * self.m[i + 1] / 6.0
    }

    /// Second derivative at `t`; linear between knots and zero at both ends
    pub fn second_derivative(&self, t: f64) -> f64 {
        let i = self.interval(t);
        let h = self.x[i + 1] - self.x[i];
        let a = (self.x[i + 1] - t) / h;
        let b = (t - self.x[i]) / h;
        a * self.m[i] + b * self.m[i + 1]
    }

    /// Values on `count` evenly spaced points spanning the knots
    pub fn sample_grid(&self, count: usize) -> (Vec<f64>, Vec<f64>) {
        let (lo, hi) = (self.x[0], self.x[self.x.len() - 1]);
        let grid: Vec<f64> = match count {
            0 => Vec::new(),
            1 => vec![lo],
            _ => (0..count)
                .map(|i| lo + (hi - lo) * i as f64 / (count - 1) as f64)
                .collect(),
        };
        let values = grid.iter().map(|&t| self.value(t)).collect();
        (grid, values)
    }
}

/// `d[i][j]` is the sensitivity of the spline's first derivative at knot `i` to `y[j]`.
///
/// The spline is linear in its data, so this matrix maps uncertainties in the values onto
/// uncertainties in the derivative.
pub fn derivative_sensitivity(x: &[f64]) -> Result<Vec<Vec<f64>>> {
    sensitivity(x, NaturalSpline::derivative)
}

/// `d[i][j]` is the sensitivity of the spline's second derivative at knot `i` to `y[j]`
pub fn second_derivative_sensitivity(x: &[f64]) -> Result<Vec<Vec<f64>>> {
    sensitivity(x, NaturalSpline::second_derivative)
}

fn sensitivity<F>(x: &[f64], at: F) -> Result<Vec<Vec<f64>>>
where
    F: Fn(&NaturalSpline, f64) -> f64,
{
    let n = x.len();
    let mut d = vec![vec![0.0; n]; n];
    let mut unit = vec![0.0; n];
    for j in 0..n {
        unit[j] = 1.0;
        let basis = NaturalSpline::fit(x, &unit)?;
        for (i, row) in d.iter_mut().enumerate() {
            row[j] = at(&basis, x[i]);
        }
        unit[j] = 0.0;
    }
    Ok(d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpolates_knots() {
        let x = [280.0, 290.0, 305.0, 320.0, 340.0];
        let y = [1.3, -0.2, 2.7, 0.4, 5.5];
        let spline = NaturalSpline::fit(&x, &y).unwrap();
        for (xi, yi) in x.iter().zip(&y) {
            assert!((spline.value(*xi) - yi).abs() < 1e-12);
        }
    }

    #[test]
    fn reproduces_straight_lines() {
        let x = [0.0, 1.0, 2.5, 4.0];
        let y: Vec<f64> = x.iter().map(|x| 3.0 - 2.0 * x).collect();
        let spline = NaturalSpline::fit(&x, &y).unwrap();
        for t in [0.0, 0.3, 1.7, 4.0] {
            assert!((spline.derivative(t) + 2.0).abs() < 1e-12);
            assert!((spline.value(t) - (3.0 - 2.0 * t)).abs() < 1e-12);
        }
    }

    #[test]
    fn derivative_of_smooth_function() {
        let x: Vec<f64> = (0..41).map(|i| i as f64 * 0.1).collect();
        let y: Vec<f64> = x.iter().map(|x| x.sin()).collect();
        let spline = NaturalSpline::fit(&x, &y).unwrap();
        for &t in &[1.0, 2.0, 3.0] {
            assert!((spline.derivative(t) - t.cos()).abs() < 1e-3);
        }
    }

    #[test]
    fn second_derivative_of_smooth_function() {
        let x: Vec<f64> = (0..41).map(|i| i as f64 * 0.1).collect();
        let y: Vec<f64> = x.iter().map(|x| x.sin()).collect();
        let spline = NaturalSpline::fit(&x, &y).unwrap();
        for &t in &[1.0, 1.55, 2.0, 3.0] {
            assert!((spline.second_derivative(t) + t.sin()).abs() < 1e-2);
        }
        // natural end conditions
        assert_eq!(spline.second_derivative(0.0), 0.0);
        assert!(spline.second_derivative(4.0).abs() < 1e-12);

        let line = NaturalSpline::fit(&[0.0, 1.0, 2.5, 4.0], &[3.0, 1.0, -2.0, -5.0]).unwrap();
        for t in [0.0, 0.7, 2.5, 3.9] {
            assert!(line.second_derivative(t).abs() < 1e-12);
        }
    }

    #[test]
    fn sensitivity_matches_second_derivative() {
        let x = [0.0, 1.0, 3.0, 4.0, 6.0];
        let y = [0.5, 1.5, -1.0, 2.0, 0.0];
        let spline = NaturalSpline::fit(&x, &y).unwrap();
        let d = second_derivative_sensitivity(&x).unwrap();
        for i in 0..x.len() {
            let linear: f64 = d[i].iter().zip(&y).map(|(d, y)| d * y).sum();
            assert!((linear - spline.second_derivative(x[i])).abs() < 1e-12);
        }
        assert!(d[0].iter().chain(&d[4]).all(|v| *v == 0.0));
    }

    #[test]
    fn sensitivity_matches_derivative() {
        let x = [0.0, 1.0, 3.0, 4.0, 6.0];
        let y = [0.5, 1.5, -1.0, 2.0, 0.0];
        let spline = NaturalSpline::fit(&x, &y).unwrap();
        let d = derivative_sensitivity(&x).unwrap();
        for i in 0..x.len() {
            let linear: f64 = d[i].iter().zip(&y).map(|(d, y)| d * y).sum();
            assert!((linear - spline.derivative(x[i])).abs() < 1e-12);
        }
    }

    #[test]
    fn rejects_bad_knots() {
        assert!(NaturalSpline::fit(&[1.0], &[1.0]).is_err());
        assert!(NaturalSpline::fit(&[1.0, 1.0], &[1.0, 2.0]).is_err());
        assert!(NaturalSpline::fit(&[1.0, 2.0], &[1.0]).is_err());
    }

    #[test]
    fn grid_spans_knots() {
        let spline = NaturalSpline::fit(&[1.0, 2.0, 3.0], &[0.0, 1.0, 0.0]).unwrap();
        let (grid, values) = spline.sample_grid(5);
        assert_eq!(grid, vec![1.0, 1.5, 2.0, 2.5, 3.0]);
        assert!((values[2] - 1.0).abs() < 1e-12);
    }
}
