//! Spectral resampling onto a shared waveband grid.
//!
//! All sensors report on their own wavelength axes; downstream combination
//! requires a single grid. Interpolation is a natural cubic spline over the
//! source wavelength axis, applied identically to per-band vectors and to
//! full Monte Carlo sample ensembles (draw by draw).

use crate::types::{RadError, RadResult, SampleEnsemble, Spectrum};
use ndarray::{Array2, ArrayView1};

/// Natural cubic spline over a strictly increasing abscissa.
///
/// Piecewise cubic with C2 continuity and zero second derivative at the
/// endpoints. Evaluation outside the fitted range clamps to the boundary
/// values; target grids are always constructed inside the intersection of
/// the source ranges, so clamping is never exercised in normal processing.
pub struct CubicSpline {
    x: Vec<f64>,
    y: Vec<f64>,
    coeffs: Vec<[f64; 4]>,
}

impl CubicSpline {
    pub fn new(x: Vec<f64>, y: Vec<f64>) -> RadResult<Self> {
        if x.len() != y.len() {
            return Err(RadError::ShapeMismatch(format!(
                "spline abscissa has {} points, ordinate has {}",
                x.len(),
                y.len()
            )));
        }
        if x.len() < 2 {
            return Err(RadError::Interpolation(format!(
                "need at least 2 points for spline interpolation, got {}",
                x.len()
            )));
        }
        if !x.windows(2).all(|w| w[1] > w[0]) {
            return Err(RadError::Interpolation(
                "spline abscissa is not strictly increasing".to_string(),
            ));
        }

        let n = x.len();
        let mut spline = CubicSpline {
            x,
            y,
            coeffs: vec![[0.0; 4]; n - 1],
        };
        spline.compute_coefficients();
        Ok(spline)
    }

    /// Solve the tridiagonal system for the segment coefficients
    /// (Thomas algorithm, natural boundary conditions).
    fn compute_coefficients(&mut self) {
        let n = self.x.len();
        let mut h = vec![0.0; n - 1];
        let mut alpha = vec![0.0; n - 1];

        for i in 0..n - 1 {
            h[i] = self.x[i + 1] - self.x[i];
        }
        for i in 1..n - 1 {
            alpha[i] = (3.0 / h[i]) * (self.y[i + 1] - self.y[i])
                - (3.0 / h[i - 1]) * (self.y[i] - self.y[i - 1]);
        }

        let mut l = vec![1.0; n];
        let mut mu = vec![0.0; n];
        let mut z = vec![0.0; n];
        for i in 1..n - 1 {
            l[i] = 2.0 * (self.x[i + 1] - self.x[i - 1]) - h[i - 1] * mu[i - 1];
            mu[i] = h[i] / l[i];
            z[i] = (alpha[i] - h[i - 1] * z[i - 1]) / l[i];
        }

        let mut c = vec![0.0; n];
        let mut b = vec![0.0; n - 1];
        let mut d = vec![0.0; n - 1];
        for j in (0..n - 1).rev() {
            c[j] = z[j] - mu[j] * c[j + 1];
            b[j] = (self.y[j + 1] - self.y[j]) / h[j] - h[j] * (c[j + 1] + 2.0 * c[j]) / 3.0;
            d[j] = (c[j + 1] - c[j]) / (3.0 * h[j]);
        }
        for i in 0..n - 1 {
            self.coeffs[i] = [self.y[i], b[i], c[i], d[i]];
        }
    }

    pub fn evaluate(&self, x: f64) -> f64 {
        if x <= self.x[0] {
            return self.y[0];
        }
        if x >= self.x[self.x.len() - 1] {
            return self.y[self.y.len() - 1];
        }

        let segment = self.find_segment(x);
        let dx = x - self.x[segment];
        let [a, b, c, d] = self.coeffs[segment];
        a + b * dx + c * dx * dx + d * dx * dx * dx
    }

    fn find_segment(&self, x: f64) -> usize {
        let mut left = 0;
        let mut right = self.x.len() - 1;
        while left < right - 1 {
            let mid = (left + right) / 2;
            if x < self.x[mid] {
                right = mid;
            } else {
                left = mid;
            }
        }
        left
    }
}

/// Interpolate a per-band vector from its source wavelengths onto a target
/// grid.
pub fn resample(
    values: ArrayView1<f64>,
    source_wl: ArrayView1<f64>,
    target_wl: ArrayView1<f64>,
) -> RadResult<Spectrum> {
    let spline = CubicSpline::new(source_wl.to_vec(), values.to_vec())?;
    Ok(target_wl.iter().map(|&wl| spline.evaluate(wl)).collect())
}

/// Interpolate every draw of a sample ensemble onto a target grid,
/// preserving draw indexing.
pub fn resample_ensemble(
    ensemble: &SampleEnsemble,
    source_wl: ArrayView1<f64>,
    target_wl: ArrayView1<f64>,
) -> RadResult<SampleEnsemble> {
    let draws = ensemble.nrows();
    let mut out = Array2::zeros((draws, target_wl.len()));
    for (m, draw) in ensemble.rows().into_iter().enumerate() {
        let resampled = resample(draw, source_wl, target_wl)?;
        out.row_mut(m).assign(&resampled);
    }
    Ok(out)
}

/// Shared waveband grid across sensors: from the ceiling of the largest
/// sensor minimum to the floor of the smallest sensor maximum, stepped by
/// the configured interval (end included when it falls on a step).
pub fn common_waveband_grid(ranges: &[(f64, f64)], interval: f64) -> RadResult<Spectrum> {
    if ranges.is_empty() {
        return Err(RadError::Interpolation(
            "no sensor wavelength ranges supplied for grid construction".to_string(),
        ));
    }
    if !(interval > 0.0) {
        return Err(RadError::Interpolation(format!(
            "waveband interval must be positive, got {interval}"
        )));
    }

    let start = ranges
        .iter()
        .map(|r| r.0.ceil())
        .fold(f64::NEG_INFINITY, f64::max);
    let end = ranges
        .iter()
        .map(|r| r.1.floor())
        .fold(f64::INFINITY, f64::min);
    if start > end {
        return Err(RadError::Interpolation(format!(
            "sensor wavelength ranges do not overlap: [{start}, {end}]"
        )));
    }

    let steps = ((end - start) / interval).floor() as usize;
    let grid: Spectrum = (0..=steps).map(|i| start + i as f64 * interval).collect();
    log::debug!(
        "common waveband grid: [{:.1}, {:.1}] nm, {} bands at {} nm",
        grid[0],
        grid[grid.len() - 1],
        grid.len(),
        interval
    );
    Ok(grid)
}

/// One-decimal label for a grid wavelength, used as a display/lookup key.
/// Cosmetic only; interpolation always uses the unrounded value.
pub fn grid_label(wavelength: f64) -> String {
    format!("{:.1}", (wavelength * 10.0).round() / 10.0)
}
