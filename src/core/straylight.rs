//! Stray-light correction by iterative deconvolution (Slaper et al.).
//!
//! Optical cross-talk between spectral bands is characterized by a
//! line-spread-function (LSF) matrix. The correction redistributes signal by
//! repeatedly convolving the current estimate with the normalized LSF and
//! rescaling against the original measurement.

use crate::types::{RadError, RadResult, Spectrum};
use ndarray::{Array2, ArrayView1, ArrayView2};

/// Half-width of the in-band window used for row normalization.
const NORM_WINDOW: usize = 10;

/// Normalize each LSF row by the sum of its in-band window
/// `[i - 10, i + 10)`. Rows with a zero window sum become all-zero.
fn normalize_rows(lsf: ArrayView2<f64>) -> Array2<f64> {
    let nband = lsf.nrows();
    let mut normalized = lsf.to_owned();
    for i in 0..nband {
        let jstart = i.saturating_sub(NORM_WINDOW);
        let jstop = (i + NORM_WINDOW).min(nband);
        let window_sum: f64 = (jstart..jstop).map(|j| lsf[[i, j]]).sum();
        if window_sum == 0.0 {
            normalized.row_mut(i).fill(0.0);
        } else {
            normalized.row_mut(i).mapv_inplace(|v| v / window_sum);
        }
    }
    normalized
}

/// Iterative stray-light deconvolution of a per-band signal.
///
/// Returns the second-to-last iterate of the refinement sequence, matching
/// the reference output of the characterization pipeline this implements.
pub fn slaper_correction(
    signal: ArrayView1<f64>,
    lsf: ArrayView2<f64>,
    n_iter: usize,
) -> RadResult<Spectrum> {
    let nband = signal.len();
    if lsf.nrows() != nband || lsf.ncols() != nband {
        return Err(RadError::ShapeMismatch(format!(
            "LSF matrix is {}x{}, signal has {} bands",
            lsf.nrows(),
            lsf.ncols(),
            nband
        )));
    }
    if n_iter == 0 {
        return Err(RadError::Processing(
            "stray-light correction requires at least one iteration".to_string(),
        ));
    }

    let z_norm = normalize_rows(lsf);

    // mx[k] is the k-th refinement of the signal estimate
    let mut mx: Vec<Spectrum> = Vec::with_capacity(n_iter + 1);
    mx.push(signal.to_owned());

    for _ in 1..=n_iter {
        let prev = &mx[mx.len() - 1];
        let mut next = Spectrum::zeros(nband);
        for i in 0..nband {
            let c: f64 = prev
                .iter()
                .zip(z_norm.row(i).iter())
                .map(|(x, z)| x * z)
                .sum();
            next[i] = if c == 0.0 {
                0.0
            } else {
                prev[i] * mx[0][i] / c
            };
        }
        mx.push(next);
    }

    Ok(mx.swap_remove(n_iter - 1))
}

/// Iteration-truncation uncertainty of the stray-light correction: the
/// absolute per-band difference between running `n_iter` and `n_iter - 1`
/// iterations. Treated as a systematic component by the propagation engine;
/// the random component comes from Monte Carlo perturbation of the LSF.
pub fn slaper_uncertainty(
    signal: ArrayView1<f64>,
    lsf: ArrayView2<f64>,
    n_iter: usize,
) -> RadResult<Spectrum> {
    if n_iter < 2 {
        return Err(RadError::Processing(
            "iteration-truncation uncertainty requires at least two iterations".to_string(),
        ));
    }
    let full = slaper_correction(signal, lsf, n_iter)?;
    let truncated = slaper_correction(signal, lsf, n_iter - 1)?;
    Ok((&full - &truncated).mapv(f64::abs))
}
