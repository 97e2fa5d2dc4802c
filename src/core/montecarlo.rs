//! Monte Carlo uncertainty propagation.
//!
//! Any deterministic measurement function is turned into an uncertainty
//! estimate by evaluating it across an ensemble of perturbed input draws.
//! Input uncertainties carry an error-correlation tag: `Random` perturbs
//! every band of every draw independently, `Systematic` applies one
//! perturbation factor per draw across all bands. Independent error sources
//! are added in quadrature by summing their sample ensembles.

use crate::types::{ErrorCorrelation, RadError, RadResult, SampleEnsemble, Spectrum};
use ndarray::{Array2, Array3, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// One input quantity of a propagation run.
pub struct PropagationInput<'a> {
    pub mean: ArrayView1<'a, f64>,
    /// Absolute uncertainty per band; `None` pins the input to its mean
    pub uncertainty: Option<ArrayView1<'a, f64>>,
    pub correlation: ErrorCorrelation,
}

/// Result of a propagation run: per-channel absolute uncertainties and,
/// when requested, the Pearson correlation matrix between output channels.
pub struct PropagationOutput {
    pub uncertainties: Vec<Spectrum>,
    pub correlation: Option<Array2<f64>>,
}

/// Monte Carlo propagation engine.
pub struct McPropagation {
    draws: usize,
    parallel_degree: usize,
    rng: StdRng,
}

impl McPropagation {
    /// Engine with an entropy-seeded generator.
    pub fn new(draws: usize, parallel_degree: usize) -> Self {
        Self {
            draws,
            parallel_degree,
            rng: StdRng::from_entropy(),
        }
    }

    /// Engine with a fixed seed, for reproducible runs and tests.
    pub fn with_seed(draws: usize, parallel_degree: usize, seed: u64) -> Self {
        Self {
            draws,
            parallel_degree,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn draws(&self) -> usize {
        self.draws
    }

    /// Gaussian sample ensemble of a per-band quantity.
    ///
    /// `Random`: independent standard-normal factor per draw and band.
    /// `Systematic`: one standard-normal factor per draw, applied across all
    /// bands of that draw. Zero or absent uncertainty reproduces the mean
    /// exactly in every draw.
    pub fn generate_sample(
        &mut self,
        mean: ArrayView1<f64>,
        uncertainty: Option<ArrayView1<f64>>,
        correlation: ErrorCorrelation,
    ) -> SampleEnsemble {
        let nband = mean.len();
        let mut ensemble = Array2::zeros((self.draws, nband));
        match uncertainty {
            None => {
                for mut row in ensemble.rows_mut() {
                    row.assign(&mean);
                }
            }
            Some(unc) => {
                for mut row in ensemble.rows_mut() {
                    let common: f64 = match correlation {
                        ErrorCorrelation::Systematic => self.rng.sample(StandardNormal),
                        ErrorCorrelation::Random => 0.0,
                    };
                    for (j, v) in row.iter_mut().enumerate() {
                        let z = match correlation {
                            ErrorCorrelation::Random => self.rng.sample(StandardNormal),
                            ErrorCorrelation::Systematic => common,
                        };
                        *v = mean[j] + z * unc[j];
                    }
                }
            }
        }
        ensemble
    }

    /// Sample ensemble of a scalar quantity, stored as a 1-band ensemble.
    pub fn generate_scalar_sample(&mut self, mean: f64, uncertainty: Option<f64>) -> SampleEnsemble {
        let mean = ndarray::arr1(&[mean]);
        let unc = uncertainty.map(|u| ndarray::arr1(&[u]));
        self.generate_sample(
            mean.view(),
            unc.as_ref().map(|u| u.view()),
            ErrorCorrelation::Random,
        )
    }

    /// Sample ensemble of a matrix quantity (draw x rows x cols), used for
    /// perturbing the stray-light LSF matrix.
    pub fn generate_matrix_sample(
        &mut self,
        mean: ArrayView2<f64>,
        uncertainty: Option<ArrayView2<f64>>,
        correlation: ErrorCorrelation,
    ) -> Array3<f64> {
        let (rows, cols) = mean.dim();
        let mut ensemble = Array3::zeros((self.draws, rows, cols));
        for mut draw in ensemble.axis_iter_mut(Axis(0)) {
            match uncertainty {
                None => draw.assign(&mean),
                Some(unc) => {
                    let common: f64 = match correlation {
                        ErrorCorrelation::Systematic => self.rng.sample(StandardNormal),
                        ErrorCorrelation::Random => 0.0,
                    };
                    for ((i, j), v) in draw.indexed_iter_mut() {
                        let z = match correlation {
                            ErrorCorrelation::Random => self.rng.sample(StandardNormal),
                            ErrorCorrelation::Systematic => common,
                        };
                        *v = mean[[i, j]] + z * unc[[i, j]];
                    }
                }
            }
        }
        ensemble
    }

    /// Per-input ensembles whose per-draw perturbations are correlated
    /// across inputs through the Cholesky factor of `corr_between`.
    ///
    /// All inputs must share the band count. Random inputs receive
    /// per-band draws correlated across inputs band by band; systematic
    /// inputs receive one correlated factor per draw.
    pub fn generate_samples_correlated(
        &mut self,
        inputs: &[PropagationInput],
        corr_between: ArrayView2<f64>,
    ) -> RadResult<Vec<SampleEnsemble>> {
        let n_inputs = inputs.len();
        if corr_between.nrows() != n_inputs || corr_between.ncols() != n_inputs {
            return Err(RadError::ShapeMismatch(format!(
                "inter-input correlation matrix is {}x{}, expected {}x{}",
                corr_between.nrows(),
                corr_between.ncols(),
                n_inputs,
                n_inputs
            )));
        }
        let nband = inputs[0].mean.len();
        if inputs.iter().any(|inp| inp.mean.len() != nband) {
            return Err(RadError::ShapeMismatch(
                "correlated inputs must share the band count".to_string(),
            ));
        }

        let chol = cholesky(corr_between)?;
        let mut ensembles: Vec<SampleEnsemble> =
            vec![Array2::zeros((self.draws, nband)); n_inputs];

        let mut iid = vec![0.0_f64; n_inputs];
        let mut correlated = vec![0.0_f64; n_inputs];
        for m in 0..self.draws {
            // one correlated factor vector per draw for systematic inputs,
            // re-drawn per band for random inputs
            for z in iid.iter_mut() {
                *z = self.rng.sample(StandardNormal);
            }
            lower_multiply(&chol, &iid, &mut correlated);
            let systematic = correlated.clone();

            for band in 0..nband {
                for z in iid.iter_mut() {
                    *z = self.rng.sample(StandardNormal);
                }
                lower_multiply(&chol, &iid, &mut correlated);
                for (i, input) in inputs.iter().enumerate() {
                    let value = match input.uncertainty {
                        None => input.mean[band],
                        Some(unc) => {
                            let z = match input.correlation {
                                ErrorCorrelation::Random => correlated[i],
                                ErrorCorrelation::Systematic => systematic[i],
                            };
                            input.mean[band] + z * unc[band]
                        }
                    };
                    ensembles[i][[m, band]] = value;
                }
            }
        }
        Ok(ensembles)
    }

    /// Evaluate a per-draw closure across all draws, collecting the outputs
    /// into a new ensemble. Evaluations are independent and run on worker
    /// threads when the `parallel` feature and degree allow.
    pub fn run_draws<F>(&self, f: F) -> RadResult<SampleEnsemble>
    where
        F: Fn(usize) -> RadResult<Spectrum> + Sync,
    {
        let rows = self.evaluate_draws(&f)?;
        if rows.is_empty() {
            return Err(RadError::Processing(
                "engine configured with zero draws".to_string(),
            ));
        }
        let nband = rows[0].len();
        if rows.iter().any(|r| r.len() != nband) {
            return Err(RadError::ShapeMismatch(
                "measurement function returned inconsistent band counts across draws".to_string(),
            ));
        }
        let flat: Vec<f64> = rows.into_iter().flatten().collect();
        Array2::from_shape_vec((self.draws, nband), flat)
            .map_err(|e| RadError::ShapeMismatch(e.to_string()))
    }

    #[cfg(feature = "parallel")]
    fn evaluate_draws<F>(&self, f: &F) -> RadResult<Vec<Spectrum>>
    where
        F: Fn(usize) -> RadResult<Spectrum> + Sync,
    {
        if self.parallel_degree > 1 {
            (0..self.draws).into_par_iter().map(f).collect()
        } else {
            (0..self.draws).map(f).collect()
        }
    }

    #[cfg(not(feature = "parallel"))]
    fn evaluate_draws<F>(&self, f: &F) -> RadResult<Vec<Spectrum>>
    where
        F: Fn(usize) -> RadResult<Spectrum> + Sync,
    {
        (0..self.draws).map(f).collect()
    }

    #[cfg(feature = "parallel")]
    fn evaluate_multi<F>(
        &self,
        f: &F,
        ensembles: &[SampleEnsemble],
    ) -> RadResult<Vec<Vec<Spectrum>>>
    where
        F: Fn(&[ArrayView1<f64>]) -> Vec<Spectrum> + Sync,
    {
        let eval = |m: usize| -> RadResult<Vec<Spectrum>> {
            let views: Vec<ArrayView1<f64>> = ensembles.iter().map(|e| e.row(m)).collect();
            Ok(f(&views))
        };
        if self.parallel_degree > 1 {
            (0..self.draws).into_par_iter().map(eval).collect()
        } else {
            (0..self.draws).map(eval).collect()
        }
    }

    #[cfg(not(feature = "parallel"))]
    fn evaluate_multi<F>(
        &self,
        f: &F,
        ensembles: &[SampleEnsemble],
    ) -> RadResult<Vec<Vec<Spectrum>>>
    where
        F: Fn(&[ArrayView1<f64>]) -> Vec<Spectrum> + Sync,
    {
        let eval = |m: usize| -> RadResult<Vec<Spectrum>> {
            let views: Vec<ArrayView1<f64>> = ensembles.iter().map(|e| e.row(m)).collect();
            Ok(f(&views))
        };
        (0..self.draws).map(eval).collect()
    }

    /// Evaluate a measurement function draw-by-draw over input ensembles.
    pub fn run_samples<F>(&self, f: F, inputs: &[&SampleEnsemble]) -> RadResult<SampleEnsemble>
    where
        F: Fn(&[ArrayView1<f64>]) -> Spectrum + Sync,
    {
        self.check_draw_counts(inputs)?;
        self.run_draws(|m| {
            let views: Vec<ArrayView1<f64>> = inputs.iter().map(|e| e.row(m)).collect();
            Ok(f(&views))
        })
    }

    /// Element-wise sum of independent ensembles: orthogonal error sources
    /// added in quadrature through their samples.
    pub fn combine_samples(&self, ensembles: &[&SampleEnsemble]) -> RadResult<SampleEnsemble> {
        let first = ensembles.first().ok_or_else(|| {
            RadError::ShapeMismatch("no ensembles supplied for combination".to_string())
        })?;
        self.check_draw_counts(ensembles)?;
        let mut combined = (*first).clone();
        for ensemble in &ensembles[1..] {
            if ensemble.dim() != combined.dim() {
                return Err(RadError::ShapeMismatch(format!(
                    "cannot combine ensembles of shape {:?} and {:?}",
                    combined.dim(),
                    ensemble.dim()
                )));
            }
            combined += *ensemble;
        }
        Ok(combined)
    }

    /// Per-band sample standard deviation of an ensemble, the reported
    /// absolute uncertainty.
    pub fn process_samples(&self, ensemble: &SampleEnsemble) -> Spectrum {
        ensemble.std_axis(Axis(0), 0.0)
    }

    /// Full propagation of a multi-channel measurement function: perturb the
    /// inputs, evaluate across all draws, report per-channel uncertainties
    /// and (on request) the inter-channel correlation matrix estimated from
    /// the complete draw set.
    pub fn propagate<F>(
        &mut self,
        f: F,
        inputs: &[PropagationInput],
        corr_between: Option<ArrayView2<f64>>,
        return_corr: bool,
    ) -> RadResult<PropagationOutput>
    where
        F: Fn(&[ArrayView1<f64>]) -> Vec<Spectrum> + Sync,
    {
        if inputs.is_empty() {
            return Err(RadError::ShapeMismatch(
                "propagation requires at least one input".to_string(),
            ));
        }

        let ensembles: Vec<SampleEnsemble> = match corr_between {
            Some(corr) => self.generate_samples_correlated(inputs, corr)?,
            None => inputs
                .iter()
                .map(|inp| self.generate_sample(inp.mean, inp.uncertainty, inp.correlation))
                .collect(),
        };

        // evaluate once per draw, splitting the channel outputs
        let outputs_per_draw = self.evaluate_multi(&f, &ensembles)?;

        if outputs_per_draw.is_empty() {
            return Err(RadError::Processing(
                "engine configured with zero draws".to_string(),
            ));
        }
        let n_out = outputs_per_draw[0].len();
        if outputs_per_draw.iter().any(|o| o.len() != n_out) {
            return Err(RadError::ShapeMismatch(
                "measurement function returned inconsistent channel counts".to_string(),
            ));
        }

        let mut channel_ensembles: Vec<SampleEnsemble> = Vec::with_capacity(n_out);
        for channel in 0..n_out {
            let nband = outputs_per_draw[0][channel].len();
            let mut ensemble = Array2::zeros((self.draws, nband));
            for (m, outputs) in outputs_per_draw.iter().enumerate() {
                if outputs[channel].len() != nband {
                    return Err(RadError::ShapeMismatch(format!(
                        "channel {channel} band count varies across draws"
                    )));
                }
                ensemble.row_mut(m).assign(&outputs[channel]);
            }
            channel_ensembles.push(ensemble);
        }

        let uncertainties: Vec<Spectrum> = channel_ensembles
            .iter()
            .map(|e| self.process_samples(e))
            .collect();
        let correlation = if return_corr {
            Some(channel_correlation(&channel_ensembles))
        } else {
            None
        };

        Ok(PropagationOutput {
            uncertainties,
            correlation,
        })
    }

    fn check_draw_counts(&self, ensembles: &[&SampleEnsemble]) -> RadResult<()> {
        for ensemble in ensembles {
            if ensemble.nrows() != self.draws {
                return Err(RadError::ShapeMismatch(format!(
                    "ensemble has {} draws, engine is configured for {}",
                    ensemble.nrows(),
                    self.draws
                )));
            }
        }
        Ok(())
    }
}

/// Relative uncertainty per band: absolute divided by the deterministic
/// mean, falling back to the absolute value where the mean is exactly zero.
pub fn relative_uncertainty(absolute: ArrayView1<f64>, mean: ArrayView1<f64>) -> Spectrum {
    absolute
        .iter()
        .zip(mean.iter())
        .map(|(&u, &v)| if v == 0.0 { u } else { u / v })
        .collect()
}

/// Pearson correlation matrix between output channels, estimated band by
/// band across the draw axis and averaged over bands. Symmetric with unit
/// diagonal.
pub fn channel_correlation(ensembles: &[SampleEnsemble]) -> Array2<f64> {
    let n = ensembles.len();
    let mut corr = Array2::eye(n);
    for i in 0..n {
        for j in (i + 1)..n {
            let value = ensemble_correlation(&ensembles[i], &ensembles[j]);
            corr[[i, j]] = value;
            corr[[j, i]] = value;
        }
    }
    corr
}

fn ensemble_correlation(a: &SampleEnsemble, b: &SampleEnsemble) -> f64 {
    let nband = a.ncols().min(b.ncols());
    if nband == 0 || a.nrows() != b.nrows() {
        return 0.0;
    }
    let mut sum = 0.0;
    for band in 0..nband {
        sum += pearson(a.column(band), b.column(band));
    }
    sum / nband as f64
}

fn pearson(x: ndarray::ArrayView1<f64>, y: ndarray::ArrayView1<f64>) -> f64 {
    let n = x.len() as f64;
    let mx = x.sum() / n;
    let my = y.sum() / n;
    let mut cov = 0.0;
    let mut vx = 0.0;
    let mut vy = 0.0;
    for (&a, &b) in x.iter().zip(y.iter()) {
        cov += (a - mx) * (b - my);
        vx += (a - mx) * (a - mx);
        vy += (b - my) * (b - my);
    }
    let denom = (vx * vy).sqrt();
    if denom == 0.0 {
        0.0
    } else {
        cov / denom
    }
}

/// Lower-triangular Cholesky factor of a symmetric positive-definite matrix.
fn cholesky(a: ArrayView2<f64>) -> RadResult<Array2<f64>> {
    let n = a.nrows();
    let mut l = Array2::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[[i, j]];
            for k in 0..j {
                sum -= l[[i, k]] * l[[j, k]];
            }
            if i == j {
                if sum <= 0.0 {
                    return Err(RadError::Processing(format!(
                        "correlation matrix is not positive definite at row {i}"
                    )));
                }
                l[[i, j]] = sum.sqrt();
            } else {
                l[[i, j]] = sum / l[[j, j]];
            }
        }
    }
    Ok(l)
}

fn lower_multiply(l: &Array2<f64>, x: &[f64], out: &mut [f64]) {
    for i in 0..x.len() {
        let mut sum = 0.0;
        for j in 0..=i {
            sum += l[[i, j]] * x[j];
        }
        out[i] = sum;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::arr1;

    fn engine(draws: usize) -> McPropagation {
        McPropagation::with_seed(draws, 1, 42)
    }

    #[test]
    fn test_zero_uncertainty_pins_draws_to_mean() {
        let mut mc = engine(50);
        let mean = arr1(&[10.0, 20.0, 30.0]);
        let zeros = arr1(&[0.0, 0.0, 0.0]);
        for corr in [ErrorCorrelation::Random, ErrorCorrelation::Systematic] {
            let ensemble = mc.generate_sample(mean.view(), Some(zeros.view()), corr);
            for row in ensemble.rows() {
                for (v, m) in row.iter().zip(mean.iter()) {
                    assert_relative_eq!(*v, *m);
                }
            }
        }
    }

    #[test]
    fn test_systematic_draws_fully_correlated_across_bands() {
        let mut mc = engine(200);
        let mean = arr1(&[100.0, 100.0]);
        let unc = arr1(&[5.0, 5.0]);
        let ensemble =
            mc.generate_sample(mean.view(), Some(unc.view()), ErrorCorrelation::Systematic);
        for row in ensemble.rows() {
            assert_relative_eq!(row[0], row[1], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_random_draws_vary_across_bands() {
        let mut mc = engine(200);
        let mean = arr1(&[100.0, 100.0]);
        let unc = arr1(&[5.0, 5.0]);
        let ensemble =
            mc.generate_sample(mean.view(), Some(unc.view()), ErrorCorrelation::Random);
        let differing = ensemble
            .rows()
            .into_iter()
            .filter(|row| (row[0] - row[1]).abs() > 1e-9)
            .count();
        assert!(differing > 150);
    }

    #[test]
    fn test_identity_propagation_recovers_uncertainty() {
        let mut mc = engine(1000);
        let mean = arr1(&[50.0, 80.0, 120.0]);
        let unc = arr1(&[5.0, 8.0, 12.0]);
        let inputs = [PropagationInput {
            mean: mean.view(),
            uncertainty: Some(unc.view()),
            correlation: ErrorCorrelation::Random,
        }];
        let out = mc
            .propagate(|x| vec![x[0].to_owned()], &inputs, None, false)
            .unwrap();
        for (est, expected) in out.uncertainties[0].iter().zip(unc.iter()) {
            assert!((est - expected).abs() / expected < 0.1);
        }
    }

    #[test]
    fn test_combine_samples_adds_in_quadrature() {
        let mut mc = engine(2000);
        let mean = arr1(&[0.0; 4]);
        let u1 = arr1(&[3.0; 4]);
        let u2 = arr1(&[4.0; 4]);
        let e1 = mc.generate_sample(mean.view(), Some(u1.view()), ErrorCorrelation::Random);
        let e2 = mc.generate_sample(mean.view(), Some(u2.view()), ErrorCorrelation::Random);
        let combined = mc.combine_samples(&[&e1, &e2]).unwrap();
        let std = mc.process_samples(&combined);
        for s in std.iter() {
            assert!((s - 5.0).abs() < 0.5, "expected ~5.0, got {s}");
        }
    }

    #[test]
    fn test_mismatched_draw_count_rejected() {
        let mut mc_a = engine(100);
        let mut mc_b = engine(50);
        let mean = arr1(&[1.0]);
        let e1 = mc_a.generate_sample(mean.view(), None, ErrorCorrelation::Random);
        let e2 = mc_b.generate_sample(mean.view(), None, ErrorCorrelation::Random);
        assert!(matches!(
            mc_a.combine_samples(&[&e1, &e2]),
            Err(RadError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_relative_uncertainty_zero_mean_fallback() {
        let rel = relative_uncertainty(
            arr1(&[0.5, 2.0]).view(),
            arr1(&[10.0, 0.0]).view(),
        );
        assert_relative_eq!(rel[0], 0.05);
        assert_relative_eq!(rel[1], 2.0);
    }

    #[test]
    fn test_correlated_generation_tracks_corr_between() {
        let mut mc = engine(4000);
        let mean = arr1(&[10.0]);
        let unc = arr1(&[1.0]);
        let inputs = [
            PropagationInput {
                mean: mean.view(),
                uncertainty: Some(unc.view()),
                correlation: ErrorCorrelation::Systematic,
            },
            PropagationInput {
                mean: mean.view(),
                uncertainty: Some(unc.view()),
                correlation: ErrorCorrelation::Systematic,
            },
        ];
        let corr = ndarray::arr2(&[[1.0, 0.8], [0.8, 1.0]]);
        let ensembles = mc.generate_samples_correlated(&inputs, corr.view()).unwrap();
        let rho = pearson(ensembles[0].column(0), ensembles[1].column(0));
        assert!((rho - 0.8).abs() < 0.05, "expected rho ~0.8, got {rho}");
    }

    #[test]
    fn test_propagation_correlation_matrix_shape() {
        let mut mc = engine(500);
        let mean = arr1(&[10.0, 20.0]);
        let unc = arr1(&[1.0, 2.0]);
        let inputs = [PropagationInput {
            mean: mean.view(),
            uncertainty: Some(unc.view()),
            correlation: ErrorCorrelation::Random,
        }];
        // two channels that are identical should correlate at 1.0
        let out = mc
            .propagate(
                |x| vec![x[0].to_owned(), x[0].to_owned()],
                &inputs,
                None,
                true,
            )
            .unwrap();
        let corr = out.correlation.unwrap();
        assert_eq!(corr.dim(), (2, 2));
        assert_relative_eq!(corr[[0, 0]], 1.0);
        assert_relative_eq!(corr[[0, 1]], 1.0, epsilon = 1e-9);
    }
}
