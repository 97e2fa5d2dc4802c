//! Instrument uncertainty processing for one acquisition.
//!
//! Two branches, mirroring the calibration regimes:
//!
//! * **class-based** — the sensors keep their factory calibration and the
//!   uncertainty budget is a closed-form multiplicative measurement
//!   function over 24 inputs (light, dark, calibration and the class
//!   correction factors of each channel), propagated in one Monte Carlo
//!   run with inter-input correlation read from the correlation store.
//! * **full characterization** — the complete correction chain is executed
//!   deterministically and per draw, stage by stage, with the stray-light
//!   dual-component uncertainty and the updated calibration gain.
//!
//! Both branches end on the shared waveband grid and write the resulting
//! inter-channel correlation back to the store.

use crate::core::correction::{
    self, CorrectionChain, STRAYLIGHT_ITERATIONS, UNIT_SCALE,
};
use crate::core::montecarlo::{
    channel_correlation, relative_uncertainty, McPropagation, PropagationInput,
};
use crate::core::resample::{common_waveband_grid, resample, resample_ensemble};
use crate::core::stats::{light_dark_stats, SensorStats};
use crate::core::straylight::{slaper_correction, slaper_uncertainty};
use crate::io::corr_store::CorrelationStore;
use crate::types::{
    ChannelSet, ErrorCorrelation, ProcessingConfig, RadError, RadResult, SampleEnsemble,
    SensorCharacterization, SensorRecord, SensorType, SolarGeometry, Spectrum,
};
use ndarray::{Array2, ArrayView1, Axis};

/// Store key of the inter-input correlation consumed by the class-based
/// branch.
pub const INPUT_CORRELATION_KEY: &str = "RAD";

/// Store key under which the inter-channel correlation of the processed
/// acquisition is persisted.
pub const CHANNEL_CORRELATION_KEY: &str = "instrument";

/// Solar zenith angle uncertainty of the atmospheric model (deg).
const SOLAR_ZENITH_UNC: f64 = 0.05;

/// Relative uncertainty of the modeled direct/global irradiance ratio.
const DIRECT_RATIO_REL_UNC: f64 = 0.08;

/// Per-channel statistics resampled onto the shared waveband grid.
#[derive(Debug, Clone)]
pub struct GridStats {
    pub ave_light: Spectrum,
    pub ave_dark: Spectrum,
    pub std_light: Spectrum,
    pub std_dark: Spectrum,
    pub std_signal: Spectrum,
}

/// Per-channel class-based uncertainty.
#[derive(Debug, Clone)]
pub struct ChannelUncertainty {
    pub absolute: Spectrum,
    pub relative: Spectrum,
}

/// Class-based propagation result.
pub struct ClassBasedUncertainty {
    pub wavebands: Spectrum,
    pub channels: ChannelSet<ChannelUncertainty>,
    /// Inter-channel Pearson correlation (ES/LI/LT)
    pub correlation: Array2<f64>,
}

/// Per-channel full-characterization result on the shared grid.
#[derive(Debug, Clone)]
pub struct ChannelResult {
    pub calibrated: Spectrum,
    /// Relative uncertainty per band
    pub uncertainty: Spectrum,
    pub samples: SampleEnsemble,
}

/// Full-characterization propagation result.
pub struct InstrumentUncertainty {
    pub wavebands: Spectrum,
    pub channels: ChannelSet<ChannelResult>,
    /// Inter-channel Pearson correlation (ES/LI/LT)
    pub correlation: Array2<f64>,
}

/// Output of the per-channel chain before grid resampling.
struct ChannelComputation {
    wavelengths: Spectrum,
    calibrated: Spectrum,
    uncertainty_abs: Spectrum,
    samples: SampleEnsemble,
}

/// Processor tying the Monte Carlo engine, the correction chain and the
/// correlation store together for one station/acquisition at a time.
pub struct InstrumentProcessor {
    config: ProcessingConfig,
    mc: McPropagation,
    store: CorrelationStore,
}

impl InstrumentProcessor {
    /// The correlation store is an explicit dependency so tests can inject
    /// an in-memory store.
    pub fn new(config: ProcessingConfig, store: CorrelationStore) -> Self {
        let mc = match config.seed {
            Some(seed) => McPropagation::with_seed(config.mc_draws, config.parallel_degree, seed),
            None => McPropagation::new(config.mc_draws, config.parallel_degree),
        };
        Self { config, mc, store }
    }

    pub fn store(&self) -> &CorrelationStore {
        &self.store
    }

    /// Statistics for all three channels from their light/dark records.
    pub fn channel_stats(
        &self,
        records: &ChannelSet<(SensorRecord, SensorRecord)>,
        cal_coefficients: &ChannelSet<Spectrum>,
    ) -> RadResult<ChannelSet<SensorStats>> {
        ChannelSet::try_from_fn(|sensor| {
            let (light, dark) = records.get(sensor);
            light_dark_stats(light, dark, cal_coefficients.get(sensor))
        })
    }

    /// Shared waveband grid from the calibrated ranges of all channels.
    pub fn waveband_grid(&self, stats: &ChannelSet<SensorStats>) -> RadResult<Spectrum> {
        let ranges = [
            stats.es.valid_range()?,
            stats.li.valid_range()?,
            stats.lt.valid_range()?,
        ];
        common_waveband_grid(&ranges, self.config.interp_interval)
    }

    /// Channel statistics interpolated onto the shared grid, masked bands
    /// dropped before splining.
    pub fn stats_to_grid(
        &self,
        stats: &SensorStats,
        grid: ArrayView1<f64>,
    ) -> RadResult<GridStats> {
        let wl = stats.valid_wavelengths();
        let onto = |values: &Spectrum| -> RadResult<Spectrum> {
            resample(stats.apply_mask(values).view(), wl.view(), grid)
        };
        Ok(GridStats {
            ave_light: onto(&stats.ave_light)?,
            ave_dark: onto(&stats.ave_dark)?,
            std_light: onto(&stats.std_light)?,
            std_dark: onto(&stats.std_dark)?,
            std_signal: onto(&stats.std_signal)?,
        })
    }

    /// Class-based instrument uncertainty: one propagation of the
    /// multiplicative measurement function across all 24 inputs, with
    /// inter-input correlation read from the store. The resulting
    /// inter-channel correlation is written back under
    /// [`CHANNEL_CORRELATION_KEY`].
    pub fn class_based(
        &mut self,
        wavebands: &Spectrum,
        stats: &ChannelSet<GridStats>,
        coefficients: &ChannelSet<crate::types::ClassCoefficients>,
    ) -> RadResult<ClassBasedUncertainty> {
        let nband = wavebands.len();
        for (sensor, s) in stats.iter() {
            if s.ave_light.len() != nband || s.std_light.len() != nband {
                return Err(RadError::ShapeMismatch(format!(
                    "{sensor}: channel statistics not on the shared grid"
                )));
            }
        }
        for (sensor, c) in coefficients.iter() {
            if c.cal.len() != nband {
                return Err(RadError::ShapeMismatch(format!(
                    "{sensor}: class coefficients not on the shared grid"
                )));
            }
        }

        let corr_between = self
            .store
            .get(INPUT_CORRELATION_KEY)
            .ok_or_else(|| {
                RadError::Processing(format!(
                    "no inter-input correlation matrix '{INPUT_CORRELATION_KEY}' in store"
                ))
            })?
            .clone();

        let ones = Spectrum::ones(nband);

        // input order: lights/darks, calibrations, stability, linearity,
        // stray light, thermal, polarization (LI, LT), cosine (ES)
        let means: Vec<&Spectrum> = vec![
            &stats.es.ave_light,
            &stats.es.ave_dark,
            &stats.li.ave_light,
            &stats.li.ave_dark,
            &stats.lt.ave_light,
            &stats.lt.ave_dark,
            &coefficients.es.cal,
            &coefficients.li.cal,
            &coefficients.lt.cal,
            &ones,
            &ones,
            &ones,
            &ones,
            &ones,
            &ones,
            &ones,
            &ones,
            &ones,
            &ones,
            &ones,
            &ones,
            &ones,
            &ones,
            &ones,
        ];
        let uncertainties: Vec<&Spectrum> = vec![
            &stats.es.std_light,
            &stats.es.std_dark,
            &stats.li.std_light,
            &stats.li.std_dark,
            &stats.lt.std_light,
            &stats.lt.std_dark,
            &coefficients.es.cal_unc,
            &coefficients.li.cal_unc,
            &coefficients.lt.cal_unc,
            &coefficients.es.stability_unc,
            &coefficients.li.stability_unc,
            &coefficients.lt.stability_unc,
            &coefficients.es.linearity_unc,
            &coefficients.li.linearity_unc,
            &coefficients.lt.linearity_unc,
            &coefficients.es.straylight_unc,
            &coefficients.li.straylight_unc,
            &coefficients.lt.straylight_unc,
            &coefficients.es.thermal_unc,
            &coefficients.li.thermal_unc,
            &coefficients.lt.thermal_unc,
            &coefficients.li.angular_unc,
            &coefficients.lt.angular_unc,
            &coefficients.es.angular_unc,
        ];

        let inputs: Vec<PropagationInput> = means
            .iter()
            .zip(uncertainties.iter())
            .enumerate()
            .map(|(i, (mean, unc))| PropagationInput {
                mean: mean.view(),
                uncertainty: Some(unc.view()),
                // lights and darks vary scan to scan; everything else is a
                // calibration-level systematic
                correlation: if i < 6 {
                    ErrorCorrelation::Random
                } else {
                    ErrorCorrelation::Systematic
                },
            })
            .collect();

        log::info!(
            "class-based propagation: {} draws over {} inputs, {} bands",
            self.mc.draws(),
            inputs.len(),
            nband
        );
        let output = self.mc.propagate(
            class_based_measurement,
            &inputs,
            Some(corr_between.view()),
            true,
        )?;

        let deterministic = {
            let views: Vec<ArrayView1<f64>> = means.iter().map(|m| m.view()).collect();
            class_based_measurement(&views)
        };

        let channels = ChannelSet {
            es: ChannelUncertainty {
                absolute: output.uncertainties[0].clone(),
                relative: relative_uncertainty(
                    output.uncertainties[0].view(),
                    deterministic[0].view(),
                ),
            },
            li: ChannelUncertainty {
                absolute: output.uncertainties[1].clone(),
                relative: relative_uncertainty(
                    output.uncertainties[1].view(),
                    deterministic[1].view(),
                ),
            },
            lt: ChannelUncertainty {
                absolute: output.uncertainties[2].clone(),
                relative: relative_uncertainty(
                    output.uncertainties[2].view(),
                    deterministic[2].view(),
                ),
            },
        };

        let correlation = output
            .correlation
            .ok_or_else(|| RadError::Processing("propagation returned no correlation".into()))?;
        self.persist_correlation(&correlation);

        Ok(ClassBasedUncertainty {
            wavebands: wavebands.clone(),
            channels,
            correlation,
        })
    }

    /// Full-characterization uncertainty: run the correction chain per
    /// channel deterministically and per draw, resample everything onto the
    /// shared grid, and persist the inter-channel correlation.
    pub fn full_characterization(
        &mut self,
        records: &ChannelSet<(SensorRecord, SensorRecord)>,
        characterizations: &ChannelSet<SensorCharacterization>,
        geometry: &SolarGeometry,
    ) -> RadResult<InstrumentUncertainty> {
        let computed = ChannelSet::try_from_fn(|sensor| {
            let (light, dark) = records.get(sensor);
            self.process_channel(light, dark, characterizations.get(sensor), geometry)
        })?;

        let ranges = [
            spectrum_range(&computed.es.wavelengths),
            spectrum_range(&computed.li.wavelengths),
            spectrum_range(&computed.lt.wavelengths),
        ];
        let grid = common_waveband_grid(&ranges, self.config.interp_interval)?;

        let channels = ChannelSet::try_from_fn(|sensor| {
            let c = computed.get(sensor);
            Ok::<_, RadError>(ChannelResult {
                calibrated: resample(c.calibrated.view(), c.wavelengths.view(), grid.view())?,
                uncertainty: resample(
                    relative_uncertainty(c.uncertainty_abs.view(), c.calibrated.view()).view(),
                    c.wavelengths.view(),
                    grid.view(),
                )?,
                samples: resample_ensemble(&c.samples, c.wavelengths.view(), grid.view())?,
            })
        })?;

        let correlation = channel_correlation(&[
            channels.es.samples.clone(),
            channels.li.samples.clone(),
            channels.lt.samples.clone(),
        ]);
        self.persist_correlation(&correlation);

        Ok(InstrumentUncertainty {
            wavebands: grid,
            channels,
            correlation,
        })
    }

    /// One channel through the full chain: statistics, characterization
    /// sampling, stage-by-stage deterministic and Monte Carlo execution,
    /// exclusion masking.
    fn process_channel(
        &mut self,
        light: &SensorRecord,
        dark: &SensorRecord,
        characterization: &SensorCharacterization,
        geometry: &SolarGeometry,
    ) -> RadResult<ChannelComputation> {
        let ch = characterization;
        let sensor = ch.sensor;
        log::info!("{sensor}: full-characterization processing started");

        let stats = light_dark_stats(light, dark, &ch.cal_coefficient)?;
        let chain = CorrectionChain::new(ch)?;
        let mc = &mut self.mc;

        // characterization ensembles
        let sample_lsf =
            mc.generate_matrix_sample(ch.lsf.view(), Some(ch.lsf_unc.view()), ErrorCorrelation::Random);
        let sample_thermal = mc.generate_sample(
            ch.thermal.view(),
            Some(ch.thermal_unc.view()),
            ErrorCorrelation::Systematic,
        );
        let sample_lamp = mc.generate_sample(
            ch.lamp.view(),
            Some(ch.lamp_unc.view()),
            ErrorCorrelation::Systematic,
        );
        let sample_s1 = mc.generate_sample(
            ch.s1.view(),
            Some(ch.s1_unc.view()),
            ErrorCorrelation::Random,
        );
        let sample_s2 = mc.generate_sample(
            ch.s2.view(),
            Some(ch.s2_unc.view()),
            ErrorCorrelation::Random,
        );

        // combined linearity signal and its stray-light correction, with
        // the truncation (systematic) and LSF-perturbation (random)
        // uncertainty components added in quadrature
        let k = ch.t1 / (ch.t2 - ch.t1);
        let sample_s12 = mc.run_samples(
            |x| correction::combined_linearity_signal(k, x[0], x[1]),
            &[&sample_s1, &sample_s2],
        )?;
        let s12 = correction::combined_linearity_signal(k, ch.s1.view(), ch.s2.view());
        let s12_sl_unc = slaper_uncertainty(s12.view(), ch.lsf.view(), STRAYLIGHT_ITERATIONS)?;
        let sample_s12_syst = mc.generate_sample(
            chain.s12_straylight.view(),
            Some(s12_sl_unc.view()),
            ErrorCorrelation::Systematic,
        );
        let sample_s12_rand = mc.run_draws(|m| {
            slaper_correction(
                sample_s12.row(m),
                sample_lsf.index_axis(Axis(0), m),
                STRAYLIGHT_ITERATIONS,
            )
        })?;
        // combination sums the two component means; re-center on the
        // deterministic value before the ensemble feeds nonlinear stages
        let sample_s12_sl =
            mc.combine_samples(&[&sample_s12_syst, &sample_s12_rand])? - &chain.s12_straylight;

        let sample_alpha = mc.run_samples(
            |x| correction::linearity_coefficients(x[0], x[1]),
            &[&sample_s1, &sample_s12_sl],
        )?;

        // updated calibration gain, invalid bands pinned to the masked value
        let t_ref = ch.reference_time;
        let t1 = ch.t1;
        let sample_gain_raw = match sensor {
            SensorType::Es => mc.run_samples(
                |x| correction::irradiance_gain(x[0], x[1], t_ref, t1),
                &[&sample_s12_sl, &sample_lamp],
            )?,
            SensorType::Li | SensorType::Lt => {
                let panel = ch.panel.as_ref().ok_or_else(|| RadError::DataNotFound {
                    sensor,
                    what: "reflectance panel characterization".to_string(),
                })?;
                let panel_unc = ch.panel_unc.as_ref().ok_or_else(|| RadError::DataNotFound {
                    sensor,
                    what: "reflectance panel uncertainty".to_string(),
                })?;
                let sample_panel = mc.generate_sample(
                    panel.view(),
                    Some(panel_unc.view()),
                    ErrorCorrelation::Systematic,
                );
                mc.run_samples(
                    |x| correction::radiance_gain(x[0], x[1], x[2], t_ref, t1),
                    &[&sample_s12_sl, &sample_lamp, &sample_panel],
                )?
            }
        };
        let gain_valid = chain.gain.valid.clone();
        let sample_gain = {
            let mut pinned = sample_gain_raw;
            for mut row in pinned.rows_mut() {
                for (j, v) in row.iter_mut().enumerate() {
                    if !gain_valid[j] || !(*v > 0.0) {
                        *v = 1.0;
                    }
                }
            }
            pinned
        };

        // signal ensembles from the acquisition statistics
        let sample_light = mc.generate_sample(
            stats.ave_light.view(),
            Some(stats.std_light.view()),
            ErrorCorrelation::Random,
        );
        let sample_dark = mc.generate_sample(
            stats.ave_dark.view(),
            Some(stats.std_dark.view()),
            ErrorCorrelation::Random,
        );
        let sample_signal = mc.run_samples(
            |x| correction::dark_substitution(x[0], x[1]),
            &[&sample_light, &sample_dark],
        )?;

        // non-linearity
        let data1 =
            correction::non_linearity_correction(stats.signal_mean.view(), chain.alpha.view());
        let sample_data1 = mc.run_samples(
            |x| correction::non_linearity_correction(x[0], x[1]),
            &[&sample_signal, &sample_alpha],
        )?;

        // stray light on the measurement, dual-component as above
        let data2 = slaper_correction(data1.view(), ch.lsf.view(), STRAYLIGHT_ITERATIONS)?;
        let data2_unc = slaper_uncertainty(data1.view(), ch.lsf.view(), STRAYLIGHT_ITERATIONS)?;
        let sample_sl_syst = mc.generate_sample(
            data2.view(),
            Some(data2_unc.view()),
            ErrorCorrelation::Systematic,
        );
        let sample_sl_rand = mc.run_draws(|m| {
            slaper_correction(
                sample_data1.row(m),
                sample_lsf.index_axis(Axis(0), m),
                STRAYLIGHT_ITERATIONS,
            )
        })?;
        let sample_data2 = mc.combine_samples(&[&sample_sl_syst, &sample_sl_rand])? - &data2;

        // integration-time normalization and absolute calibration
        let t_sample = light.integration_time;
        let sample_data3 = mc.run_samples(
            |x| {
                let normalized = correction::integration_normalization(x[0], t_ref, t_sample);
                correction::absolute_calibration(normalized.view(), x[1])
            },
            &[&sample_data2, &sample_gain],
        )?;

        // thermal response
        let sample_data4 = mc.run_samples(
            |x| correction::thermal_correction(x[0], x[1]),
            &[&sample_thermal, &sample_data3],
        )?;

        // angular response, irradiance only
        let sample_final = if sensor.is_irradiance() {
            let cosine = ch.cosine.as_ref().ok_or_else(|| RadError::DataNotFound {
                sensor,
                what: "cosine response characterization".to_string(),
            })?;
            let sample_zenith_error = mc.generate_matrix_sample(
                cosine.zenith_error.view(),
                Some(cosine.zenith_error_unc.view()),
                ErrorCorrelation::Systematic,
            );
            let sample_solar_zenith =
                mc.generate_scalar_sample(geometry.solar_zenith, Some(SOLAR_ZENITH_UNC));
            let ratio_unc = geometry.direct_ratio.mapv(|r| DIRECT_RATIO_REL_UNC * r);
            let sample_direct_ratio = mc.generate_sample(
                geometry.direct_ratio.view(),
                Some(ratio_unc.view()),
                ErrorCorrelation::Systematic,
            );
            let zenith_angles = cosine.zenith_angles.clone();
            mc.run_draws(|m| {
                let (cos_corr, hemi_corr) = correction::cosine_factors(
                    sample_zenith_error.index_axis(Axis(0), m),
                    zenith_angles.view(),
                    sample_solar_zenith[[m, 0]],
                );
                Ok(correction::cosine_correction(
                    sample_data4.row(m),
                    sample_direct_ratio.row(m),
                    cos_corr.view(),
                    hemi_corr.view(),
                ))
            })?
        } else {
            sample_data4
        };
        let sample_final = sample_final.mapv(|v| v / UNIT_SCALE);

        // deterministic result through the identical chain
        let calibrated = chain.correct(
            stats.signal_mean.view(),
            t_sample,
            sensor.is_irradiance().then_some(geometry),
        )?;
        let uncertainty_abs = self.mc.process_samples(&sample_final);

        // exclusion mask: calibration mask and gain mask combined
        let valid: Vec<bool> = stats
            .valid
            .iter()
            .zip(gain_valid.iter())
            .map(|(&a, &b)| a && b)
            .collect();
        let keep: Vec<usize> = valid
            .iter()
            .enumerate()
            .filter(|(_, &v)| v)
            .map(|(i, _)| i)
            .collect();
        if keep.is_empty() {
            return Err(RadError::CalibrationUnavailable { sensor });
        }
        log::debug!(
            "{sensor}: {} of {} bands retained after masking",
            keep.len(),
            valid.len()
        );

        Ok(ChannelComputation {
            wavelengths: ch.wavelengths.select(Axis(0), &keep),
            calibrated: calibrated.select(Axis(0), &keep),
            uncertainty_abs: uncertainty_abs.select(Axis(0), &keep),
            samples: sample_final.select(Axis(1), &keep),
        })
    }

    fn persist_correlation(&mut self, correlation: &Array2<f64>) {
        self.store
            .insert(CHANNEL_CORRELATION_KEY, correlation.clone());
        if let Err(e) = self.store.save() {
            log::warn!("could not persist correlation matrices: {e}");
        }
    }
}

/// The class-based measurement function: dark-subtracted signal times the
/// multiplicative correction factors, per channel.
fn class_based_measurement(x: &[ArrayView1<f64>]) -> Vec<Spectrum> {
    let es = (&x[0] - &x[1]) * &x[6] * &x[9] * &x[12] * &x[15] * &x[18] * &x[23];
    let li = (&x[2] - &x[3]) * &x[7] * &x[10] * &x[13] * &x[16] * &x[19] * &x[21];
    let lt = (&x[4] - &x[5]) * &x[8] * &x[11] * &x[14] * &x[17] * &x[20] * &x[22];
    vec![es, li, lt]
}

fn spectrum_range(wavelengths: &Spectrum) -> (f64, f64) {
    (wavelengths[0], wavelengths[wavelengths.len() - 1])
}
