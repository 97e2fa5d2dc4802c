//! Radiometric correction chain.
//!
//! Every stage is a pure function of its inputs so the deterministic path
//! and the Monte Carlo uncertainty path run exactly the same code: the
//! engine re-invokes these functions on perturbed draws.
//!
//! Order per sensor: dark subtraction, non-linearity, stray light,
//! absolute calibration, thermal response, and (irradiance only) the
//! angular cosine response.

use crate::core::straylight::slaper_correction;
use crate::types::{
    RadError, RadResult, SensorCharacterization, SensorType, SolarGeometry, Spectrum,
};
use ndarray::ArrayView1;

/// ADC full scale used to normalize raw counts before correction.
pub const COUNT_FULL_SCALE: f64 = 65535.0;

/// Stray-light deconvolution depth used throughout the chain.
pub const STRAYLIGHT_ITERATIONS: usize = 5;

/// Calibrated spectra are reported in uW/cm^2 (per nm, per sr for
/// radiance); characterization units are mW/m^2.
pub const UNIT_SCALE: f64 = 10.0;

/// Raw counts normalized by the ADC full scale.
pub fn normalize_counts(raw: ArrayView1<f64>) -> Spectrum {
    raw.mapv(|v| v / COUNT_FULL_SCALE)
}

/// Dark-signal removal.
pub fn dark_substitution(light: ArrayView1<f64>, dark: ArrayView1<f64>) -> Spectrum {
    &light - &dark
}

/// Background structure at integration time `t`, from the B0/B1
/// characterization at reference time `t0`.
pub fn background_signal(
    b0: ArrayView1<f64>,
    b1: ArrayView1<f64>,
    t: f64,
    t0: f64,
) -> Spectrum {
    &b0 + &(&b1 * (t / t0))
}

/// Weighted combination of the two-integration-time calibration pair:
/// `S12 = (1+k)*S1 - k*S2` with `k = t1/(t2-t1)`.
pub fn combined_linearity_signal(
    k: f64,
    s1: ArrayView1<f64>,
    s2: ArrayView1<f64>,
) -> Spectrum {
    &(&s1 * (1.0 + k)) - &(&s2 * k)
}

/// Non-linearity coefficient per band: `alpha = (S1 - S12)/S12^2`, with the
/// stray-light-corrected S12.
pub fn linearity_coefficients(s1: ArrayView1<f64>, s12: ArrayView1<f64>) -> Spectrum {
    s1.iter()
        .zip(s12.iter())
        .map(|(&a, &b)| if b == 0.0 { 0.0 } else { (a - b) / (b * b) })
        .collect()
}

/// Second-order non-linearity correction: `data * (1 - alpha*data)`.
pub fn non_linearity_correction(data: ArrayView1<f64>, alpha: ArrayView1<f64>) -> Spectrum {
    data.iter()
        .zip(alpha.iter())
        .map(|(&d, &a)| d * (1.0 - a * d))
        .collect()
}

/// Integration-time normalization to the reference time.
pub fn integration_normalization(data: ArrayView1<f64>, t_ref: f64, t_sample: f64) -> Spectrum {
    data.mapv(|v| v * t_ref / t_sample)
}

/// Absolute calibration against the per-run gain.
pub fn absolute_calibration(data: ArrayView1<f64>, gain: ArrayView1<f64>) -> Spectrum {
    &data / &gain
}

/// Thermal response correction.
pub fn thermal_correction(coefficient: ArrayView1<f64>, data: ArrayView1<f64>) -> Spectrum {
    &coefficient * &data
}

/// Irradiance gain from the lamp reference: `(S12_sl/lamp)*(t_ref/t1)`.
/// Bands with a zero lamp value get a zero gain and are masked out later.
pub fn irradiance_gain(
    s12_sl: ArrayView1<f64>,
    lamp: ArrayView1<f64>,
    t_ref: f64,
    t1: f64,
) -> Spectrum {
    s12_sl
        .iter()
        .zip(lamp.iter())
        .map(|(&s, &l)| if l == 0.0 { 0.0 } else { (s / l) * (t_ref / t1) })
        .collect()
}

/// Radiance gain from the lamp/panel reference:
/// `pi*S12_sl/(lamp*panel)*(t_ref/t1)`.
pub fn radiance_gain(
    s12_sl: ArrayView1<f64>,
    lamp: ArrayView1<f64>,
    panel: ArrayView1<f64>,
    t_ref: f64,
    t1: f64,
) -> Spectrum {
    s12_sl
        .iter()
        .zip(lamp.iter())
        .zip(panel.iter())
        .map(|((&s, &l), &p)| {
            let denom = l * p;
            if denom == 0.0 {
                0.0
            } else {
                (std::f64::consts::PI * s / denom) * (t_ref / t1)
            }
        })
        .collect()
}

/// Gain with uncalibrated bands masked: non-positive or NaN gains are
/// forced to 1 so the division stays defined, and the band is flagged for
/// exclusion from every returned output.
#[derive(Debug, Clone)]
pub struct MaskedGain {
    pub gain: Spectrum,
    pub valid: Vec<bool>,
}

pub fn mask_gain(gain: Spectrum, sensor: SensorType) -> RadResult<MaskedGain> {
    let valid: Vec<bool> = gain.iter().map(|&g| g > 0.0 && !g.is_nan()).collect();
    if valid.iter().all(|&v| !v) {
        return Err(RadError::CalibrationUnavailable { sensor });
    }
    let masked = gain
        .iter()
        .zip(valid.iter())
        .map(|(&g, &v)| if v { g } else { 1.0 })
        .collect();
    Ok(MaskedGain {
        gain: masked,
        valid,
    })
}

/// Per-band cosine and hemispherical correction factors at the acquisition
/// solar zenith angle: the characterized zenith column nearest the sun,
/// converted from percent error to a multiplicative factor.
pub fn cosine_factors(
    zenith_error: ndarray::ArrayView2<f64>,
    zenith_angles: ArrayView1<f64>,
    solar_zenith: f64,
) -> (Spectrum, Spectrum) {
    let nearest = zenith_angles
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            (*a - solar_zenith)
                .abs()
                .total_cmp(&(*b - solar_zenith).abs())
        })
        .map(|(i, _)| i)
        .unwrap_or(0);
    let cos_corr: Spectrum = zenith_error.column(nearest).mapv(|e| 1.0 - e / 100.0);
    let hemi = hemispherical_error(zenith_error, zenith_angles);
    let hemi_corr = hemi.mapv(|e| 1.0 - e / 100.0);
    (cos_corr, hemi_corr)
}

/// Full-hemispherical cosine error per band: the zenith-error table
/// integrated over the hemisphere with sin(2*theta) weighting.
pub fn hemispherical_error(
    zenith_error: ndarray::ArrayView2<f64>,
    zenith_angles: ArrayView1<f64>,
) -> Spectrum {
    let weights: Vec<f64> = zenith_angles
        .iter()
        .map(|&z| (2.0 * z.to_radians()).sin().max(0.0))
        .collect();
    let weight_sum: f64 = weights.iter().sum();
    zenith_error
        .rows()
        .into_iter()
        .map(|row| {
            if weight_sum == 0.0 {
                0.0
            } else {
                row.iter().zip(weights.iter()).map(|(&e, &w)| e * w).sum::<f64>() / weight_sum
            }
        })
        .collect()
}

/// Angular response correction for irradiance sensors: direct and diffuse
/// components weighted by the direct/global irradiance ratio.
pub fn cosine_correction(
    thermal: ArrayView1<f64>,
    direct_ratio: ArrayView1<f64>,
    cos_corr: ArrayView1<f64>,
    hemi_corr: ArrayView1<f64>,
) -> Spectrum {
    thermal
        .iter()
        .zip(direct_ratio.iter())
        .zip(cos_corr.iter())
        .zip(hemi_corr.iter())
        .map(|(((&t, &r), &c), &h)| r * t * c + (1.0 - r) * t * h)
        .collect()
}

/// Deterministic correction chain for one sensor, holding the per-run
/// derived quantities (non-linearity coefficients, masked gain).
pub struct CorrectionChain<'a> {
    characterization: &'a SensorCharacterization,
    pub alpha: Spectrum,
    pub gain: MaskedGain,
    pub s12_straylight: Spectrum,
}

impl<'a> CorrectionChain<'a> {
    /// Derive the per-run chain quantities from the characterization: the
    /// combined linearity signal, its stray-light correction, the
    /// non-linearity coefficients, and the masked calibration gain.
    pub fn new(characterization: &'a SensorCharacterization) -> RadResult<Self> {
        let ch = characterization;
        if ch.t2 == ch.t1 {
            return Err(RadError::Processing(format!(
                "{}: non-linearity pair has equal integration times",
                ch.sensor
            )));
        }
        let k = ch.t1 / (ch.t2 - ch.t1);
        let s12 = combined_linearity_signal(k, ch.s1.view(), ch.s2.view());
        let s12_sl = slaper_correction(s12.view(), ch.lsf.view(), STRAYLIGHT_ITERATIONS)?;
        let alpha = linearity_coefficients(ch.s1.view(), s12_sl.view());

        let raw_gain = match ch.sensor {
            SensorType::Es => {
                irradiance_gain(s12_sl.view(), ch.lamp.view(), ch.reference_time, ch.t1)
            }
            SensorType::Li | SensorType::Lt => {
                let panel = ch.panel.as_ref().ok_or_else(|| RadError::DataNotFound {
                    sensor: ch.sensor,
                    what: "reflectance panel characterization".to_string(),
                })?;
                radiance_gain(
                    s12_sl.view(),
                    ch.lamp.view(),
                    panel.view(),
                    ch.reference_time,
                    ch.t1,
                )
            }
        };
        let gain = mask_gain(raw_gain, ch.sensor)?;
        log::info!(
            "{}: correction chain ready, {} of {} bands calibrated",
            ch.sensor,
            gain.valid.iter().filter(|&&v| v).count(),
            gain.valid.len()
        );

        Ok(Self {
            characterization,
            alpha,
            gain,
            s12_straylight: s12_sl,
        })
    }

    pub fn sensor(&self) -> SensorType {
        self.characterization.sensor
    }

    /// Run the full chain on one dark-subtracted signal.
    ///
    /// `geometry` is required for irradiance sensors and ignored otherwise.
    /// Output stays full-length on the native band axis; callers drop the
    /// bands flagged in `self.gain.valid`.
    pub fn correct(
        &self,
        signal: ArrayView1<f64>,
        sample_time: f64,
        geometry: Option<&SolarGeometry>,
    ) -> RadResult<Spectrum> {
        let ch = self.characterization;

        let linear = non_linearity_correction(signal, self.alpha.view());
        let straylight =
            slaper_correction(linear.view(), ch.lsf.view(), STRAYLIGHT_ITERATIONS)?;
        let normalized =
            integration_normalization(straylight.view(), ch.reference_time, sample_time);
        let calibrated = absolute_calibration(normalized.view(), self.gain.gain.view());
        let thermal = thermal_correction(ch.thermal.view(), calibrated.view());

        let corrected = if ch.sensor.is_irradiance() {
            let geometry = geometry.ok_or_else(|| RadError::DataNotFound {
                sensor: ch.sensor,
                what: "solar geometry for cosine correction".to_string(),
            })?;
            let cosine = ch.cosine.as_ref().ok_or_else(|| RadError::DataNotFound {
                sensor: ch.sensor,
                what: "cosine response characterization".to_string(),
            })?;
            let (cos_corr, hemi_corr) = cosine_factors(
                cosine.zenith_error.view(),
                cosine.zenith_angles.view(),
                geometry.solar_zenith,
            );
            cosine_correction(
                thermal.view(),
                geometry.direct_ratio.view(),
                cos_corr.view(),
                hemi_corr.view(),
            )
        } else {
            thermal
        };

        Ok(corrected.mapv(|v| v / UNIT_SCALE))
    }
}
