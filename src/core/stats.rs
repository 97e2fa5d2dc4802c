//! Per-band light/dark statistics for one sensor acquisition.
//!
//! Dark-shutter scans are captured on their own timestamps and must be
//! brought onto the light-shutter time axis before subtraction; the
//! resampled dark series then yields the standard errors consumed as
//! random-type inputs by the propagation engine.

use crate::core::resample::CubicSpline;
use crate::types::{RadError, RadResult, SensorRecord, SensorType, SpectralSeries, Spectrum};
use ndarray::{Array2, Axis};

/// Light/dark statistics of one sensor, full-length on the sensor's native
/// band axis with an exclusion mask for uncalibrated bands.
#[derive(Debug, Clone)]
pub struct SensorStats {
    pub sensor: SensorType,
    /// Mean raw light counts per band
    pub ave_light: Spectrum,
    /// Mean interpolated dark counts per band
    pub ave_dark: Spectrum,
    /// Standard error of the mean of the light scans per band
    pub std_light: Spectrum,
    /// Standard error of the mean of the interpolated dark scans per band
    pub std_dark: Spectrum,
    /// Normalized noise of the dark-subtracted signal per band
    pub std_signal: Spectrum,
    /// Station-mean dark-subtracted signal per band
    pub signal_mean: Spectrum,
    /// Dark-subtracted light scans (scan x band)
    pub dark_corrected: SpectralSeries,
    /// Native band centers (nm), unmasked
    pub wavelengths: Spectrum,
    /// Per-band calibration mask; false marks a band with zero/NaN
    /// calibration coefficient, excluded from every later stage
    pub valid: Vec<bool>,
}

impl SensorStats {
    /// Wavelengths of the calibrated bands only.
    pub fn valid_wavelengths(&self) -> Spectrum {
        self.wavelengths
            .iter()
            .zip(self.valid.iter())
            .filter(|(_, &v)| v)
            .map(|(&wl, _)| wl)
            .collect()
    }

    /// Range of the calibrated wavelengths, for waveband grid construction.
    pub fn valid_range(&self) -> RadResult<(f64, f64)> {
        let wl = self.valid_wavelengths();
        if wl.is_empty() {
            return Err(RadError::CalibrationUnavailable {
                sensor: self.sensor,
            });
        }
        Ok((wl[0], wl[wl.len() - 1]))
    }

    /// Filter a full-length per-band vector down to the calibrated bands.
    pub fn apply_mask(&self, values: &Spectrum) -> Spectrum {
        values
            .iter()
            .zip(self.valid.iter())
            .filter(|(_, &v)| v)
            .map(|(&x, _)| x)
            .collect()
    }
}

/// Exclusion mask over the calibration coefficients: a band is valid only if
/// its coefficient is finite and non-zero.
pub fn calibration_mask(cal_coefficient: &Spectrum) -> Vec<bool> {
    cal_coefficient
        .iter()
        .map(|&c| c != 0.0 && !c.is_nan())
        .collect()
}

/// Compute light/dark statistics for one sensor.
///
/// The dark series is resampled onto the light timestamps with a cubic
/// spline over epoch seconds, then subtracted scan by scan. Standard errors
/// are population standard deviations over scans divided by sqrt(N).
pub fn light_dark_stats(
    light: &SensorRecord,
    dark: &SensorRecord,
    cal_coefficient: &Spectrum,
) -> RadResult<SensorStats> {
    if light.num_bands() != dark.num_bands() {
        return Err(RadError::ShapeMismatch(format!(
            "{}: light has {} bands, dark has {}",
            light.sensor,
            light.num_bands(),
            dark.num_bands()
        )));
    }
    if cal_coefficient.len() != light.num_bands() {
        return Err(RadError::ShapeMismatch(format!(
            "{}: {} calibration coefficients for {} bands",
            light.sensor,
            cal_coefficient.len(),
            light.num_bands()
        )));
    }
    if light.num_scans() == 0 || dark.num_scans() == 0 {
        return Err(RadError::DataNotFound {
            sensor: light.sensor,
            what: "empty light or dark series".to_string(),
        });
    }

    let dark_interp = interpolate_dark(light, dark)?;

    let n = light.num_scans() as f64;
    let nd = dark.num_scans() as f64;

    let ave_light = light.counts.sum_axis(Axis(0)) / n;
    let ave_dark = dark_interp.sum_axis(Axis(0)) / dark_interp.nrows() as f64;
    let std_light = light.counts.std_axis(Axis(0), 0.0) / n.sqrt();
    let std_dark = dark_interp.std_axis(Axis(0), 0.0) / nd.sqrt();

    let dark_corrected = &light.counts - &dark_interp;
    let signal_mean = dark_corrected.sum_axis(Axis(0)) / n;

    let std_signal: Spectrum = std_light
        .iter()
        .zip(std_dark.iter())
        .zip(signal_mean.iter())
        .map(|((&sl, &sd), &avg)| {
            let noise = (sl * sl + sd * sd).sqrt();
            if noise == 0.0 {
                0.0
            } else {
                noise / avg
            }
        })
        .collect();

    let valid = calibration_mask(cal_coefficient);
    if valid.iter().all(|&v| !v) {
        return Err(RadError::CalibrationUnavailable {
            sensor: light.sensor,
        });
    }
    log::debug!(
        "{}: {} of {} bands calibrated, {} light / {} dark scans",
        light.sensor,
        valid.iter().filter(|&&v| v).count(),
        valid.len(),
        light.num_scans(),
        dark.num_scans()
    );

    Ok(SensorStats {
        sensor: light.sensor,
        ave_light,
        ave_dark,
        std_light,
        std_dark,
        std_signal,
        signal_mean,
        dark_corrected,
        wavelengths: light.wavelengths.clone(),
        valid,
    })
}

/// Resample the dark series onto the light timestamps, band by band.
fn interpolate_dark(light: &SensorRecord, dark: &SensorRecord) -> RadResult<SpectralSeries> {
    if dark.num_scans() < 3 || light.num_scans() < 3 {
        return Err(RadError::Interpolation(format!(
            "{}: cannot spline dark onto light timestamps, series too short ({} dark, {} light scans)",
            light.sensor,
            dark.num_scans(),
            light.num_scans()
        )));
    }

    let dark_times = dark.epoch_seconds();
    let light_times = light.epoch_seconds();
    if !dark_times.windows(2).all(|w| w[1] > w[0]) {
        return Err(RadError::Interpolation(format!(
            "{}: dark timestamps are not strictly increasing",
            light.sensor
        )));
    }
    if !light_times.windows(2).all(|w| w[1] > w[0]) {
        return Err(RadError::Interpolation(format!(
            "{}: light timestamps are not strictly increasing",
            light.sensor
        )));
    }

    let mut interpolated = Array2::zeros((light.num_scans(), light.num_bands()));
    for band in 0..dark.num_bands() {
        let spline = CubicSpline::new(dark_times.clone(), dark.counts.column(band).to_vec())?;
        for (scan, &t) in light_times.iter().enumerate() {
            interpolated[[scan, band]] = spline.evaluate(t);
        }
    }
    Ok(interpolated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::{TimeZone, Utc};
    use ndarray::{arr1, arr2};

    fn record(sensor: SensorType, counts: SpectralSeries, second_step: u32) -> SensorRecord {
        let scans = counts.nrows();
        SensorRecord {
            sensor,
            timestamps: (0..scans as u32)
                .map(|i| {
                    Utc.with_ymd_and_hms(2021, 6, 1, 12, 0, 0).unwrap()
                        + chrono::Duration::seconds((i * second_step) as i64)
                })
                .collect(),
            wavelengths: (0..counts.ncols()).map(|i| 400.0 + 10.0 * i as f64).collect(),
            counts,
            integration_time: 128.0,
        }
    }

    #[test]
    fn test_dark_subtraction_scenario() {
        // light [100, 102, 98, 101], constant dark 10
        let light = record(
            SensorType::Es,
            arr2(&[[100.0], [102.0], [98.0], [101.0]]),
            1,
        );
        let dark = record(SensorType::Es, arr2(&[[10.0], [10.0], [10.0], [10.0]]), 1);
        let cal = arr1(&[1.5]);

        let stats = light_dark_stats(&light, &dark, &cal).unwrap();
        assert_relative_eq!(stats.ave_light[0], 100.25);
        assert_relative_eq!(stats.ave_dark[0], 10.0, epsilon = 1e-9);
        assert_relative_eq!(stats.signal_mean[0], 90.25, epsilon = 1e-9);
    }

    #[test]
    fn test_zero_noise_band_has_zero_signal_noise() {
        let light = record(
            SensorType::Li,
            arr2(&[[50.0, 100.0], [50.0, 102.0], [50.0, 98.0], [50.0, 101.0]]),
            1,
        );
        let dark = record(
            SensorType::Li,
            arr2(&[[5.0, 10.0], [5.0, 10.0], [5.0, 10.0], [5.0, 10.0]]),
            1,
        );
        let cal = arr1(&[1.0, 1.0]);

        let stats = light_dark_stats(&light, &dark, &cal).unwrap();
        assert_relative_eq!(stats.std_signal[0], 0.0);
        assert!(stats.std_signal[1] > 0.0);
    }

    #[test]
    fn test_short_series_rejected() {
        let light = record(SensorType::Lt, arr2(&[[100.0], [101.0]]), 1);
        let dark = record(SensorType::Lt, arr2(&[[10.0], [10.0]]), 1);
        let cal = arr1(&[1.0]);
        assert!(matches!(
            light_dark_stats(&light, &dark, &cal),
            Err(RadError::Interpolation(_))
        ));
    }

    #[test]
    fn test_non_monotonic_timestamps_rejected() {
        let mut light = record(SensorType::Es, arr2(&[[1.0], [2.0], [3.0]]), 1);
        let dark = record(SensorType::Es, arr2(&[[0.1], [0.1], [0.1]]), 1);
        light.timestamps.swap(0, 2);
        let cal = arr1(&[1.0]);
        assert!(matches!(
            light_dark_stats(&light, &dark, &cal),
            Err(RadError::Interpolation(_))
        ));
    }

    #[test]
    fn test_calibration_mask_excludes_bands() {
        let cal = arr1(&[2.0, 0.0, f64::NAN, 5.0]);
        let mask = calibration_mask(&cal);
        assert_eq!(mask, vec![true, false, false, true]);
    }

    #[test]
    fn test_all_bands_uncalibrated_is_error() {
        let light = record(SensorType::Es, arr2(&[[1.0], [2.0], [3.0]]), 1);
        let dark = record(SensorType::Es, arr2(&[[0.0], [0.0], [0.0]]), 1);
        let cal = arr1(&[0.0]);
        assert!(matches!(
            light_dark_stats(&light, &dark, &cal),
            Err(RadError::CalibrationUnavailable { .. })
        ));
    }

    #[test]
    fn test_valid_wavelengths_masked() {
        let light = record(
            SensorType::Es,
            arr2(&[[1.0, 1.0, 1.0], [2.0, 2.0, 2.0], [3.0, 3.0, 3.0]]),
            1,
        );
        let dark = record(
            SensorType::Es,
            arr2(&[[0.0, 0.0, 0.0], [0.0, 0.0, 0.0], [0.0, 0.0, 0.0]]),
            1,
        );
        let cal = arr1(&[1.0, 0.0, 2.0]);
        let stats = light_dark_stats(&light, &dark, &cal).unwrap();
        let wl = stats.valid_wavelengths();
        assert_eq!(wl.len(), 2);
        assert_relative_eq!(wl[0], 400.0);
        assert_relative_eq!(wl[1], 420.0);
    }
}
