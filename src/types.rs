use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

/// Per-band spectral vector (one value per waveband)
pub type Spectrum = Array1<f64>;

/// 2D spectral time series (scan x band)
pub type SpectralSeries = Array2<f64>;

/// Monte Carlo sample ensemble (draw x band)
pub type SampleEnsemble = Array2<f64>;

/// Radiometer channel / frame type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorType {
    /// Downwelling irradiance
    Es,
    /// Sky radiance
    Li,
    /// Total water-leaving radiance
    Lt,
}

impl SensorType {
    /// Irradiance sensors carry a cosine collector and receive the angular
    /// response correction; radiance sensors do not.
    pub fn is_irradiance(&self) -> bool {
        matches!(self, SensorType::Es)
    }

    /// The three channels in processing order.
    pub const ALL: [SensorType; 3] = [SensorType::Es, SensorType::Li, SensorType::Lt];
}

impl std::fmt::Display for SensorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SensorType::Es => write!(f, "ES"),
            SensorType::Li => write!(f, "LI"),
            SensorType::Lt => write!(f, "LT"),
        }
    }
}

/// Error-correlation model of a calibration uncertainty
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCorrelation {
    /// Independent per Monte Carlo draw and per band
    Random,
    /// Fully correlated across bands, independent across draws
    Systematic,
}

/// One value per radiometer channel
#[derive(Debug, Clone, Default)]
pub struct ChannelSet<T> {
    pub es: T,
    pub li: T,
    pub lt: T,
}

impl<T> ChannelSet<T> {
    pub fn get(&self, sensor: SensorType) -> &T {
        match sensor {
            SensorType::Es => &self.es,
            SensorType::Li => &self.li,
            SensorType::Lt => &self.lt,
        }
    }

    pub fn get_mut(&mut self, sensor: SensorType) -> &mut T {
        match sensor {
            SensorType::Es => &mut self.es,
            SensorType::Li => &mut self.li,
            SensorType::Lt => &mut self.lt,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (SensorType, &T)> {
        SensorType::ALL.iter().map(move |&s| (s, self.get(s)))
    }

    /// Build a channel set by evaluating a fallible constructor per channel.
    pub fn try_from_fn<E>(
        mut f: impl FnMut(SensorType) -> Result<T, E>,
    ) -> Result<ChannelSet<T>, E> {
        Ok(ChannelSet {
            es: f(SensorType::Es)?,
            li: f(SensorType::Li)?,
            lt: f(SensorType::Lt)?,
        })
    }
}

/// One acquisition of a single sensor in one shutter state.
///
/// Scan timestamps and the counts array share the scan axis; wavelengths
/// label the band axis. Immutable once captured.
#[derive(Debug, Clone)]
pub struct SensorRecord {
    pub sensor: SensorType,
    pub timestamps: Vec<DateTime<Utc>>,
    /// Raw counts, scan x band
    pub counts: SpectralSeries,
    /// Band centers in nm, strictly increasing
    pub wavelengths: Spectrum,
    /// Integration time of the scans in this record (ms)
    pub integration_time: f64,
}

impl SensorRecord {
    /// Scan timestamps as epoch seconds (fractional), the numeric axis used
    /// for dark-to-light time interpolation.
    pub fn epoch_seconds(&self) -> Vec<f64> {
        self.timestamps
            .iter()
            .map(|t| t.timestamp() as f64 + f64::from(t.timestamp_subsec_micros()) / 1e6)
            .collect()
    }

    pub fn num_scans(&self) -> usize {
        self.counts.nrows()
    }

    pub fn num_bands(&self) -> usize {
        self.counts.ncols()
    }
}

/// Angular (cosine) response characterization of an irradiance sensor.
#[derive(Debug, Clone)]
pub struct CosineCharacterization {
    /// Characterized zenith angles (deg)
    pub zenith_angles: Spectrum,
    /// Cosine error in percent, band x zenith angle
    pub zenith_error: Array2<f64>,
    /// Uncertainty of the cosine error table (percent, absolute)
    pub zenith_error_unc: Array2<f64>,
}

/// Full radiometric characterization of one sensor, as delivered by the
/// calibration provider. All uncertainties are absolute (same units as the
/// quantity they belong to).
#[derive(Debug, Clone)]
pub struct SensorCharacterization {
    pub sensor: SensorType,
    /// Band centers (nm), strictly increasing
    pub wavelengths: Spectrum,
    /// Factory calibration coefficient per band; zero/NaN marks an
    /// uncalibrated band
    pub cal_coefficient: Spectrum,
    /// Background dark structure at the reference integration time
    pub b0: Spectrum,
    /// Integration-time-dependent background component
    pub b1: Spectrum,
    /// Non-linearity calibration measurement at integration time `t1`
    pub s1: Spectrum,
    pub s1_unc: Spectrum,
    /// Non-linearity calibration measurement at integration time `t2`
    pub s2: Spectrum,
    pub s2_unc: Spectrum,
    /// Integration times of the S1/S2 measurements (ms)
    pub t1: f64,
    pub t2: f64,
    /// Reference integration time of the characterization (ms)
    pub reference_time: f64,
    /// Stray-light line-spread-function matrix, band x band
    pub lsf: Array2<f64>,
    pub lsf_unc: Array2<f64>,
    /// Thermal response coefficient per band
    pub thermal: Spectrum,
    pub thermal_unc: Spectrum,
    /// Reference lamp irradiance per band
    pub lamp: Spectrum,
    pub lamp_unc: Spectrum,
    /// Reflectance panel, radiance sensors only
    pub panel: Option<Spectrum>,
    pub panel_unc: Option<Spectrum>,
    /// Cosine response, irradiance sensors only
    pub cosine: Option<CosineCharacterization>,
}

/// Class-based uncertainty coefficients for one sensor: multiplicative
/// correction factors around unity with their absolute uncertainties.
#[derive(Debug, Clone)]
pub struct ClassCoefficients {
    /// Factory calibration coefficient per band
    pub cal: Spectrum,
    pub cal_unc: Spectrum,
    pub stability_unc: Spectrum,
    pub linearity_unc: Spectrum,
    pub straylight_unc: Spectrum,
    pub thermal_unc: Spectrum,
    /// Polarization sensitivity (radiance) or cosine response (irradiance)
    pub angular_unc: Spectrum,
}

/// Solar geometry and sky condition for one acquisition, supplied by the
/// atmospheric model provider.
#[derive(Debug, Clone)]
pub struct SolarGeometry {
    /// Solar zenith angle (deg)
    pub solar_zenith: f64,
    /// Direct/global irradiance ratio per band
    pub direct_ratio: Spectrum,
}

/// Processing parameters. No behavior of its own, only parameterization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Waveband interpolation interval (nm)
    pub interp_interval: f64,
    /// Number of Monte Carlo draws
    pub mc_draws: usize,
    /// Worker threads for per-draw evaluation (1 = sequential)
    pub parallel_degree: usize,
    /// RNG seed, fixed for reproducible runs
    pub seed: Option<u64>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            interp_interval: 3.3,
            mc_draws: 100,
            parallel_degree: 1,
            seed: None,
        }
    }
}

/// Error types for radiometric processing
#[derive(Debug, thiserror::Error)]
pub enum RadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{sensor}: missing data: {what}")]
    DataNotFound { sensor: SensorType, what: String },

    #[error("interpolation error: {0}")]
    Interpolation(String),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("{sensor}: no calibrated bands available")]
    CalibrationUnavailable { sensor: SensorType },

    #[error("correlation store format error: {0}")]
    CorrelationStoreFormat(String),

    #[error("processing error: {0}")]
    Processing(String),
}

/// Result type for radiometric operations
pub type RadResult<T> = Result<T, RadError>;
