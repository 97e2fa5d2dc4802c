//! hydrorad: A Fast, Modular Hyperspectral Radiometer Calibration and Uncertainty Processor
//!
//! This library converts raw radiometer counts from above-water
//! irradiance/radiance sensors (ES, LI, LT) into calibrated physical units
//! and propagates measurement uncertainty through every correction stage:
//! dark-signal removal, non-linearity, stray-light deconvolution,
//! radiometric gain, thermal response and angular (cosine) response. A
//! Monte Carlo engine re-runs the same correction functions on perturbed
//! draws to produce per-waveband uncertainties and inter-channel
//! correlation.

pub mod core;
pub mod io;
pub mod types;

// Re-export main types and functions for easier access
pub use types::{
    ChannelSet, ClassCoefficients, CosineCharacterization, ErrorCorrelation, ProcessingConfig,
    RadError, RadResult, SampleEnsemble, SensorCharacterization, SensorRecord, SensorType,
    SolarGeometry, SpectralSeries, Spectrum,
};

pub use crate::core::{
    CorrectionChain, InstrumentProcessor, InstrumentUncertainty, McPropagation, SensorStats,
};
pub use crate::io::CorrelationStore;
