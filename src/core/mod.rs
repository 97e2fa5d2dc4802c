//! Core radiometric processing modules

pub mod correction;
pub mod montecarlo;
pub mod resample;
pub mod stats;
pub mod straylight;
pub mod uncertainty;

// Re-export main types
pub use correction::{CorrectionChain, MaskedGain};
pub use montecarlo::{McPropagation, PropagationInput, PropagationOutput};
pub use resample::{common_waveband_grid, resample, resample_ensemble, CubicSpline};
pub use stats::{light_dark_stats, SensorStats};
pub use straylight::{slaper_correction, slaper_uncertainty};
pub use uncertainty::{
    ClassBasedUncertainty, InstrumentProcessor, InstrumentUncertainty,
};
