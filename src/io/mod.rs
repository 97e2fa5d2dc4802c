//! Persistence interfaces

pub mod corr_store;

pub use corr_store::CorrelationStore;
