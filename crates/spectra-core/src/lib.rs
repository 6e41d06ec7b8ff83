//! Orchestration layer for stellar spectral synthesis.
//!
//! Line lists are partitioned by wavelength, each chunk is synthesized by an
//! external kernel in its own session directory, and the resulting flux
//! segments are stitched and convolved with an instrumental profile.

pub mod common;
pub mod domain;
pub mod lines;
pub mod numerics;
pub mod pipeline;
pub mod scheduler;
pub mod session;
pub mod spectrum;
pub mod tuner;

pub use common::SynthesisConfig;
pub use domain::{
    FluxSegment, LineList, LineRecord, ProfileSpec, SpeciesClass, SynthError, SynthResult,
    SynthesizedSpectrum, WavelengthInterval, WavelengthUnit,
};
