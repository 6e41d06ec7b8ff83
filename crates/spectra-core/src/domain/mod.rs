pub mod errors;

pub use errors::{ErrorCategory, LineListError, SpectrumError, SynthError, SynthResult};

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WavelengthUnit {
    #[default]
    Angstrom,
    Nanometer,
}

impl WavelengthUnit {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Angstrom => "angstrom",
            Self::Nanometer => "nanometer",
        }
    }
}

impl FromStr for WavelengthUnit {
    type Err = LineListError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "angstrom" | "a" => Ok(Self::Angstrom),
            "nanometer" | "nm" => Ok(Self::Nanometer),
            other => Err(LineListError::IncompatibleUnits {
                reason: format!("unknown wavelength unit '{}'", other),
            }),
        }
    }
}

impl Display for WavelengthUnit {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeciesClass {
    Atomic,
    Molecular,
}

impl SpeciesClass {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Atomic => "atomic",
            Self::Molecular => "molecular",
        }
    }
}

impl Display for SpeciesClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).as_str())
    }
}

/// Closed wavelength interval `[llzero, llfin]` with `llzero < llfin`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawInterval", into = "RawInterval")]
pub struct WavelengthInterval {
    llzero: f64,
    llfin: f64,
}

#[derive(Serialize, Deserialize)]
struct RawInterval {
    llzero: f64,
    llfin: f64,
}

impl TryFrom<RawInterval> for WavelengthInterval {
    type Error = LineListError;

    fn try_from(raw: RawInterval) -> Result<Self, Self::Error> {
        Self::new(raw.llzero, raw.llfin)
    }
}

impl From<WavelengthInterval> for RawInterval {
    fn from(interval: WavelengthInterval) -> Self {
        Self {
            llzero: interval.llzero,
            llfin: interval.llfin,
        }
    }
}

impl WavelengthInterval {
    pub fn new(llzero: f64, llfin: f64) -> Result<Self, LineListError> {
        if !llzero.is_finite() || !llfin.is_finite() {
            return Err(LineListError::invalid_range(format!(
                "bounds must be finite, got [{}, {}]",
                llzero, llfin
            )));
        }
        if llzero >= llfin {
            return Err(LineListError::invalid_range(format!(
                "llzero must be below llfin, got [{}, {}]",
                llzero, llfin
            )));
        }
        Ok(Self { llzero, llfin })
    }

    pub const fn llzero(&self) -> f64 {
        self.llzero
    }

    pub const fn llfin(&self) -> f64 {
        self.llfin
    }

    pub fn width(&self) -> f64 {
        self.llfin - self.llzero
    }

    pub fn contains(&self, wavelength: f64) -> bool {
        self.llzero <= wavelength && wavelength <= self.llfin
    }

    pub fn intersect(&self, other: &WavelengthInterval) -> Option<WavelengthInterval> {
        Self::new(self.llzero.max(other.llzero), self.llfin.min(other.llfin)).ok()
    }
}

impl Display for WavelengthInterval {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.llzero, self.llfin)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineRecord {
    pub species: String,
    pub wavelength: f64,
    pub lower_energy: f64,
    pub upper_energy: f64,
    pub log_gf: f64,
    #[serde(default)]
    pub isotope: String,
}

/// Identity of a transition for de-duplication: species, wavelength and
/// quantum state (energy levels plus isotope tag).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DuplicateKey {
    species: String,
    wavelength_bits: u64,
    lower_bits: u64,
    upper_bits: u64,
    isotope: String,
}

impl LineRecord {
    pub fn new(
        species: impl Into<String>,
        wavelength: f64,
        lower_energy: f64,
        upper_energy: f64,
        log_gf: f64,
    ) -> Self {
        Self {
            species: species.into(),
            wavelength,
            lower_energy,
            upper_energy,
            log_gf,
            isotope: String::new(),
        }
    }

    pub fn with_isotope(mut self, isotope: impl Into<String>) -> Self {
        self.isotope = isotope.into();
        self
    }

    pub fn duplicate_key(&self) -> DuplicateKey {
        // adding 0.0 folds -0.0 into +0.0 before taking the bit pattern
        DuplicateKey {
            species: self.species.clone(),
            wavelength_bits: (self.wavelength + 0.0).to_bits(),
            lower_bits: (self.lower_energy + 0.0).to_bits(),
            upper_bits: (self.upper_energy + 0.0).to_bits(),
            isotope: self.isotope.clone(),
        }
    }
}

/// Wavelength-sorted transitions of one species class inside a declared interval.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineList {
    class: SpeciesClass,
    unit: WavelengthUnit,
    interval: WavelengthInterval,
    records: Vec<LineRecord>,
}

impl LineList {
    /// Sorts `records` by wavelength (stable) and checks that every record lies
    /// inside `interval`.
    pub fn new(
        class: SpeciesClass,
        unit: WavelengthUnit,
        interval: WavelengthInterval,
        mut records: Vec<LineRecord>,
    ) -> Result<Self, LineListError> {
        if let Some(outside) = records
            .iter()
            .find(|record| !record.wavelength.is_finite() || !interval.contains(record.wavelength))
        {
            return Err(LineListError::RecordOutsideInterval {
                species: outside.species.clone(),
                wavelength: outside.wavelength,
                llzero: interval.llzero(),
                llfin: interval.llfin(),
            });
        }
        records.sort_by(|a, b| a.wavelength.total_cmp(&b.wavelength));
        Ok(Self {
            class,
            unit,
            interval,
            records,
        })
    }

    pub const fn class(&self) -> SpeciesClass {
        self.class
    }

    pub const fn unit(&self) -> WavelengthUnit {
        self.unit
    }

    pub const fn interval(&self) -> WavelengthInterval {
        self.interval
    }

    pub fn records(&self) -> &[LineRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<LineRecord> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, LineRecord> {
        self.records.iter()
    }

    pub fn species(&self) -> BTreeSet<&str> {
        self.records
            .iter()
            .map(|record| record.species.as_str())
            .collect()
    }
}

impl<'a> IntoIterator for &'a LineList {
    type Item = &'a LineRecord;
    type IntoIter = std::slice::Iter<'a, LineRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

pub(crate) fn validate_axis(wavelength: &[f64], flux: &[f64]) -> Result<(), SpectrumError> {
    if wavelength.len() < 2 {
        return Err(SpectrumError::InsufficientPoints {
            actual: wavelength.len(),
        });
    }
    if wavelength.len() != flux.len() {
        return Err(SpectrumError::LengthMismatch {
            wavelength: wavelength.len(),
            flux: flux.len(),
        });
    }

    for (index, value) in wavelength.iter().copied().enumerate() {
        if !value.is_finite() {
            return Err(SpectrumError::NonFiniteWavelength { index, value });
        }
        if index > 0 {
            let previous = wavelength[index - 1];
            if value <= previous {
                return Err(SpectrumError::NonIncreasingWavelength {
                    index,
                    previous,
                    current: value,
                });
            }
        }
    }

    for (index, value) in flux.iter().copied().enumerate() {
        if !value.is_finite() {
            return Err(SpectrumError::NonFiniteFlux { index, value });
        }
    }

    Ok(())
}

/// Flux computed by one session over its sub-interval.
#[derive(Debug, Clone, PartialEq)]
pub struct FluxSegment {
    wavelength: Vec<f64>,
    flux: Vec<f64>,
}

impl FluxSegment {
    pub fn new(wavelength: Vec<f64>, flux: Vec<f64>) -> Result<Self, SpectrumError> {
        validate_axis(&wavelength, &flux)?;
        Ok(Self { wavelength, flux })
    }

    pub fn wavelength(&self) -> &[f64] {
        &self.wavelength
    }

    pub fn flux(&self) -> &[f64] {
        &self.flux
    }

    pub fn len(&self) -> usize {
        self.wavelength.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wavelength.is_empty()
    }

    pub fn start(&self) -> f64 {
        self.wavelength[0]
    }

    pub fn end(&self) -> f64 {
        self.wavelength[self.wavelength.len() - 1]
    }

    pub fn interval(&self) -> WavelengthInterval {
        WavelengthInterval {
            llzero: self.start(),
            llfin: self.end(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProfileSpec {
    Gaussian { fwhm: f64 },
    Lorentzian { fwhm: f64 },
}

impl ProfileSpec {
    pub const fn fwhm(&self) -> f64 {
        match self {
            Self::Gaussian { fwhm } | Self::Lorentzian { fwhm } => *fwhm,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Gaussian { .. } => "gaussian",
            Self::Lorentzian { .. } => "lorentzian",
        }
    }
}

/// Final stitched spectrum; `profile` is `None` when no broadening was applied.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedSpectrum {
    wavelength: Vec<f64>,
    flux: Vec<f64>,
    profile: Option<ProfileSpec>,
}

impl SynthesizedSpectrum {
    pub fn new(
        wavelength: Vec<f64>,
        flux: Vec<f64>,
        profile: Option<ProfileSpec>,
    ) -> Result<Self, SpectrumError> {
        validate_axis(&wavelength, &flux)?;
        Ok(Self {
            wavelength,
            flux,
            profile,
        })
    }

    pub fn wavelength(&self) -> &[f64] {
        &self.wavelength
    }

    pub fn flux(&self) -> &[f64] {
        &self.flux
    }

    pub fn profile(&self) -> Option<ProfileSpec> {
        self.profile
    }

    pub fn len(&self) -> usize {
        self.wavelength.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wavelength.is_empty()
    }

    pub fn interval(&self) -> WavelengthInterval {
        WavelengthInterval {
            llzero: self.wavelength[0],
            llfin: self.wavelength[self.wavelength.len() - 1],
        }
    }
}
