//! Two-column `wavelength flux` spectrum files.

use crate::domain::{FluxSegment, SpectrumError, SynthError, SynthesizedSpectrum};
use std::fs;
use std::path::{Path, PathBuf};

/// Significant digits written for every value (`%.10g`).
pub const SIGNIFICANT_DIGITS: usize = 10;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SpectrumFileError {
    #[error("failed to access spectrum file '{path}': {message}")]
    Io { path: PathBuf, message: String },
    #[error("spectrum line {line}: {reason}")]
    Parse { line: usize, reason: String },
    #[error(transparent)]
    Shape(#[from] SpectrumError),
}

impl From<SpectrumFileError> for SynthError {
    fn from(error: SpectrumFileError) -> Self {
        match error {
            SpectrumFileError::Io { .. } => {
                SynthError::io_system("IO.SPECTRUM_FILE", error.to_string())
            }
            SpectrumFileError::Parse { .. } => {
                SynthError::input_validation("INPUT.SPECTRUM_PARSE", error.to_string())
            }
            SpectrumFileError::Shape(inner) => inner.into(),
        }
    }
}

/// Parses `wavelength flux` pairs; blank lines and `#` comments are skipped
/// and any columns past the second are ignored.
pub fn parse_xy(content: &str) -> Result<(Vec<f64>, Vec<f64>), SpectrumFileError> {
    let mut wavelength = Vec::new();
    let mut flux = Vec::new();

    for (index, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(x), Some(y)) = (fields.next(), fields.next()) else {
            return Err(SpectrumFileError::Parse {
                line: index + 1,
                reason: format!("expected two columns, got '{}'", line),
            });
        };
        let parse = |text: &str| {
            text.parse::<f64>().map_err(|_| SpectrumFileError::Parse {
                line: index + 1,
                reason: format!("'{}' is not a number", text),
            })
        };
        wavelength.push(parse(x)?);
        flux.push(parse(y)?);
    }

    Ok((wavelength, flux))
}

pub fn read_segment(path: &Path) -> Result<FluxSegment, SpectrumFileError> {
    let content = fs::read_to_string(path).map_err(|source| SpectrumFileError::Io {
        path: path.to_path_buf(),
        message: source.to_string(),
    })?;
    let (wavelength, flux) = parse_xy(&content)?;
    Ok(FluxSegment::new(wavelength, flux)?)
}

pub fn render_xy(wavelength: &[f64], flux: &[f64]) -> String {
    let mut out = String::with_capacity(wavelength.len() * 32);
    for (x, y) in wavelength.iter().zip(flux) {
        out.push_str(&format_general(*x, SIGNIFICANT_DIGITS));
        out.push(' ');
        out.push_str(&format_general(*y, SIGNIFICANT_DIGITS));
        out.push('\n');
    }
    out
}

pub fn write_spectrum(
    path: &Path,
    spectrum: &SynthesizedSpectrum,
) -> Result<(), SpectrumFileError> {
    write_text(path, &render_xy(spectrum.wavelength(), spectrum.flux()))
}

pub fn write_segment(path: &Path, segment: &FluxSegment) -> Result<(), SpectrumFileError> {
    write_text(path, &render_xy(segment.wavelength(), segment.flux()))
}

fn write_text(path: &Path, content: &str) -> Result<(), SpectrumFileError> {
    fs::write(path, content).map_err(|source| SpectrumFileError::Io {
        path: path.to_path_buf(),
        message: source.to_string(),
    })
}

/// C `%.{significant}g`: shortest of fixed or exponent notation with trailing
/// zeros removed.
pub fn format_general(value: f64, significant: usize) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    if !value.is_finite() {
        return value.to_string();
    }

    let significant = significant.max(1);
    let scientific = format!("{:.*e}", significant - 1, value);
    let Some((mantissa, exponent)) = scientific.split_once('e') else {
        return scientific;
    };
    let exponent: i32 = exponent.parse().unwrap_or(0);

    if exponent < -4 || exponent >= significant as i32 {
        let mantissa = trim_fraction(mantissa);
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", mantissa, sign, exponent.unsigned_abs())
    } else {
        let decimals = (significant as i32 - 1 - exponent).max(0) as usize;
        trim_fraction(&format!("{:.*}", decimals, value)).to_string()
    }
}

fn trim_fraction(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}
