use super::CliError;
use anyhow::Context;
use spectra_core::common::SynthesisConfig;
use spectra_core::domain::{LineList, SynthError, WavelengthInterval};
use spectra_core::lines::codec::{read_line_list, write_line_list};
use spectra_core::lines::cut;
use spectra_core::pipeline::AbundanceVariant;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub(super) fn compute_error<E: Into<SynthError>>(error: E) -> CliError {
    CliError::Compute(error.into())
}

/// File configuration (or defaults), then `SPECTRA_*` overrides, validated once.
pub(super) fn load_config(path: Option<&Path>) -> Result<SynthesisConfig, CliError> {
    let config = match path {
        Some(path) => SynthesisConfig::load(path).map_err(compute_error)?,
        None => SynthesisConfig::default(),
    };
    let config = config.from_process_env();
    config.validate().map_err(compute_error)?;
    Ok(config)
}

pub(super) fn read_lines(path: &Path) -> Result<LineList, CliError> {
    read_line_list(path).map_err(compute_error)
}

pub(super) fn write_lines(path: &Path, list: &LineList) -> Result<(), CliError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        ensure_dir(parent)?;
    }
    write_line_list(path, list).map_err(compute_error)
}

pub(super) fn ensure_dir(path: &Path) -> Result<(), CliError> {
    fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory '{}'", path.display()))?;
    Ok(())
}

pub(super) fn write_text(path: &Path, content: &str) -> Result<(), CliError> {
    fs::write(path, content).with_context(|| format!("failed to write '{}'", path.display()))?;
    Ok(())
}

/// Applies `--llzero`/`--llfin`; a missing bound keeps the list's own bound.
pub(super) fn restrict_interval(
    list: LineList,
    llzero: Option<f64>,
    llfin: Option<f64>,
) -> Result<LineList, CliError> {
    if llzero.is_none() && llfin.is_none() {
        return Ok(list);
    }
    let interval = WavelengthInterval::new(
        llzero.unwrap_or(list.interval().llzero()),
        llfin.unwrap_or(list.interval().llfin()),
    )
    .map_err(compute_error)?;
    cut(&list, interval).map_err(compute_error)
}

/// `ELEMENT=OFFSET`, as accepted by `--offset`.
pub(super) fn parse_offset(value: &str) -> Result<(String, f64), String> {
    let (element, offset) = value
        .split_once('=')
        .ok_or_else(|| format!("expected ELEMENT=OFFSET, got '{}'", value))?;
    let element = element.trim();
    if element.is_empty() {
        return Err(format!("missing element in '{}'", value));
    }
    let offset: f64 = offset
        .trim()
        .parse()
        .map_err(|_| format!("invalid offset in '{}'", value))?;
    if !offset.is_finite() {
        return Err(format!("offset must be finite in '{}'", value));
    }
    Ok((element.to_string(), offset))
}

/// `NAME:ELEMENT=OFFSET[,ELEMENT=OFFSET...]`, as accepted by `--variant`.
pub(super) fn parse_variant(value: &str) -> Result<AbundanceVariant, String> {
    let (name, offsets) = value
        .split_once(':')
        .ok_or_else(|| format!("expected NAME:ELEMENT=OFFSET[,...], got '{}'", value))?;
    let name = name.trim();
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.');
    if name.is_empty() || !name.chars().all(allowed) {
        return Err(format!(
            "variant name in '{}' must be ASCII letters, digits, '-', '_' or '.'",
            value
        ));
    }
    let offsets = offsets
        .split(',')
        .map(parse_offset)
        .collect::<Result<BTreeMap<_, _>, _>>()?;
    Ok(AbundanceVariant::new(name, offsets))
}

pub(super) fn chunk_file_name(index: usize) -> String {
    format!("chunk-{:03}.dat", index)
}

pub(super) fn spectrum_file_name(variant: Option<&str>, fwhm: Option<f64>) -> String {
    let mut name = "spectrum".to_string();
    if let Some(variant) = variant {
        name.push('-');
        name.push_str(variant);
    }
    if let Some(fwhm) = fwhm {
        name.push_str(&format!("-{}", fwhm));
    }
    name.push_str(".dat");
    name
}
