//! On-disk line-list formats.
//!
//! Both formats start with a header `#ATOMIC|#MOLECULAR <unit> <llzero> <llfin>`.
//! Atomic records are fixed width:
//!
//! ```text
//! cols  1-6   species (left aligned)
//! cols  7-18  wavelength      %12.4f
//! cols 19-28  lower energy    %10.4f
//! cols 29-38  upper energy    %10.4f
//! cols 39-46  log gf          %8.3f
//! cols 47-54  isotope tag     right aligned, optional
//! ```
//!
//! Molecular records are `;`-separated tags in fixed order:
//! `species=CN;lambda=4000.5;elow=0.1;eup=3.2;loggf=-1.5;iso=12C14N`.
//! Blank lines and lines starting with `!` are ignored.

use crate::domain::{
    LineList, LineListError, LineRecord, SpeciesClass, SynthError, WavelengthInterval,
    WavelengthUnit,
};
use std::fs;
use std::path::{Path, PathBuf};

const ATOMIC_HEADER: &str = "#ATOMIC";
const MOLECULAR_HEADER: &str = "#MOLECULAR";
const MOLECULAR_TAGS: [&str; 6] = ["species", "lambda", "elow", "eup", "loggf", "iso"];

const SPECIES_COLUMNS: (usize, usize) = (0, 6);
const WAVELENGTH_COLUMNS: (usize, usize) = (6, 18);
const LOWER_COLUMNS: (usize, usize) = (18, 28);
const UPPER_COLUMNS: (usize, usize) = (28, 38);
const LOG_GF_COLUMNS: (usize, usize) = (38, 46);
const ISOTOPE_COLUMNS: (usize, usize) = (46, 54);

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    #[error("failed to access line list '{path}': {message}")]
    Io { path: PathBuf, message: String },
    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },
    #[error("cannot encode line of species '{species}': {reason}")]
    Encode { species: String, reason: String },
    #[error(transparent)]
    LineList(#[from] LineListError),
}

impl From<CodecError> for SynthError {
    fn from(error: CodecError) -> Self {
        match error {
            CodecError::Io { .. } => SynthError::io_system("IO.LINELIST_FILE", error.to_string()),
            CodecError::Parse { .. } => {
                SynthError::input_validation("INPUT.LINELIST_PARSE", error.to_string())
            }
            CodecError::Encode { .. } => {
                SynthError::input_validation("INPUT.LINELIST_ENCODE", error.to_string())
            }
            CodecError::LineList(inner) => inner.into(),
        }
    }
}

pub fn read_line_list(path: &Path) -> Result<LineList, CodecError> {
    let content = fs::read_to_string(path).map_err(|source| CodecError::Io {
        path: path.to_path_buf(),
        message: source.to_string(),
    })?;
    parse_line_list(&content)
}

pub fn write_line_list(path: &Path, list: &LineList) -> Result<(), CodecError> {
    let content = render_line_list(list)?;
    fs::write(path, content).map_err(|source| CodecError::Io {
        path: path.to_path_buf(),
        message: source.to_string(),
    })
}

pub fn parse_line_list(content: &str) -> Result<LineList, CodecError> {
    let mut lines = content
        .lines()
        .enumerate()
        .map(|(index, line)| (index + 1, line.trim_end()))
        .filter(|(_, line)| !line.trim().is_empty() && !line.starts_with('!'));

    let Some((header_line, header)) = lines.next() else {
        return Err(CodecError::Parse {
            line: 1,
            reason: "missing line-list header".to_string(),
        });
    };
    let (class, unit, interval) = parse_header(header_line, header)?;

    let mut records = Vec::new();
    for (number, line) in lines {
        let record = match class {
            SpeciesClass::Atomic => parse_atomic_record(number, line)?,
            SpeciesClass::Molecular => parse_molecular_record(number, line)?,
        };
        records.push(record);
    }

    Ok(LineList::new(class, unit, interval, records)?)
}

fn parse_header(
    number: usize,
    header: &str,
) -> Result<(SpeciesClass, WavelengthUnit, WavelengthInterval), CodecError> {
    let parse_error = |reason: String| CodecError::Parse {
        line: number,
        reason,
    };
    let fields: Vec<&str> = header.split_whitespace().collect();
    if fields.len() != 4 {
        return Err(parse_error(format!(
            "header must be '<#ATOMIC|#MOLECULAR> <unit> <llzero> <llfin>', got '{}'",
            header
        )));
    }
    let class = match fields[0] {
        ATOMIC_HEADER => SpeciesClass::Atomic,
        MOLECULAR_HEADER => SpeciesClass::Molecular,
        other => return Err(parse_error(format!("unknown line-list kind '{}'", other))),
    };
    let unit = fields[1]
        .parse::<WavelengthUnit>()
        .map_err(|source| parse_error(source.to_string()))?;
    let llzero = parse_number(number, "llzero", fields[2])?;
    let llfin = parse_number(number, "llfin", fields[3])?;
    let interval =
        WavelengthInterval::new(llzero, llfin).map_err(|source| parse_error(source.to_string()))?;
    Ok((class, unit, interval))
}

fn parse_number(line: usize, field: &str, text: &str) -> Result<f64, CodecError> {
    text.trim().parse::<f64>().map_err(|_| CodecError::Parse {
        line,
        reason: format!("field '{}' is not a number: '{}'", field, text.trim()),
    })
}

fn column<'a>(
    line_number: usize,
    line: &'a str,
    field: &str,
    (start, end): (usize, usize),
) -> Result<&'a str, CodecError> {
    line.get(start..end.min(line.len()))
        .ok_or_else(|| CodecError::Parse {
            line: line_number,
            reason: format!(
                "field '{}' expected at columns {}-{} in a record of {} bytes",
                field,
                start + 1,
                end,
                line.len()
            ),
        })
}

fn parse_atomic_record(number: usize, line: &str) -> Result<LineRecord, CodecError> {
    if line.len() < LOG_GF_COLUMNS.1 {
        return Err(CodecError::Parse {
            line: number,
            reason: format!(
                "atomic record must span at least {} columns, got {}",
                LOG_GF_COLUMNS.1,
                line.len()
            ),
        });
    }
    if line.len() > ISOTOPE_COLUMNS.1 {
        return Err(CodecError::Parse {
            line: number,
            reason: format!(
                "atomic record exceeds {} columns, got {}",
                ISOTOPE_COLUMNS.1,
                line.len()
            ),
        });
    }

    let species = column(number, line, "species", SPECIES_COLUMNS)?.trim();
    if species.is_empty() || species.contains(char::is_whitespace) {
        return Err(CodecError::Parse {
            line: number,
            reason: format!("invalid species id '{}'", species),
        });
    }
    let wavelength = parse_number(
        number,
        "wavelength",
        column(number, line, "wavelength", WAVELENGTH_COLUMNS)?,
    )?;
    let lower = parse_number(
        number,
        "lower energy",
        column(number, line, "lower energy", LOWER_COLUMNS)?,
    )?;
    let upper = parse_number(
        number,
        "upper energy",
        column(number, line, "upper energy", UPPER_COLUMNS)?,
    )?;
    let log_gf = parse_number(
        number,
        "log gf",
        column(number, line, "log gf", LOG_GF_COLUMNS)?,
    )?;
    let isotope = if line.len() > ISOTOPE_COLUMNS.0 {
        column(number, line, "isotope", ISOTOPE_COLUMNS)?.trim()
    } else {
        ""
    };

    Ok(LineRecord::new(species, wavelength, lower, upper, log_gf).with_isotope(isotope))
}

fn parse_molecular_record(number: usize, line: &str) -> Result<LineRecord, CodecError> {
    let tags: Vec<&str> = line.trim().split(';').collect();
    if tags.len() != MOLECULAR_TAGS.len() {
        return Err(CodecError::Parse {
            line: number,
            reason: format!(
                "molecular record needs {} tags, got {}",
                MOLECULAR_TAGS.len(),
                tags.len()
            ),
        });
    }

    let mut values = [""; 6];
    for (slot, (tag, expected)) in tags.iter().zip(MOLECULAR_TAGS).enumerate() {
        let (key, value) = tag.split_once('=').ok_or_else(|| CodecError::Parse {
            line: number,
            reason: format!("tag '{}' is not a key=value pair", tag),
        })?;
        if key.trim() != expected {
            return Err(CodecError::Parse {
                line: number,
                reason: format!("expected tag '{}', found '{}'", expected, key.trim()),
            });
        }
        values[slot] = value.trim();
    }

    if values[0].is_empty() {
        return Err(CodecError::Parse {
            line: number,
            reason: "species tag is empty".to_string(),
        });
    }
    Ok(LineRecord::new(
        values[0],
        parse_number(number, "lambda", values[1])?,
        parse_number(number, "elow", values[2])?,
        parse_number(number, "eup", values[3])?,
        parse_number(number, "loggf", values[4])?,
    )
    .with_isotope(values[5]))
}

pub fn render_line_list(list: &LineList) -> Result<String, CodecError> {
    let kind = match list.class() {
        SpeciesClass::Atomic => ATOMIC_HEADER,
        SpeciesClass::Molecular => MOLECULAR_HEADER,
    };
    let interval = list.interval();
    let mut out = format!(
        "{} {} {} {}\n",
        kind,
        list.unit(),
        interval.llzero(),
        interval.llfin()
    );
    for record in list {
        let line = match list.class() {
            SpeciesClass::Atomic => render_atomic_record(record)?,
            SpeciesClass::Molecular => render_molecular_record(record)?,
        };
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

fn fixed_field(
    record: &LineRecord,
    field: &str,
    value: f64,
    width: usize,
    precision: usize,
) -> Result<String, CodecError> {
    let text = format!("{value:>width$.precision$}");
    if text.len() > width {
        return Err(CodecError::Encode {
            species: record.species.clone(),
            reason: format!("{} {} does not fit in {} columns", field, value, width),
        });
    }
    Ok(text)
}

fn render_atomic_record(record: &LineRecord) -> Result<String, CodecError> {
    let species_width = SPECIES_COLUMNS.1 - SPECIES_COLUMNS.0;
    let isotope_width = ISOTOPE_COLUMNS.1 - ISOTOPE_COLUMNS.0;
    if record.species.is_empty()
        || record.species.len() > species_width
        || record.species.contains(char::is_whitespace)
    {
        return Err(CodecError::Encode {
            species: record.species.clone(),
            reason: format!(
                "species id must be 1-{} characters without spaces",
                species_width
            ),
        });
    }
    if record.isotope.len() > isotope_width || record.isotope.contains(char::is_whitespace) {
        return Err(CodecError::Encode {
            species: record.species.clone(),
            reason: format!(
                "isotope tag '{}' must be at most {} characters without spaces",
                record.isotope, isotope_width
            ),
        });
    }

    let mut line = format!("{:<species_width$}", record.species);
    line.push_str(&fixed_field(record, "wavelength", record.wavelength, 12, 4)?);
    line.push_str(&fixed_field(record, "lower energy", record.lower_energy, 10, 4)?);
    line.push_str(&fixed_field(record, "upper energy", record.upper_energy, 10, 4)?);
    line.push_str(&fixed_field(record, "log gf", record.log_gf, 8, 3)?);
    if !record.isotope.is_empty() {
        line.push_str(&format!("{:>isotope_width$}", record.isotope));
    }
    Ok(line)
}

fn render_molecular_record(record: &LineRecord) -> Result<String, CodecError> {
    let forbidden = |text: &str| text.contains([';', '=', '\n']);
    if record.species.is_empty() || forbidden(&record.species) || forbidden(&record.isotope) {
        return Err(CodecError::Encode {
            species: record.species.clone(),
            reason: "species and isotope tags must be non-empty and free of ';' and '='"
                .to_string(),
        });
    }
    Ok(format!(
        "species={};lambda={};elow={};eup={};loggf={};iso={}",
        record.species,
        record.wavelength,
        record.lower_energy,
        record.upper_energy,
        record.log_gf,
        record.isotope
    ))
}
