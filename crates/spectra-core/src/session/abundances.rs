use crate::domain::SynthError;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AbundanceError {
    #[error("failed to access abundances file '{path}': {message}")]
    Io { path: PathBuf, message: String },
    #[error("abundances line {line}: {reason}")]
    Parse { line: usize, reason: String },
    #[error("abundance offset names element '{element}' which is absent from the table")]
    UnknownElement { element: String },
}

impl From<AbundanceError> for SynthError {
    fn from(error: AbundanceError) -> Self {
        match error {
            AbundanceError::Io { .. } => {
                SynthError::io_system("IO.ABUNDANCE_FILE", error.to_string())
            }
            AbundanceError::Parse { .. } => {
                SynthError::input_validation("INPUT.ABUNDANCE_PARSE", error.to_string())
            }
            AbundanceError::UnknownElement { .. } => {
                SynthError::input_validation("INPUT.ABUNDANCE_UNKNOWN_ELEMENT", error.to_string())
            }
        }
    }
}

/// Element abundances in file order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AbundanceTable {
    entries: Vec<(String, f64)>,
}

impl AbundanceTable {
    pub fn parse(content: &str) -> Result<Self, AbundanceError> {
        let mut entries: Vec<(String, f64)> = Vec::new();
        for (index, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            let [symbol, value] = fields[..] else {
                return Err(AbundanceError::Parse {
                    line: index + 1,
                    reason: format!("expected 'SYMBOL value', got '{}'", line),
                });
            };
            let value = value
                .parse::<f64>()
                .ok()
                .filter(|value| value.is_finite())
                .ok_or_else(|| AbundanceError::Parse {
                    line: index + 1,
                    reason: format!("abundance of {} is not a finite number: '{}'", symbol, value),
                })?;
            if entries.iter().any(|(existing, _)| existing == symbol) {
                return Err(AbundanceError::Parse {
                    line: index + 1,
                    reason: format!("element {} is listed twice", symbol),
                });
            }
            entries.push((symbol.to_string(), value));
        }
        Ok(Self { entries })
    }

    pub fn read(path: &Path) -> Result<Self, AbundanceError> {
        let content = fs::read_to_string(path).map_err(|source| AbundanceError::Io {
            path: path.to_path_buf(),
            message: source.to_string(),
        })?;
        Self::parse(&content)
    }

    pub fn get(&self, element: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|(symbol, _)| symbol == element)
            .map(|(_, value)| *value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Adds `offsets` (dex) to the named elements.
    pub fn with_offsets(&self, offsets: &BTreeMap<String, f64>) -> Result<Self, AbundanceError> {
        let mut table = self.clone();
        for (element, offset) in offsets {
            let entry = table
                .entries
                .iter_mut()
                .find(|(symbol, _)| symbol == element)
                .ok_or_else(|| AbundanceError::UnknownElement {
                    element: element.clone(),
                })?;
            entry.1 += offset;
        }
        Ok(table)
    }

    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|(symbol, value)| format!("{} {}\n", symbol, value))
            .collect()
    }

    pub fn write(&self, path: &Path) -> Result<(), AbundanceError> {
        fs::write(path, self.render()).map_err(|source| AbundanceError::Io {
            path: path.to_path_buf(),
            message: source.to_string(),
        })
    }
}
