use std::error::Error;
use std::fmt::{Display, Formatter};

pub type SynthResult<T> = Result<T, SynthError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Success,
    InputValidationError,
    IoSystemError,
    ComputationError,
    InternalError,
}

impl ErrorCategory {
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::InputValidationError => 2,
            Self::IoSystemError => 3,
            Self::ComputationError => 4,
            Self::InternalError => 5,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::InputValidationError => "InputValidationError",
            Self::IoSystemError => "IoSystemError",
            Self::ComputationError => "ComputationError",
            Self::InternalError => "InternalError",
        }
    }

    pub const fn is_fatal(self) -> bool {
        !matches!(self, Self::Success)
    }
}

/// Crate-wide error carrying a category (which fixes the process exit code)
/// and a stable dotted placeholder such as `INPUT.LINELIST_RANGE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthError {
    category: ErrorCategory,
    placeholder: &'static str,
    message: String,
}

impl SynthError {
    pub fn new(
        category: ErrorCategory,
        placeholder: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            placeholder,
            message: message.into(),
        }
    }

    pub fn input_validation(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::InputValidationError, placeholder, message)
    }

    pub fn io_system(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::IoSystemError, placeholder, message)
    }

    pub fn computation(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::ComputationError, placeholder, message)
    }

    pub fn internal(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::InternalError, placeholder, message)
    }

    pub const fn category(&self) -> ErrorCategory {
        self.category
    }

    pub const fn placeholder(&self) -> &'static str {
        self.placeholder
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn exit_code(&self) -> i32 {
        self.category.exit_code()
    }

    pub fn diagnostic_line(&self) -> String {
        let severity = if self.category.is_fatal() {
            "ERROR"
        } else {
            "INFO"
        };
        format!("{}: [{}] {}", severity, self.placeholder, self.message)
    }

    pub fn fatal_exit_line(&self) -> Option<String> {
        self.category
            .is_fatal()
            .then(|| format!("FATAL EXIT CODE: {}", self.exit_code()))
    }
}

impl Display for SynthError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.category.as_str(),
            self.placeholder,
            self.message
        )
    }
}

impl Error for SynthError {}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LineListError {
    #[error("invalid wavelength range: {reason}")]
    InvalidRange { reason: String },
    #[error("line {wavelength} of species '{species}' lies outside [{llzero}, {llfin}]")]
    RecordOutsideInterval {
        species: String,
        wavelength: f64,
        llzero: f64,
        llfin: f64,
    },
    #[error("incompatible line lists: {reason}")]
    IncompatibleUnits { reason: String },
    #[error("line list is empty after {operation}")]
    EmptyResult { operation: &'static str },
    #[error("invalid species pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

impl LineListError {
    pub(crate) fn invalid_range(reason: impl Into<String>) -> Self {
        Self::InvalidRange {
            reason: reason.into(),
        }
    }
}

impl From<LineListError> for SynthError {
    fn from(error: LineListError) -> Self {
        let placeholder = match &error {
            LineListError::InvalidRange { .. } | LineListError::RecordOutsideInterval { .. } => {
                "INPUT.LINELIST_RANGE"
            }
            LineListError::IncompatibleUnits { .. } => "INPUT.LINELIST_INCOMPATIBLE",
            LineListError::EmptyResult { .. } => "INPUT.LINELIST_EMPTY",
            LineListError::InvalidPattern { .. } => "INPUT.LINELIST_PATTERN",
        };
        SynthError::input_validation(placeholder, error.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SpectrumError {
    #[error("spectrum requires at least 2 points, got {actual}")]
    InsufficientPoints { actual: usize },
    #[error("spectrum length mismatch: wavelength={wavelength}, flux={flux}")]
    LengthMismatch { wavelength: usize, flux: usize },
    #[error("wavelength must be finite at index {index}, got {value}")]
    NonFiniteWavelength { index: usize, value: f64 },
    #[error(
        "wavelength axis must be strictly increasing, index {index} has {current} after {previous}"
    )]
    NonIncreasingWavelength {
        index: usize,
        previous: f64,
        current: f64,
    },
    #[error("flux must be finite at index {index}, got {value}")]
    NonFiniteFlux { index: usize, value: f64 },
}

impl From<SpectrumError> for SynthError {
    fn from(error: SpectrumError) -> Self {
        SynthError::input_validation("INPUT.SPECTRUM_SHAPE", error.to_string())
    }
}
