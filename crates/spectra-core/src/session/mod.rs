//! Isolated per-interval working directories for the synthesis kernel.

pub mod abundances;
pub mod kernel;

pub use abundances::{AbundanceError, AbundanceTable};
pub use kernel::{ExternalKernel, SynthesisKernel};

use crate::domain::{LineList, SynthError, WavelengthInterval};
use crate::lines::codec::{CodecError, write_line_list};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

pub const MAIN_CONFIG_FILE: &str = "main.cfg";
pub const LINES_FILE: &str = "lines.dat";
pub const ATMOSPHERE_FILE: &str = "modeles.dat";
pub const ABUNDANCES_FILE: &str = "abonds.dat";
pub const DISSOCIATION_FILE: &str = "dissoc.dat";
pub const SPECTRUM_FILE: &str = "spectrum.dat";
pub const COMMANDS_LOG: &str = "commands.log";
pub const KERNEL_LOG: &str = "kernel.log";

const SESSION_PREFIX: &str = "session-";

/// Everything one kernel invocation needs. Input files live inside
/// `work_dir` under the fixed names above.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub index: usize,
    pub work_dir: PathBuf,
    pub interval: WavelengthInterval,
    pub zinf: f64,
    /// Sampling step (`pas`).
    pub step: f64,
    pub fwhm: f64,
    pub abundance_offsets: BTreeMap<String, f64>,
    pub has_dissociation: bool,
}

impl SessionConfig {
    pub fn with_zinf(&self, zinf: f64) -> Self {
        Self {
            zinf,
            ..self.clone()
        }
    }

    pub fn spectrum_path(&self) -> PathBuf {
        self.work_dir.join(SPECTRUM_FILE)
    }

    pub fn render_main_config(&self) -> String {
        let mut out = String::new();
        let mut entry = |key: &str, value: String| {
            let _ = writeln!(out, "{} = {}", key, value);
        };
        entry("llzero", self.interval.llzero().to_string());
        entry("llfin", self.interval.llfin().to_string());
        entry("pas", self.step.to_string());
        entry("zinf", self.zinf.to_string());
        entry("fwhm", self.fwhm.to_string());
        entry("fn_lines", LINES_FILE.to_string());
        entry("fn_modeles", ATMOSPHERE_FILE.to_string());
        entry("fn_abonds", ABUNDANCES_FILE.to_string());
        if self.has_dissociation {
            entry("fn_dissoc", DISSOCIATION_FILE.to_string());
        }
        entry("fn_spectrum", SPECTRUM_FILE.to_string());
        out
    }

    pub fn write_main_config(&self) -> std::io::Result<()> {
        fs::write(self.work_dir.join(MAIN_CONFIG_FILE), self.render_main_config())
    }

    pub fn failure(&self, kind: SessionFailure) -> SessionError {
        SessionError {
            index: self.index,
            interval: self.interval,
            kind,
            diagnostics: Vec::new(),
        }
    }

    /// Removes the working directory. Failures are logged, not returned.
    pub fn cleanup(&self) -> bool {
        match fs::remove_dir_all(&self.work_dir) {
            Ok(()) => true,
            Err(error) if error.kind() == ErrorKind::NotFound => true,
            Err(error) => {
                warn!(
                    session = self.index,
                    dir = %self.work_dir.display(),
                    %error,
                    "failed to remove session directory"
                );
                false
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionFailure {
    #[error("kernel could not be started: {0}")]
    Spawn(String),
    #[error("session directory unusable: {0}")]
    Io(String),
    #[error("kernel exited with {status}")]
    NonZeroExit { status: String },
    #[error("kernel exceeded the {seconds} s timeout")]
    Timeout { seconds: f64 },
    #[error("malformed kernel output: {0}")]
    MalformedOutput(String),
    #[error("cancelled before completion")]
    Cancelled,
}

/// Failure of one session; the rest of the batch is unaffected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("session {index} {interval}: {kind}")]
pub struct SessionError {
    pub index: usize,
    pub interval: WavelengthInterval,
    pub kind: SessionFailure,
    /// Trailing kernel log lines.
    pub diagnostics: Vec<String>,
}

impl SessionError {
    pub fn with_diagnostics(mut self, diagnostics: Vec<String>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == SessionFailure::Cancelled
    }
}

impl From<SessionError> for SynthError {
    fn from(error: SessionError) -> Self {
        SynthError::computation("RUN.SESSION_FAILED", error.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PrepareError {
    #[error("failed to prepare '{path}': {message}")]
    Io { path: PathBuf, message: String },
    #[error(transparent)]
    Abundance(#[from] AbundanceError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl From<PrepareError> for SynthError {
    fn from(error: PrepareError) -> Self {
        match error {
            PrepareError::Io { .. } => SynthError::io_system("IO.SESSION_SETUP", error.to_string()),
            PrepareError::Abundance(inner) => inner.into(),
            PrepareError::Codec(inner) => inner.into(),
        }
    }
}

fn prepare_io(path: &Path, source: std::io::Error) -> PrepareError {
    PrepareError::Io {
        path: path.to_path_buf(),
        message: source.to_string(),
    }
}

/// Hands out fresh `session-<n>` directories under a root. Safe to share
/// between threads; an existing directory is never reused.
#[derive(Debug)]
pub struct IdMaker {
    root: PathBuf,
    next: AtomicUsize,
}

impl IdMaker {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            next: AtomicUsize::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn make_dir(&self) -> Result<PathBuf, PrepareError> {
        fs::create_dir_all(&self.root).map_err(|source| prepare_io(&self.root, source))?;
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            let dir = self.root.join(format!("{}{}", SESSION_PREFIX, id));
            match fs::create_dir(&dir) {
                Ok(()) => return Ok(dir),
                Err(error) if error.kind() == ErrorKind::AlreadyExists => continue,
                Err(error) => return Err(prepare_io(&dir, error)),
            }
        }
    }
}

/// Inputs shared by every session of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInputs {
    pub atmosphere: PathBuf,
    pub abundances: AbundanceTable,
    pub dissociation: Option<PathBuf>,
    pub zinf: f64,
    pub step: f64,
    pub fwhm: f64,
    pub abundance_offsets: BTreeMap<String, f64>,
}

impl SessionInputs {
    pub fn new(atmosphere: impl Into<PathBuf>, abundances: AbundanceTable) -> Self {
        Self {
            atmosphere: atmosphere.into(),
            abundances,
            dissociation: None,
            zinf: 0.5,
            step: 0.02,
            fwhm: 0.0,
            abundance_offsets: BTreeMap::new(),
        }
    }
}

/// Creates one directory per chunk and writes every kernel input into it.
/// On failure every directory created by this call is removed.
pub fn prepare_sessions(
    ids: &IdMaker,
    chunks: &[LineList],
    inputs: &SessionInputs,
) -> Result<Vec<SessionConfig>, PrepareError> {
    let mut sessions = Vec::with_capacity(chunks.len());
    if let Err(error) = append_sessions(&mut sessions, ids, chunks, inputs) {
        for session in &sessions {
            session.cleanup();
        }
        return Err(error);
    }
    Ok(sessions)
}

/// Prepares one session per chunk, numbered after those already in
/// `sessions`. On failure `sessions` keeps every completed session and the
/// half-written directory of the failing one is removed.
pub fn append_sessions(
    sessions: &mut Vec<SessionConfig>,
    ids: &IdMaker,
    chunks: &[LineList],
    inputs: &SessionInputs,
) -> Result<(), PrepareError> {
    let abundances = inputs.abundances.with_offsets(&inputs.abundance_offsets)?;
    for chunk in chunks {
        let session = prepare_session(ids, sessions.len(), chunk, inputs, &abundances)?;
        sessions.push(session);
    }
    Ok(())
}

fn prepare_session(
    ids: &IdMaker,
    index: usize,
    chunk: &LineList,
    inputs: &SessionInputs,
    abundances: &AbundanceTable,
) -> Result<SessionConfig, PrepareError> {
    let session = SessionConfig {
        index,
        work_dir: ids.make_dir()?,
        interval: chunk.interval(),
        zinf: inputs.zinf,
        step: inputs.step,
        fwhm: inputs.fwhm,
        abundance_offsets: inputs.abundance_offsets.clone(),
        has_dissociation: inputs.dissociation.is_some(),
    };
    if let Err(error) = write_session_inputs(&session, chunk, inputs, abundances) {
        session.cleanup();
        return Err(error);
    }
    debug!(
        session = index,
        dir = %session.work_dir.display(),
        interval = %session.interval,
        lines = chunk.len(),
        "prepared session"
    );
    Ok(session)
}

fn write_session_inputs(
    session: &SessionConfig,
    chunk: &LineList,
    inputs: &SessionInputs,
    abundances: &AbundanceTable,
) -> Result<(), PrepareError> {
    let work_dir = &session.work_dir;
    write_line_list(&work_dir.join(LINES_FILE), chunk)?;
    abundances.write(&work_dir.join(ABUNDANCES_FILE))?;
    copy_input(&inputs.atmosphere, &work_dir.join(ATMOSPHERE_FILE))?;
    if let Some(dissociation) = &inputs.dissociation {
        copy_input(dissociation, &work_dir.join(DISSOCIATION_FILE))?;
    }
    session
        .write_main_config()
        .map_err(|source| prepare_io(&work_dir.join(MAIN_CONFIG_FILE), source))
}

fn copy_input(from: &Path, to: &Path) -> Result<(), PrepareError> {
    fs::copy(from, to)
        .map(|_| ())
        .map_err(|source| prepare_io(from, source))
}
