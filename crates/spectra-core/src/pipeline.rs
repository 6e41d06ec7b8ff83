//! End-to-end synthesis: partition, optional zinf pre-pass, parallel
//! sessions per abundance variant, stitching and convolution.

use crate::common::config::SynthesisConfig;
use crate::domain::{
    LineList, LineListError, ProfileSpec, SynthError, SynthesizedSpectrum, WavelengthInterval,
};
use crate::lines::partition;
use crate::numerics::{ConvolutionEngine, ConvolutionError};
use crate::scheduler::{BatchCancelled, CancellationToken, RunScheduler};
use crate::session::{
    IdMaker, PrepareError, SessionConfig, SessionError, SessionInputs, SynthesisKernel,
    append_sessions, prepare_sessions,
};
use crate::tuner::{KernelProbe, TuneError, TuneOutcome, tune};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Ok,
    Failed,
}

/// Name given to the single run of a request without variants.
pub const BASE_VARIANT: &str = "base";

/// Differential abundances for one fan-out of the chunk set. Offsets (dex)
/// are added on top of the request's base offsets.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AbundanceVariant {
    pub name: String,
    pub offsets: BTreeMap<String, f64>,
}

impl AbundanceVariant {
    pub fn new(name: impl Into<String>, offsets: BTreeMap<String, f64>) -> Self {
        Self {
            name: name.into(),
            offsets,
        }
    }

    /// Zero-padded position, used when variants are not named.
    pub fn numbered(position: usize, offsets: BTreeMap<String, f64>) -> Self {
        Self::new(format!("{:02}", position), offsets)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionReport {
    pub index: usize,
    pub variant: String,
    pub interval: WavelengthInterval,
    pub status: SessionStatus,
    pub work_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<String>,
}

/// Contents of `report.json`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub zinf: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tuning: Option<TuneOutcome>,
    pub sessions: Vec<SessionReport>,
}

impl RunReport {
    pub fn failed(&self) -> impl Iterator<Item = &SessionReport> {
        self.sessions
            .iter()
            .filter(|session| session.status == SessionStatus::Failed)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    pub lines: LineList,
    pub inputs: SessionInputs,
    /// Empty means the stitched flux is returned unconvolved.
    pub profiles: Vec<ProfileSpec>,
    /// Empty means one run with the base offsets, named [`BASE_VARIANT`].
    pub variants: Vec<AbundanceVariant>,
    pub tune_zinf: bool,
}

impl SynthesisRequest {
    /// Session inputs of every variant, validated before any directory is
    /// created.
    fn variant_inputs(&self) -> Result<Vec<(AbundanceVariant, SessionInputs)>, PipelineError> {
        let variants = if self.variants.is_empty() {
            vec![AbundanceVariant::new(BASE_VARIANT, BTreeMap::new())]
        } else {
            self.variants.clone()
        };

        let mut names = BTreeSet::new();
        let mut resolved = Vec::with_capacity(variants.len());
        for variant in variants {
            if variant.name.is_empty() || !names.insert(variant.name.clone()) {
                return Err(PipelineError::InvalidVariant { name: variant.name });
            }
            let mut inputs = self.inputs.clone();
            for (element, offset) in &variant.offsets {
                *inputs.abundance_offsets.entry(element.clone()).or_insert(0.0) += offset;
            }
            inputs
                .abundances
                .with_offsets(&inputs.abundance_offsets)
                .map_err(PrepareError::from)?;
            resolved.push((variant, inputs));
        }
        Ok(resolved)
    }
}

/// Spectra of one abundance variant, one per requested profile (or the
/// unconvolved stitch when no profile was requested).
#[derive(Debug, Clone, PartialEq)]
pub struct VariantSpectra {
    pub variant: AbundanceVariant,
    pub spectra: Vec<SynthesizedSpectrum>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisOutput {
    pub variants: Vec<VariantSpectra>,
    pub report: RunReport,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    LineList(#[from] LineListError),
    #[error(transparent)]
    Prepare(#[from] PrepareError),
    #[error("abundance variant name '{name}' is empty or repeated")]
    InvalidVariant { name: String },
    #[error(transparent)]
    Tune(#[from] TuneError),
    #[error(transparent)]
    Cancelled(#[from] BatchCancelled),
    #[error(
        "{count} of {total} synthesis sessions failed",
        count = .failures.len(),
        total = .report.sessions.len()
    )]
    SessionsFailed {
        failures: Vec<SessionError>,
        report: RunReport,
    },
    #[error(transparent)]
    Convolution(#[from] ConvolutionError),
}

impl From<PipelineError> for SynthError {
    fn from(error: PipelineError) -> Self {
        match error {
            PipelineError::LineList(inner) => inner.into(),
            PipelineError::Prepare(inner) => inner.into(),
            PipelineError::InvalidVariant { .. } => {
                SynthError::input_validation("INPUT.ABUNDANCE_VARIANT", error.to_string())
            }
            PipelineError::Tune(inner) => inner.into(),
            PipelineError::Cancelled(inner) => inner.into(),
            PipelineError::SessionsFailed { .. } => {
                SynthError::computation("RUN.SESSION_FAILED", error.to_string())
            }
            PipelineError::Convolution(inner) => inner.into(),
        }
    }
}

pub struct SynthesisPipeline<K> {
    config: SynthesisConfig,
    scheduler: RunScheduler<K>,
    engine: ConvolutionEngine,
}

impl<K: SynthesisKernel> SynthesisPipeline<K> {
    pub fn new(kernel: K, config: SynthesisConfig) -> Self {
        let scheduler = RunScheduler::new(kernel, &config.scheduler);
        let engine = ConvolutionEngine::new(config.convolution.clone());
        Self {
            config,
            scheduler,
            engine,
        }
    }

    pub fn config(&self) -> &SynthesisConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &RunScheduler<K> {
        &self.scheduler
    }

    pub fn synthesize(
        &self,
        request: &SynthesisRequest,
        cancel: &CancellationToken,
    ) -> Result<SynthesisOutput, PipelineError> {
        let chunks = partition(&request.lines, self.config.partition.chunk_width)?;
        let mut variants = request.variant_inputs()?;
        let ids = IdMaker::new(&self.config.scheduler.session_root);

        let tuning = if request.tune_zinf {
            let outcome = self.tune_first_chunk(&ids, &chunks, &variants[0].1, cancel)?;
            for (_, inputs) in &mut variants {
                inputs.zinf = outcome.zinf;
            }
            Some(outcome)
        } else {
            None
        };
        let zinf = variants[0].1.zinf;

        let mut sessions = Vec::with_capacity(chunks.len() * variants.len());
        let mut owners = Vec::with_capacity(sessions.capacity());
        for (position, (_, inputs)) in variants.iter().enumerate() {
            if let Err(error) = append_sessions(&mut sessions, &ids, &chunks, inputs) {
                self.cleanup(&sessions);
                return Err(error.into());
            }
            owners.resize(sessions.len(), position);
        }
        info!(
            sessions = sessions.len(),
            variants = variants.len(),
            root = %ids.root().display(),
            zinf,
            "prepared synthesis sessions"
        );

        let outcomes = match self.scheduler.run_cancellable(&sessions, cancel) {
            Ok(outcomes) => outcomes,
            Err(cancelled) => {
                self.cleanup(&sessions);
                return Err(cancelled.into());
            }
        };

        let mut report = RunReport {
            zinf,
            tuning,
            sessions: Vec::with_capacity(sessions.len()),
        };
        let mut segments = vec![Vec::with_capacity(chunks.len()); variants.len()];
        let mut failures = Vec::new();
        for ((session, outcome), owner) in sessions.iter().zip(outcomes).zip(&owners) {
            let (status, reason, diagnostics) = match &outcome {
                Ok(_) => (SessionStatus::Ok, None, Vec::new()),
                Err(error) => (
                    SessionStatus::Failed,
                    Some(error.kind.to_string()),
                    error.diagnostics.clone(),
                ),
            };
            report.sessions.push(SessionReport {
                index: session.index,
                variant: variants[*owner].0.name.clone(),
                interval: session.interval,
                status,
                work_dir: session.work_dir.clone(),
                reason,
                diagnostics,
            });
            match outcome {
                Ok(segment) => segments[*owner].push(segment),
                Err(error) => failures.push(error),
            }
        }

        if !failures.is_empty() {
            // session directories are left in place for inspection
            return Err(PipelineError::SessionsFailed { failures, report });
        }

        let mut output = Vec::with_capacity(variants.len());
        for ((variant, _), segments) in variants.into_iter().zip(&segments) {
            let spectra = if request.profiles.is_empty() {
                vec![self.engine.stitch(segments)?]
            } else {
                self.engine.convolve_many(segments, &request.profiles)?
            };
            output.push(VariantSpectra { variant, spectra });
        }
        self.cleanup(&sessions);

        Ok(SynthesisOutput {
            variants: output,
            report,
        })
    }

    /// Runs the zinf search on a dedicated session for the first chunk.
    pub fn tune_first_chunk(
        &self,
        ids: &IdMaker,
        chunks: &[LineList],
        inputs: &SessionInputs,
        cancel: &CancellationToken,
    ) -> Result<TuneOutcome, PipelineError> {
        let Some(first) = chunks.first() else {
            return Err(LineListError::EmptyResult {
                operation: "partition",
            }
            .into());
        };
        let sessions = prepare_sessions(ids, std::slice::from_ref(first), inputs)?;
        let mut probe = KernelProbe::new(
            self.scheduler.kernel(),
            sessions[0].clone(),
            &self.config.tuner,
        )
        .with_cancellation(cancel.clone());
        let outcome = tune(self.config.tuner.clone(), &mut probe);
        self.cleanup(&sessions);
        Ok(outcome?)
    }

    fn cleanup(&self, sessions: &[SessionConfig]) {
        if self.config.scheduler.keep_sessions {
            return;
        }
        let failed = sessions.iter().filter(|session| !session.cleanup()).count();
        if failed > 0 {
            warn!(failed, "some session directories could not be removed");
        }
    }
}
