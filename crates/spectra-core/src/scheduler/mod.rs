//! Bounded parallel dispatch of synthesis sessions.

use crate::common::config::SchedulerConfig;
use crate::domain::{FluxSegment, SynthError};
use crate::session::{SessionConfig, SessionError, SessionFailure, SynthesisKernel};
use rayon::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{info, warn};

pub type SessionOutcome = Result<FluxSegment, SessionError>;

/// Shared stop flag. Workers check it before starting a session and the
/// external kernel polls it while a subprocess is running.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("batch cancelled; {discarded} completed segment(s) of {total} sessions discarded")]
pub struct BatchCancelled {
    pub discarded: usize,
    pub total: usize,
}

impl From<BatchCancelled> for SynthError {
    fn from(error: BatchCancelled) -> Self {
        SynthError::computation("RUN.CANCELLED", error.to_string())
    }
}

pub struct RunScheduler<K> {
    kernel: K,
    workers: usize,
}

impl<K: SynthesisKernel> RunScheduler<K> {
    pub fn new(kernel: K, config: &SchedulerConfig) -> Self {
        Self::with_workers(kernel, config.effective_workers())
    }

    pub fn with_workers(kernel: K, workers: usize) -> Self {
        Self {
            kernel,
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// One result per session, in input order. No session is retried.
    pub fn run(&self, sessions: &[SessionConfig]) -> Vec<SessionOutcome> {
        self.dispatch(sessions, &CancellationToken::new())
    }

    /// Like [`RunScheduler::run`], but once `cancel` fires no new session is
    /// started, running kernels are killed and every result is discarded.
    pub fn run_cancellable(
        &self,
        sessions: &[SessionConfig],
        cancel: &CancellationToken,
    ) -> Result<Vec<SessionOutcome>, BatchCancelled> {
        let outcomes = self.dispatch(sessions, cancel);
        if cancel.is_cancelled() {
            let error = BatchCancelled {
                discarded: outcomes.iter().filter(|outcome| outcome.is_ok()).count(),
                total: sessions.len(),
            };
            warn!(%error, "batch cancelled");
            return Err(error);
        }
        Ok(outcomes)
    }

    fn dispatch(
        &self,
        sessions: &[SessionConfig],
        cancel: &CancellationToken,
    ) -> Vec<SessionOutcome> {
        let started = Instant::now();
        info!(
            sessions = sessions.len(),
            workers = self.workers,
            "starting synthesis batch"
        );

        let outcomes: Vec<SessionOutcome> = match rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|index| format!("spectra-worker-{}", index))
            .build()
        {
            Ok(pool) => pool.install(|| {
                sessions
                    .par_iter()
                    .map(|session| self.run_one(session, cancel))
                    .collect()
            }),
            Err(error) => {
                warn!(%error, "worker pool unavailable, running sessions serially");
                sessions
                    .iter()
                    .map(|session| self.run_one(session, cancel))
                    .collect()
            }
        };

        let failed = outcomes.iter().filter(|outcome| outcome.is_err()).count();
        info!(
            sessions = sessions.len(),
            failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "synthesis batch finished"
        );
        outcomes
    }

    fn run_one(&self, session: &SessionConfig, cancel: &CancellationToken) -> SessionOutcome {
        if cancel.is_cancelled() {
            return Err(session.failure(SessionFailure::Cancelled));
        }
        let outcome = self.kernel.synthesize(session, cancel);
        match &outcome {
            Err(error) if !error.is_cancelled() => warn!(
                session = error.index,
                interval = %error.interval,
                reason = %error.kind,
                "session failed"
            ),
            _ => {}
        }
        outcome
    }
}
