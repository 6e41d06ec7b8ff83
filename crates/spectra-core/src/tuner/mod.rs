//! Search for the smallest zinf that keeps interval-edge flux stable.
//!
//! [`ZinfTuner`] is a pure state machine (`Initial -> Trial -> Converged |
//! Failed`) fed with residuals; [`tune`] drives it with a [`ResidualProbe`],
//! and [`KernelProbe`] measures residuals by running a synthesis kernel.

use crate::common::config::TunerConfig;
use crate::domain::{FluxSegment, SynthError};
use crate::scheduler::CancellationToken;
use crate::session::{SessionConfig, SessionError, SynthesisKernel};
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TuneAttempt {
    pub zinf: f64,
    pub residual: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TuneOutcome {
    pub zinf: f64,
    pub trace: Vec<TuneAttempt>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TuneError {
    #[error(
        "zinf did not converge after {attempts} attempt(s); last residual {last_residual}"
    )]
    ConvergenceFailure {
        attempts: usize,
        last_residual: f64,
        trace: Vec<TuneAttempt>,
    },
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl From<TuneError> for SynthError {
    fn from(error: TuneError) -> Self {
        match error {
            TuneError::ConvergenceFailure { .. } => {
                SynthError::computation("RUN.ZINF_CONVERGENCE", error.to_string())
            }
            TuneError::Session(inner) => inner.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TunerState {
    Initial,
    Trial { zinf: f64, attempt: usize },
    Converged { zinf: f64 },
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ZinfTuner {
    config: TunerConfig,
    state: TunerState,
    step: f64,
    trace: Vec<TuneAttempt>,
}

impl ZinfTuner {
    pub fn new(config: TunerConfig) -> Self {
        let step = config.step;
        Self {
            config,
            state: TunerState::Initial,
            step,
            trace: Vec::new(),
        }
    }

    pub fn state(&self) -> TunerState {
        self.state
    }

    pub fn trace(&self) -> &[TuneAttempt] {
        &self.trace
    }

    /// `Initial -> Trial`; returns the first zinf to try. Later calls return
    /// the zinf of the current trial unchanged.
    pub fn begin(&mut self) -> f64 {
        match self.state {
            TunerState::Initial => {
                self.state = TunerState::Trial {
                    zinf: self.config.start,
                    attempt: 1,
                };
                self.config.start
            }
            TunerState::Trial { zinf, .. } | TunerState::Converged { zinf } => zinf,
            TunerState::Failed => self.trace.last().map_or(self.config.start, |a| a.zinf),
        }
    }

    /// Records the residual of the running trial. Outside `Trial` this is a
    /// no-op returning the current state.
    pub fn observe(&mut self, residual: f64) -> TunerState {
        let TunerState::Trial { zinf, attempt } = self.state else {
            return self.state;
        };
        self.trace.push(TuneAttempt { zinf, residual });

        // NaN never converges
        self.state = if residual <= self.config.tolerance {
            TunerState::Converged { zinf }
        } else if attempt < self.config.max_attempts {
            let next = zinf + self.step;
            self.step *= self.config.growth;
            TunerState::Trial {
                zinf: next,
                attempt: attempt + 1,
            }
        } else {
            TunerState::Failed
        };
        self.state
    }
}

/// Measures the edge residual of one trial zinf.
pub trait ResidualProbe {
    fn residual(&mut self, zinf: f64) -> Result<f64, SessionError>;
}

impl<F> ResidualProbe for F
where
    F: FnMut(f64) -> Result<f64, SessionError>,
{
    fn residual(&mut self, zinf: f64) -> Result<f64, SessionError> {
        self(zinf)
    }
}

/// Runs the tuner to completion. Exhausted attempts are reported as
/// [`TuneError::ConvergenceFailure`], never replaced by a default.
pub fn tune<P: ResidualProbe + ?Sized>(
    config: TunerConfig,
    probe: &mut P,
) -> Result<TuneOutcome, TuneError> {
    let mut tuner = ZinfTuner::new(config);
    let mut zinf = tuner.begin();
    loop {
        let residual = probe.residual(zinf)?;
        debug!(zinf, residual, "zinf trial");
        match tuner.observe(residual) {
            TunerState::Initial | TunerState::Trial { .. } => zinf = tuner.begin(),
            TunerState::Converged { zinf } => {
                info!(zinf, attempts = tuner.trace.len(), "zinf converged");
                return Ok(TuneOutcome {
                    zinf,
                    trace: tuner.trace,
                });
            }
            TunerState::Failed => {
                warn!(attempts = tuner.trace.len(), residual, "zinf did not converge");
                return Err(TuneError::ConvergenceFailure {
                    attempts: tuner.trace.len(),
                    last_residual: residual,
                    trace: tuner.trace,
                });
            }
        }
    }
}

/// Compares each trial against a reference run at a large zinf, looking only
/// at samples within `edge_band` of either end of the segment.
pub struct KernelProbe<'a, K: ?Sized> {
    kernel: &'a K,
    session: SessionConfig,
    edge_band: f64,
    reference_zinf: f64,
    reference: Option<FluxSegment>,
    cancel: CancellationToken,
}

impl<'a, K: SynthesisKernel + ?Sized> KernelProbe<'a, K> {
    pub fn new(kernel: &'a K, session: SessionConfig, config: &TunerConfig) -> Self {
        Self {
            kernel,
            session,
            edge_band: config.edge_band,
            reference_zinf: config.reference_zinf,
            reference: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn reference(&mut self) -> Result<&FluxSegment, SessionError> {
        let reference = match self.reference.take() {
            Some(reference) => reference,
            None => {
                let session = self.session.with_zinf(self.reference_zinf);
                self.kernel.synthesize(&session, &self.cancel)?
            }
        };
        Ok(self.reference.insert(reference))
    }
}

impl<K: SynthesisKernel + ?Sized> ResidualProbe for KernelProbe<'_, K> {
    fn residual(&mut self, zinf: f64) -> Result<f64, SessionError> {
        let trial = self
            .kernel
            .synthesize(&self.session.with_zinf(zinf), &self.cancel)?;
        let band = self.edge_band;
        let reference = self.reference()?;
        Ok(edge_residual(&trial, reference, band))
    }
}

/// Largest absolute difference over samples of `trial` within `band` of
/// either end; the reference is linearly interpolated and clamped.
pub fn edge_residual(trial: &FluxSegment, reference: &FluxSegment, band: f64) -> f64 {
    let (start, end) = (trial.start(), trial.end());
    trial
        .wavelength()
        .iter()
        .zip(trial.flux())
        .filter(|(x, _)| **x <= start + band || **x >= end - band)
        .map(|(x, y)| (y - interpolate_clamped(reference, *x)).abs())
        .fold(0.0, f64::max)
}

fn interpolate_clamped(segment: &FluxSegment, wavelength: f64) -> f64 {
    let grid = segment.wavelength();
    let values = segment.flux();
    let last = grid.len() - 1;
    if wavelength <= grid[0] {
        return values[0];
    }
    if wavelength >= grid[last] {
        return values[last];
    }
    match grid.binary_search_by(|probe| probe.total_cmp(&wavelength)) {
        Ok(index) => values[index],
        Err(upper) => {
            let lower = upper - 1;
            let fraction = (wavelength - grid[lower]) / (grid[upper] - grid[lower]);
            values[lower] + (values[upper] - values[lower]) * fraction
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{KernelProbe, TuneError, TunerState, ZinfTuner, edge_residual, tune};
    use crate::common::config::TunerConfig;
    use crate::domain::{FluxSegment, WavelengthInterval};
    use crate::scheduler::CancellationToken;
    use crate::session::{SessionConfig, SessionError, SessionFailure};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(max_attempts: usize) -> TunerConfig {
        TunerConfig {
            max_attempts,
            ..TunerConfig::default()
        }
    }

    #[test]
    fn state_machine_walks_through_trials() {
        let mut tuner = ZinfTuner::new(TunerConfig {
            growth: 2.0,
            ..config(4)
        });
        assert_eq!(tuner.state(), TunerState::Initial);
        assert_eq!(tuner.begin(), 0.5);
        assert_eq!(
            tuner.observe(1.0),
            TunerState::Trial {
                zinf: 1.0,
                attempt: 2
            }
        );
        assert_eq!(
            tuner.observe(1.0),
            TunerState::Trial {
                zinf: 2.0,
                attempt: 3
            }
        );
        assert_eq!(tuner.observe(1e-4), TunerState::Converged { zinf: 2.0 });
        assert_eq!(tuner.observe(5.0), TunerState::Converged { zinf: 2.0 });
        assert_eq!(tuner.trace().len(), 3);
    }

    #[test]
    fn decreasing_residual_converges_within_bounded_attempts() {
        let mut calls = 0;
        let mut probe = |zinf: f64| -> Result<f64, SessionError> {
            calls += 1;
            Ok(0.1 / zinf.powi(3))
        };
        let outcome = tune(config(12), &mut probe).expect("tuner should converge");
        // 0.1 / z^3 <= 1e-3 first holds at the tenth trial, z = 5.0
        assert_eq!(outcome.zinf, 5.0);
        assert_eq!(outcome.trace.len(), 10);
        assert_eq!(calls, outcome.trace.len());
        assert!(
            outcome
                .trace
                .windows(2)
                .all(|pair| pair[1].residual < pair[0].residual)
        );
    }

    #[test]
    fn persistent_residual_reports_convergence_failure() {
        let mut probe = |_: f64| -> Result<f64, SessionError> { Ok(0.5) };
        let error = tune(config(4), &mut probe).expect_err("must not converge");
        match error {
            TuneError::ConvergenceFailure {
                attempts,
                last_residual,
                trace,
            } => {
                assert_eq!(attempts, 4);
                assert_eq!(last_residual, 0.5);
                assert_eq!(
                    trace.iter().map(|a| a.zinf).collect::<Vec<_>>(),
                    [0.5, 1.0, 1.5, 2.0]
                );
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn nan_residual_never_converges() {
        let mut probe = |_: f64| -> Result<f64, SessionError> { Ok(f64::NAN) };
        assert!(matches!(
            tune(config(2), &mut probe),
            Err(TuneError::ConvergenceFailure { attempts: 2, .. })
        ));
    }

    fn session() -> SessionConfig {
        SessionConfig {
            index: 0,
            work_dir: "unused".into(),
            interval: WavelengthInterval::new(5000.0, 5010.0).expect("interval"),
            zinf: 0.5,
            step: 0.5,
            fwhm: 0.0,
            abundance_offsets: BTreeMap::new(),
            has_dissociation: false,
        }
    }

    #[test]
    fn kernel_probe_compares_edges_against_reference_run() {
        let runs = AtomicUsize::new(0);
        // edge flux is depressed by exp(-zinf); the middle is unaffected
        let kernel = |session: &SessionConfig,
                      _: &CancellationToken|
         -> Result<FluxSegment, SessionError> {
            runs.fetch_add(1, Ordering::SeqCst);
            let wavelength: Vec<f64> = (0..=20).map(|i| 5000.0 + 0.5 * i as f64).collect();
            let flux = wavelength
                .iter()
                .map(|x| {
                    if *x < 5001.0 || *x > 5009.0 {
                        1.0 - (-session.zinf).exp()
                    } else {
                        1.0
                    }
                })
                .collect();
            Ok(FluxSegment::new(wavelength, flux).expect("segment"))
        };

        let tuner_config = TunerConfig {
            max_attempts: 20,
            ..TunerConfig::default()
        };
        let mut probe = KernelProbe::new(&kernel, session(), &tuner_config);
        let outcome = tune(tuner_config, &mut probe).expect("tuner should converge");
        // exp(-6.5) > 1e-3 >= exp(-7.0)
        assert_eq!(outcome.zinf, 7.0);
        assert_eq!(outcome.trace.len(), 14);
        assert_eq!(runs.load(Ordering::SeqCst), 15);
    }

    #[test]
    fn kernel_failures_abort_tuning() {
        let kernel = |session: &SessionConfig,
                      _: &CancellationToken|
         -> Result<FluxSegment, SessionError> {
            Err(session.failure(SessionFailure::Timeout { seconds: 1.0 }))
        };
        let tuner_config = TunerConfig::default();
        let mut probe = KernelProbe::new(&kernel, session(), &tuner_config);
        assert!(matches!(
            tune(tuner_config, &mut probe),
            Err(TuneError::Session(_))
        ));
    }

    #[test]
    fn edge_residual_ignores_the_interior() {
        let trial =
            FluxSegment::new(vec![0.0, 1.0, 2.0, 3.0, 4.0], vec![0.9, 1.0, 0.0, 1.0, 0.8])
                .expect("trial");
        let reference =
            FluxSegment::new(vec![0.0, 4.0], vec![1.0, 1.0]).expect("reference");
        assert!((edge_residual(&trial, &reference, 1.0) - 0.2).abs() < 1e-12);
    }
}
