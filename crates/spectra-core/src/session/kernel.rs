use super::{
    COMMANDS_LOG, KERNEL_LOG, MAIN_CONFIG_FILE, SessionConfig, SessionError, SessionFailure,
};
use crate::common::config::SchedulerConfig;
use crate::domain::FluxSegment;
use crate::scheduler::CancellationToken;
use crate::spectrum::read_segment;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Produces the flux of one prepared session.
pub trait SynthesisKernel: Send + Sync {
    fn synthesize(
        &self,
        session: &SessionConfig,
        cancel: &CancellationToken,
    ) -> Result<FluxSegment, SessionError>;
}

impl<F> SynthesisKernel for F
where
    F: Fn(&SessionConfig, &CancellationToken) -> Result<FluxSegment, SessionError> + Send + Sync,
{
    fn synthesize(
        &self,
        session: &SessionConfig,
        cancel: &CancellationToken,
    ) -> Result<FluxSegment, SessionError> {
        self(session, cancel)
    }
}

/// Runs the native kernel as `<program> [args...] --fn_main main.cfg` inside
/// the session directory.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalKernel {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    poll_interval: Duration,
    diagnostic_lines: usize,
}

enum Completion {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

impl ExternalKernel {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self::from_config(&SchedulerConfig {
            kernel: program.into(),
            ..SchedulerConfig::default()
        })
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        let program = config.kernel.clone();
        // relative paths with a directory part would otherwise resolve against the session dir
        let program = if program.is_relative() && program.components().count() > 1 {
            std::path::absolute(&program).unwrap_or(program)
        } else {
            program
        };
        Self {
            program,
            args: config.kernel_args.clone(),
            timeout: config.timeout(),
            poll_interval: config.poll_interval(),
            diagnostic_lines: config.diagnostic_lines,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_args<S: Into<String>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .chain(["--fn_main".to_string(), MAIN_CONFIG_FILE.to_string()])
            .map(|part| {
                if part.contains(char::is_whitespace) {
                    format!("\"{}\"", part)
                } else {
                    part
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn diagnostics(&self, session: &SessionConfig) -> Vec<String> {
        let Ok(log) = fs::read_to_string(session.work_dir.join(KERNEL_LOG)) else {
            return Vec::new();
        };
        let lines: Vec<&str> = log.lines().collect();
        let start = lines.len().saturating_sub(self.diagnostic_lines);
        lines[start..].iter().map(|line| line.to_string()).collect()
    }

    fn spawn(&self, session: &SessionConfig) -> Result<Child, SessionError> {
        let io_failure =
            |error: std::io::Error| session.failure(SessionFailure::Io(error.to_string()));

        // output left by an earlier run in the same directory must never be read back
        match fs::remove_file(session.spectrum_path()) {
            Ok(()) => {}
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => return Err(io_failure(error)),
        }
        session.write_main_config().map_err(io_failure)?;
        let command_line = self.command_line();
        let mut commands = OpenOptions::new()
            .create(true)
            .append(true)
            .open(session.work_dir.join(COMMANDS_LOG))
            .map_err(io_failure)?;
        writeln!(commands, "{}", command_line).map_err(io_failure)?;

        let log = File::create(session.work_dir.join(KERNEL_LOG)).map_err(io_failure)?;
        let log_err = log.try_clone().map_err(io_failure)?;

        debug!(session = session.index, command = %command_line, "launching kernel");
        Command::new(&self.program)
            .args(&self.args)
            .arg("--fn_main")
            .arg(MAIN_CONFIG_FILE)
            .current_dir(&session.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|error| {
                session.failure(SessionFailure::Spawn(format!(
                    "{}: {}",
                    self.program.display(),
                    error
                )))
            })
    }

    fn wait(
        &self,
        child: &mut Child,
        cancel: &CancellationToken,
    ) -> std::io::Result<Completion> {
        let started = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(Completion::Exited(status));
            }
            let outcome = if cancel.is_cancelled() {
                Some(Completion::Cancelled)
            } else if started.elapsed() >= self.timeout {
                Some(Completion::TimedOut)
            } else {
                None
            };
            if let Some(outcome) = outcome {
                // the child may have exited between try_wait and kill
                let _ = child.kill();
                child.wait()?;
                return Ok(outcome);
            }
            std::thread::sleep(self.poll_interval);
        }
    }
}

impl SynthesisKernel for ExternalKernel {
    fn synthesize(
        &self,
        session: &SessionConfig,
        cancel: &CancellationToken,
    ) -> Result<FluxSegment, SessionError> {
        if cancel.is_cancelled() {
            return Err(session.failure(SessionFailure::Cancelled));
        }
        let mut child = self.spawn(session)?;
        let completion = self
            .wait(&mut child, cancel)
            .map_err(|error| session.failure(SessionFailure::Io(error.to_string())))?;

        let failure = match completion {
            Completion::Exited(status) if status.success() => {
                return read_segment(&session.spectrum_path()).map_err(|error| {
                    session
                        .failure(SessionFailure::MalformedOutput(error.to_string()))
                        .with_diagnostics(self.diagnostics(session))
                });
            }
            Completion::Exited(status) => SessionFailure::NonZeroExit {
                status: status.to_string(),
            },
            Completion::TimedOut => {
                warn!(
                    session = session.index,
                    timeout_secs = self.timeout.as_secs_f64(),
                    "kernel timed out and was killed"
                );
                SessionFailure::Timeout {
                    seconds: self.timeout.as_secs_f64(),
                }
            }
            Completion::Cancelled => SessionFailure::Cancelled,
        };
        Err(session
            .failure(failure)
            .with_diagnostics(self.diagnostics(session)))
    }
}

#[cfg(test)]
mod tests {
    use super::ExternalKernel;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn command_line_appends_main_config_flag() {
        let kernel = ExternalKernel::new("pfant").with_args(["--no_h", "T", "two words"]);
        assert_eq!(
            kernel.command_line(),
            "pfant --no_h T \"two words\" --fn_main main.cfg"
        );
    }

    #[test]
    fn bare_program_names_stay_on_path_lookup() {
        let kernel = ExternalKernel::new("pfant").with_timeout(Duration::from_secs(1));
        assert_eq!(kernel.program, PathBuf::from("pfant"));

        let nested = ExternalKernel::new("bin/pfant");
        assert!(nested.program.is_absolute());
    }
}
