#![cfg(unix)]

use spectra_core::common::TunerConfig;
use spectra_core::domain::WavelengthInterval;
use spectra_core::scheduler::{CancellationToken, RunScheduler};
use spectra_core::session::{
    COMMANDS_LOG, ExternalKernel, KERNEL_LOG, SessionConfig, SessionFailure, SynthesisKernel,
};
use spectra_core::tuner::{KernelProbe, TuneError, tune};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;

const WELL_BEHAVED: &str = r#"
llzero=$(sed -n 's/^llzero = //p' "$2")
llfin=$(sed -n 's/^llfin = //p' "$2")
printf '# lambda flux\n%s 0.98\n%s 0.97\n' "$llzero" "$llfin" > spectrum.dat
echo "synthesized $llzero $llfin"
"#;

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).expect("script should be written");
    path
}

/// Scripts are run through `/bin/sh` so they never need the exec bit.
fn shell_kernel(script: &Path) -> ExternalKernel {
    ExternalKernel::new("/bin/sh").with_args([script.display().to_string()])
}

fn session(root: &Path, index: usize, llzero: f64, llfin: f64) -> SessionConfig {
    let work_dir = root.join(format!("session-{index}"));
    fs::create_dir_all(&work_dir).expect("session dir should be created");
    SessionConfig {
        index,
        work_dir,
        interval: WavelengthInterval::new(llzero, llfin).expect("interval"),
        zinf: 0.5,
        step: 0.02,
        fwhm: 0.0,
        abundance_offsets: BTreeMap::new(),
        has_dissociation: false,
    }
}

#[test]
fn successful_kernel_output_becomes_a_segment() {
    let temp = TempDir::new().expect("tempdir should be created");
    let script = write_script(temp.path(), "kernel.sh", WELL_BEHAVED);
    let session = session(temp.path(), 0, 5000.0, 5100.0);

    let segment = shell_kernel(&script)
        .synthesize(&session, &CancellationToken::new())
        .expect("kernel should succeed");
    assert_eq!(segment.wavelength(), [5000.0, 5100.0]);
    assert_eq!(segment.flux(), [0.98, 0.97]);

    let commands = fs::read_to_string(session.work_dir.join(COMMANDS_LOG)).expect("commands.log");
    assert!(commands.trim_end().ends_with("--fn_main main.cfg"), "{commands}");
    let log = fs::read_to_string(session.work_dir.join(KERNEL_LOG)).expect("kernel.log");
    assert!(log.contains("synthesized 5000 5100"), "{log}");
}

#[test]
fn non_zero_exit_carries_log_tail() {
    let temp = TempDir::new().expect("tempdir should be created");
    let script = write_script(
        temp.path(),
        "kernel.sh",
        "echo 'reading atmosphere'\necho 'opacity table missing' >&2\nexit 3\n",
    );
    let session = session(temp.path(), 4, 5000.0, 5100.0);

    let error = shell_kernel(&script)
        .synthesize(&session, &CancellationToken::new())
        .expect_err("kernel must fail");
    assert_eq!(error.index, 4);
    assert!(matches!(error.kind, SessionFailure::NonZeroExit { .. }), "{error}");
    assert!(
        error
            .diagnostics
            .iter()
            .any(|line| line.contains("opacity table missing")),
        "{:?}",
        error.diagnostics
    );
}

#[test]
fn malformed_spectrum_fails_the_session() {
    let temp = TempDir::new().expect("tempdir should be created");
    let script = write_script(temp.path(), "kernel.sh", "echo '5000 abc' > spectrum.dat\n");
    let session = session(temp.path(), 0, 5000.0, 5100.0);

    let error = shell_kernel(&script)
        .synthesize(&session, &CancellationToken::new())
        .expect_err("malformed output must fail");
    assert!(matches!(error.kind, SessionFailure::MalformedOutput(_)), "{error}");

    let script = write_script(temp.path(), "silent.sh", "exit 0\n");
    let quiet_session = self::session(temp.path(), 1, 5000.0, 5100.0);
    let error = shell_kernel(&script)
        .synthesize(&quiet_session, &CancellationToken::new())
        .expect_err("missing output must fail");
    assert!(matches!(error.kind, SessionFailure::MalformedOutput(_)), "{error}");
}

#[test]
fn tuning_never_reads_back_an_earlier_trial() {
    let temp = TempDir::new().expect("tempdir should be created");
    let script = write_script(
        temp.path(),
        "kernel.sh",
        r#"
zinf=$(sed -n 's/^zinf = //p' "$2")
llzero=$(sed -n 's/^llzero = //p' "$2")
llfin=$(sed -n 's/^llfin = //p' "$2")
case "$zinf" in
    0.5) level=0.5 ;;
    50) level=1.0 ;;
    *) exit 0 ;;
esac
printf '%s %s\n%s %s\n' "$llzero" "$level" "$llfin" "$level" > spectrum.dat
"#,
    );
    let kernel = shell_kernel(&script);
    let config = TunerConfig::default();
    let mut trials = KernelProbe::new(&kernel, session(temp.path(), 0, 5000.0, 5100.0), &config);

    match tune(config.clone(), &mut trials) {
        Err(TuneError::Session(error)) => {
            assert!(matches!(error.kind, SessionFailure::MalformedOutput(_)), "{error}");
        }
        other => panic!("second trial wrote nothing and must fail, got {other:?}"),
    }
}

#[test]
fn slow_kernels_are_killed_at_the_timeout() {
    let temp = TempDir::new().expect("tempdir should be created");
    let script = write_script(temp.path(), "kernel.sh", "sleep 10\n");
    let session = session(temp.path(), 0, 5000.0, 5100.0);

    let started = Instant::now();
    let error = shell_kernel(&script)
        .with_timeout(Duration::from_millis(200))
        .synthesize(&session, &CancellationToken::new())
        .expect_err("kernel must time out");
    assert!(matches!(error.kind, SessionFailure::Timeout { .. }), "{error}");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn cancellation_terminates_running_kernels() {
    let temp = TempDir::new().expect("tempdir should be created");
    let script = write_script(temp.path(), "kernel.sh", "sleep 10\n");
    let session = session(temp.path(), 0, 5000.0, 5100.0);
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        trigger.cancel();
    });
    let started = Instant::now();
    let error = shell_kernel(&script)
        .synthesize(&session, &cancel)
        .expect_err("kernel must be cancelled");
    canceller.join().expect("canceller thread");

    assert!(error.is_cancelled(), "{error}");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn missing_program_is_a_spawn_failure() {
    let temp = TempDir::new().expect("tempdir should be created");
    let session = session(temp.path(), 0, 5000.0, 5100.0);
    let error = ExternalKernel::new(temp.path().join("no-such-kernel"))
        .synthesize(&session, &CancellationToken::new())
        .expect_err("spawn must fail");
    assert!(matches!(error.kind, SessionFailure::Spawn(_)), "{error}");
}

#[test]
fn scheduler_isolates_real_subprocess_failures() {
    let temp = TempDir::new().expect("tempdir should be created");
    let script = write_script(
        temp.path(),
        "kernel.sh",
        &format!(
            "if grep -q '^llzero = 5100' \"$2\"; then exit 7; fi\n{}",
            WELL_BEHAVED
        ),
    );
    let sessions: Vec<SessionConfig> = (0..4)
        .map(|index| {
            let llzero = 5000.0 + 50.0 * index as f64;
            session(temp.path(), index, llzero, llzero + 50.0)
        })
        .collect();

    let outcomes = RunScheduler::with_workers(shell_kernel(&script), 2).run(&sessions);
    assert_eq!(outcomes.len(), 4);
    assert!(outcomes[0].is_ok());
    assert!(outcomes[1].is_ok());
    assert!(outcomes[3].is_ok());
    let failure = outcomes[2].as_ref().expect_err("session 2 must fail");
    assert_eq!(
        failure.to_string(),
        "session 2 [5100, 5150]: kernel exited with exit status: 7"
    );
    assert_eq!(
        outcomes[3].as_ref().expect("session 3").wavelength(),
        [5150.0, 5200.0]
    );
}
