use serde_json::{Value, json};
use spectra_core::lines::codec::read_line_list;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

/// Each session writes llzero, midpoint and llfin; the edge samples dip by `0.01 / zinf`.
const SHELL_KERNEL: &str = r#"
llzero=$(sed -n 's/^llzero = //p' "$2")
llfin=$(sed -n 's/^llfin = //p' "$2")
zinf=$(sed -n 's/^zinf = //p' "$2")
awk -v a="$llzero" -v b="$llfin" -v z="$zinf" 'BEGIN {
  d = 0.01 / z
  printf "%s %.12f\n%s 1.0\n%s %.12f\n", a, 1 - d, (a + b) / 2, b, 1 - d
}' > spectrum.dat
"#;

fn atomic_record(species: &str, wavelength: f64, log_gf: f64) -> String {
    format!(
        "{:<6}{:>12.4}{:>10.4}{:>10.4}{:>8.3}\n",
        species, wavelength, 1.0, 3.5, log_gf
    )
}

fn atomic_list(llzero: f64, llfin: f64, records: &[(&str, f64, f64)]) -> String {
    let mut content = format!("#ATOMIC angstrom {} {}\n", llzero, llfin);
    for (species, wavelength, log_gf) in records {
        content.push_str(&atomic_record(species, *wavelength, *log_gf));
    }
    content
}

fn write_file(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("parent directory should be created");
    }
    fs::write(path, content).expect("file should be written");
}

fn spectra(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_spectra"))
        .args(args)
        .env_remove("SPECTRA_KERNEL")
        .env_remove("SPECTRA_WORK_ROOT")
        .env_remove("SPECTRA_LOG")
        .output()
        .expect("spectra should run")
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

struct RunFixture {
    temp: TempDir,
    config: PathBuf,
    lines: PathBuf,
    atmosphere: PathBuf,
    abundances: PathBuf,
}

impl RunFixture {
    fn new(kernel_body: &str) -> Self {
        let temp = TempDir::new().expect("tempdir should be created");
        let root = temp.path();
        let script = root.join("kernel.sh");
        write_file(&script, kernel_body);

        let config = root.join("config.json");
        let settings = json!({
            "partition": { "chunkWidth": 100.0 },
            "scheduler": {
                "workers": 2,
                "kernel": "/bin/sh",
                "kernelArgs": [path_arg(&script)],
                "sessionRoot": path_arg(&root.join("sessions")),
            },
            "tuner": { "maxAttempts": 20 },
        });
        write_file(&config, &settings.to_string());

        let lines = root.join("lines.dat");
        write_file(
            &lines,
            &atomic_list(
                5000.0,
                5200.0,
                &[("Fe1", 5012.5, -1.2), ("Ca1", 5101.0, -0.3), ("Fe1", 5188.0, -2.0)],
            ),
        );
        let atmosphere = root.join("sun.mod");
        write_file(&atmosphere, "teff 5777 logg 4.44\n");
        let abundances = root.join("abonds.dat");
        write_file(&abundances, "Fe 7.50\nCa 6.34\n");

        Self {
            temp,
            config,
            lines,
            atmosphere,
            abundances,
        }
    }

    fn root(&self) -> &Path {
        self.temp.path()
    }

    fn input_args(&self) -> Vec<String> {
        vec![
            "--config".to_string(),
            path_arg(&self.config),
            "--lines".to_string(),
            path_arg(&self.lines),
            "--atmosphere".to_string(),
            path_arg(&self.atmosphere),
            "--abundances".to_string(),
            path_arg(&self.abundances),
        ]
    }

    fn session_dirs(&self) -> usize {
        fs::read_dir(self.root().join("sessions"))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

#[test]
fn partition_writes_one_file_per_chunk() {
    let temp = TempDir::new().expect("tempdir should be created");
    let lines = temp.path().join("lines.dat");
    write_file(
        &lines,
        &atomic_list(
            5000.0,
            5250.0,
            &[("Fe1", 5010.0, -1.0), ("Ca1", 5150.0, -0.5), ("Fe1", 5240.0, -2.0)],
        ),
    );
    let out_dir = temp.path().join("chunks");

    let output = spectra(&[
        "partition",
        "--lines",
        &path_arg(&lines),
        "--width",
        "100",
        "--output-dir",
        &path_arg(&out_dir),
    ]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));

    let printed = stdout(&output);
    assert!(printed.contains("[5000, 5100]"), "{printed}");
    assert!(printed.contains("[5100, 5200]"), "{printed}");
    assert!(printed.contains("[5200, 5250]"), "{printed}");

    let last = read_line_list(&out_dir.join("chunk-002.dat")).expect("last chunk");
    assert_eq!(last.len(), 1);
    assert_eq!(last.interval().llfin(), 5250.0);
    assert!(!out_dir.join("chunk-003.dat").exists());
}

#[test]
fn merge_filter_and_cut_compose() {
    let temp = TempDir::new().expect("tempdir should be created");
    let first = temp.path().join("first.dat");
    let second = temp.path().join("second.dat");
    write_file(
        &first,
        &atomic_list(5000.0, 5100.0, &[("Fe1", 5010.0, -1.0), ("Ca1", 5050.0, -0.5)]),
    );
    write_file(
        &second,
        &atomic_list(5000.0, 5200.0, &[("Fe1", 5010.0, 0.5), ("Ti1", 5150.0, -0.8)]),
    );
    let merged = temp.path().join("out/merged.dat");
    let filtered = temp.path().join("out/filtered.dat");
    let cut = temp.path().join("out/cut.dat");

    let output = spectra(&[
        "merge",
        "--lines",
        &path_arg(&first),
        &path_arg(&second),
        "--policy",
        "keep-strongest",
        "--output",
        &path_arg(&merged),
    ]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let list = read_line_list(&merged).expect("merged list");
    assert_eq!(list.len(), 3);
    assert_eq!(list.interval().llzero(), 5000.0);
    assert_eq!(list.interval().llfin(), 5200.0);
    assert_eq!(list.records()[0].log_gf, 0.5);

    let output = spectra(&[
        "filter",
        "--lines",
        &path_arg(&merged),
        "--exclude",
        "Ca1,Ti1",
        "--output",
        &path_arg(&filtered),
    ]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let list = read_line_list(&filtered).expect("filtered list");
    assert_eq!(list.species().into_iter().collect::<Vec<_>>(), ["Fe1"]);

    let output = spectra(&[
        "cut",
        "--lines",
        &path_arg(&merged),
        "--llzero",
        "5040",
        "--llfin",
        "5500",
        "--output",
        &path_arg(&cut),
    ]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let list = read_line_list(&cut).expect("cut list");
    assert_eq!(list.len(), 2);
    assert_eq!(list.interval().llzero(), 5040.0);
    assert_eq!(list.interval().llfin(), 5200.0);
}

#[test]
fn usage_errors_exit_with_input_code() {
    let output = spectra(&["cut", "--llzero", "5000"]);
    assert_eq!(output.status.code(), Some(2));
    let message = stderr(&output);
    assert!(message.contains("ERROR: [INPUT.CLI_USAGE]"), "{message}");
    assert!(message.contains("FATAL EXIT CODE: 2"), "{message}");
}

#[test]
fn out_of_range_cut_is_an_input_error() {
    let temp = TempDir::new().expect("tempdir should be created");
    let lines = temp.path().join("lines.dat");
    write_file(&lines, &atomic_list(5000.0, 5100.0, &[("Fe1", 5010.0, -1.0)]));

    let output = spectra(&[
        "cut",
        "--lines",
        &path_arg(&lines),
        "--llzero",
        "6000",
        "--llfin",
        "6100",
        "--output",
        &path_arg(&temp.path().join("cut.dat")),
    ]);
    assert_eq!(output.status.code(), Some(2));
    assert!(
        stderr(&output).contains("[INPUT.LINELIST_RANGE]"),
        "{}",
        stderr(&output)
    );
}

#[test]
fn missing_line_list_is_an_io_error() {
    let temp = TempDir::new().expect("tempdir should be created");
    let output = spectra(&[
        "filter",
        "--lines",
        &path_arg(&temp.path().join("absent.dat")),
        "--output",
        &path_arg(&temp.path().join("out.dat")),
    ]);
    assert_eq!(output.status.code(), Some(3));
}

#[test]
fn convolve_stitches_segments_into_one_spectrum() {
    let temp = TempDir::new().expect("tempdir should be created");
    let left = temp.path().join("left.dat");
    let right = temp.path().join("right.dat");
    let axis = |start: f64| -> String {
        (0..=10)
            .map(|i| format!("{} 0.9\n", start + i as f64 * 0.5))
            .collect()
    };
    write_file(&left, &format!("# lambda flux\n{}", axis(5000.0)));
    write_file(&right, &axis(5005.0));
    let out = temp.path().join("convolved.dat");

    let output = spectra(&[
        "convolve",
        "--segments",
        &path_arg(&left),
        &path_arg(&right),
        "--fwhm",
        "1.0",
        "--profile",
        "lorentzian",
        "--output",
        &path_arg(&out),
    ]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));

    let content = fs::read_to_string(&out).expect("convolved spectrum");
    let rows: Vec<(f64, f64)> = content
        .lines()
        .filter(|line| !line.starts_with('#'))
        .map(|line| {
            let mut fields = line.split_whitespace();
            let x: f64 = fields.next().expect("x").parse().expect("numeric x");
            let y: f64 = fields.next().expect("y").parse().expect("numeric y");
            (x, y)
        })
        .collect();
    assert_eq!(rows.len(), 21);
    assert_eq!(rows[0].0, 5000.0);
    assert_eq!(rows[20].0, 5010.0);
    assert!(rows.iter().all(|(_, y)| (y - 0.9).abs() < 1e-9));
}

#[cfg(unix)]
#[test]
fn run_writes_spectra_and_report() {
    let fixture = RunFixture::new(SHELL_KERNEL);
    let out_dir = fixture.root().join("out");
    let mut args = vec!["run".to_string()];
    args.extend(fixture.input_args());
    args.extend(["--fwhm", "20", "--fwhm", "40", "--output-dir"].map(String::from));
    args.push(path_arg(&out_dir));
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    let output = spectra(&args);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(out_dir.join("spectrum-20.dat").is_file());
    assert!(out_dir.join("spectrum-40.dat").is_file());
    assert!(!out_dir.join("spectrum.dat").exists());

    let report: Value = serde_json::from_str(
        &fs::read_to_string(out_dir.join("report.json")).expect("report.json"),
    )
    .expect("report should be json");
    assert_eq!(report["zinf"], 0.5);
    let sessions = report["sessions"].as_array().expect("sessions array");
    assert_eq!(sessions.len(), 2);
    assert!(sessions.iter().all(|session| session["status"] == "ok"));
    assert_eq!(sessions[1]["interval"]["llzero"], 5100.0);
    assert_eq!(fixture.session_dirs(), 0);
}

#[cfg(unix)]
#[test]
fn run_writes_one_spectrum_per_variant_and_fwhm() {
    let fixture = RunFixture::new(SHELL_KERNEL);
    let out_dir = fixture.root().join("out");
    let mut args = vec!["run".to_string()];
    args.extend(fixture.input_args());
    args.extend(
        [
            "--variant",
            "poor:Fe=-0.3,Ca=-0.1",
            "--variant",
            "rich:Fe=0.3",
            "--fwhm",
            "20",
            "--output-dir",
        ]
        .map(String::from),
    );
    args.push(path_arg(&out_dir));
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    let output = spectra(&args);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(out_dir.join("spectrum-poor-20.dat").is_file());
    assert!(out_dir.join("spectrum-rich-20.dat").is_file());
    assert!(!out_dir.join("spectrum-20.dat").exists());

    let report: Value = serde_json::from_str(
        &fs::read_to_string(out_dir.join("report.json")).expect("report.json"),
    )
    .expect("report should be json");
    let variants: Vec<&str> = report["sessions"]
        .as_array()
        .expect("sessions array")
        .iter()
        .map(|session| session["variant"].as_str().expect("variant name"))
        .collect();
    assert_eq!(variants, ["poor", "poor", "rich", "rich"]);
    assert_eq!(fixture.session_dirs(), 0);
}

#[cfg(unix)]
#[test]
fn run_rejects_unknown_variant_elements_and_repeated_fwhm() {
    let fixture = RunFixture::new(SHELL_KERNEL);
    let out_dir = fixture.root().join("out");
    let run = |extra: &[&str]| {
        let mut args = vec!["run".to_string()];
        args.extend(fixture.input_args());
        args.extend(extra.iter().map(|arg| arg.to_string()));
        args.extend(["--output-dir".to_string(), path_arg(&out_dir)]);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        spectra(&args)
    };

    let output = run(&["--variant", "odd:Xx=0.2"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(
        stderr(&output).contains("[INPUT.ABUNDANCE_UNKNOWN_ELEMENT]"),
        "{}",
        stderr(&output)
    );
    assert_eq!(fixture.session_dirs(), 0);

    let output = run(&["--fwhm", "20", "--fwhm", "20.0"]);
    assert_eq!(output.status.code(), Some(2));
    let message = stderr(&output);
    assert!(message.contains("[INPUT.CLI_USAGE]"), "{message}");
    assert!(message.contains("--fwhm 20 given more than once"), "{message}");
    assert!(!out_dir.join("spectrum-20.dat").exists());
}

#[cfg(unix)]
#[test]
fn run_lists_every_failed_session_and_exits_with_computation_code() {
    let fixture = RunFixture::new(&format!(
        "if grep -q '^llzero = 5100' \"$2\"; then echo 'bad opacity' >&2; exit 7; fi\n{}",
        SHELL_KERNEL
    ));
    let out_dir = fixture.root().join("out");
    let mut args = vec!["run".to_string()];
    args.extend(fixture.input_args());
    args.extend(["--output-dir".to_string(), path_arg(&out_dir)]);
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    let output = spectra(&args);
    assert_eq!(output.status.code(), Some(4));
    let message = stderr(&output);
    assert!(
        message.contains("session 1 [5100, 5200]: kernel exited with exit status: 7"),
        "{message}"
    );
    assert!(message.contains("[RUN.SESSION_FAILED]"), "{message}");
    assert!(!out_dir.join("spectrum.dat").exists());

    let report: Value = serde_json::from_str(
        &fs::read_to_string(out_dir.join("report.json")).expect("report.json"),
    )
    .expect("report should be json");
    assert_eq!(report["sessions"][0]["status"], "ok");
    assert_eq!(report["sessions"][1]["status"], "failed");
    assert_eq!(report["sessions"][1]["diagnostics"][0], "bad opacity");
    // failed runs keep their sessions for inspection
    assert_eq!(fixture.session_dirs(), 2);
}

#[cfg(unix)]
#[test]
fn tune_prints_zinf_and_trace() {
    let fixture = RunFixture::new(SHELL_KERNEL);
    let mut args = vec!["tune".to_string()];
    args.extend(fixture.input_args());
    args.extend(["--llfin".to_string(), "5100".to_string()]);
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    let output = spectra(&args);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let printed = stdout(&output);
    let mut lines = printed.lines();
    assert_eq!(lines.next(), Some("zinf 8.5"));
    let trace: Vec<&str> = lines.collect();
    assert_eq!(trace.len(), 17);
    assert!(trace[0].starts_with("attempt 1 zinf 0.5 residual"), "{printed}");
    assert_eq!(fixture.session_dirs(), 0);
}
