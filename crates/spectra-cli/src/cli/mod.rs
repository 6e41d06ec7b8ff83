mod commands;
mod helpers;

use clap::Parser;
use spectra_core::domain::SynthError;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "SPECTRA_LOG";

pub fn run_from_env() -> i32 {
    let args: Vec<String> = std::env::args().skip(1).collect();

    match run(args) {
        Ok(code) => code,
        Err(error) => {
            let synth_error = error.as_synth_error();
            eprintln!("{}", synth_error.diagnostic_line());
            if let Some(summary_line) = synth_error.fatal_exit_line() {
                eprintln!("{}", summary_line);
            }
            synth_error.exit_code()
        }
    }
}

pub fn run<I, S>(args: I) -> Result<i32, CliError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let full_args = std::iter::once("spectra".to_string())
        .chain(args.into_iter().map(Into::into))
        .collect::<Vec<_>>();
    parse_and_dispatch(full_args)
}

fn parse_and_dispatch(args: Vec<String>) -> Result<i32, CliError> {
    match Cli::try_parse_from(&args) {
        Ok(cli) => {
            init_tracing(cli.verbose);
            dispatch_parsed(cli.config, cli.command)
        }
        Err(err) => match err.kind() {
            clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                print!("{}", err);
                Ok(0)
            }
            _ => Err(CliError::Usage(err.to_string())),
        },
    }
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        _ => EnvFilter::new("debug"),
    };
    // a subscriber may already be installed when `run` is called repeatedly
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[derive(Parser)]
#[command(name = "spectra", about = "Parallel stellar spectral synthesis driver")]
struct Cli {
    /// JSON run configuration
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Raise log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(clap::Subcommand)]
enum CliCommand {
    /// Split a line list into fixed-width wavelength chunks
    Partition(commands::PartitionArgs),
    /// Merge several line lists into one
    Merge(commands::MergeArgs),
    /// Keep or drop lines by species
    Filter(commands::FilterArgs),
    /// Restrict a line list to a wavelength interval
    Cut(commands::CutArgs),
    /// Synthesize a spectrum with one kernel session per chunk
    Run(commands::RunArgs),
    /// Search for the smallest zinf that keeps interval edges stable
    Tune(commands::TuneArgs),
    /// Stitch spectrum segments and convolve them with a profile
    Convolve(commands::ConvolveArgs),
}

fn dispatch_parsed(config: Option<PathBuf>, command: CliCommand) -> Result<i32, CliError> {
    let config = helpers::load_config(config.as_deref())?;
    match command {
        CliCommand::Partition(args) => commands::run_partition_command(&config, args),
        CliCommand::Merge(args) => commands::run_merge_command(&config, args),
        CliCommand::Filter(args) => commands::run_filter_command(args),
        CliCommand::Cut(args) => commands::run_cut_command(args),
        CliCommand::Run(args) => commands::run_synthesis_command(config, args),
        CliCommand::Tune(args) => commands::run_tune_command(config, args),
        CliCommand::Convolve(args) => commands::run_convolve_command(&config, args),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error("{0}")]
    Compute(SynthError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CliError {
    fn as_synth_error(&self) -> SynthError {
        match self {
            Self::Usage(message) => {
                SynthError::input_validation("INPUT.CLI_USAGE", message.clone())
            }
            Self::Compute(error) => error.clone(),
            Self::Internal(error) => SynthError::io_system("IO.CLI", format!("{error:#}")),
        }
    }
}

impl From<SynthError> for CliError {
    fn from(error: SynthError) -> Self {
        Self::Compute(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn help_exits_successfully() {
        assert_eq!(run(["--help"]).expect("help should render"), 0);
    }

    #[test]
    fn unknown_subcommand_is_a_usage_error() {
        let error = run(["frobnicate"]).expect_err("unknown subcommand must fail");
        assert!(matches!(error, CliError::Usage(_)));
        assert_eq!(error.as_synth_error().exit_code(), 2);
    }

    #[test]
    fn internal_errors_map_to_io_category() {
        let error = CliError::Internal(anyhow::anyhow!("disk full"));
        let synth_error = error.as_synth_error();
        assert_eq!(synth_error.placeholder(), "IO.CLI");
        assert_eq!(synth_error.exit_code(), 3);
    }
}
