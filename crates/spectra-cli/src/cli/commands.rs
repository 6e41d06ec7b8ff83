use super::CliError;
use super::helpers::*;
use spectra_core::common::{DuplicatePolicy, SynthesisConfig};
use spectra_core::domain::{ProfileSpec, SynthError};
use spectra_core::lines::{MergeMode, SpeciesFilter, merge, partition};
use spectra_core::numerics::ConvolutionEngine;
use spectra_core::pipeline::{AbundanceVariant, PipelineError, SynthesisPipeline, SynthesisRequest};
use spectra_core::scheduler::CancellationToken;
use spectra_core::session::{AbundanceTable, ExternalKernel, IdMaker, SessionInputs};
use spectra_core::spectrum::{read_segment, write_spectrum};
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::info;

#[derive(clap::Args)]
pub(super) struct PartitionArgs {
    /// Line list to split
    #[arg(long)]
    lines: PathBuf,

    /// Chunk width in the list's wavelength unit (defaults to the configured width)
    #[arg(long)]
    width: Option<f64>,

    /// Directory receiving chunk-NNN.dat files
    #[arg(long)]
    output_dir: PathBuf,
}

#[derive(clap::Args)]
pub(super) struct MergeArgs {
    /// Line lists to merge, in priority order
    #[arg(long, num_args = 1.., required = true)]
    lines: Vec<PathBuf>,

    /// union | intersect-species
    #[arg(long, default_value = "union")]
    mode: MergeMode,

    /// Duplicate resolution (defaults to the configured policy)
    #[arg(long, value_enum)]
    policy: Option<PolicyArg>,

    /// Merged line list
    #[arg(long)]
    output: PathBuf,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum PolicyArg {
    KeepFirst,
    KeepStrongest,
}

impl From<PolicyArg> for DuplicatePolicy {
    fn from(policy: PolicyArg) -> Self {
        match policy {
            PolicyArg::KeepFirst => DuplicatePolicy::KeepFirst,
            PolicyArg::KeepStrongest => DuplicatePolicy::KeepStrongest,
        }
    }
}

#[derive(clap::Args)]
pub(super) struct FilterArgs {
    #[arg(long)]
    lines: PathBuf,

    /// Species to keep (comma separated); empty keeps every species
    #[arg(long, value_delimiter = ',')]
    include: Vec<String>,

    /// Species to drop (comma separated)
    #[arg(long, value_delimiter = ',')]
    exclude: Vec<String>,

    #[arg(long)]
    output: PathBuf,
}

#[derive(clap::Args)]
pub(super) struct CutArgs {
    #[arg(long)]
    lines: PathBuf,

    #[arg(long)]
    llzero: f64,

    #[arg(long)]
    llfin: f64,

    #[arg(long)]
    output: PathBuf,
}

/// Inputs shared by `run` and `tune`.
#[derive(clap::Args)]
pub(super) struct SynthesisInputArgs {
    /// Line list to synthesize
    #[arg(long)]
    lines: PathBuf,

    /// Model atmosphere passed through to the kernel
    #[arg(long)]
    atmosphere: PathBuf,

    /// Abundance table (SYMBOL value per line)
    #[arg(long)]
    abundances: PathBuf,

    /// Molecular dissociation data passed through to the kernel
    #[arg(long)]
    dissociation: Option<PathBuf>,

    /// Lower bound of the synthesized interval
    #[arg(long)]
    llzero: Option<f64>,

    /// Upper bound of the synthesized interval
    #[arg(long)]
    llfin: Option<f64>,

    /// Kernel sampling step
    #[arg(long, default_value_t = 0.02)]
    step: f64,

    /// Initial zinf given to every session
    #[arg(long, default_value_t = 0.5)]
    zinf: f64,

    /// Abundance offset applied before synthesis, e.g. Fe=-0.3 (repeatable)
    #[arg(long = "offset", value_name = "ELEMENT=OFFSET", value_parser = parse_offset)]
    offsets: Vec<(String, f64)>,

    /// Number of parallel kernel sessions (defaults to the configured count)
    #[arg(long)]
    workers: Option<usize>,
}

impl SynthesisInputArgs {
    fn session_inputs(&self) -> Result<SessionInputs, CliError> {
        let abundances = AbundanceTable::read(&self.abundances).map_err(compute_error)?;
        let mut inputs = SessionInputs::new(self.atmosphere.clone(), abundances);
        inputs.dissociation = self.dissociation.clone();
        inputs.step = self.step;
        inputs.zinf = self.zinf;
        inputs.abundance_offsets = self.offsets.iter().cloned().collect();
        Ok(inputs)
    }

    fn apply_overrides(&self, config: &mut SynthesisConfig) -> Result<(), CliError> {
        if let Some(workers) = self.workers {
            config.scheduler.workers = workers;
        }
        if !(self.step.is_finite() && self.step > 0.0) {
            return Err(CliError::Usage(format!(
                "--step must be finite and > 0, got {}",
                self.step
            )));
        }
        Ok(())
    }
}

#[derive(clap::Args)]
pub(super) struct RunArgs {
    #[command(flatten)]
    inputs: SynthesisInputArgs,

    /// Chunk width per session (defaults to the configured width)
    #[arg(long)]
    width: Option<f64>,

    /// Instrumental FWHM; repeat for several convolved spectra
    #[arg(long)]
    fwhm: Vec<f64>,

    /// Line profile used for every --fwhm
    #[arg(long, value_enum, default_value = "gaussian")]
    profile: ProfileArg,

    /// Differential abundances synthesized as a separate run over every chunk,
    /// e.g. poor:Fe=-0.3,Ca=-0.1 (repeatable)
    #[arg(long = "variant", value_name = "NAME:ELEMENT=OFFSET,...", value_parser = parse_variant)]
    variants: Vec<AbundanceVariant>,

    /// Run the zinf search on the first chunk before the batch
    #[arg(long)]
    tune: bool,

    /// Directory receiving spectra and report.json
    #[arg(long)]
    output_dir: PathBuf,
}

#[derive(clap::Args)]
pub(super) struct TuneArgs {
    #[command(flatten)]
    inputs: SynthesisInputArgs,
}

#[derive(clap::Args)]
pub(super) struct ConvolveArgs {
    /// Two-column spectrum segments to stitch
    #[arg(long, num_args = 1.., required = true)]
    segments: Vec<PathBuf>,

    #[arg(long)]
    fwhm: f64,

    #[arg(long, value_enum, default_value = "gaussian")]
    profile: ProfileArg,

    #[arg(long)]
    output: PathBuf,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum ProfileArg {
    Gaussian,
    Lorentzian,
}

impl ProfileArg {
    fn with_fwhm(self, fwhm: f64) -> ProfileSpec {
        match self {
            Self::Gaussian => ProfileSpec::Gaussian { fwhm },
            Self::Lorentzian => ProfileSpec::Lorentzian { fwhm },
        }
    }
}

pub(super) fn run_partition_command(
    config: &SynthesisConfig,
    args: PartitionArgs,
) -> Result<i32, CliError> {
    let list = read_lines(&args.lines)?;
    let width = args.width.unwrap_or(config.partition.chunk_width);
    let chunks = partition(&list, width).map_err(compute_error)?;

    ensure_dir(&args.output_dir)?;
    for (index, chunk) in chunks.iter().enumerate() {
        let path = args.output_dir.join(chunk_file_name(index));
        write_lines(&path, chunk)?;
        println!("{} {} {} lines", path.display(), chunk.interval(), chunk.len());
    }
    Ok(0)
}

pub(super) fn run_merge_command(
    config: &SynthesisConfig,
    args: MergeArgs,
) -> Result<i32, CliError> {
    let lists = args
        .lines
        .iter()
        .map(|path| read_lines(path))
        .collect::<Result<Vec<_>, _>>()?;
    let policy = args
        .policy
        .map(DuplicatePolicy::from)
        .unwrap_or(config.partition.duplicate_policy);
    let merged = merge(&lists, args.mode, policy).map_err(compute_error)?;
    write_lines(&args.output, &merged)?;
    println!("{} {} {} lines", args.output.display(), merged.interval(), merged.len());
    Ok(0)
}

pub(super) fn run_filter_command(args: FilterArgs) -> Result<i32, CliError> {
    let list = read_lines(&args.lines)?;
    let filtered = SpeciesFilter::new(&args.include, &args.exclude)
        .and_then(|filter| filter.apply(&list))
        .map_err(compute_error)?;
    write_lines(&args.output, &filtered)?;
    println!("{} {} lines", args.output.display(), filtered.len());
    Ok(0)
}

pub(super) fn run_cut_command(args: CutArgs) -> Result<i32, CliError> {
    let list = read_lines(&args.lines)?;
    let cut = restrict_interval(list, Some(args.llzero), Some(args.llfin))?;
    write_lines(&args.output, &cut)?;
    println!("{} {} {} lines", args.output.display(), cut.interval(), cut.len());
    Ok(0)
}

pub(super) fn run_synthesis_command(
    mut config: SynthesisConfig,
    args: RunArgs,
) -> Result<i32, CliError> {
    args.inputs.apply_overrides(&mut config)?;
    if let Some(width) = args.width {
        config.partition.chunk_width = width;
    }
    config.validate().map_err(compute_error)?;
    let mut requested = BTreeSet::new();
    if let Some(repeated) = args.fwhm.iter().find(|fwhm| !requested.insert(fwhm.to_bits())) {
        return Err(CliError::Usage(format!("--fwhm {} given more than once", repeated)));
    }

    let lines = read_lines(&args.inputs.lines)?;
    let lines = restrict_interval(lines, args.inputs.llzero, args.inputs.llfin)?;
    let request = SynthesisRequest {
        lines,
        inputs: args.inputs.session_inputs()?,
        profiles: args
            .fwhm
            .iter()
            .map(|fwhm| args.profile.with_fwhm(*fwhm))
            .collect(),
        variants: args.variants.clone(),
        tune_zinf: args.tune,
    };

    ensure_dir(&args.output_dir)?;
    let report_path = args.output_dir.join("report.json");
    let pipeline = SynthesisPipeline::new(ExternalKernel::from_config(&config.scheduler), config);

    match pipeline.synthesize(&request, &CancellationToken::new()) {
        Ok(output) => {
            // a run without --variant keeps the plain spectrum[-fwhm].dat names
            let named = !args.variants.is_empty();
            for variant in &output.variants {
                for spectrum in &variant.spectra {
                    let name = spectrum_file_name(
                        named.then_some(variant.variant.name.as_str()),
                        spectrum.profile().map(|profile| profile.fwhm()),
                    );
                    let path = args.output_dir.join(name);
                    write_spectrum(&path, spectrum).map_err(compute_error)?;
                    println!("{}", path.display());
                }
            }
            let report = output
                .report
                .to_json()
                .map_err(|error| anyhow::anyhow!("failed to encode run report: {error}"))?;
            write_text(&report_path, &report)?;
            info!(
                sessions = output.report.sessions.len(),
                zinf = output.report.zinf,
                "synthesis finished"
            );
            Ok(0)
        }
        Err(PipelineError::SessionsFailed { failures, report }) => {
            let encoded = report
                .to_json()
                .map_err(|error| anyhow::anyhow!("failed to encode run report: {error}"))?;
            write_text(&report_path, &encoded)?;
            for failure in &failures {
                eprintln!("{}", failure);
            }
            Err(CliError::Compute(SynthError::computation(
                "RUN.SESSION_FAILED",
                format!(
                    "{} of {} synthesis sessions failed; see '{}'",
                    failures.len(),
                    report.sessions.len(),
                    report_path.display()
                ),
            )))
        }
        Err(error) => Err(compute_error(error)),
    }
}

pub(super) fn run_tune_command(
    mut config: SynthesisConfig,
    args: TuneArgs,
) -> Result<i32, CliError> {
    args.inputs.apply_overrides(&mut config)?;
    config.validate().map_err(compute_error)?;

    let lines = read_lines(&args.inputs.lines)?;
    let lines = restrict_interval(lines, args.inputs.llzero, args.inputs.llfin)?;
    let inputs = args.inputs.session_inputs()?;
    let ids = IdMaker::new(&config.scheduler.session_root);
    let pipeline = SynthesisPipeline::new(ExternalKernel::from_config(&config.scheduler), config);

    let outcome = pipeline
        .tune_first_chunk(
            &ids,
            std::slice::from_ref(&lines),
            &inputs,
            &CancellationToken::new(),
        )
        .map_err(compute_error)?;
    println!("zinf {}", outcome.zinf);
    for (attempt, trial) in outcome.trace.iter().enumerate() {
        println!("attempt {} zinf {} residual {}", attempt + 1, trial.zinf, trial.residual);
    }
    Ok(0)
}

pub(super) fn run_convolve_command(
    config: &SynthesisConfig,
    args: ConvolveArgs,
) -> Result<i32, CliError> {
    let segments = args
        .segments
        .iter()
        .map(|path| read_segment(path).map_err(compute_error))
        .collect::<Result<Vec<_>, _>>()?;
    let engine = ConvolutionEngine::new(config.convolution.clone());
    let spectrum = engine
        .convolve(&segments, &args.profile.with_fwhm(args.fwhm))
        .map_err(compute_error)?;
    if let Some(parent) = args.output.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        ensure_dir(parent)?;
    }
    write_spectrum(&args.output, &spectrum).map_err(compute_error)?;
    println!("{} {} points", args.output.display(), spectrum.len());
    Ok(0)
}
