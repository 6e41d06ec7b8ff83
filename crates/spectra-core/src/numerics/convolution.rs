use crate::common::config::ConvolutionConfig;
use crate::domain::{FluxSegment, ProfileSpec, SpectrumError, SynthError, SynthesizedSpectrum};
use std::cmp::Ordering;
use std::f64::consts::LN_2;
use tracing::debug;

/// Samples closer than this fraction of the step are the same wavelength.
const SAMPLE_MATCH_FRACTION: f64 = 1e-6;
const MAX_KERNEL_HALF_WIDTH: usize = 1 << 20;
const MAX_AXIS_SAMPLES: usize = 1 << 26;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConvolutionError {
    #[error("no flux segments to stitch")]
    NoSegments,
    #[error(
        "coverage gap between {covered_end} and {next_start} exceeds the sampling step {step}"
    )]
    CoverageGap {
        covered_end: f64,
        next_start: f64,
        step: f64,
    },
    #[error("sampling step must be finite and > 0, got {value}")]
    InvalidStep { value: f64 },
    #[error("sampling step {step} over {span} would need more than {limit} samples")]
    AxisTooLong { span: f64, step: f64, limit: usize },
    #[error("invalid {profile} profile: {reason}")]
    InvalidProfile {
        profile: &'static str,
        reason: String,
    },
    #[error(transparent)]
    Spectrum(#[from] SpectrumError),
}

impl From<ConvolutionError> for SynthError {
    fn from(error: ConvolutionError) -> Self {
        let placeholder = match &error {
            ConvolutionError::NoSegments => "INPUT.SEGMENTS_EMPTY",
            ConvolutionError::CoverageGap { .. } => "INPUT.COVERAGE_GAP",
            ConvolutionError::InvalidStep { .. } | ConvolutionError::AxisTooLong { .. } => {
                "INPUT.SAMPLING_STEP"
            }
            ConvolutionError::InvalidProfile { .. } => "INPUT.PROFILE",
            ConvolutionError::Spectrum(_) => "INPUT.SPECTRUM_SHAPE",
        };
        SynthError::input_validation(placeholder, error.to_string())
    }
}

/// Stitches flux segments into one spectrum and applies instrumental profiles.
///
/// The stitched spectrum is always sampled on a uniform grid at
/// [`ConvolutionEngine::sampling_step`], so profile kernels built at that
/// step keep their FWHM in wavelength units whatever the segment grids are.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvolutionEngine {
    config: ConvolutionConfig,
}

impl ConvolutionEngine {
    pub fn new(config: ConvolutionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConvolutionConfig {
        &self.config
    }

    /// The configured step, or the median sample spacing of `segments`.
    pub fn sampling_step(&self, segments: &[FluxSegment]) -> Result<f64, ConvolutionError> {
        let step = match self.config.sampling_step {
            Some(step) => step,
            None => median_spacing(segments).ok_or(ConvolutionError::NoSegments)?,
        };
        if !step.is_finite() || step <= 0.0 {
            return Err(ConvolutionError::InvalidStep { value: step });
        }
        Ok(step)
    }

    /// Resamples segments onto one uniform grid starting at the lowest
    /// covered wavelength. Where segments overlap each sample is the mean of
    /// every covering segment; the result does not depend on the order of
    /// `segments`.
    pub fn stitch(
        &self,
        segments: &[FluxSegment],
    ) -> Result<SynthesizedSpectrum, ConvolutionError> {
        let step = self.sampling_step(segments)?;
        let (wavelength, flux) = stitch_segments(segments, step)?;
        Ok(SynthesizedSpectrum::new(wavelength, flux, None)?)
    }

    pub fn convolve(
        &self,
        segments: &[FluxSegment],
        profile: &ProfileSpec,
    ) -> Result<SynthesizedSpectrum, ConvolutionError> {
        let mut spectra = self.convolve_many(segments, std::slice::from_ref(profile))?;
        spectra.pop().ok_or(ConvolutionError::NoSegments)
    }

    /// Stitches once and convolves the result with each profile in turn.
    pub fn convolve_many(
        &self,
        segments: &[FluxSegment],
        profiles: &[ProfileSpec],
    ) -> Result<Vec<SynthesizedSpectrum>, ConvolutionError> {
        let step = self.sampling_step(segments)?;
        let (wavelength, flux) = stitch_segments(segments, step)?;

        profiles
            .iter()
            .map(|profile| {
                let weights =
                    discretize_profile(profile, step, self.config.truncation_half_widths)?;
                debug!(
                    profile = profile.name(),
                    fwhm = profile.fwhm(),
                    step,
                    kernel_len = weights.len(),
                    "convolving stitched flux"
                );
                let convolved = convolve_flux(&flux, &weights);
                Ok(SynthesizedSpectrum::new(
                    wavelength.clone(),
                    convolved,
                    Some(*profile),
                )?)
            })
            .collect()
    }
}

fn median_spacing(segments: &[FluxSegment]) -> Option<f64> {
    let mut spacings: Vec<f64> = segments
        .iter()
        .flat_map(|segment| segment.wavelength().windows(2).map(|pair| pair[1] - pair[0]))
        .collect();
    if spacings.is_empty() {
        return None;
    }
    spacings.sort_by(f64::total_cmp);
    let middle = spacings.len() / 2;
    Some(if spacings.len() % 2 == 0 {
        (spacings[middle - 1] + spacings[middle]) / 2.0
    } else {
        spacings[middle]
    })
}

fn by_extent(a: &&FluxSegment, b: &&FluxSegment) -> Ordering {
    a.start()
        .total_cmp(&b.start())
        .then_with(|| a.end().total_cmp(&b.end()))
}

fn stitch_segments(
    segments: &[FluxSegment],
    step: f64,
) -> Result<(Vec<f64>, Vec<f64>), ConvolutionError> {
    let mut ordered: Vec<&FluxSegment> = segments.iter().collect();
    ordered.sort_by(by_extent);
    let Some(first) = ordered.first() else {
        return Err(ConvolutionError::NoSegments);
    };

    let tolerance = step * SAMPLE_MATCH_FRACTION;
    let start = first.start();
    let mut covered_end = first.end();
    for segment in &ordered[1..] {
        if segment.start() - covered_end > step + tolerance {
            return Err(ConvolutionError::CoverageGap {
                covered_end,
                next_start: segment.start(),
                step,
            });
        }
        covered_end = covered_end.max(segment.end());
    }

    // a red-end remainder shorter than one step is not sampled
    let span = covered_end - start;
    let intervals = span / step + SAMPLE_MATCH_FRACTION;
    if !intervals.is_finite() || intervals >= MAX_AXIS_SAMPLES as f64 {
        return Err(ConvolutionError::AxisTooLong {
            span,
            step,
            limit: MAX_AXIS_SAMPLES,
        });
    }
    let count = intervals.floor() as usize + 1;

    let mut axis = Vec::with_capacity(count);
    let mut flux = Vec::with_capacity(count);
    let mut contributions = Vec::with_capacity(ordered.len());
    for index in 0..count {
        let wavelength = start + index as f64 * step;
        contributions.clear();
        contributions.extend(
            ordered
                .iter()
                .filter_map(|segment| sample_segment(segment, wavelength, tolerance)),
        );
        let value = if contributions.is_empty() {
            bridge_gap(&ordered, wavelength).ok_or(ConvolutionError::CoverageGap {
                covered_end: wavelength,
                next_start: wavelength,
                step,
            })?
        } else {
            contributions.sort_by(f64::total_cmp);
            contributions.iter().sum::<f64>() / contributions.len() as f64
        };
        axis.push(wavelength);
        flux.push(value);
    }

    Ok((axis, flux))
}

/// Flux of `segment` at `wavelength`: the sample itself when one lies within
/// `tolerance`, a linear interpolation inside the segment, `None` outside.
fn sample_segment(segment: &FluxSegment, wavelength: f64, tolerance: f64) -> Option<f64> {
    if wavelength < segment.start() - tolerance || wavelength > segment.end() + tolerance {
        return None;
    }
    let grid = segment.wavelength();
    let values = segment.flux();
    let upper = grid.partition_point(|probe| *probe < wavelength);

    if upper < grid.len() && grid[upper] - wavelength <= tolerance {
        return Some(values[upper]);
    }
    if upper > 0 && wavelength - grid[upper - 1] <= tolerance {
        return Some(values[upper - 1]);
    }
    if upper == 0 || upper == grid.len() {
        return None;
    }

    let (x0, x1) = (grid[upper - 1], grid[upper]);
    let (y0, y1) = (values[upper - 1], values[upper]);
    Some(y0 + (y1 - y0) * (wavelength - x0) / (x1 - x0))
}

/// Linear bridge across a gap narrower than one step, from the last sample of
/// the segment ending below `wavelength` to the first sample of the segment
/// starting above it.
fn bridge_gap(ordered: &[&FluxSegment], wavelength: f64) -> Option<f64> {
    let below = ordered
        .iter()
        .filter(|segment| segment.end() < wavelength)
        .max_by(|a, b| a.end().total_cmp(&b.end()))?;
    let above = ordered
        .iter()
        .filter(|segment| segment.start() > wavelength)
        .min_by(|a, b| a.start().total_cmp(&b.start()))?;
    let (x0, y0) = (below.end(), *below.flux().last()?);
    let (x1, y1) = (above.start(), *above.flux().first()?);
    Some(y0 + (y1 - y0) * (wavelength - x0) / (x1 - x0))
}

/// Normalized, odd-length, centered kernel sampled at `step`. A zero FWHM is
/// the identity kernel `[1.0]`.
pub fn discretize_profile(
    profile: &ProfileSpec,
    step: f64,
    truncation_half_widths: f64,
) -> Result<Vec<f64>, ConvolutionError> {
    let fwhm = profile.fwhm();
    let invalid = |reason: String| ConvolutionError::InvalidProfile {
        profile: profile.name(),
        reason,
    };
    if !fwhm.is_finite() || fwhm < 0.0 {
        return Err(invalid(format!("fwhm must be finite and >= 0, got {}", fwhm)));
    }
    if !step.is_finite() || step <= 0.0 {
        return Err(ConvolutionError::InvalidStep { value: step });
    }
    if !truncation_half_widths.is_finite() || truncation_half_widths <= 0.0 {
        return Err(invalid(format!(
            "truncation must be finite and > 0 half-widths, got {}",
            truncation_half_widths
        )));
    }
    if fwhm == 0.0 {
        return Ok(vec![1.0]);
    }

    let half_width = fwhm / 2.0;
    let reach = (truncation_half_widths * half_width / step).ceil();
    if reach > MAX_KERNEL_HALF_WIDTH as f64 {
        return Err(invalid(format!(
            "kernel would span {} samples at step {}",
            2.0 * reach + 1.0,
            step
        )));
    }
    let half = reach as usize;

    let shape = |offset: f64| match profile {
        ProfileSpec::Gaussian { .. } => {
            let sigma = fwhm / (2.0 * (2.0 * LN_2).sqrt());
            (-0.5 * (offset / sigma).powi(2)).exp()
        }
        ProfileSpec::Lorentzian { .. } => 1.0 / (1.0 + (offset / half_width).powi(2)),
    };
    let mut weights: Vec<f64> = (0..=2 * half)
        .map(|index| shape((index as f64 - half as f64) * step))
        .collect();
    let total: f64 = weights.iter().sum();
    for weight in &mut weights {
        *weight /= total;
    }
    Ok(weights)
}

/// Discrete convolution in sample space; `flux` must be uniformly sampled at
/// the step the kernel was built for. Near the edges the kernel is
/// renormalized over the samples that exist, so a flat input stays flat.
pub fn convolve_flux(flux: &[f64], weights: &[f64]) -> Vec<f64> {
    if weights.len() <= 1 {
        return flux.to_vec();
    }
    let half = weights.len() / 2;
    let len = flux.len();

    (0..len)
        .map(|center| {
            let first = center.saturating_sub(half);
            let last = (center + half).min(len - 1);
            let mut value = 0.0;
            let mut norm = 0.0;
            for (index, sample) in flux.iter().enumerate().take(last + 1).skip(first) {
                let weight = weights[index + half - center];
                value += weight * sample;
                norm += weight;
            }
            value / norm
        })
        .collect()
}
