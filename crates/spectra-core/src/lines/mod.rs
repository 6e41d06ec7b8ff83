//! Line-list partitioning, merging and filtering.

pub mod codec;
pub mod source;

use crate::common::config::DuplicatePolicy;
use crate::domain::{LineList, LineListError, LineRecord, WavelengthInterval};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::str::FromStr;

/// A trailing remainder no wider than this many ulps of the interval bounds
/// is rounding noise and is folded into the previous chunk.
const ROUNDING_ULPS: f64 = 4.0;
pub const MAX_CHUNKS: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeMode {
    #[default]
    Union,
    IntersectSpecies,
}

impl FromStr for MergeMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "union" => Ok(Self::Union),
            "intersect-species" => Ok(Self::IntersectSpecies),
            other => Err(format!(
                "unknown merge mode '{}'; expected 'union' or 'intersect-species'",
                other
            )),
        }
    }
}

/// Splits `list` into contiguous chunks `[llzero + i*w, llzero + (i+1)*w)`;
/// the last chunk is closed at `llfin` and may be narrower. Chunks without
/// lines are kept so the chunk intervals always tile the source interval.
pub fn partition(list: &LineList, chunk_width: f64) -> Result<Vec<LineList>, LineListError> {
    if !chunk_width.is_finite() || chunk_width <= 0.0 {
        return Err(LineListError::invalid_range(format!(
            "chunk width must be finite and > 0, got {}",
            chunk_width
        )));
    }
    let interval = list.interval();
    if interval.width() <= 0.0 {
        return Err(LineListError::invalid_range(format!(
            "source interval {} is empty",
            interval
        )));
    }

    let bounds = chunk_bounds(interval, chunk_width)?;
    let records = list.records();
    let mut chunks = Vec::with_capacity(bounds.len());
    let mut cursor = 0;
    let last = bounds.len() - 1;

    for (index, chunk) in bounds.iter().enumerate() {
        let remaining = &records[cursor..];
        let taken = if index == last {
            remaining.len()
        } else {
            remaining.partition_point(|record| record.wavelength < chunk.llfin())
        };
        let chunk_records = remaining[..taken].to_vec();
        cursor += taken;
        chunks.push(LineList::new(list.class(), list.unit(), *chunk, chunk_records)?);
    }

    tracing::debug!(
        interval = %interval,
        chunk_width,
        chunks = chunks.len(),
        "partitioned line list"
    );
    Ok(chunks)
}

fn chunk_bounds(
    interval: WavelengthInterval,
    chunk_width: f64,
) -> Result<Vec<WavelengthInterval>, LineListError> {
    let ratio = interval.width() / chunk_width;
    if !ratio.is_finite() || ratio > MAX_CHUNKS as f64 {
        return Err(LineListError::invalid_range(format!(
            "chunk width {} splits {} into more than {} chunks",
            chunk_width, interval, MAX_CHUNKS
        )));
    }
    let magnitude = interval.llzero().abs().max(interval.llfin().abs());
    let rounding = ROUNDING_ULPS * f64::EPSILON * magnitude;
    let nominal_lower = |index: usize| interval.llzero() + index as f64 * chunk_width;
    let mut count = (ratio.ceil() as usize).max(1);
    while count > 1 && interval.llfin() - nominal_lower(count - 1) <= rounding {
        count -= 1;
    }

    let mut bounds = Vec::with_capacity(count);
    for index in 0..count {
        let lower = nominal_lower(index);
        let upper = if index + 1 == count {
            interval.llfin()
        } else {
            nominal_lower(index + 1)
        };
        bounds.push(WavelengthInterval::new(lower, upper)?);
    }
    Ok(bounds)
}

/// Concatenates `lists`, re-sorts by wavelength and resolves duplicate
/// transitions with `policy`. Ties under keep-strongest keep the earlier record.
pub fn merge(
    lists: &[LineList],
    mode: MergeMode,
    policy: DuplicatePolicy,
) -> Result<LineList, LineListError> {
    let Some(first) = lists.first() else {
        return Err(LineListError::EmptyResult { operation: "merge" });
    };

    for (index, list) in lists.iter().enumerate().skip(1) {
        if list.unit() != first.unit() {
            return Err(LineListError::IncompatibleUnits {
                reason: format!(
                    "list {} uses {} but list 0 uses {}",
                    index,
                    list.unit(),
                    first.unit()
                ),
            });
        }
        if list.class() != first.class() {
            return Err(LineListError::IncompatibleUnits {
                reason: format!(
                    "list {} holds {} lines but list 0 holds {} lines",
                    index,
                    list.class(),
                    first.class()
                ),
            });
        }
    }

    let allowed: Option<BTreeSet<String>> = match mode {
        MergeMode::Union => None,
        MergeMode::IntersectSpecies => {
            let mut common: BTreeSet<String> =
                first.species().into_iter().map(str::to_owned).collect();
            for list in &lists[1..] {
                let species = list.species();
                common.retain(|name| species.contains(name.as_str()));
            }
            if common.is_empty() {
                return Err(LineListError::EmptyResult {
                    operation: "species intersection",
                });
            }
            Some(common)
        }
    };

    let mut merged: Vec<LineRecord> = Vec::new();
    let mut positions: HashMap<_, usize> = HashMap::new();
    let mut duplicates = 0usize;
    for record in lists.iter().flat_map(LineList::records) {
        if let Some(allowed) = &allowed {
            if !allowed.contains(&record.species) {
                continue;
            }
        }
        match positions.entry(record.duplicate_key()) {
            Entry::Vacant(slot) => {
                slot.insert(merged.len());
                merged.push(record.clone());
            }
            Entry::Occupied(slot) => {
                duplicates += 1;
                let position = *slot.get();
                if policy == DuplicatePolicy::KeepStrongest
                    && record.log_gf > merged[position].log_gf
                {
                    merged[position] = record.clone();
                }
            }
        }
    }

    let llzero = lists
        .iter()
        .map(|list| list.interval().llzero())
        .fold(f64::INFINITY, f64::min);
    let llfin = lists
        .iter()
        .map(|list| list.interval().llfin())
        .fold(f64::NEG_INFINITY, f64::max);
    let interval = WavelengthInterval::new(llzero, llfin)?;

    if duplicates > 0 {
        tracing::debug!(duplicates, ?policy, "resolved duplicate lines during merge");
    }
    LineList::new(first.class(), first.unit(), interval, merged)
}

/// Glob-based species selection; an empty include list selects every species.
#[derive(Debug, Clone)]
pub struct SpeciesFilter {
    include: Option<GlobSet>,
    exclude: Option<GlobSet>,
}

impl SpeciesFilter {
    pub fn new<S: AsRef<str>>(include: &[S], exclude: &[S]) -> Result<Self, LineListError> {
        Ok(Self {
            include: build_globset(include)?,
            exclude: build_globset(exclude)?,
        })
    }

    pub fn matches(&self, species: &str) -> bool {
        let included = self
            .include
            .as_ref()
            .is_none_or(|set| set.is_match(species));
        let excluded = self
            .exclude
            .as_ref()
            .is_some_and(|set| set.is_match(species));
        included && !excluded
    }

    pub fn apply(&self, list: &LineList) -> Result<LineList, LineListError> {
        let records: Vec<LineRecord> = list
            .iter()
            .filter(|record| self.matches(&record.species))
            .cloned()
            .collect();
        if records.is_empty() {
            return Err(LineListError::EmptyResult {
                operation: "species filter",
            });
        }
        LineList::new(list.class(), list.unit(), list.interval(), records)
    }
}

fn build_globset<S: AsRef<str>>(patterns: &[S]) -> Result<Option<GlobSet>, LineListError> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern.as_ref()).map_err(|source| LineListError::InvalidPattern {
            pattern: pattern.as_ref().to_string(),
            reason: source.to_string(),
        })?;
        builder.add(glob);
    }
    builder
        .build()
        .map(Some)
        .map_err(|source| LineListError::InvalidPattern {
            pattern: patterns
                .iter()
                .map(|pattern| pattern.as_ref())
                .collect::<Vec<_>>()
                .join(","),
            reason: source.to_string(),
        })
}

pub fn filter_by_species<S: AsRef<str>>(
    list: &LineList,
    include: &[S],
    exclude: &[S],
) -> Result<LineList, LineListError> {
    SpeciesFilter::new(include, exclude)?.apply(list)
}

/// Keeps the lines with `llzero <= wavelength <= llfin` and narrows the
/// declared interval to the overlap with `interval`.
pub fn cut(list: &LineList, interval: WavelengthInterval) -> Result<LineList, LineListError> {
    let narrowed = list.interval().intersect(&interval).ok_or_else(|| {
        LineListError::invalid_range(format!(
            "cut interval {} does not overlap line list interval {}",
            interval,
            list.interval()
        ))
    })?;
    let records: Vec<LineRecord> = list
        .iter()
        .filter(|record| narrowed.contains(record.wavelength))
        .cloned()
        .collect();
    if records.is_empty() {
        return Err(LineListError::EmptyResult { operation: "cut" });
    }
    LineList::new(list.class(), list.unit(), narrowed, records)
}

/// One list per species, ordered by species id; each keeps the parent interval.
pub fn split_by_species(list: &LineList) -> Result<Vec<LineList>, LineListError> {
    let mut grouped: BTreeMap<&str, Vec<LineRecord>> = BTreeMap::new();
    for record in list {
        grouped
            .entry(record.species.as_str())
            .or_default()
            .push(record.clone());
    }
    grouped
        .into_values()
        .map(|records| LineList::new(list.class(), list.unit(), list.interval(), records))
        .collect()
}
