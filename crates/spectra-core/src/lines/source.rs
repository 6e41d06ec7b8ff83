//! External line databases and the on-disk cache in front of them.

use crate::common::config::SourceConfig;
use crate::domain::{
    LineList, LineListError, LineRecord, SpeciesClass, SynthError, WavelengthInterval,
    WavelengthUnit,
};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SourceError {
    #[error("line source '{source_name}' request failed: {message}")]
    Request {
        source_name: String,
        message: String,
    },
    #[error("line source '{source_name}' returned unreadable data: {message}")]
    Parse {
        source_name: String,
        message: String,
    },
    #[error("line cache '{path}' is unusable: {message}")]
    Cache { path: PathBuf, message: String },
    #[error(transparent)]
    LineList(#[from] LineListError),
}

impl From<SourceError> for SynthError {
    fn from(error: SourceError) -> Self {
        match error {
            SourceError::Request { .. } => {
                SynthError::io_system("IO.LINE_SOURCE_REQUEST", error.to_string())
            }
            SourceError::Parse { .. } => {
                SynthError::input_validation("INPUT.LINE_SOURCE_PARSE", error.to_string())
            }
            SourceError::Cache { .. } => {
                SynthError::io_system("IO.LINE_SOURCE_CACHE", error.to_string())
            }
            SourceError::LineList(inner) => inner.into(),
        }
    }
}

/// A database of transitions that can be queried by species and wavelength
/// range. Implementations report failures as-is; callers never retry.
pub trait LineSource {
    fn name(&self) -> &str;

    fn query(
        &self,
        species: &str,
        interval: WavelengthInterval,
    ) -> Result<Vec<LineRecord>, SourceError>;
}

/// Stores every successful query as JSON under
/// `<cache_dir>/<source name>/<species>_<llzero>_<llfin>.json`.
pub struct CachedLineSource<S> {
    inner: S,
    cache_dir: PathBuf,
}

impl<S: LineSource> CachedLineSource<S> {
    pub fn new(inner: S, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            cache_dir: cache_dir.into(),
        }
    }

    /// `None` when no cache directory is configured.
    pub fn from_config(inner: S, config: &SourceConfig) -> Option<Self> {
        config.cache_dir.clone().map(|dir| Self::new(inner, dir))
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn cache_path(&self, species: &str, interval: WavelengthInterval) -> PathBuf {
        self.cache_dir
            .join(sanitize(self.inner.name()))
            .join(format!(
                "{}_{}_{}.json",
                sanitize(species),
                interval.llzero(),
                interval.llfin()
            ))
    }
}

impl<S: LineSource> LineSource for CachedLineSource<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn query(
        &self,
        species: &str,
        interval: WavelengthInterval,
    ) -> Result<Vec<LineRecord>, SourceError> {
        let path = self.cache_path(species, interval);
        if path.is_file() {
            debug!(path = %path.display(), "line cache hit");
            return read_cache(&path);
        }

        let records = self.inner.query(species, interval)?;
        write_cache(&path, &records)?;
        debug!(path = %path.display(), records = records.len(), "line cache stored");
        Ok(records)
    }
}

fn sanitize(text: &str) -> String {
    text.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '+' | '-' | '.') {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

fn cache_error(path: &Path, message: impl ToString) -> SourceError {
    SourceError::Cache {
        path: path.to_path_buf(),
        message: message.to_string(),
    }
}

fn read_cache(path: &Path) -> Result<Vec<LineRecord>, SourceError> {
    let content = fs::read_to_string(path).map_err(|source| cache_error(path, source))?;
    serde_json::from_str(&content).map_err(|source| cache_error(path, source))
}

fn write_cache(path: &Path, records: &[LineRecord]) -> Result<(), SourceError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| cache_error(parent, source))?;
    }
    let content =
        serde_json::to_string_pretty(records).map_err(|source| cache_error(path, source))?;
    fs::write(path, content).map_err(|source| cache_error(path, source))
}

/// Queries `source` once per species and assembles the answers into one list.
pub fn collect_line_list<S: LineSource + ?Sized>(
    source: &S,
    class: SpeciesClass,
    unit: WavelengthUnit,
    interval: WavelengthInterval,
    species: &[&str],
) -> Result<LineList, SourceError> {
    let mut records = Vec::new();
    for name in species {
        records.extend(source.query(name, interval)?);
    }
    if records.is_empty() {
        return Err(LineListError::EmptyResult {
            operation: "line source query",
        }
        .into());
    }
    Ok(LineList::new(class, unit, interval, records)?)
}

#[cfg(test)]
mod tests {
    use super::{CachedLineSource, LineSource, SourceError, collect_line_list};
    use crate::common::config::SourceConfig;
    use crate::domain::{
        LineListError, LineRecord, SpeciesClass, WavelengthInterval, WavelengthUnit,
    };
    use std::cell::Cell;
    use tempfile::TempDir;

    struct CountingSource {
        calls: Cell<usize>,
        fail: bool,
    }

    impl CountingSource {
        fn new(fail: bool) -> Self {
            Self {
                calls: Cell::new(0),
                fail,
            }
        }
    }

    impl LineSource for CountingSource {
        fn name(&self) -> &str {
            "fake db"
        }

        fn query(
            &self,
            species: &str,
            interval: WavelengthInterval,
        ) -> Result<Vec<LineRecord>, SourceError> {
            self.calls.set(self.calls.get() + 1);
            if self.fail {
                return Err(SourceError::Request {
                    source_name: self.name().to_string(),
                    message: "connection refused".to_string(),
                });
            }
            let middle = interval.llzero() + interval.width() / 2.0;
            Ok(vec![LineRecord::new(species, middle, 0.0, 1.0, -1.0)])
        }
    }

    fn interval() -> WavelengthInterval {
        WavelengthInterval::new(3000.0, 3100.0).expect("interval")
    }

    #[test]
    fn second_query_is_served_from_cache() {
        let temp = TempDir::new().expect("tempdir should be created");
        let cached = CachedLineSource::new(CountingSource::new(false), temp.path());

        let first = cached.query("OH", interval()).expect("first query");
        let second = cached.query("OH", interval()).expect("second query");
        assert_eq!(first, second);
        assert_eq!(cached.inner().calls.get(), 1);

        let path = cached.cache_path("OH", interval());
        assert!(path.ends_with("fake_db/OH_3000_3100.json"), "{}", path.display());
        assert!(path.is_file());
    }

    #[test]
    fn cache_directory_comes_from_configuration() {
        let unset = SourceConfig::default();
        assert!(CachedLineSource::from_config(CountingSource::new(false), &unset).is_none());

        let temp = TempDir::new().expect("tempdir should be created");
        let configured = SourceConfig {
            cache_dir: Some(temp.path().join("cache")),
        };
        let cached = CachedLineSource::from_config(CountingSource::new(false), &configured)
            .expect("cache should be configured");
        assert!(cached.cache_path("OH", interval()).starts_with(temp.path().join("cache")));
    }

    #[test]
    fn source_errors_surface_without_retry_or_cache_entry() {
        let temp = TempDir::new().expect("tempdir should be created");
        let cached = CachedLineSource::new(CountingSource::new(true), temp.path());

        let error = cached.query("OH", interval()).expect_err("query must fail");
        assert!(matches!(error, SourceError::Request { .. }));
        assert_eq!(cached.inner().calls.get(), 1);
        assert!(!cached.cache_path("OH", interval()).exists());
    }

    #[test]
    fn corrupt_cache_entries_are_reported() {
        let temp = TempDir::new().expect("tempdir should be created");
        let cached = CachedLineSource::new(CountingSource::new(false), temp.path());
        let path = cached.cache_path("CN", interval());
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(&path, "not json").expect("write");

        assert!(matches!(
            cached.query("CN", interval()),
            Err(SourceError::Cache { .. })
        ));
    }

    #[test]
    fn collected_lists_are_sorted_and_validated() {
        let source = CountingSource::new(false);
        let list = collect_line_list(
            &source,
            SpeciesClass::Molecular,
            WavelengthUnit::Angstrom,
            interval(),
            &["OH", "CH"],
        )
        .expect("list should assemble");
        assert_eq!(list.len(), 2);
        assert_eq!(source.calls.get(), 2);

        let empty = collect_line_list(
            &source,
            SpeciesClass::Molecular,
            WavelengthUnit::Angstrom,
            interval(),
            &[],
        );
        assert!(matches!(
            empty,
            Err(SourceError::LineList(LineListError::EmptyResult { .. }))
        ));
    }
}
