//! Per-symbol flat files: CSV or Parquet, one symbol per file.
//!
//! Layout: `[datetime, open, high, low, close, volume]`, symbol taken from the
//! file stem and normalized. The source path is a glob whose last component
//! may hold `*` and `?`; files are visited in lexicographic path order so
//! first-encounter symbol order is deterministic.

use super::{in_range, parse_timestamp};
use crate::config::{DateRange, PipelineConfig};
use crate::error::{FailureKind, ItemFailure, PipelineError, SourceError};
use barforge_core::data::SymbolRules;
use barforge_core::domain::SourceRow;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use polars::prelude::*;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const TIME_COLUMNS: [&str; 4] = ["datetime", "timestamp", "date", "time"];
const DATA_EXTENSIONS: [&str; 2] = ["csv", "parquet"];

/// Rows read from one file, already tagged with the normalized symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct FileFragment {
    pub path: PathBuf,
    pub symbol: String,
    pub rows: Vec<SourceRow>,
}

/// Reader for a glob of per-symbol files.
#[derive(Debug, Clone)]
pub struct FileSource {
    pattern: PathBuf,
    tz: Tz,
    range: DateRange,
    allow: Option<BTreeSet<String>>,
    rules: SymbolRules,
}

impl FileSource {
    pub fn new(pattern: impl Into<PathBuf>, tz: Tz, rules: SymbolRules) -> Self {
        Self {
            pattern: pattern.into(),
            tz,
            range: DateRange::default(),
            allow: None,
            rules,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let source = Self::new(&config.source_path, config.timezone()?, config.symbols.clone())
            .with_range(config.date_range);
        Ok(match &config.symbol_filter {
            Some(symbols) => source.with_symbols(symbols),
            None => source,
        })
    }

    pub fn with_range(mut self, range: DateRange) -> Self {
        self.range = range;
        self
    }

    /// Restrict to these symbols, compared after normalization.
    pub fn with_symbols(mut self, symbols: &[String]) -> Self {
        self.allow = Some(symbols.iter().map(|s| self.rules.normalize(s)).collect());
        self
    }

    /// Expand the pattern into concrete files.
    ///
    /// A missing directory or a pattern matching nothing is fatal.
    pub fn resolve(&self) -> Result<Vec<PathBuf>, PipelineError> {
        let name = self
            .pattern
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        if !has_wildcard(&name) {
            if self.pattern.is_file() {
                return Ok(vec![self.pattern.clone()]);
            }
            if self.pattern.is_dir() {
                let files = list_files(&self.pattern, |p| is_data_file(p))?;
                return non_empty(files, &self.pattern);
            }
            return Err(PipelineError::SourceUnavailable(format!(
                "{} does not exist",
                self.pattern.display()
            )));
        }

        let dir = match self.pattern.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        if !dir.is_dir() {
            return Err(PipelineError::SourceUnavailable(format!(
                "directory {} does not exist",
                dir.display()
            )));
        }
        let pattern: Vec<char> = name.chars().collect();
        let files = list_files(&dir, |p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| wildcard_match(&pattern, &n.chars().collect::<Vec<_>>()))
        })?;
        non_empty(files, &self.pattern)
    }

    /// Lazily read every matching file, one fragment per file.
    pub fn fragments(&self) -> Result<FileFragments<'_>, PipelineError> {
        let paths = self.resolve()?;
        debug!(pattern = %self.pattern.display(), files = paths.len(), "resolved source files");
        Ok(FileFragments {
            source: self,
            paths: paths.into_iter(),
        })
    }

    /// Read one file. `None` when the symbol is filtered out.
    pub fn read_file(&self, path: &Path) -> Result<Option<FileFragment>, SourceError> {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| SourceError::Unreadable {
                path: path.display().to_string(),
                reason: "file name is not valid UTF-8".into(),
            })?;
        let symbol = self.rules.normalize(stem);
        if let Some(allow) = &self.allow {
            if !allow.contains(&symbol) {
                debug!(file = %path.display(), %symbol, "symbol not in filter");
                return Ok(None);
            }
        }

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        let mut rows = match extension.as_deref() {
            Some("csv") => read_csv(path, &symbol, self.tz)?,
            Some("parquet") => read_parquet(path, &symbol, self.tz)?,
            _ => {
                return Err(SourceError::Unreadable {
                    path: path.display().to_string(),
                    reason: "unsupported file type".into(),
                })
            }
        };
        rows.retain(|r| in_range(&self.range, r.timestamp, self.tz));

        Ok(Some(FileFragment {
            path: path.to_path_buf(),
            symbol,
            rows,
        }))
    }
}

/// Pull-based iterator over file fragments. Unreadable files surface as
/// `ItemFailure`s after a warning; they never stop the iteration.
pub struct FileFragments<'a> {
    source: &'a FileSource,
    paths: std::vec::IntoIter<PathBuf>,
}

impl Iterator for FileFragments<'_> {
    type Item = Result<FileFragment, ItemFailure>;

    fn next(&mut self) -> Option<Self::Item> {
        for path in self.paths.by_ref() {
            match self.source.read_file(&path) {
                Ok(Some(fragment)) => return Some(Ok(fragment)),
                Ok(None) => continue,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "skipping unreadable file");
                    return Some(Err(
                        e.for_item(FailureKind::PerFileRead, path.display().to_string())
                    ));
                }
            }
        }
        None
    }
}

fn has_wildcard(name: &str) -> bool {
    name.contains('*') || name.contains('?')
}

fn is_data_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| DATA_EXTENSIONS.iter().any(|d| e.eq_ignore_ascii_case(d)))
}

fn list_files(dir: &Path, keep: impl Fn(&Path) -> bool) -> Result<Vec<PathBuf>, PipelineError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && keep(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn non_empty(files: Vec<PathBuf>, pattern: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    if files.is_empty() {
        return Err(PipelineError::SourceUnavailable(format!(
            "no files match {}",
            pattern.display()
        )));
    }
    Ok(files)
}

/// `*` matches any run of characters, `?` exactly one.
fn wildcard_match(pattern: &[char], name: &[char]) -> bool {
    let (mut p, mut n) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while n < name.len() {
        match pattern.get(p) {
            Some(&'*') => {
                star = Some((p, n));
                p += 1;
            }
            Some(&c) if c == '?' || c == name[n] => {
                p += 1;
                n += 1;
            }
            _ => match star {
                Some((sp, sn)) => {
                    p = sp + 1;
                    n = sn + 1;
                    star = Some((sp, sn + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&c| c == '*')
}

fn number(field: Option<&str>) -> Option<f64> {
    field
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse().ok())
}

fn read_csv(path: &Path, symbol: &str, tz: Tz) -> Result<Vec<SourceRow>, SourceError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)?;
    let headers = reader.headers()?.clone();
    let find = |name: &str| headers.iter().position(|h| h.eq_ignore_ascii_case(name));
    let missing = |name: &str| SourceError::Unreadable {
        path: path.display().to_string(),
        reason: format!("missing column {name}"),
    };

    let time_idx = TIME_COLUMNS
        .iter()
        .find_map(|c| find(*c))
        .ok_or_else(|| missing("datetime"))?;
    let open_idx = find("open").ok_or_else(|| missing("open"))?;
    let high_idx = find("high").ok_or_else(|| missing("high"))?;
    let low_idx = find("low").ok_or_else(|| missing("low"))?;
    let close_idx = find("close").ok_or_else(|| missing("close"))?;
    let volume_idx = find("volume");

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let stamp = record.get(time_idx).unwrap_or_default();
        rows.push(SourceRow {
            symbol: symbol.to_string(),
            timestamp: parse_timestamp(stamp, tz).ok(),
            open: number(record.get(open_idx)),
            high: number(record.get(high_idx)),
            low: number(record.get(low_idx)),
            close: number(record.get(close_idx)),
            volume: volume_idx.and_then(|i| number(record.get(i))),
        });
    }
    Ok(rows)
}

fn read_parquet(path: &Path, symbol: &str, tz: Tz) -> Result<Vec<SourceRow>, SourceError> {
    let file = fs::File::open(path)?;
    let df = ParquetReader::new(file).finish()?;
    let missing = |name: &str| SourceError::Unreadable {
        path: path.display().to_string(),
        reason: format!("missing column {name}"),
    };

    let time_col = TIME_COLUMNS
        .iter()
        .find_map(|c| df.column(*c).ok())
        .ok_or_else(|| missing("datetime"))?;
    let timestamps = parquet_timestamps(time_col, tz, path)?;

    let prices = |name: &str| -> Result<Vec<Option<f64>>, SourceError> {
        let col = df
            .column(name)
            .map_err(|_| missing(name))?
            .cast(&DataType::Float64)?;
        Ok(col.f64()?.into_iter().collect())
    };
    let (opens, highs, lows, closes) = (
        prices("open")?,
        prices("high")?,
        prices("low")?,
        prices("close")?,
    );
    let volumes: Vec<Option<f64>> = match df.column("volume") {
        Ok(col) => col.cast(&DataType::Float64)?.f64()?.into_iter().collect(),
        Err(_) => vec![None; df.height()],
    };

    Ok(timestamps
        .into_iter()
        .enumerate()
        .map(|(i, timestamp)| SourceRow {
            symbol: symbol.to_string(),
            timestamp,
            open: opens[i],
            high: highs[i],
            low: lows[i],
            close: closes[i],
            volume: volumes[i],
        })
        .collect())
}

/// Datetime columns with a zone hold UTC instants; naive ones hold wall
/// clock in `tz`. String columns are parsed like CSV values. Nulls and values
/// without an instant come back as `None`.
fn parquet_timestamps(
    col: &Column,
    tz: Tz,
    path: &Path,
) -> Result<Vec<Option<DateTime<Utc>>>, SourceError> {
    match col.dtype() {
        DataType::Datetime(unit, zone) => {
            let per_ms = match unit {
                TimeUnit::Nanoseconds => 1_000_000,
                TimeUnit::Microseconds => 1_000,
                TimeUnit::Milliseconds => 1,
            };
            let zoned = zone.is_some();
            let raw = col.cast(&DataType::Int64)?;
            Ok(raw
                .i64()?
                .into_iter()
                .map(|value| {
                    let instant = DateTime::from_timestamp_millis(value?.div_euclid(per_ms))?;
                    if zoned {
                        Some(instant)
                    } else {
                        super::localize(instant.naive_utc(), tz)
                    }
                })
                .collect())
        }
        DataType::String => Ok(col
            .str()?
            .into_iter()
            .map(|value| value.and_then(|v| parse_timestamp(v, tz).ok()))
            .collect()),
        other => Err(SourceError::Unreadable {
            path: path.display().to_string(),
            reason: format!("unsupported time column type {other:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    const ACME: &str = "datetime,open,high,low,close,volume\n\
                        2024-01-08 09:16:00,100,101,99,100.5,10\n\
                        2024-01-08 09:17:00,100.5,102,100,101,\n";

    fn source(pattern: PathBuf) -> FileSource {
        FileSource::new(pattern, chrono_tz::Asia::Kolkata, SymbolRules::default())
    }

    #[test]
    fn wildcards() {
        let m = |p: &str, n: &str| {
            wildcard_match(&p.chars().collect::<Vec<_>>(), &n.chars().collect::<Vec<_>>())
        };
        assert!(m("*.csv", "acme.csv"));
        assert!(m("*_minute.csv", "acme_minute.csv"));
        assert!(m("a?me.csv", "acme.csv"));
        assert!(m("*", ""));
        assert!(!m("*.csv", "acme.parquet"));
        assert!(!m("a?me.csv", "ame.csv"));
        assert!(m("*a*b*", "xxaxxbxx"));
    }

    #[test]
    fn resolves_glob_in_lexicographic_order() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "zed.csv", ACME);
        write(dir.path(), "acme.csv", ACME);
        write(dir.path(), "notes.txt", "");

        let files = source(dir.path().join("*.csv")).resolve().unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["acme.csv", "zed.csv"]);
    }

    #[test]
    fn missing_directory_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = source(dir.path().join("nope/*.csv")).resolve().unwrap_err();
        assert!(matches!(err, PipelineError::SourceUnavailable(_)));
    }

    #[test]
    fn empty_match_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = source(dir.path().join("*.csv")).resolve().unwrap_err();
        assert!(matches!(err, PipelineError::SourceUnavailable(_)));
    }

    #[test]
    fn reads_csv_with_normalized_symbol() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "acme_minute.csv", ACME);

        let fragment = source(path.clone()).read_file(&path).unwrap().unwrap();

        assert_eq!(fragment.symbol, "ACME");
        assert_eq!(fragment.rows.len(), 2);
        assert_eq!(
            fragment.rows[0].timestamp,
            Some(Utc.with_ymd_and_hms(2024, 1, 8, 3, 46, 0).unwrap())
        );
        assert_eq!(fragment.rows[0].volume, Some(10.0));
        assert_eq!(fragment.rows[1].volume, None);
    }

    #[test]
    fn unreadable_file_is_an_item_failure() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "acme.csv", ACME);
        write(dir.path(), "broken.csv", "datetime,open\nnot-a-date,1\n");

        let src = source(dir.path().join("*.csv"));
        let results: Vec<_> = src.fragments().unwrap().collect();

        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        let failure = results[1].as_ref().unwrap_err();
        assert_eq!(failure.kind, FailureKind::PerFileRead);
        assert!(failure.item.ends_with("broken.csv"));
    }

    #[test]
    fn bad_timestamp_is_a_row_not_a_file_failure() {
        let dir = tempfile::tempdir().unwrap();
        let body = "datetime,open,high,low,close,volume\n\
                    not-a-date,1,1,1,1,1\n\
                    ,1,1,1,1,1\n\
                    2024-01-08 09:16:00,1,1,1,1,1\n";
        let path = write(dir.path(), "acme.csv", body);

        let fragment = source(path.clone()).read_file(&path).unwrap().unwrap();

        let stamped: Vec<bool> = fragment.rows.iter().map(|r| r.timestamp.is_some()).collect();
        assert_eq!(stamped, vec![false, false, true]);
    }

    #[test]
    fn symbol_filter_skips_other_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "acme.csv", ACME);
        write(dir.path(), "zed.csv", ACME);

        let src = source(dir.path().join("*.csv")).with_symbols(&["zed".into()]);
        let fragments: Vec<_> = src.fragments().unwrap().collect::<Result<_, _>>().unwrap();

        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].symbol, "ZED");
    }

    #[test]
    fn date_range_trims_rows() {
        let dir = tempfile::tempdir().unwrap();
        let body = "datetime,open,high,low,close,volume\n\
                    2024-01-05 09:16:00,1,1,1,1,1\n\
                    2024-01-08 09:16:00,1,1,1,1,1\n";
        let path = write(dir.path(), "acme.csv", body);
        let jan8 = chrono::NaiveDate::from_ymd_opt(2024, 1, 8);

        let fragment = source(path.clone())
            .with_range(DateRange::new(jan8, None))
            .read_file(&path)
            .unwrap()
            .unwrap();

        assert_eq!(fragment.rows.len(), 1);
    }

    #[test]
    fn reads_parquet_with_naive_datetimes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acme.parquet");
        // 2024-01-08 09:16:00 as naive wall clock.
        let naive_ms = 1_704_705_360_000i64;
        let mut df = DataFrame::new(vec![
            Column::new("datetime".into(), vec![naive_ms])
                .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))
                .unwrap(),
            Column::new("open".into(), vec![100.0]),
            Column::new("high".into(), vec![101.0]),
            Column::new("low".into(), vec![99.0]),
            Column::new("close".into(), vec![100.5]),
            Column::new("volume".into(), vec![7i64]),
        ])
        .unwrap();
        ParquetWriter::new(fs::File::create(&path).unwrap())
            .finish(&mut df)
            .unwrap();

        let fragment = source(path.clone()).read_file(&path).unwrap().unwrap();

        assert_eq!(fragment.rows.len(), 1);
        assert_eq!(
            fragment.rows[0].timestamp,
            Some(Utc.with_ymd_and_hms(2024, 1, 8, 3, 46, 0).unwrap())
        );
        assert_eq!(fragment.rows[0].volume, Some(7.0));
    }
}
