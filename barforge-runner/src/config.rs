//! Pipeline configuration.
//!
//! One immutable struct, loaded from TOML, validated once and passed by value
//! into `IngestPipeline::new`. Nothing else in the crate reads configuration
//! from the environment.

use barforge_core::data::SymbolRules;
use chrono::NaiveDate;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("parse config TOML: {0}")]
    Parse(String),

    #[error("chunk thresholds must be strictly increasing (small < large < ultra_large)")]
    ThresholdOrder,

    #[error("{0} must be greater than zero")]
    ZeroSize(&'static str),

    #[error("date range start {start} is after end {end}")]
    DateOrder { start: NaiveDate, end: NaiveDate },

    #[error("unknown timezone '{0}'")]
    Timezone(String),

    #[error("table name '{0}' is not a plain SQL identifier")]
    TableName(String),

    #[error("source path is empty")]
    EmptySourcePath,
}

/// Optional inclusive date window applied to every source query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl DateRange {
    pub fn new(start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        Self { start, end }
    }

    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start.map_or(true, |s| date >= s) && self.end.map_or(true, |e| date <= e)
    }
}

/// Row-count thresholds and batch sizes for the extraction strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkThresholds {
    /// At or below: Direct.
    pub small: u64,
    /// At or below: Chunked.
    pub large: u64,
    /// At or below: per-symbol sequential. Above: per-symbol batched.
    pub ultra_large: u64,
    /// Rows per page in the chunked strategy.
    pub page_size: u64,
    /// Pages accumulated before compaction.
    pub compact_every: usize,
    /// Scratch files combined per batch.
    pub combine_batch: usize,
    /// Symbols per query in the batched strategy.
    pub symbol_group: usize,
    /// Parquet row-group size for cache artifacts.
    pub row_group_size: usize,
}

impl Default for ChunkThresholds {
    fn default() -> Self {
        Self {
            small: 5_000_000,
            large: 50_000_000,
            ultra_large: 200_000_000,
            page_size: 1_000_000,
            compact_every: 10,
            combine_batch: 25,
            symbol_group: 20,
            row_group_size: 500_000,
        }
    }
}

impl ChunkThresholds {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.small < self.large && self.large < self.ultra_large) {
            return Err(ConfigError::ThresholdOrder);
        }
        let sizes = [
            ("page_size", self.page_size as usize),
            ("compact_every", self.compact_every),
            ("combine_batch", self.combine_batch),
            ("symbol_group", self.symbol_group),
            ("row_group_size", self.row_group_size),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(ConfigError::ZeroSize(name));
            }
        }
        Ok(())
    }
}

/// Exchange buckets written to the exchanges table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeNames {
    pub equity: String,
    pub index: String,
    pub country_code: String,
}

impl Default for ExchangeNames {
    fn default() -> Self {
        Self {
            equity: "NSE".into(),
            index: "NSE_INDEX".into(),
            country_code: "IN".into(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

fn default_freshness_hours() -> u64 {
    24
}

fn default_timezone() -> String {
    "Asia/Kolkata".into()
}

/// Everything one ingestion run needs to know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// File glob (file mode) or DuckDB database file (store mode).
    pub source_path: PathBuf,
    /// Present: queryable-store mode against this table.
    #[serde(default)]
    pub table_name: Option<String>,
    #[serde(default)]
    pub date_range: DateRange,
    /// Symbol allow-list. Absent means all symbols.
    #[serde(default)]
    pub symbol_filter: Option<Vec<String>>,
    #[serde(default)]
    pub chunk_thresholds: ChunkThresholds,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Ignore fresh cache artifacts and re-extract.
    #[serde(default)]
    pub force_refresh: bool,
    #[serde(default = "default_freshness_hours")]
    pub cache_freshness_hours: u64,
    /// Parent of scratch workspaces. Defaults to the system temp dir.
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
    /// IANA name used to localize naive source timestamps.
    #[serde(default = "default_timezone")]
    pub source_timezone: String,
    #[serde(default)]
    pub symbols: SymbolRules,
    #[serde(default)]
    pub exchanges: ExchangeNames,
}

impl PipelineConfig {
    /// Defaults for everything but the source path.
    pub fn new(source_path: impl Into<PathBuf>) -> Self {
        Self {
            source_path: source_path.into(),
            table_name: None,
            date_range: DateRange::default(),
            symbol_filter: None,
            chunk_thresholds: ChunkThresholds::default(),
            cache_dir: default_cache_dir(),
            force_refresh: false,
            cache_freshness_hours: default_freshness_hours(),
            scratch_dir: None,
            source_timezone: default_timezone(),
            symbols: SymbolRules::default(),
            exchanges: ExchangeNames::default(),
        }
    }

    /// Load and validate a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source_path.as_os_str().is_empty() {
            return Err(ConfigError::EmptySourcePath);
        }
        self.chunk_thresholds.validate()?;
        if let (Some(start), Some(end)) = (self.date_range.start, self.date_range.end) {
            if start > end {
                return Err(ConfigError::DateOrder { start, end });
            }
        }
        self.timezone()?;
        if let Some(table) = &self.table_name {
            if !is_plain_identifier(table) {
                return Err(ConfigError::TableName(table.clone()));
            }
        }
        Ok(())
    }

    pub fn timezone(&self) -> Result<Tz, ConfigError> {
        self.source_timezone
            .parse::<Tz>()
            .map_err(|_| ConfigError::Timezone(self.source_timezone.clone()))
    }

    pub fn is_store_mode(&self) -> bool {
        self.table_name.is_some()
    }
}

/// `name` or `schema.name`, ASCII letters, digits and underscores only.
fn is_plain_identifier(name: &str) -> bool {
    let part_ok = |part: &str| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() <= 2 && parts.iter().all(|p| part_ok(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_toml_gets_defaults() {
        let config = PipelineConfig::from_toml(r#"source_path = "data/minute/*.csv""#).unwrap();
        assert_eq!(config.source_path, PathBuf::from("data/minute/*.csv"));
        assert!(!config.is_store_mode());
        assert_eq!(config.chunk_thresholds, ChunkThresholds::default());
        assert_eq!(config.cache_freshness_hours, 24);
        assert_eq!(config.timezone().unwrap(), chrono_tz::Asia::Kolkata);
    }

    #[test]
    fn full_toml_parses() {
        let toml = r#"
            source_path = "warehouse.duckdb"
            table_name = "minute_bars"
            symbol_filter = ["ACME", "NIFTY50"]
            cache_dir = "/tmp/bars"
            force_refresh = true
            source_timezone = "UTC"

            [date_range]
            start = "2024-01-01"
            end = "2024-03-31"

            [chunk_thresholds]
            small = 10
            large = 100
            ultra_large = 1000

            [exchanges]
            index = "INDEX"
        "#;
        let config = PipelineConfig::from_toml(toml).unwrap();
        assert!(config.is_store_mode());
        assert_eq!(config.date_range.start, NaiveDate::from_ymd_opt(2024, 1, 1));
        assert_eq!(config.chunk_thresholds.small, 10);
        assert_eq!(config.chunk_thresholds.page_size, 1_000_000);
        assert_eq!(config.exchanges.index, "INDEX");
        assert_eq!(config.exchanges.equity, "NSE");
        assert!(config.force_refresh);
    }

    #[test]
    fn rejects_unordered_thresholds() {
        let mut config = PipelineConfig::new("data/*.csv");
        config.chunk_thresholds.large = config.chunk_thresholds.small;
        assert!(matches!(config.validate(), Err(ConfigError::ThresholdOrder)));
    }

    #[test]
    fn rejects_zero_sizes() {
        let mut config = PipelineConfig::new("data/*.csv");
        config.chunk_thresholds.combine_batch = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroSize("combine_batch"))
        ));
    }

    #[test]
    fn rejects_inverted_dates() {
        let mut config = PipelineConfig::new("data/*.csv");
        config.date_range = DateRange::new(
            NaiveDate::from_ymd_opt(2024, 2, 1),
            NaiveDate::from_ymd_opt(2024, 1, 1),
        );
        assert!(matches!(config.validate(), Err(ConfigError::DateOrder { .. })));
    }

    #[test]
    fn rejects_unknown_timezone() {
        let mut config = PipelineConfig::new("data/*.csv");
        config.source_timezone = "Mars/Olympus".into();
        assert!(matches!(config.validate(), Err(ConfigError::Timezone(_))));
    }

    #[test]
    fn table_name_must_be_identifier() {
        assert!(is_plain_identifier("minute_bars"));
        assert!(is_plain_identifier("main.minute_bars"));
        assert!(!is_plain_identifier("bars; DROP TABLE x"));
        assert!(!is_plain_identifier("1bars"));
        assert!(!is_plain_identifier("a.b.c"));
    }

    #[test]
    fn date_range_is_inclusive() {
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2024, 1, 1),
            NaiveDate::from_ymd_opt(2024, 1, 31),
        );
        assert!(range.contains(NaiveDate::from_ymd_opt(2024, 1, 31).unwrap()));
        assert!(!range.contains(NaiveDate::from_ymd_opt(2024, 2, 1).unwrap()));
        assert!(DateRange::default().contains(NaiveDate::from_ymd_opt(1999, 1, 1).unwrap()));
    }
}
