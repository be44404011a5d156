//! Content-addressed Parquet cache of extracted rows.
//!
//! Layout: `{cache_dir}/{name}.parquet` + `{cache_dir}/{name}.meta.json`, where
//! `name` is a BLAKE3 digest of the key: date range, symbol scope, source
//! identity and the symbol rules whose normalized names the rows carry.
//!
//! Features:
//! - Atomic publish (rows stream into `.parquet.tmp`, renamed on commit)
//! - Writer exclusion via a `.lock` file created with `create_new`
//! - Abandoned writers remove their temp file and lock on drop
//! - Freshness window from the sidecar `created_at`
//! - Quarantine for artifacts that fail to read back

use crate::error::PipelineError;
use crate::source::{BarQuery, BarStore};
use crate::strategist::RowSink;
use barforge_core::data::{bars_to_frame, BarSchema, DataError, SymbolRules};
use barforge_core::domain::RawBar;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Cache errors.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("artifact {0} is being written by another run")]
    Locked(String),

    #[error("cache I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache meta: {0}")]
    Meta(#[from] serde_json::Error),

    #[error("parquet: {0}")]
    Parquet(#[from] PolarsError),

    #[error("data: {0}")]
    Data(#[from] DataError),
}

/// Which symbols an artifact covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolScope {
    All,
    /// Sorted, de-duplicated allow-list.
    Set(Vec<String>),
}

/// Everything an artifact's contents depend on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheKey {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub scope: SymbolScope,
    /// `BarStore::identity` of the store the rows came from.
    pub source: String,
    /// Digest of the symbol rules applied to the rows.
    pub rules: String,
}

impl CacheKey {
    pub fn new(query: &BarQuery, store: &dyn BarStore, rules: &SymbolRules) -> Self {
        let scope = match &query.symbols {
            None => SymbolScope::All,
            Some(symbols) => {
                let mut symbols = symbols.clone();
                symbols.sort();
                symbols.dedup();
                SymbolScope::Set(symbols)
            }
        };
        Self {
            start: query.range.start,
            end: query.range.end,
            scope,
            source: store.identity(),
            rules: rules_digest(rules),
        }
    }

    /// File stem derived from the key.
    pub fn name(&self) -> String {
        let date = |d: Option<NaiveDate>| d.map_or_else(|| "-".to_string(), |d| d.to_string());
        let scope = match &self.scope {
            SymbolScope::All => "*".to_string(),
            SymbolScope::Set(symbols) => symbols.join(","),
        };
        let canonical = format!(
            "{}|{}|{}|{}|{}",
            date(self.start),
            date(self.end),
            scope,
            self.source,
            self.rules
        );
        let digest = blake3::hash(canonical.as_bytes()).to_hex();
        format!("bars_{}", &digest[..24])
    }
}

fn rules_digest(rules: &SymbolRules) -> String {
    let mut hasher = blake3::Hasher::new();
    for suffix in &rules.strip_suffixes {
        hasher.update(b"s:");
        hasher.update(suffix.as_bytes());
        hasher.update(b"\n");
    }
    for (raw, target) in &rules.index_aliases {
        hasher.update(b"a:");
        hasher.update(raw.as_bytes());
        hasher.update(b"=");
        hasher.update(target.as_bytes());
        hasher.update(b"\n");
    }
    for symbol in &rules.index_symbols {
        hasher.update(b"i:");
        hasher.update(symbol.as_bytes());
        hasher.update(b"\n");
    }
    hasher.finalize().to_hex()[..16].to_string()
}

/// Sidecar describing a published artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMeta {
    pub key: CacheKey,
    pub rows: u64,
    pub symbols: usize,
    pub created_at: DateTime<Utc>,
    pub strategy: String,
}

/// A published artifact found on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedArtifact {
    pub path: PathBuf,
    pub meta: CacheMeta,
}

/// Listing entry from `status()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStatus {
    pub name: String,
    pub rows: u64,
    pub symbols: usize,
    pub created_at: DateTime<Utc>,
    pub fresh: bool,
    pub locked: bool,
}

/// The artifact cache.
#[derive(Debug, Clone)]
pub struct ArtifactCache {
    dir: PathBuf,
    freshness: Duration,
}

impl ArtifactCache {
    pub fn new(dir: impl Into<PathBuf>, freshness_hours: u64) -> Self {
        Self::with_freshness(dir, Duration::hours(freshness_hours as i64))
    }

    pub fn with_freshness(dir: impl Into<PathBuf>, freshness: Duration) -> Self {
        Self {
            dir: dir.into(),
            freshness,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn parquet_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.parquet"))
    }

    fn meta_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.meta.json"))
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.lock"))
    }

    fn is_fresh(&self, meta: &CacheMeta) -> bool {
        Utc::now() - meta.created_at < self.freshness
    }

    fn read_meta(&self, name: &str) -> Option<CacheMeta> {
        let content = fs::read_to_string(self.meta_path(name)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// A fresh, published artifact for `key`, if any.
    pub fn lookup(&self, key: &CacheKey) -> Option<CachedArtifact> {
        let name = key.name();
        let path = self.parquet_path(&name);
        if !path.is_file() {
            return None;
        }
        let meta = self.read_meta(&name)?;
        if &meta.key != key {
            warn!(artifact = %name, "cache key collision, ignoring artifact");
            return None;
        }
        if !self.is_fresh(&meta) {
            debug!(artifact = %name, created_at = %meta.created_at, "artifact is stale");
            return None;
        }
        Some(CachedArtifact { path, meta })
    }

    /// Start writing an artifact. Fails with `Locked` while another writer
    /// holds the key.
    pub fn begin(
        &self,
        key: &CacheKey,
        row_group_size: usize,
    ) -> Result<ArtifactWriter, CacheError> {
        fs::create_dir_all(&self.dir)?;
        let name = key.name();
        let lock_path = self.lock_path(&name);
        match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(CacheError::Locked(name));
            }
            Err(e) => return Err(e.into()),
        }

        let tmp_path = self.dir.join(format!("{name}.parquet.tmp"));
        let writer = fs::File::create(&tmp_path)
            .map_err(CacheError::from)
            .and_then(|file| {
                Ok(ParquetWriter::new(file)
                    .with_compression(ParquetCompression::Zstd(None))
                    .with_row_group_size(Some(row_group_size))
                    .batched(&BarSchema::rows())?)
            });
        let writer = match writer {
            Ok(w) => w,
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                let _ = fs::remove_file(&lock_path);
                return Err(e);
            }
        };

        Ok(ArtifactWriter {
            key: key.clone(),
            final_path: self.parquet_path(&name),
            meta_path: self.meta_path(&name),
            tmp_path,
            lock_path,
            writer,
            buffer: Vec::with_capacity(row_group_size),
            row_group_size,
            rows: 0,
            symbols: HashSet::new(),
            committed: false,
        })
    }

    /// Rename a corrupt artifact out of the way.
    pub fn quarantine(&self, key: &CacheKey) -> Result<(), CacheError> {
        let name = key.name();
        let path = self.parquet_path(&name);
        warn!(artifact = %name, "quarantining unreadable artifact");
        fs::rename(&path, path.with_extension("parquet.quarantined"))?;
        let _ = fs::remove_file(self.meta_path(&name));
        Ok(())
    }

    /// Every artifact with a readable sidecar.
    pub fn status(&self) -> Result<Vec<CacheStatus>, CacheError> {
        let mut out = Vec::new();
        if !self.dir.is_dir() {
            return Ok(out);
        }
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".meta.json"))
            else {
                continue;
            };
            let Some(meta) = self.read_meta(name) else {
                continue;
            };
            out.push(CacheStatus {
                name: name.to_string(),
                rows: meta.rows,
                symbols: meta.symbols,
                created_at: meta.created_at,
                fresh: self.is_fresh(&meta),
                locked: self.lock_path(name).exists(),
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Remove stale, unlocked artifacts. Returns how many were removed.
    pub fn purge_stale(&self) -> Result<usize, CacheError> {
        let mut removed = 0;
        for status in self.status()? {
            if status.fresh || status.locked {
                continue;
            }
            let _ = fs::remove_file(self.parquet_path(&status.name));
            fs::remove_file(self.meta_path(&status.name))?;
            removed += 1;
        }
        if removed > 0 {
            info!(removed, dir = %self.dir.display(), "purged stale artifacts");
        }
        Ok(removed)
    }
}

/// Streams rows into a temp file with fixed row groups; publishes on commit.
pub struct ArtifactWriter {
    key: CacheKey,
    final_path: PathBuf,
    meta_path: PathBuf,
    tmp_path: PathBuf,
    lock_path: PathBuf,
    writer: polars::io::parquet::write::BatchedWriter<fs::File>,
    buffer: Vec<RawBar>,
    row_group_size: usize,
    rows: u64,
    symbols: HashSet<String>,
    committed: bool,
}

impl ArtifactWriter {
    pub fn rows(&self) -> u64 {
        self.rows + self.buffer.len() as u64
    }

    fn write_group(&mut self, bars: &[RawBar]) -> Result<(), CacheError> {
        let df = bars_to_frame(bars)?;
        self.writer.write_batch(&df)?;
        self.rows += bars.len() as u64;
        Ok(())
    }

    /// Append rows, writing every full row group.
    pub fn push(&mut self, bars: Vec<RawBar>) -> Result<(), CacheError> {
        for bar in &bars {
            if !self.symbols.contains(&bar.symbol) {
                self.symbols.insert(bar.symbol.clone());
            }
        }
        self.buffer.extend(bars);
        while self.buffer.len() >= self.row_group_size {
            let rest = self.buffer.split_off(self.row_group_size);
            let group = std::mem::replace(&mut self.buffer, rest);
            self.write_group(&group)?;
        }
        Ok(())
    }

    /// Flush, rename into place, write the sidecar and release the lock.
    pub fn commit(mut self, strategy: &str) -> Result<CachedArtifact, CacheError> {
        let rest = std::mem::take(&mut self.buffer);
        if !rest.is_empty() {
            self.write_group(&rest)?;
        }
        self.writer.finish()?;
        fs::rename(&self.tmp_path, &self.final_path)?;

        let meta = CacheMeta {
            key: self.key.clone(),
            rows: self.rows,
            symbols: self.symbols.len(),
            created_at: Utc::now(),
            strategy: strategy.to_string(),
        };
        let meta_tmp = self.meta_path.with_extension("json.tmp");
        fs::write(&meta_tmp, serde_json::to_string_pretty(&meta)?)?;
        fs::rename(&meta_tmp, &self.meta_path)?;

        self.committed = true;
        let _ = fs::remove_file(&self.lock_path);
        info!(
            artifact = %self.final_path.display(),
            rows = meta.rows,
            symbols = meta.symbols,
            "published cache artifact"
        );
        Ok(CachedArtifact {
            path: self.final_path.clone(),
            meta,
        })
    }
}

impl RowSink for ArtifactWriter {
    fn append(&mut self, bars: Vec<RawBar>) -> Result<(), PipelineError> {
        Ok(self.push(bars)?)
    }

    fn rows_written(&self) -> u64 {
        self.rows()
    }
}

impl Drop for ArtifactWriter {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.tmp_path);
            let _ = fs::remove_file(&self.lock_path);
            debug!(artifact = %self.final_path.display(), "abandoned cache write");
        }
    }
}
