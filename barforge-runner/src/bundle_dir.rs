//! Directory-backed `BundleWriter`.
//!
//! Layout of a committed bundle:
//! `{root}/{bundle}/{timestamp}/`
//! - `minute/{sid}.parquet`, `daily/{sid}.parquet`
//! - `assets.parquet`, `exchanges.parquet`
//! - `splits.parquet`, `dividends.parquet`
//! - `manifest.json`
//!
//! Everything is written into a hidden staging directory first and renamed
//! into place on commit; abort (or drop before commit) removes the staging
//! directory, so consumers never see a partial bundle.

use crate::error::PipelineError;
use crate::writer::{BundleManifest, BundleWriter, CorporateActions, FrameStream};
use barforge_core::domain::{AssetRecord, ExchangeRecord, Sid};
use chrono::{NaiveDate, Utc};
use polars::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, warn};

const STAGING_PREFIX: &str = ".staging-";

pub struct DirectoryBundleWriter {
    bundle_dir: PathBuf,
    staging: Option<TempDir>,
    committed: Option<PathBuf>,
}

impl DirectoryBundleWriter {
    pub fn new(root: &Path, bundle: &str) -> Result<Self, PipelineError> {
        let bundle_dir = root.join(bundle);
        fs::create_dir_all(&bundle_dir)?;
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&bundle_dir)?;
        debug!(staging = %staging.path().display(), "opened bundle staging directory");
        Ok(Self {
            bundle_dir,
            staging: Some(staging),
            committed: None,
        })
    }

    /// Path of the committed version, once `commit` succeeded.
    pub fn committed_path(&self) -> Option<&Path> {
        self.committed.as_deref()
    }

    /// Committed versions of a bundle, oldest first.
    pub fn versions(root: &Path, bundle: &str) -> Result<Vec<PathBuf>, PipelineError> {
        let dir = root.join(bundle);
        let mut versions = Vec::new();
        if !dir.is_dir() {
            return Ok(versions);
        }
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.'));
            if path.is_dir() && !hidden {
                versions.push(path);
            }
        }
        versions.sort();
        Ok(versions)
    }

    fn staging(&self) -> Result<&Path, PipelineError> {
        self.staging
            .as_ref()
            .map(TempDir::path)
            .ok_or_else(|| PipelineError::Writer("bundle already committed or aborted".into()))
    }

    fn write_stream(
        &mut self,
        subdir: &str,
        bars: &mut FrameStream<'_>,
    ) -> Result<usize, PipelineError> {
        let dir = self.staging()?.join(subdir);
        fs::create_dir_all(&dir)?;
        let mut rows = 0;
        let mut last: Option<Sid> = None;
        for item in bars {
            let mut symbol_frame = item?;
            if last.is_some_and(|prev| symbol_frame.sid <= prev) {
                return Err(PipelineError::Writer(format!(
                    "{subdir} stream out of order at sid {}",
                    symbol_frame.sid
                )));
            }
            last = Some(symbol_frame.sid);
            rows += symbol_frame.frame.height();
            let path = dir.join(format!("{}.parquet", symbol_frame.sid));
            write_parquet(&path, &mut symbol_frame.frame)?;
        }
        Ok(rows)
    }
}

impl BundleWriter for DirectoryBundleWriter {
    fn write_minute_bars(&mut self, bars: &mut FrameStream<'_>) -> Result<usize, PipelineError> {
        self.write_stream("minute", bars)
    }

    fn write_daily_bars(&mut self, bars: &mut FrameStream<'_>) -> Result<usize, PipelineError> {
        self.write_stream("daily", bars)
    }

    fn write_asset_metadata(
        &mut self,
        assets: &[AssetRecord],
        exchanges: &[ExchangeRecord],
    ) -> Result<(), PipelineError> {
        let staging = self.staging()?;
        write_parquet(&staging.join("assets.parquet"), &mut assets_frame(assets)?)?;
        write_parquet(&staging.join("exchanges.parquet"), &mut exchanges_frame(exchanges)?)?;
        Ok(())
    }

    fn write_corporate_actions(&mut self, actions: &CorporateActions) -> Result<(), PipelineError> {
        let staging = self.staging()?;
        write_parquet(&staging.join("splits.parquet"), &mut actions.splits.clone())?;
        write_parquet(&staging.join("dividends.parquet"), &mut actions.dividends.clone())?;
        Ok(())
    }

    fn commit(&mut self, manifest: &BundleManifest) -> Result<(), PipelineError> {
        let staging = self.staging()?.to_path_buf();
        let json = serde_json::to_string_pretty(manifest)
            .map_err(|e| PipelineError::Writer(format!("manifest: {e}")))?;
        fs::write(staging.join("manifest.json"), json)?;

        let version = Utc::now().format("%Y%m%dT%H%M%S%.6f").to_string();
        let target = self.bundle_dir.join(version);
        fs::rename(&staging, &target)?;
        // The TempDir now points at a path that no longer exists; its drop is a no-op.
        self.staging = None;
        info!(bundle = %target.display(), symbols = manifest.symbols, "committed bundle");
        self.committed = Some(target);
        Ok(())
    }

    fn abort(&mut self) {
        if let Some(staging) = self.staging.take() {
            let path = staging.path().to_path_buf();
            if let Err(e) = staging.close() {
                warn!(staging = %path.display(), error = %e, "failed to remove staging directory");
            } else {
                debug!(staging = %path.display(), "aborted bundle");
            }
        }
    }
}

fn write_parquet(path: &Path, df: &mut DataFrame) -> Result<(), PipelineError> {
    let file = fs::File::create(path)?;
    ParquetWriter::new(file)
        .with_compression(ParquetCompression::Zstd(None))
        .finish(df)?;
    Ok(())
}

fn date_column(name: &str, dates: impl Iterator<Item = NaiveDate>) -> Result<Column, PolarsError> {
    let epoch = NaiveDate::default();
    let days: Vec<i32> = dates.map(|d| (d - epoch).num_days() as i32).collect();
    Column::new(name.into(), days).cast(&DataType::Date)
}

/// `symbol, sid, start_date, end_date, exchange, auto_close_date`
pub fn assets_frame(assets: &[AssetRecord]) -> Result<DataFrame, PolarsError> {
    DataFrame::new(vec![
        Column::new(
            "symbol".into(),
            assets.iter().map(|a| a.symbol.as_str()).collect::<Vec<_>>(),
        ),
        Column::new("sid".into(), assets.iter().map(|a| a.sid.0).collect::<Vec<_>>()),
        date_column("start_date", assets.iter().map(|a| a.start_date))?,
        date_column("end_date", assets.iter().map(|a| a.end_date))?,
        Column::new(
            "exchange".into(),
            assets.iter().map(|a| a.exchange.as_str()).collect::<Vec<_>>(),
        ),
        date_column("auto_close_date", assets.iter().map(|a| a.auto_close_date))?,
    ])
}

/// `exchange, canonical_name, country_code`
pub fn exchanges_frame(exchanges: &[ExchangeRecord]) -> Result<DataFrame, PolarsError> {
    let column = |name: &str, f: fn(&ExchangeRecord) -> &str| {
        Column::new(name.into(), exchanges.iter().map(f).collect::<Vec<_>>())
    };
    DataFrame::new(vec![
        column("exchange", |e| e.exchange.as_str()),
        column("canonical_name", |e| e.canonical_name.as_str()),
        column("country_code", |e| e.country_code.as_str()),
    ])
}
