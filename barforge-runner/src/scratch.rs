//! Run-exclusive scratch workspace for per-symbol intermediate files.
//!
//! The directory is owned by a `tempfile::TempDir`, so it is removed when the
//! workspace drops: after success, after an early `?` return, and while
//! unwinding from a panic.

use crate::error::PipelineError;
use barforge_core::data::{bars_to_frame, frame_to_bars};
use barforge_core::domain::RawBar;
use polars::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;

pub struct ScratchWorkspace {
    dir: TempDir,
    files: usize,
}

impl ScratchWorkspace {
    /// Create a fresh workspace under `parent`, or the system temp dir.
    pub fn create(parent: Option<&Path>) -> Result<Self, PipelineError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("barforge-scratch-");
        let dir = match parent {
            Some(parent) => {
                fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };
        debug!(path = %dir.path().display(), "created scratch workspace");
        Ok(Self { dir, files: 0 })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Number of symbol files written so far.
    pub fn files_written(&self) -> usize {
        self.files
    }

    /// Persist one symbol's rows as a zstd Parquet file.
    pub fn persist(&mut self, symbol: &str, bars: &[RawBar]) -> Result<PathBuf, PipelineError> {
        let path = self
            .dir
            .path()
            .join(format!("{:05}_{}.parquet", self.files, sanitize(symbol)));
        let mut df = bars_to_frame(bars)?;
        let file = fs::File::create(&path)?;
        ParquetWriter::new(file)
            .with_compression(ParquetCompression::Zstd(None))
            .finish(&mut df)?;
        self.files += 1;
        Ok(path)
    }

    /// Read a batch of symbol files back, in the given order, and delete them.
    pub fn drain(&self, paths: &[PathBuf]) -> Result<Vec<RawBar>, PipelineError> {
        let mut bars = Vec::new();
        for path in paths {
            let df = ParquetReader::new(fs::File::open(path)?).finish()?;
            bars.extend(frame_to_bars(&df)?);
            fs::remove_file(path)?;
        }
        Ok(bars)
    }
}

impl std::fmt::Debug for ScratchWorkspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScratchWorkspace")
            .field("path", &self.dir.path())
            .field("files", &self.files)
            .finish()
    }
}

fn sanitize(symbol: &str) -> String {
    symbol
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
