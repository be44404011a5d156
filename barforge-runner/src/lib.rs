//! Barforge Runner: turns raw minute bars into a calendar-aligned bundle.
//!
//! This crate builds on `barforge-core` to provide:
//! - Sources: per-symbol CSV/Parquet files, a DuckDB table, an in-memory store
//! - Extraction strategies chosen by probed row count, with a scratch workspace
//! - A BLAKE3-keyed Parquet artifact cache with atomic publication
//! - Asset metadata (sids, exchanges) and the bundle writer adapter
//! - A directory-backed bundle writer with staged commit
//! - The two-pass ingestion pipeline and its run report

pub mod bundle_dir;
pub mod cache;
pub mod config;
pub mod dataset;
pub mod error;
pub mod metadata;
pub mod pipeline;
pub mod scratch;
pub mod source;
pub mod strategist;
pub mod writer;

pub use bundle_dir::DirectoryBundleWriter;
pub use cache::{ArtifactCache, ArtifactWriter, CacheError, CacheKey, CacheMeta, CachedArtifact};
pub use config::{ChunkThresholds, ConfigError, DateRange, ExchangeNames, PipelineConfig};
pub use dataset::{ArtifactDataset, Dataset, GroupedBars};
pub use error::{FailureKind, ItemFailure, Outcome, PipelineError, SourceError};
pub use metadata::{AssetMetadataBuilder, AssetTable, ExchangeCount};
pub use pipeline::{dataset_hash, IngestPipeline, IngestReport};
pub use scratch::ScratchWorkspace;
pub use source::{BarQuery, BarStore, DuckDbStore, FileSource, InMemoryStore, Page};
pub use strategist::{Extraction, ExtractionStrategist, RowSink, Strategy};
pub use writer::{
    BundleManifest, BundleWriter, BundleWriterAdapter, CorporateActions, FrameStream,
    PreparedSymbol, SymbolFrame,
};

#[cfg(test)]
mod send_sync_checks {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn config_types_are_send_sync() {
        assert_send::<PipelineConfig>();
        assert_sync::<PipelineConfig>();
        assert_send::<ChunkThresholds>();
        assert_sync::<ChunkThresholds>();
    }

    #[test]
    fn report_types_are_send_sync() {
        assert_send::<IngestReport>();
        assert_sync::<IngestReport>();
        assert_send::<ItemFailure>();
        assert_sync::<ItemFailure>();
        assert_send::<BundleManifest>();
        assert_sync::<BundleManifest>();
    }

    #[test]
    fn datasets_are_send_sync() {
        assert_send::<Dataset>();
        assert_sync::<Dataset>();
        assert_send::<PreparedSymbol>();
        assert_sync::<PreparedSymbol>();
    }

    #[test]
    fn errors_are_send_sync() {
        assert_send::<PipelineError>();
        assert_sync::<PipelineError>();
        assert_send::<CacheError>();
        assert_sync::<CacheError>();
    }
}
