//! The ingestion run.
//!
//! Stages, in order:
//! 1. Extract: file fragments (file mode) or a strategy-driven store
//!    extraction into a cache artifact (store mode), screening every row.
//! 2. Prepare (pass 1): per symbol, deduplicate, align to session-minutes,
//!    resample to sessions; survivors get sids.
//! 3. Write (pass 2): minute stream, daily stream, asset metadata, corporate
//!    actions, commit. Minute bars are reloaded one symbol at a time.
//!
//! Nothing reaches the writer until pass 1 has found at least one surviving
//! symbol, and any failure after that aborts the writer.

use crate::cache::{ArtifactCache, CacheError, CacheKey};
use crate::config::PipelineConfig;
use crate::dataset::{ArtifactDataset, Dataset, GroupedBars};
use crate::error::{ItemFailure, Outcome, PipelineError};
use crate::metadata::{AssetMetadataBuilder, AssetTable, ExchangeCount};
use crate::source::{BarQuery, BarStore, DuckDbStore, FileSource};
use crate::strategist::{Extraction, ExtractionStrategist, RowSink, Strategy};
use crate::writer::{BundleManifest, BundleWriter, BundleWriterAdapter, PreparedSymbol};
use barforge_core::data::{CalendarAligner, SymbolRules, ValidityFilter, ValidityReport};
use barforge_core::domain::{DatasetHash, RawBar};
use barforge_core::TradingCalendar;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Summary of one completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestReport {
    /// Extraction strategy; `None` in file mode.
    pub strategy: Option<String>,
    pub cache_hit: bool,
    /// Rows that passed validity screening.
    pub source_rows: usize,
    pub validity: ValidityReport,
    pub failures: Vec<ItemFailure>,
    pub symbols: usize,
    /// Symbols with rows but no bar on a session-minute.
    pub skipped_symbols: Vec<String>,
    /// Rows dropped for landing outside session-minutes.
    pub off_calendar: usize,
    pub minute_rows: usize,
    pub daily_rows: usize,
    pub dataset_hash: DatasetHash,
    pub exchanges: Vec<ExchangeCount>,
    pub bundle: BundleManifest,
}

struct Extracted {
    dataset: Dataset,
    strategy: Option<String>,
    cache_hit: bool,
    validity: ValidityReport,
    failures: Vec<ItemFailure>,
}

struct Prepared {
    aligner: CalendarAligner,
    assets: AssetTable,
    symbols: Vec<PreparedSymbol>,
    skipped: Vec<String>,
    off_calendar: usize,
}

/// One ingestion run over a fixed configuration.
pub struct IngestPipeline {
    config: PipelineConfig,
    calendar: Arc<dyn TradingCalendar>,
    store: Option<Box<dyn BarStore>>,
    strategy: Option<Strategy>,
}

impl IngestPipeline {
    pub fn new(
        config: PipelineConfig,
        calendar: Arc<dyn TradingCalendar>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            config,
            calendar,
            store: None,
            strategy: None,
        })
    }

    /// Run in store mode against `store` instead of opening `source_path`.
    pub fn with_store(mut self, store: Box<dyn BarStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Skip row-count selection and always extract with `strategy`.
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Extract, prepare and write one bundle.
    pub fn run(&self, writer: &mut dyn BundleWriter) -> Result<IngestReport, PipelineError> {
        let started = Instant::now();
        let result = self.run_stages(writer);
        match &result {
            Ok(report) => info!(
                strategy = report.strategy.as_deref().unwrap_or("files"),
                cache_hit = report.cache_hit,
                rows = report.source_rows,
                dropped = report.validity.dropped(),
                off_calendar = report.off_calendar,
                failures = report.failures.len(),
                symbols = report.symbols,
                minute_rows = report.minute_rows,
                daily_rows = report.daily_rows,
                hash = %report.dataset_hash,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "ingestion complete"
            ),
            Err(e) => {
                warn!(error = %e, "ingestion failed, aborting bundle");
                writer.abort();
            }
        }
        result
    }

    fn run_stages(&self, writer: &mut dyn BundleWriter) -> Result<IngestReport, PipelineError> {
        let extracted = self.extract()?;
        let prepared = self.prepare(&extracted.dataset)?;
        let dataset_hash = dataset_hash(&prepared.symbols);

        let adapter =
            BundleWriterAdapter::new(&extracted.dataset, &prepared.aligner, &prepared.symbols);
        let minute_rows = writer.write_minute_bars(&mut adapter.minute_frames())?;
        let daily_rows = writer.write_daily_bars(&mut adapter.daily_frames())?;
        writer.write_asset_metadata(&prepared.assets.assets, &prepared.assets.exchanges)?;
        writer.write_corporate_actions(&adapter.corporate_actions()?)?;

        let manifest = BundleManifest {
            calendar: self.calendar.name().to_string(),
            strategy: extracted.strategy.clone(),
            symbols: prepared.symbols.len(),
            minute_rows,
            daily_rows,
            dataset_hash: dataset_hash.0.clone(),
            created_at: Utc::now(),
        };
        writer.commit(&manifest)?;

        Ok(IngestReport {
            strategy: extracted.strategy,
            cache_hit: extracted.cache_hit,
            source_rows: extracted.dataset.row_count(),
            validity: extracted.validity,
            failures: extracted.failures,
            symbols: prepared.symbols.len(),
            skipped_symbols: prepared.skipped,
            off_calendar: prepared.off_calendar,
            minute_rows,
            daily_rows,
            dataset_hash,
            exchanges: prepared.assets.summary(),
            bundle: manifest,
        })
    }

    fn extract(&self) -> Result<Extracted, PipelineError> {
        if let Some(store) = &self.store {
            return self.extract_store(store.as_ref());
        }
        match &self.config.table_name {
            Some(table) => {
                let store =
                    DuckDbStore::open(&self.config.source_path, table, self.config.timezone()?)?;
                self.extract_store(&store)
            }
            None => self.extract_files(),
        }
    }

    fn extract_files(&self) -> Result<Extracted, PipelineError> {
        let source = FileSource::from_config(&self.config)?;
        let mut grouped = GroupedBars::new();
        let mut validity = ValidityReport::default();
        let mut outcome: Outcome<PathBuf> = Outcome::default();

        for item in source.fragments()? {
            outcome.push(item.map(|fragment| {
                let (bars, report) = ValidityFilter::apply(fragment.rows);
                validity.merge(&report);
                debug!(
                    file = %fragment.path.display(),
                    symbol = %fragment.symbol,
                    rows = bars.len(),
                    "read file"
                );
                if !bars.is_empty() {
                    grouped.push_fragment(&fragment.symbol, bars);
                }
                fragment.path
            }));
        }

        if outcome.is_all_failed() {
            return Err(PipelineError::NoValidData(format!(
                "all {} source files failed to read",
                outcome.failures.len()
            )));
        }
        if grouped.row_count() == 0 {
            return Err(PipelineError::NoValidData(format!(
                "no rows survived screening ({} dropped)",
                validity.dropped()
            )));
        }
        info!(
            files = outcome.successes.len(),
            failures = outcome.failures.len(),
            rows = grouped.row_count(),
            dropped = validity.dropped(),
            "loaded source files"
        );
        Ok(Extracted {
            dataset: Dataset::InMemory(grouped),
            strategy: None,
            cache_hit: false,
            validity,
            failures: outcome.failures,
        })
    }

    fn extract_store(&self, store: &dyn BarStore) -> Result<Extracted, PipelineError> {
        let query = BarQuery::from_config(&self.config);
        let key = CacheKey::new(&query, store, &self.config.symbols);
        let cache = ArtifactCache::new(&self.config.cache_dir, self.config.cache_freshness_hours);

        if self.config.force_refresh {
            info!(artifact = %key.name(), "force refresh, bypassing cache");
        } else if let Some(artifact) = cache.lookup(&key) {
            match ArtifactDataset::open(&artifact.path) {
                Ok(dataset) => {
                    info!(
                        artifact = %artifact.path.display(),
                        rows = artifact.meta.rows,
                        "cache hit"
                    );
                    return Ok(Extracted {
                        dataset: Dataset::Artifact(dataset),
                        strategy: Some(artifact.meta.strategy),
                        cache_hit: true,
                        validity: ValidityReport {
                            kept: artifact.meta.rows as usize,
                            ..ValidityReport::default()
                        },
                        failures: Vec::new(),
                    });
                }
                Err(e) => {
                    warn!(
                        artifact = %artifact.path.display(),
                        error = %e,
                        "unreadable cache artifact"
                    );
                    cache.quarantine(&key)?;
                }
            }
        }

        let strategist = ExtractionStrategist::from_config(&self.config);
        let row_group_size = self.config.chunk_thresholds.row_group_size;
        match cache.begin(&key, row_group_size) {
            Ok(mut writer) => {
                let extraction = self.extract_into(&strategist, store, &query, &mut writer)?;
                if writer.rows() == 0 {
                    return Err(no_rows(&extraction));
                }
                let artifact = writer.commit(extraction.strategy.as_str())?;
                let dataset = ArtifactDataset::open(&artifact.path)?;
                Ok(Extracted {
                    dataset: Dataset::Artifact(dataset),
                    strategy: Some(extraction.strategy.to_string()),
                    cache_hit: false,
                    validity: extraction.validity,
                    failures: extraction.failures,
                })
            }
            Err(CacheError::Locked(name)) => {
                warn!(
                    artifact = %name,
                    "artifact is being written by another run, extracting in memory"
                );
                let mut rows: Vec<RawBar> = Vec::new();
                let extraction = self.extract_into(&strategist, store, &query, &mut rows)?;
                if rows.is_empty() {
                    return Err(no_rows(&extraction));
                }
                Ok(Extracted {
                    dataset: Dataset::InMemory(GroupedBars::from_rows(rows)),
                    strategy: Some(extraction.strategy.to_string()),
                    cache_hit: false,
                    validity: extraction.validity,
                    failures: extraction.failures,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn extract_into(
        &self,
        strategist: &ExtractionStrategist,
        store: &dyn BarStore,
        query: &BarQuery,
        sink: &mut dyn RowSink,
    ) -> Result<Extraction, PipelineError> {
        let mut sink = NormalizingSink::new(&self.config.symbols, sink);
        match self.strategy {
            Some(strategy) => strategist.extract_with(strategy, store, query, &mut sink),
            None => strategist.extract(store, query, &mut sink),
        }
    }

    /// Pass 1: align every symbol, keep daily series, assign sids.
    fn prepare(&self, dataset: &Dataset) -> Result<Prepared, PipelineError> {
        let (earliest, latest) = dataset
            .time_bounds()?
            .ok_or_else(|| PipelineError::NoValidData("dataset is empty".into()))?;
        let aligner = CalendarAligner::for_bounds(Arc::clone(&self.calendar), earliest, latest);
        let mut builder = AssetMetadataBuilder::from_config(&self.config);
        let mut symbols = Vec::new();
        let mut skipped = Vec::new();
        let mut off_calendar = 0;

        for symbol in dataset.symbols() {
            let series = dataset.load(symbol)?;
            let aligned = aligner.align_minutes(&series);
            off_calendar += aligned.dropped;
            let daily = aligner.resample_daily(&aligned.bars);
            match builder.add(symbol, &daily) {
                Some(sid) => {
                    debug!(
                        %symbol,
                        %sid,
                        minutes = aligned.bars.len(),
                        sessions = daily.len(),
                        "prepared symbol"
                    );
                    symbols.push(PreparedSymbol {
                        sid,
                        symbol: symbol.clone(),
                        daily,
                        minute_rows: aligned.bars.len(),
                    });
                }
                None => {
                    debug!(%symbol, dropped = aligned.dropped, "no session-minute data, skipping");
                    skipped.push(symbol.clone());
                }
            }
        }

        if symbols.is_empty() {
            return Err(PipelineError::NoValidData(format!(
                "none of {} symbols has data on a trading session",
                dataset.symbols().len()
            )));
        }
        Ok(Prepared {
            aligner,
            assets: builder.build(),
            symbols,
            skipped,
            off_calendar,
        })
    }
}

fn no_rows(extraction: &Extraction) -> PipelineError {
    PipelineError::NoValidData(format!(
        "no rows survived screening ({} dropped, {} failed symbols)",
        extraction.validity.dropped(),
        extraction.failures.len()
    ))
}

/// Content hash over the daily series in sid order.
pub fn dataset_hash(symbols: &[PreparedSymbol]) -> DatasetHash {
    let mut ordered: Vec<&PreparedSymbol> = symbols.iter().collect();
    ordered.sort_by_key(|p| p.sid);

    let mut hasher = blake3::Hasher::new();
    for prepared in ordered {
        hasher.update(&prepared.sid.0.to_le_bytes());
        hasher.update(prepared.symbol.as_bytes());
        for bar in &prepared.daily {
            hasher.update(bar.date.to_string().as_bytes());
            hasher.update(&bar.open.to_le_bytes());
            hasher.update(&bar.high.to_le_bytes());
            hasher.update(&bar.low.to_le_bytes());
            hasher.update(&bar.close.to_le_bytes());
            hasher.update(&bar.volume.to_le_bytes());
        }
    }
    DatasetHash(hasher.finalize().to_hex().to_string())
}

/// Rewrites store symbols to their normalized form on the way to a sink.
struct NormalizingSink<'a> {
    rules: &'a SymbolRules,
    inner: &'a mut dyn RowSink,
    last: Option<(String, String)>,
}

impl<'a> NormalizingSink<'a> {
    fn new(rules: &'a SymbolRules, inner: &'a mut dyn RowSink) -> Self {
        Self {
            rules,
            inner,
            last: None,
        }
    }
}

impl RowSink for NormalizingSink<'_> {
    fn append(&mut self, mut bars: Vec<RawBar>) -> Result<(), PipelineError> {
        for bar in &mut bars {
            match &self.last {
                Some((raw, normalized)) if *raw == bar.symbol => bar.symbol = normalized.clone(),
                _ => {
                    let normalized = self.rules.normalize(&bar.symbol);
                    let raw = std::mem::replace(&mut bar.symbol, normalized.clone());
                    self.last = Some((raw, normalized));
                }
            }
        }
        self.inner.append(bars)
    }

    fn rows_written(&self) -> u64 {
        self.inner.rows_written()
    }
}
