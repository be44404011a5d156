//! Domain types shared by every ingestion stage.

pub mod asset;
pub mod bar;

pub use asset::{AssetKind, AssetRecord, DatasetHash, ExchangeRecord, Sid, SymbolMap};
pub use bar::{DailyBar, RawBar, SourceRow, SymbolSeries};
