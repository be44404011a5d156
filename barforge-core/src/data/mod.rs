//! Pure OHLCV transforms: screening, merging, calendar alignment, frames.

pub mod align;
pub mod dedup;
pub mod error;
pub mod schema;
pub mod symbol;
pub mod validity;

pub use align::{CalendarAligner, MinuteAlignment};
pub use dedup::Deduplicator;
pub use error::DataError;
pub use schema::{bars_to_frame, daily_frame, frame_to_bars, minute_frame, BarSchema};
pub use symbol::SymbolRules;
pub use validity::{Rejection, ValidityFilter, ValidityReport};
