//! Barforge Core: domain types and pure transforms for bundle ingestion.
//!
//! This crate holds everything that does not touch a data source or disk:
//! - Domain types (source rows, clean minute bars, session bars, asset records)
//! - Trading calendar boundary and a configurable exchange calendar
//! - Validity screening, last-write-wins deduplication, calendar alignment
//! - Symbol normalization and polars frame schemas

pub mod calendar;
pub mod data;
pub mod domain;

pub use calendar::{ExchangeCalendar, TradingCalendar};
