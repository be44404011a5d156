//! DuckDB-backed `BarStore`.
//!
//! Expects a table `[symbol, timestamp, open, high, low, close, volume]` with
//! naive wall-clock timestamps in the source timezone. Dates and symbols are
//! always bound as parameters; only the validated table name and the integer
//! page bounds are formatted into SQL.
//!
//! Values are read with `TRY_CAST`, so a cell that does not convert comes
//! back as NULL and the row is rejected during screening instead of failing
//! the query. Rows are ordered by `symbol, timestamp, rowid`; `rowid` follows
//! insertion order, which makes ties and page boundaries identical across
//! queries.

use super::{localize, BarQuery, BarStore, Page};
use crate::error::{PipelineError, SourceError};
use ::duckdb::{params_from_iter, AccessMode, Config, Connection};
use barforge_core::domain::SourceRow;
use chrono::{DateTime, NaiveDateTime, Utc};
use chrono_tz::Tz;
use std::path::Path;
use tracing::debug;

const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub struct DuckDbStore {
    conn: Connection,
    table: String,
    label: String,
    tz: Tz,
}

impl std::fmt::Debug for DuckDbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuckDbStore")
            .field("table", &self.table)
            .field("label", &self.label)
            .field("tz", &self.tz)
            .finish()
    }
}

impl DuckDbStore {
    /// Open a database file read-only and probe for the table.
    pub fn open(path: &Path, table: &str, tz: Tz) -> Result<Self, PipelineError> {
        if !path.is_file() {
            return Err(PipelineError::SourceUnavailable(format!(
                "database file {} not found",
                path.display()
            )));
        }
        let config = Config::default()
            .access_mode(AccessMode::ReadOnly)
            .map_err(|e| SourceError::from(e).unavailable())?;
        let conn = Connection::open_with_flags(path, config)
            .map_err(|e| SourceError::from(e).unavailable())?;
        Self::from_connection(conn, table, tz, path.display().to_string())
    }

    /// Wrap an existing connection, probing for the table.
    pub fn from_connection(
        conn: Connection,
        table: &str,
        tz: Tz,
        label: impl Into<String>,
    ) -> Result<Self, PipelineError> {
        let bare = table.rsplit('.').next().unwrap_or(table);
        let found: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM information_schema.tables WHERE table_name = ?",
                [bare],
                |row| row.get(0),
            )
            .map_err(|e| SourceError::from(e).unavailable())?;
        if found == 0 {
            return Err(PipelineError::SourceUnavailable(format!(
                "table {table} not found"
            )));
        }
        Ok(Self {
            conn,
            table: table.to_string(),
            label: label.into(),
            tz,
        })
    }

    /// Wall-clock text to UTC; `None` when unparseable or inside a DST gap.
    fn resolve(&self, stamp: &str) -> Option<DateTime<Utc>> {
        let naive = NaiveDateTime::parse_from_str(stamp, TS_FORMAT).ok()?;
        localize(naive, self.tz)
    }

    fn where_clause(query: &BarQuery) -> (String, Vec<String>) {
        let mut predicates: Vec<String> = vec!["symbol IS NOT NULL".into()];
        let mut params: Vec<String> = Vec::new();
        if let Some(start) = query.range.start {
            predicates.push("TRY_CAST(\"timestamp\" AS DATE) >= CAST(? AS DATE)".into());
            params.push(start.to_string());
        }
        if let Some(end) = query.range.end {
            predicates.push("TRY_CAST(\"timestamp\" AS DATE) <= CAST(? AS DATE)".into());
            params.push(end.to_string());
        }
        if let Some(symbols) = &query.symbols {
            if symbols.is_empty() {
                predicates.push("FALSE".into());
            } else {
                let marks = vec!["?"; symbols.len()].join(", ");
                predicates.push(format!("symbol IN ({marks})"));
                params.extend(symbols.iter().cloned());
            }
        }
        (format!(" WHERE {}", predicates.join(" AND ")), params)
    }
}

impl BarStore for DuckDbStore {
    fn describe(&self) -> String {
        format!("duckdb {}:{}", self.label, self.table)
    }

    fn estimate_rows(&self, query: &BarQuery) -> Result<u64, SourceError> {
        let (clause, params) = Self::where_clause(query);
        let sql = format!("SELECT COUNT(*) FROM {}{clause}", self.table);
        let count: i64 = self
            .conn
            .query_row(&sql, params_from_iter(params.iter()), |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    fn distinct_symbols(&self, query: &BarQuery) -> Result<Vec<String>, SourceError> {
        let (clause, params) = Self::where_clause(query);
        let sql = format!(
            "SELECT DISTINCT symbol FROM {}{clause} ORDER BY symbol",
            self.table
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let symbols = stmt
            .query_map(params_from_iter(params.iter()), |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(symbols)
    }

    fn identity(&self) -> String {
        format!("duckdb:{}:{}:{}", self.label, self.table, self.tz.name())
    }

    fn fetch(&self, query: &BarQuery, page: Option<Page>) -> Result<Vec<SourceRow>, SourceError> {
        let (clause, params) = Self::where_clause(query);
        let mut sql = format!(
            "SELECT symbol, strftime(TRY_CAST(\"timestamp\" AS TIMESTAMP), '{TS_FORMAT}'), \
             TRY_CAST(open AS DOUBLE), TRY_CAST(high AS DOUBLE), TRY_CAST(low AS DOUBLE), \
             TRY_CAST(close AS DOUBLE), TRY_CAST(volume AS DOUBLE) \
             FROM {}{clause} \
             ORDER BY symbol, TRY_CAST(\"timestamp\" AS TIMESTAMP) NULLS LAST, rowid",
            self.table
        );
        if let Some(p) = page {
            sql.push_str(&format!(" LIMIT {} OFFSET {}", p.limit, p.offset));
        }
        debug!(table = %self.table, ?page, "fetching rows");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(params.iter()), |row| {
                let stamp: Option<String> = row.get(1)?;
                Ok(SourceRow {
                    symbol: row.get(0)?,
                    timestamp: stamp.and_then(|ts| self.resolve(&ts)),
                    open: row.get(2)?,
                    high: row.get(3)?,
                    low: row.get(4)?,
                    close: row.get(5)?,
                    volume: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
