use polars::prelude::{DataType, PolarsError};

/// Errors converting between bar rows and polars frames.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("polars: {0}")]
    Polars(#[from] PolarsError),

    #[error("missing required column: {0}")]
    MissingColumn(String),

    #[error("type mismatch in column {column}: expected {expected:?}, got {actual:?}")]
    TypeMismatch {
        column: String,
        expected: DataType,
        actual: DataType,
    },

    #[error("null {column} at row {row}")]
    NullValue { column: &'static str, row: usize },

    #[error("timestamp out of range: {0}")]
    InvalidTimestamp(i64),
}
