//! Error types for the analytics pipeline

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalysisError {
    /// A column with no numeric fallback is missing from the input entirely
    #[error("Schema error: required column {column} is absent")]
    Schema { column: String },

    #[error(
        "Insufficient features: need at least {required} usable columns, attempted {attempted:?} (usable: {usable:?})"
    )]
    InsufficientFeatures {
        required: usize,
        attempted: Vec<String>,
        usable: Vec<String>,
    },

    #[error("Insufficient data: need at least {required} rows, got {actual}")]
    InsufficientData { required: usize, actual: usize },

    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AnalysisError {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        AnalysisError::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AnalysisError>;
