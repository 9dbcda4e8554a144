//! Policy Analytics - exploratory analysis engine for policy-level insurance data
//!
//! This library provides:
//! - Canonicalization of raw policy rows with derived actuarial ratios
//! - Grouped aggregation, ranking and portfolio summaries
//! - Risk segmentation by a weighted combined score
//! - Isolation-forest anomaly detection
//! - K-means clustering with a 2-D principal component projection
//! - Random forest reserve prediction

pub mod error;
pub mod policy;
pub mod analysis;

// Re-export commonly used types
pub use error::{AnalysisError, Result};
pub use policy::{canonicalize, canonicalize_with, CanonicalTable, Column, PolicyFilter, PolicyRecord, RawTable, RawValue};
pub use analysis::{AnalysisConfig, DEFAULT_SEED};
