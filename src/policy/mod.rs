//! Policy data structures, canonicalization and upload loading

mod data;
mod canonical;
pub mod loader;

pub use data::{
    CellValue, Column, PolicyRecord, RawTable, RawValue, Season, DEFAULT_REFERENCE_YEAR,
    RATIO_EPSILON,
};
pub use canonical::{canonicalize, canonicalize_with, CanonicalTable, PolicyFilter};
pub use loader::{load_raw_table, load_raw_table_from_reader};
