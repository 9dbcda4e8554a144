//! Load raw policy uploads from delimited text
//!
//! Every cell is kept as text; numeric coercion happens during
//! canonicalization so bad values degrade to NaN instead of failing the load.

use super::{RawTable, RawValue};
use crate::error::Result;
use csv::{ReaderBuilder, StringRecord};
use log::debug;
use std::path::Path;

/// Load a raw table from a CSV file
pub fn load_raw_table<P: AsRef<Path>>(path: P) -> Result<RawTable> {
    let file = std::fs::File::open(path.as_ref())?;
    debug!("Loading policies from {}", path.as_ref().display());
    load_raw_table_from_reader(file)
}

/// Load a raw table from any reader (e.g., string buffer, upload body)
pub fn load_raw_table_from_reader<R: std::io::Read>(reader: R) -> Result<RawTable> {
    let mut csv_reader = ReaderBuilder::new().flexible(true).from_reader(reader);
    let headers = csv_reader.headers()?.iter().map(str::to_string).collect();
    let mut table = RawTable::new(headers);

    for result in csv_reader.records() {
        let record: StringRecord = result?;
        table.push_row(record.iter().map(RawValue::from).collect());
    }

    debug!("Loaded {} raw rows", table.len());
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_from_reader() {
        let data = "POL_NUMBER,ANNUAL_PREM,CL_PBAND\nP1,1000,A\nP2,,B\nP3,12\n";
        let table = load_raw_table_from_reader(data.as_bytes()).unwrap();

        assert_eq!(table.columns, vec!["POL_NUMBER", "ANNUAL_PREM", "CL_PBAND"]);
        assert_eq!(table.len(), 3);
        assert_eq!(table.rows[0][1], RawValue::Text("1000".to_string()));
        assert_eq!(table.rows[1][1], RawValue::Empty);
        // Short rows are padded
        assert_eq!(table.rows[2][2], RawValue::Empty);
    }
}
