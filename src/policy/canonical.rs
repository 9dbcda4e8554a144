//! Canonicalization of raw uploads into the analytic policy table

use super::data::{Column, PolicyRecord, RawTable, RawValue, DEFAULT_REFERENCE_YEAR};
use crate::error::{AnalysisError, Result};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::BTreeSet;
use std::io::Write;

/// Immutable table of canonical policy records.
///
/// Built once per upload. Analyses only borrow it and return their own
/// projections, so the same table can back any number of analyses.
#[derive(Debug, Clone)]
pub struct CanonicalTable {
    records: Vec<PolicyRecord>,
    available: BTreeSet<Column>,
    reference_year: i32,
}

/// Row subset selection for the policy explorer
#[derive(Debug, Clone, Default)]
pub struct PolicyFilter {
    /// Keep only this premium band
    pub band: Option<String>,
    /// Keep rows with annual premium at or above this value
    pub min_annual_premium: Option<f64>,
    /// Keep rows with loss ratio at or below this value
    pub max_loss_ratio: Option<f64>,
}

impl PolicyFilter {
    pub fn matches(&self, record: &PolicyRecord) -> bool {
        if let Some(band) = &self.band {
            if record.band.as_deref() != Some(band.as_str()) {
                return false;
            }
        }
        if let Some(min) = self.min_annual_premium {
            if !(record.annual_premium >= min) {
                return false;
            }
        }
        if let Some(max) = self.max_loss_ratio {
            if !(record.loss_ratio <= max) {
                return false;
            }
        }
        true
    }
}

/// Canonicalize with the default reference year
pub fn canonicalize(raw: &RawTable) -> Result<CanonicalTable> {
    canonicalize_with(raw, DEFAULT_REFERENCE_YEAR)
}

/// Normalize headers, coerce numerics and compute the derived fields.
///
/// Numeric problems degrade to NaN; only a missing identifier column fails.
pub fn canonicalize_with(raw: &RawTable, reference_year: i32) -> Result<CanonicalTable> {
    // First matching header wins when normalization produces duplicates
    let mut positions: Vec<Option<usize>> = vec![None; Column::SOURCE.len()];
    for (idx, header) in raw.columns.iter().enumerate() {
        let normalized = header.trim().to_uppercase();
        if let Some(column) = Column::from_header(&normalized) {
            let slot = source_slot(column);
            if positions[slot].is_none() {
                positions[slot] = Some(idx);
            }
        }
    }

    if positions[source_slot(Column::PolicyNumber)].is_none() {
        return Err(AnalysisError::Schema {
            column: Column::PolicyNumber.name().to_string(),
        });
    }

    let mut available: BTreeSet<Column> = Column::SOURCE
        .iter()
        .copied()
        .filter(|c| positions[source_slot(*c)].is_some())
        .collect();

    for column in Column::SOURCE.iter().filter(|c| !available.contains(*c)) {
        warn!("Column {} not found in upload; treating as missing", column);
    }

    for column in Column::ALL.iter().filter(|c| c.is_derived()) {
        if column.inputs().iter().all(|input| available.contains(input)) {
            available.insert(*column);
        } else {
            debug!("Derived field {} unavailable", column);
        }
    }

    let empty = RawValue::Empty;
    let records: Vec<PolicyRecord> = raw
        .rows
        .iter()
        .map(|row| {
            let cell = |column: Column| {
                positions[source_slot(column)]
                    .and_then(|idx| row.get(idx))
                    .unwrap_or(&empty)
            };
            let label = |column: Column| cell(column).to_label();

            PolicyRecord::derive(
                label(Column::PolicyNumber).unwrap_or_default(),
                cell(Column::AnnualPremium).to_f64(),
                cell(Column::ReserveAmount).to_f64(),
                cell(Column::PremiumAmount).to_f64(),
                cell(Column::ExpectedClaims).to_f64(),
                cell(Column::ActualClaims).to_f64(),
                cell(Column::NzReserve).to_f64(),
                cell(Column::EntryYear)
                    .to_i64()
                    .and_then(|y| i32::try_from(y).ok()),
                cell(Column::EntryMonth)
                    .to_i64()
                    .and_then(|m| u32::try_from(m).ok()),
                label(Column::Band),
                label(Column::Frequency),
                label(Column::Term),
                label(Column::Status),
                reference_year,
            )
        })
        .collect();

    let nan_loss_ratios = records.iter().filter(|r| r.loss_ratio.is_nan()).count();
    if nan_loss_ratios > 0 {
        warn!("{} rows have a non-numeric loss ratio", nan_loss_ratios);
    }
    info!(
        "Canonicalized {} rows ({} of {} columns available)",
        records.len(),
        available.len(),
        Column::ALL.len()
    );

    Ok(CanonicalTable {
        records,
        available,
        reference_year,
    })
}

fn source_slot(column: Column) -> usize {
    Column::SOURCE
        .iter()
        .position(|c| *c == column)
        .unwrap_or_default()
}

impl CanonicalTable {
    pub fn records(&self) -> &[PolicyRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn reference_year(&self) -> i32 {
        self.reference_year
    }

    /// Columns present in the upload or computable from it
    pub fn available(&self) -> &BTreeSet<Column> {
        &self.available
    }

    pub fn is_available(&self, column: Column) -> bool {
        self.available.contains(&column)
    }

    /// Column as a dense numeric vector, NaN where missing
    pub fn numeric(&self, column: Column) -> Vec<f64> {
        self.records.iter().map(|r| r.number(column)).collect()
    }

    /// A new table holding the rows that pass the filter
    pub fn filter(&self, filter: &PolicyFilter) -> CanonicalTable {
        let records: Vec<PolicyRecord> = self
            .records
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        debug!("Filter kept {} of {} rows", records.len(), self.records.len());
        CanonicalTable {
            records,
            available: self.available.clone(),
            reference_year: self.reference_year,
        }
    }

    /// Write the table as CSV in canonical schema order; NaN becomes an empty field
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut csv_writer = csv::Writer::from_writer(writer);
        for record in &self.records {
            csv_writer.serialize(ExportRow::from(record))?;
        }
        if self.records.is_empty() {
            csv_writer.write_record(Column::ALL.iter().map(|c| c.name()))?;
        }
        csv_writer.flush()?;
        Ok(())
    }
}

/// Export shape of a record: headers match the upload dictionary
#[derive(Serialize)]
struct ExportRow<'a> {
    #[serde(rename = "POL_NUMBER")]
    policy_number: &'a str,
    #[serde(rename = "ANNUAL_PREM")]
    annual_premium: Option<f64>,
    #[serde(rename = "RES_GP_PUPS")]
    reserve_amount: Option<f64>,
    #[serde(rename = "PREM_GP_PUPS")]
    premium_amount: Option<f64>,
    #[serde(rename = "EXP_GP_PUP")]
    expected_claims: Option<f64>,
    #[serde(rename = "ACT_GP_PUP")]
    actual_claims: Option<f64>,
    #[serde(rename = "NZ_RES_IF_94")]
    nz_reserve: Option<f64>,
    #[serde(rename = "ENTRY_YEAR")]
    entry_year: Option<i32>,
    #[serde(rename = "ENTRY_MONTH")]
    entry_month: Option<u32>,
    #[serde(rename = "CL_PBAND")]
    band: Option<&'a str>,
    #[serde(rename = "CL_PFREQ")]
    frequency: Option<&'a str>,
    #[serde(rename = "CL_PPT")]
    term: Option<&'a str>,
    #[serde(rename = "CL_STATUS")]
    status: Option<&'a str>,
    #[serde(rename = "LOSS_RATIO")]
    loss_ratio: Option<f64>,
    #[serde(rename = "PREMIUM_ADEQUACY")]
    premium_adequacy: Option<f64>,
    #[serde(rename = "EXPECTED_VS_ACTUAL")]
    expected_vs_actual: Option<f64>,
    #[serde(rename = "RISK_SCORE")]
    risk_score: Option<f64>,
    #[serde(rename = "POLICY_VINTAGE")]
    policy_vintage: Option<i32>,
    #[serde(rename = "ENTRY_SEASON")]
    entry_season: Option<&'static str>,
}

fn nan_to_none(v: f64) -> Option<f64> {
    if v.is_nan() {
        None
    } else {
        Some(v)
    }
}

impl<'a> From<&'a PolicyRecord> for ExportRow<'a> {
    fn from(r: &'a PolicyRecord) -> Self {
        Self {
            policy_number: &r.policy_number,
            annual_premium: nan_to_none(r.annual_premium),
            reserve_amount: nan_to_none(r.reserve_amount),
            premium_amount: nan_to_none(r.premium_amount),
            expected_claims: nan_to_none(r.expected_claims),
            actual_claims: nan_to_none(r.actual_claims),
            nz_reserve: nan_to_none(r.nz_reserve),
            entry_year: r.entry_year,
            entry_month: r.entry_month,
            band: r.band.as_deref(),
            frequency: r.frequency.as_deref(),
            term: r.term.as_deref(),
            status: r.status.as_deref(),
            loss_ratio: nan_to_none(r.loss_ratio),
            premium_adequacy: nan_to_none(r.premium_adequacy),
            expected_vs_actual: nan_to_none(r.expected_vs_actual),
            risk_score: nan_to_none(r.risk_score),
            policy_vintage: r.policy_vintage,
            entry_season: r.entry_season.map(|s| s.as_str()),
        }
    }
}
