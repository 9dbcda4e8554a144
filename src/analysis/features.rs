//! Feature matrix preparation for the model-based analyses

use super::stats;
use crate::error::{AnalysisError, Result};
use crate::policy::{CanonicalTable, Column};
use log::{debug, warn};

/// Minimum number of usable columns a model-based analysis needs
pub const MIN_FEATURES: usize = 2;

/// Row-major numeric matrix with its column labels
#[derive(Debug, Clone)]
pub struct FeatureMatrix {
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<f64>>,
}

impl FeatureMatrix {
    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn n_features(&self) -> usize {
        self.columns.len()
    }

    pub fn column_values(&self, j: usize) -> Vec<f64> {
        self.rows.iter().map(|r| r[j]).collect()
    }

    /// Zero-mean, unit-variance copy using population statistics.
    ///
    /// Constant columns keep a scale of 1 so they center to zero.
    pub fn standardized(&self) -> FeatureMatrix {
        let params: Vec<(f64, f64)> = (0..self.n_features())
            .map(|j| {
                let values = self.column_values(j);
                let std = stats::population_std(&values);
                let scale = if std > 0.0 && std.is_finite() { std } else { 1.0 };
                (stats::mean(&values), scale)
            })
            .collect();

        let rows = self
            .rows
            .iter()
            .map(|row| {
                row.iter()
                    .zip(&params)
                    .map(|(v, (mean, scale))| (v - mean) / scale)
                    .collect()
            })
            .collect();

        FeatureMatrix {
            columns: self.columns.clone(),
            rows,
        }
    }
}

fn finite_or_nan(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        f64::NAN
    }
}

/// Column values with non-finite entries replaced by the mean of the finite ones
pub fn impute_mean(values: &[f64]) -> Vec<f64> {
    let cleaned: Vec<f64> = values.iter().copied().map(finite_or_nan).collect();
    let fill = stats::mean(&cleaned);
    cleaned
        .into_iter()
        .map(|v| if v.is_nan() { fill } else { v })
        .collect()
}

/// Whether a column is available and holds at least one finite value
pub fn is_usable(table: &CanonicalTable, column: Column) -> bool {
    column.is_numeric()
        && table.is_available(column)
        && table.records().iter().any(|r| r.number(column).is_finite())
}

/// Build the mean-imputed matrix from the usable subset of `requested`.
///
/// Unusable columns are dropped; fewer than two survivors is an error.
pub fn prepare(table: &CanonicalTable, requested: &[Column]) -> Result<FeatureMatrix> {
    let mut unique: Vec<Column> = Vec::with_capacity(requested.len());
    for &column in requested {
        if !unique.contains(&column) {
            unique.push(column);
        }
    }
    let usable: Vec<Column> = unique
        .iter()
        .copied()
        .filter(|c| is_usable(table, *c))
        .collect();

    if usable.len() < MIN_FEATURES {
        return Err(AnalysisError::InsufficientFeatures {
            required: MIN_FEATURES,
            attempted: unique.iter().map(|c| c.name().to_string()).collect(),
            usable: usable.iter().map(|c| c.name().to_string()).collect(),
        });
    }
    if usable.len() < unique.len() {
        warn!(
            "Dropping unusable feature columns: {:?}",
            unique
                .iter()
                .filter(|c| !usable.contains(c))
                .map(|c| c.name())
                .collect::<Vec<_>>()
        );
    }

    let imputed: Vec<Vec<f64>> = usable
        .iter()
        .map(|c| impute_mean(&table.numeric(*c)))
        .collect();

    let rows = (0..table.len())
        .map(|i| imputed.iter().map(|col| col[i]).collect())
        .collect();

    debug!("Prepared {} x {} feature matrix", table.len(), usable.len());
    Ok(FeatureMatrix {
        columns: usable,
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{canonicalize, RawTable, RawValue};
    use approx::assert_relative_eq;

    fn table() -> CanonicalTable {
        let mut raw = RawTable::new(
            ["POL_NUMBER", "ANNUAL_PREM", "RES_GP_PUPS", "PREM_GP_PUPS", "EXP_GP_PUP"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );
        raw.push_row(vec!["A".into(), "100".into(), "10".into(), "50".into(), "".into()]);
        raw.push_row(vec!["B".into(), "bad".into(), "20".into(), "50".into(), "".into()]);
        raw.push_row(vec!["C".into(), "300".into(), "30".into(), "50".into(), "".into()]);
        raw.push_row(vec![RawValue::from("D"), 500.0.into(), 40.0.into(), 50.0.into(), RawValue::Empty]);
        canonicalize(&raw).unwrap()
    }

    #[test]
    fn test_prepare_imputes_and_drops_unusable() {
        let t = table();
        let m = prepare(
            &t,
            &[Column::AnnualPremium, Column::ReserveAmount, Column::ExpectedClaims],
        )
        .unwrap();

        assert_eq!(m.columns, vec![Column::AnnualPremium, Column::ReserveAmount]);
        assert_eq!(m.n_rows(), 4);
        assert_relative_eq!(m.rows[1][0], 300.0);
    }

    #[test]
    fn test_repeated_column_counts_once() {
        let t = table();
        let err = prepare(&t, &[Column::AnnualPremium, Column::AnnualPremium]).unwrap_err();
        match err {
            AnalysisError::InsufficientFeatures { attempted, usable, .. } => {
                assert_eq!(attempted, vec!["ANNUAL_PREM".to_string()]);
                assert_eq!(usable, vec!["ANNUAL_PREM".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let m = prepare(
            &t,
            &[Column::ReserveAmount, Column::AnnualPremium, Column::ReserveAmount],
        )
        .unwrap();
        assert_eq!(m.columns, vec![Column::ReserveAmount, Column::AnnualPremium]);
        assert_eq!(m.rows[0].len(), 2);
    }

    #[test]
    fn test_prepare_rejects_single_feature() {
        let t = table();
        let err = prepare(&t, &[Column::AnnualPremium, Column::ExpectedClaims, Column::ActualClaims])
            .unwrap_err();
        match err {
            AnalysisError::InsufficientFeatures { attempted, usable, .. } => {
                assert_eq!(attempted.len(), 3);
                assert_eq!(usable, vec!["ANNUAL_PREM".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_standardized_columns() {
        let t = table();
        let m = prepare(&t, &[Column::ReserveAmount, Column::PremiumAmount])
            .unwrap()
            .standardized();

        let reserve = m.column_values(0);
        assert_relative_eq!(stats::mean(&reserve), 0.0, epsilon = 1e-12);
        assert_relative_eq!(stats::population_std(&reserve), 1.0, epsilon = 1e-12);
        // Constant premium column centers to zero
        assert!(m.column_values(1).iter().all(|v| *v == 0.0));
    }
}
