//! Risk segmentation by a weighted combined risk score

use super::stats;
use crate::error::{AnalysisError, Result};
use crate::policy::{CanonicalTable, Column, PolicyRecord};
use log::{info, warn};
use serde::{Deserialize, Serialize};

/// Blend weights for the combined risk score; must sum to 1
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskWeights {
    pub loss_ratio: f64,
    /// Applied to the risk score after scaling it down by 100
    pub risk_score: f64,
    pub expected_vs_actual: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            loss_ratio: 0.4,
            risk_score: 0.3,
            expected_vs_actual: 0.3,
        }
    }
}

impl RiskWeights {
    pub fn combined_score(&self, record: &PolicyRecord) -> f64 {
        record.loss_ratio * self.loss_ratio
            + record.risk_score / 100.0 * self.risk_score
            + record.expected_vs_actual * self.expected_vs_actual
    }

    fn validate(&self) -> Result<()> {
        let parts = [self.loss_ratio, self.risk_score, self.expected_vs_actual];
        if parts.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(AnalysisError::invalid(
                "risk_weights",
                "weights must be finite and non-negative",
            ));
        }
        let total: f64 = parts.iter().sum();
        if (total - 1.0).abs() > 1e-9 {
            return Err(AnalysisError::invalid(
                "risk_weights",
                format!("weights sum to {}, expected 1.0", total),
            ));
        }
        Ok(())
    }
}

/// Ordered segments, lowest risk first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RiskSegment {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskSegment {
    pub const ALL: [RiskSegment; 4] = [
        RiskSegment::Low,
        RiskSegment::Medium,
        RiskSegment::High,
        RiskSegment::Critical,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            RiskSegment::Low => "Low Risk",
            RiskSegment::Medium => "Medium Risk",
            RiskSegment::High => "High Risk",
            RiskSegment::Critical => "Critical Risk",
        }
    }
}

/// Half-open bin edges `[e0,e1) [e1,e2) [e2,e3) [e3,e4)` for the four segments
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskBins {
    pub edges: [f64; 5],
}

impl Default for RiskBins {
    fn default() -> Self {
        Self {
            edges: [0.0, 0.5, 1.0, 1.5, f64::INFINITY],
        }
    }
}

impl RiskBins {
    /// Segment for a score; NaN or out-of-range scores are unassigned
    pub fn classify(&self, score: f64) -> Option<RiskSegment> {
        if score.is_nan() {
            return None;
        }
        self.edges
            .windows(2)
            .position(|w| score >= w[0] && score < w[1])
            .map(|i| RiskSegment::ALL[i])
    }

    fn validate(&self) -> Result<()> {
        if self.edges.iter().any(|e| e.is_nan()) || self.edges.windows(2).any(|w| w[0] >= w[1]) {
            return Err(AnalysisError::invalid(
                "risk_bins",
                format!("edges must be strictly increasing, got {:?}", self.edges),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SegmentationParams {
    pub weights: RiskWeights,
    pub bins: RiskBins,
}

/// Per-row projection of the segmentation
#[derive(Debug, Clone, Serialize)]
pub struct SegmentedRow {
    pub row: usize,
    pub policy_number: String,
    pub combined_score: f64,
    /// `None` when the score is NaN or outside every bin
    pub segment: Option<RiskSegment>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SegmentSummary {
    pub segment: RiskSegment,
    pub count: usize,
    pub total_premium: f64,
    pub mean_premium: f64,
    pub mean_loss_ratio: f64,
    pub mean_premium_adequacy: f64,
    pub total_reserve: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SegmentationReport {
    pub rows: Vec<SegmentedRow>,
    /// Non-empty segments in bin order
    pub summary: Vec<SegmentSummary>,
    pub unassigned: usize,
    pub critical_count: usize,
    /// Annual premium written in the High and Critical segments
    pub high_risk_premium: f64,
    pub critical_share: f64,
}

impl SegmentationReport {
    pub fn count(&self, segment: RiskSegment) -> usize {
        self.summary
            .iter()
            .find(|s| s.segment == segment)
            .map_or(0, |s| s.count)
    }
}

/// Partition policies into risk segments and summarize each segment
pub fn segment_risk(table: &CanonicalTable, params: &SegmentationParams) -> Result<SegmentationReport> {
    params.weights.validate()?;
    params.bins.validate()?;

    for column in [Column::LossRatio, Column::RiskScore, Column::ExpectedVsActual] {
        if !table.is_available(column) {
            warn!("{} unavailable; combined risk scores will be NaN", column);
        }
    }

    let records = table.records();
    let rows: Vec<SegmentedRow> = records
        .iter()
        .enumerate()
        .map(|(row, record)| {
            let combined_score = params.weights.combined_score(record);
            SegmentedRow {
                row,
                policy_number: record.policy_number.clone(),
                combined_score,
                segment: params.bins.classify(combined_score),
            }
        })
        .collect();

    let summary: Vec<SegmentSummary> = RiskSegment::ALL
        .iter()
        .filter_map(|segment| {
            let members: Vec<&PolicyRecord> = rows
                .iter()
                .filter(|r| r.segment == Some(*segment))
                .map(|r| &records[r.row])
                .collect();
            if members.is_empty() {
                return None;
            }
            let column = |f: fn(&PolicyRecord) -> f64| -> Vec<f64> {
                members.iter().map(|r| f(r)).collect()
            };
            let premium = column(|r| r.annual_premium);
            Some(SegmentSummary {
                segment: *segment,
                count: members.len(),
                total_premium: stats::sum(&premium),
                mean_premium: stats::mean(&premium),
                mean_loss_ratio: stats::mean(&column(|r| r.loss_ratio)),
                mean_premium_adequacy: stats::mean(&column(|r| r.premium_adequacy)),
                total_reserve: stats::sum(&column(|r| r.reserve_amount)),
            })
        })
        .collect();

    let unassigned = rows.iter().filter(|r| r.segment.is_none()).count();
    let critical_count = rows
        .iter()
        .filter(|r| r.segment == Some(RiskSegment::Critical))
        .count();
    let high_risk_premium = summary
        .iter()
        .filter(|s| s.segment >= RiskSegment::High)
        .map(|s| s.total_premium)
        .sum();
    let critical_share = if rows.is_empty() {
        f64::NAN
    } else {
        critical_count as f64 / rows.len() as f64
    };

    info!(
        "Segmented {} policies ({} unassigned, {} critical)",
        rows.len(),
        unassigned,
        critical_count
    );

    Ok(SegmentationReport {
        rows,
        summary,
        unassigned,
        critical_count,
        high_risk_premium,
        critical_share,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{canonicalize, RawTable, RawValue};
    use approx::assert_relative_eq;

    fn table(rows: &[&[&str]]) -> CanonicalTable {
        let mut raw = RawTable::new(
            [
                "POL_NUMBER", "ANNUAL_PREM", "RES_GP_PUPS", "PREM_GP_PUPS", "EXP_GP_PUP",
                "ACT_GP_PUP",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        );
        for row in rows {
            raw.push_row(row.iter().map(|v| RawValue::from(*v)).collect());
        }
        canonicalize(&raw).unwrap()
    }

    #[test]
    fn test_bins_are_lower_inclusive() {
        let bins = RiskBins::default();
        assert_eq!(bins.classify(0.0), Some(RiskSegment::Low));
        assert_eq!(bins.classify(0.5), Some(RiskSegment::Medium));
        assert_eq!(bins.classify(1.0), Some(RiskSegment::High));
        assert_eq!(bins.classify(1.4999), Some(RiskSegment::High));
        assert_eq!(bins.classify(1.5), Some(RiskSegment::Critical));
        assert_eq!(bins.classify(1e9), Some(RiskSegment::Critical));
        assert_eq!(bins.classify(-0.1), None);
        assert_eq!(bins.classify(f64::NAN), None);
    }

    #[test]
    fn test_segment_summary_in_bin_order() {
        let t = table(&[
            // loss ratio 0.1, risk 10, eva 0.1 -> 0.04 + 0.03 + 0.03 = 0.10
            &["A", "1000", "100", "1000", "100", "10"],
            // loss ratio 2.0, risk 200, eva 2.0 -> 2.0
            &["B", "1000", "2000", "1000", "100", "200"],
            // NaN premium amount -> unassigned
            &["C", "1000", "100", "x", "100", "10"],
            &["D", "2000", "200", "2000", "100", "10"],
        ]);
        let report = segment_risk(&t, &SegmentationParams::default()).unwrap();

        assert_eq!(report.rows.len(), 4);
        assert_eq!(report.unassigned, 1);
        assert_eq!(report.rows[2].segment, None);
        let order: Vec<RiskSegment> = report.summary.iter().map(|s| s.segment).collect();
        assert_eq!(order, vec![RiskSegment::Low, RiskSegment::Critical]);

        let low = &report.summary[0];
        assert_eq!(low.count, 2);
        assert_eq!(low.total_premium, 3000.0);
        assert_eq!(low.mean_premium, 1500.0);
        assert_eq!(low.total_reserve, 300.0);
        assert_relative_eq!(low.mean_premium_adequacy, 1350.0);

        assert_eq!(report.critical_count, 1);
        assert_eq!(report.high_risk_premium, 1000.0);
        assert_relative_eq!(report.critical_share, 0.25);
    }

    #[test]
    fn test_invalid_weights_rejected() {
        let t = table(&[&["A", "1000", "100", "1000", "100", "10"]]);
        let params = SegmentationParams {
            weights: RiskWeights {
                loss_ratio: 0.5,
                risk_score: 0.5,
                expected_vs_actual: 0.5,
            },
            ..Default::default()
        };
        assert!(matches!(
            segment_risk(&t, &params),
            Err(AnalysisError::InvalidParameter { .. })
        ));
    }
}
