//! Anomaly detection with an isolation forest over standardized features
//!
//! Each tree isolates points by recursive random axis-aligned splits on a
//! subsample. Points that isolate in few splits are anomalous. Scores follow
//! the usual convention `-2^(-E[h(x)] / c(psi))`, so lower is more anomalous.

use super::{features, stats, DEFAULT_SEED};
use crate::error::{AnalysisError, Result};
use crate::policy::{CanonicalTable, Column};
use log::info;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Default feature set for anomaly scoring
pub const DEFAULT_ANOMALY_FEATURES: [Column; 4] = [
    Column::AnnualPremium,
    Column::LossRatio,
    Column::RiskScore,
    Column::ExpectedVsActual,
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyParams {
    pub features: Vec<Column>,
    /// Expected share of anomalous rows, in (0, 0.5]
    pub contamination: f64,
    pub n_trees: usize,
    /// Subsample size per tree (capped at the row count)
    pub max_samples: usize,
    pub seed: u64,
}

impl Default for AnomalyParams {
    fn default() -> Self {
        Self {
            features: DEFAULT_ANOMALY_FEATURES.to_vec(),
            contamination: 0.1,
            n_trees: 100,
            max_samples: 256,
            seed: DEFAULT_SEED,
        }
    }
}

impl AnomalyParams {
    fn validate(&self) -> Result<()> {
        if !(self.contamination > 0.0 && self.contamination <= 0.5) {
            return Err(AnalysisError::invalid(
                "contamination",
                format!("must be in (0, 0.5], got {}", self.contamination),
            ));
        }
        if self.n_trees == 0 {
            return Err(AnalysisError::invalid("n_trees", "must be at least 1"));
        }
        if self.max_samples < 2 {
            return Err(AnalysisError::invalid("max_samples", "must be at least 2"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnomalyRow {
    pub row: usize,
    pub policy_number: String,
    /// Lower is more anomalous
    pub score: f64,
    pub is_anomaly: bool,
    pub loss_ratio: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnomalyReport {
    /// One entry per canonical row, in table order
    pub rows: Vec<AnomalyRow>,
    pub features: Vec<Column>,
    /// Scores strictly below this are flagged
    pub threshold: f64,
    pub anomaly_count: usize,
    pub mean_anomaly_loss_ratio: f64,
    pub anomaly_premium: f64,
}

impl AnomalyReport {
    /// Flagged rows with the highest loss ratios
    pub fn top_by_loss_ratio(&self, n: usize) -> Vec<AnomalyRow> {
        let mut flagged: Vec<AnomalyRow> = self.rows.iter().filter(|r| r.is_anomaly).cloned().collect();
        flagged.sort_by(|a, b| stats::descending_nan_last(a.loss_ratio, b.loss_ratio));
        flagged.truncate(n);
        flagged
    }
}

enum Node {
    Leaf {
        size: usize,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

/// A single isolation tree stored as a node arena, root at index 0
struct IsolationTree {
    nodes: Vec<Node>,
}

impl IsolationTree {
    fn fit(data: &[Vec<f64>], sample: Vec<usize>, max_depth: usize, rng: &mut ChaCha20Rng) -> Self {
        let mut tree = IsolationTree { nodes: Vec::new() };
        tree.grow(data, sample, 0, max_depth, rng);
        tree
    }

    fn grow(
        &mut self,
        data: &[Vec<f64>],
        rows: Vec<usize>,
        depth: usize,
        max_depth: usize,
        rng: &mut ChaCha20Rng,
    ) -> usize {
        let id = self.nodes.len();
        self.nodes.push(Node::Leaf { size: rows.len() });
        if depth >= max_depth || rows.len() <= 1 {
            return id;
        }

        // Only features that still vary within the node can split it
        let n_features = data[0].len();
        let spans: Vec<(usize, f64, f64)> = (0..n_features)
            .filter_map(|f| {
                let (lo, hi) = rows.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &r| {
                    (lo.min(data[r][f]), hi.max(data[r][f]))
                });
                (lo < hi).then_some((f, lo, hi))
            })
            .collect();
        if spans.is_empty() {
            return id;
        }

        let (feature, lo, hi) = spans[rng.random_range(0..spans.len())];
        let threshold = rng.random_range(lo..hi);
        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) =
            rows.into_iter().partition(|&r| data[r][feature] < threshold);

        let left = self.grow(data, left_rows, depth + 1, max_depth, rng);
        let right = self.grow(data, right_rows, depth + 1, max_depth, rng);
        self.nodes[id] = Node::Split {
            feature,
            threshold,
            left,
            right,
        };
        id
    }

    fn path_length(&self, x: &[f64]) -> f64 {
        let mut node = 0;
        let mut depth = 0.0;
        loop {
            match &self.nodes[node] {
                Node::Leaf { size } => return depth + average_path_length(*size),
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    node = if x[*feature] < *threshold { *left } else { *right };
                    depth += 1.0;
                }
            }
        }
    }
}

/// Expected path length of an unsuccessful BST search over `n` points
fn average_path_length(n: usize) -> f64 {
    const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

/// Score every row and flag the `contamination` share with the lowest scores.
///
/// The canonical table is not modified; results come back as a parallel vector.
pub fn detect_anomalies(table: &CanonicalTable, params: &AnomalyParams) -> Result<AnomalyReport> {
    params.validate()?;
    let matrix = features::prepare(table, &params.features)?.standardized();
    let n = matrix.n_rows();
    if n < 2 {
        return Err(AnalysisError::InsufficientData {
            required: 2,
            actual: n,
        });
    }

    let psi = params.max_samples.min(n);
    let max_depth = (psi as f64).log2().ceil() as usize;

    let mut master = ChaCha20Rng::seed_from_u64(params.seed);
    let tree_seeds: Vec<u64> = (0..params.n_trees).map(|_| master.random()).collect();

    let trees: Vec<IsolationTree> = tree_seeds
        .par_iter()
        .map(|&seed| {
            let mut rng = ChaCha20Rng::seed_from_u64(seed);
            let sample = index::sample(&mut rng, n, psi).into_vec();
            IsolationTree::fit(&matrix.rows, sample, max_depth, &mut rng)
        })
        .collect();

    let normalizer = average_path_length(psi);
    let scores: Vec<f64> = matrix
        .rows
        .par_iter()
        .map(|x| {
            let mean_path =
                trees.iter().map(|t| t.path_length(x)).sum::<f64>() / trees.len() as f64;
            -(2f64.powf(-mean_path / normalizer))
        })
        .collect();

    let threshold = stats::quantile(&scores, params.contamination);
    let records = table.records();
    let rows: Vec<AnomalyRow> = scores
        .iter()
        .enumerate()
        .map(|(row, &score)| AnomalyRow {
            row,
            policy_number: records[row].policy_number.clone(),
            score,
            is_anomaly: score < threshold,
            loss_ratio: records[row].loss_ratio,
        })
        .collect();

    let flagged: Vec<&AnomalyRow> = rows.iter().filter(|r| r.is_anomaly).collect();
    let flagged_loss_ratio: Vec<f64> = flagged.iter().map(|r| r.loss_ratio).collect();
    let flagged_premium: Vec<f64> = flagged.iter().map(|r| records[r.row].annual_premium).collect();
    let anomaly_count = flagged.len();

    info!(
        "Isolation forest flagged {} of {} policies (threshold {:.4})",
        anomaly_count,
        n,
        threshold
    );

    Ok(AnomalyReport {
        rows,
        features: matrix.columns,
        threshold,
        anomaly_count,
        mean_anomaly_loss_ratio: stats::mean(&flagged_loss_ratio),
        anomaly_premium: stats::sum(&flagged_premium),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{canonicalize, RawTable, RawValue};

    /// Forty ordinary policies plus two extreme ones at the end
    fn table() -> CanonicalTable {
        let mut raw = RawTable::new(
            ["POL_NUMBER", "ANNUAL_PREM", "RES_GP_PUPS", "PREM_GP_PUPS", "EXP_GP_PUP", "ACT_GP_PUP"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );
        for i in 0..40 {
            let premium = 1000.0 + (i % 7) as f64 * 25.0;
            let reserve = 500.0 + (i % 5) as f64 * 20.0;
            raw.push_row(vec![
                RawValue::from(format!("P{i}").as_str()),
                premium.into(),
                reserve.into(),
                premium.into(),
                100.0.into(),
                (95.0 + (i % 3) as f64 * 5.0).into(),
            ]);
        }
        raw.push_row(vec!["X1".into(), 1000.0.into(), 90_000.0.into(), 1000.0.into(), 100.0.into(), 900.0.into()]);
        raw.push_row(vec!["X2".into(), 50_000.0.into(), 100.0.into(), 50_000.0.into(), 100.0.into(), 5.0.into()]);
        canonicalize(&raw).unwrap()
    }

    #[test]
    fn test_average_path_length() {
        assert_eq!(average_path_length(1), 0.0);
        assert_eq!(average_path_length(2), 1.0);
        assert!(average_path_length(256) > average_path_length(16));
    }

    #[test]
    fn test_extreme_policies_score_lowest() {
        let t = table();
        let report = detect_anomalies(&t, &AnomalyParams::default()).unwrap();

        assert_eq!(report.rows.len(), t.len());
        assert!(report.rows[40].is_anomaly);
        assert!(report.rows[41].is_anomaly);
        let ordinary_min = report.rows[..40]
            .iter()
            .map(|r| r.score)
            .fold(f64::INFINITY, f64::min);
        assert!(report.rows[40].score < ordinary_min);
        assert!(report.rows[41].score < ordinary_min);
        assert!(report.anomaly_count <= 5);

        let top = report.top_by_loss_ratio(1);
        assert_eq!(top[0].policy_number, "X1");
    }

    #[test]
    fn test_contamination_sets_flag_count() {
        let mut raw = RawTable::new(
            ["POL_NUMBER", "ANNUAL_PREM", "RES_GP_PUPS", "PREM_GP_PUPS", "EXP_GP_PUP", "ACT_GP_PUP"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );
        // Each coordinate is a permutation of 0..100, so no two rows coincide
        for i in 0..100usize {
            let premium = 1000.0 + ((i * 7919) % 100) as f64 * 50.0;
            let reserve = 500.0 + ((i * 104_729) % 100) as f64 * 13.0;
            let claims = 50.0 + ((i * 31) % 100) as f64 * 3.0;
            raw.push_row(vec![
                RawValue::from(format!("P{i}").as_str()),
                premium.into(),
                reserve.into(),
                premium.into(),
                100.0.into(),
                claims.into(),
            ]);
        }
        let t = canonicalize(&raw).unwrap();
        let params = AnomalyParams {
            contamination: 0.1,
            ..Default::default()
        };
        let report = detect_anomalies(&t, &params).unwrap();

        assert_eq!(report.anomaly_count, 10);
        assert_eq!(report.rows.iter().filter(|r| r.is_anomaly).count(), 10);
        for row in &report.rows {
            assert_eq!(row.is_anomaly, row.score < report.threshold, "row {}", row.row);
        }
    }

    #[test]
    fn test_top_rows_survive_filtering_the_table() {
        let t = table();
        let report = detect_anomalies(&t, &AnomalyParams::default()).unwrap();
        let filtered = t.filter(&crate::policy::PolicyFilter {
            min_annual_premium: Some(40_000.0),
            ..Default::default()
        });
        assert_eq!(filtered.len(), 1);

        let top = report.top_by_loss_ratio(report.anomaly_count);
        assert_eq!(top.len(), report.anomaly_count);
        assert!(top.windows(2).all(|w| w[0].loss_ratio >= w[1].loss_ratio));
        assert_eq!(top.iter().find(|r| r.policy_number == "X1").map(|r| r.loss_ratio), Some(t.records()[40].loss_ratio));
    }

    #[test]
    fn test_fixed_seed_is_reproducible() {
        let t = table();
        let a = detect_anomalies(&t, &AnomalyParams::default()).unwrap();
        let b = detect_anomalies(&t, &AnomalyParams::default()).unwrap();
        let scores_a: Vec<u64> = a.rows.iter().map(|r| r.score.to_bits()).collect();
        let scores_b: Vec<u64> = b.rows.iter().map(|r| r.score.to_bits()).collect();
        assert_eq!(scores_a, scores_b);
    }

    #[test]
    fn test_rejects_bad_contamination() {
        let params = AnomalyParams {
            contamination: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            detect_anomalies(&table(), &params),
            Err(AnalysisError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_requires_two_features() {
        let params = AnomalyParams {
            features: vec![Column::AnnualPremium, Column::NzReserve],
            ..Default::default()
        };
        assert!(matches!(
            detect_anomalies(&table(), &params),
            Err(AnalysisError::InsufficientFeatures { .. })
        ));
    }
}
