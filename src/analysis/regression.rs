//! Reserve prediction with a random forest regressor
//!
//! Rows are split into train and holdout sets by a seeded shuffle. Each tree
//! is a fully grown CART tree on a bootstrap sample of the training rows;
//! predictions are the mean over trees.

use super::{features, stats, DEFAULT_SEED};
use crate::error::{AnalysisError, Result};
use crate::policy::{CanonicalTable, Column};
use log::{debug, info};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Default predictors for the reserve model
pub const DEFAULT_REGRESSION_FEATURES: [Column; 4] = [
    Column::AnnualPremium,
    Column::ExpectedClaims,
    Column::ActualClaims,
    Column::PremiumAmount,
];

const MIN_SPLIT: usize = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionParams {
    pub features: Vec<Column>,
    pub target: Column,
    /// Share of rows held out for evaluation, in (0, 1)
    pub test_fraction: f64,
    pub n_trees: usize,
    pub seed: u64,
}

impl Default for RegressionParams {
    fn default() -> Self {
        Self {
            features: DEFAULT_REGRESSION_FEATURES.to_vec(),
            target: Column::ReserveAmount,
            test_fraction: 0.2,
            n_trees: 100,
            seed: DEFAULT_SEED,
        }
    }
}

impl RegressionParams {
    fn validate(&self) -> Result<()> {
        if !(self.test_fraction > 0.0 && self.test_fraction < 1.0) {
            return Err(AnalysisError::invalid(
                "test_fraction",
                format!("must be in (0, 1), got {}", self.test_fraction),
            ));
        }
        if self.n_trees == 0 {
            return Err(AnalysisError::invalid("n_trees", "must be at least 1"));
        }
        if self.features.contains(&self.target) {
            return Err(AnalysisError::invalid(
                "features",
                format!("target {} cannot also be a feature", self.target),
            ));
        }
        Ok(())
    }

    fn holdout_size(&self, n: usize) -> usize {
        (self.test_fraction * n as f64).ceil() as usize
    }

    /// Smallest row count that leaves both splits non-empty.
    ///
    /// `ceil(f * n) < n` holds once `n >= 1 / (1 - f)`; nearby candidates are
    /// checked to absorb rounding in the product.
    fn min_rows(&self) -> usize {
        let estimate = (1.0 / (1.0 - self.test_fraction)).ceil();
        let estimate = if estimate.is_finite() && estimate < usize::MAX as f64 {
            (estimate as usize).max(2)
        } else {
            usize::MAX
        };
        let first = estimate.saturating_sub(2).max(2);
        (first..=estimate.saturating_add(2))
            .find(|&n| self.holdout_size(n) < n)
            .unwrap_or(estimate)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HoldoutPrediction {
    pub row: usize,
    pub policy_number: String,
    pub actual: f64,
    pub predicted: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegressionReport {
    pub target: Column,
    pub features: Vec<Column>,
    pub r2: f64,
    pub rmse: f64,
    pub mse: f64,
    pub mae: f64,
    /// `100 - mean |error| / mean(actual) * 100`
    pub accuracy: f64,
    /// Non-negative, sums to 1, in feature order
    pub feature_importances: Vec<(Column, f64)>,
    pub most_important_feature: Option<Column>,
    /// Holdout rows in table order
    pub holdout: Vec<HoldoutPrediction>,
    pub train_rows: usize,
}

enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

struct RegressionTree {
    nodes: Vec<Node>,
    /// Unnormalized impurity decrease per feature
    decrease: Vec<f64>,
}

struct BestSplit {
    feature: usize,
    threshold: f64,
    gain: f64,
}

/// Sum of squared deviations from the mean
fn sse(values: impl Iterator<Item = f64>) -> f64 {
    let (n, sum, sum_sq) = values.fold((0.0, 0.0, 0.0), |(n, s, q), v| (n + 1.0, s + v, q + v * v));
    if n == 0.0 {
        0.0
    } else {
        (sum_sq - sum * sum / n).max(0.0)
    }
}

impl RegressionTree {
    fn fit(x: &[Vec<f64>], y: &[f64], sample: Vec<usize>, rng: &mut ChaCha20Rng) -> Self {
        let mut tree = RegressionTree {
            nodes: Vec::new(),
            decrease: vec![0.0; x.first().map_or(0, |r| r.len())],
        };
        tree.grow(x, y, sample, rng);
        tree
    }

    fn grow(&mut self, x: &[Vec<f64>], y: &[f64], rows: Vec<usize>, rng: &mut ChaCha20Rng) -> usize {
        let id = self.nodes.len();
        let value = rows.iter().map(|&r| y[r]).sum::<f64>() / rows.len() as f64;
        self.nodes.push(Node::Leaf { value });

        let impurity = sse(rows.iter().map(|&r| y[r]));
        if rows.len() < MIN_SPLIT || impurity <= 0.0 {
            return id;
        }

        let mut order: Vec<usize> = (0..self.decrease.len()).collect();
        order.shuffle(rng);

        let Some(best) = best_split(x, y, &rows, &order, impurity) else {
            return id;
        };

        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) =
            rows.into_iter().partition(|&r| x[r][best.feature] <= best.threshold);
        self.decrease[best.feature] += best.gain;

        let left = self.grow(x, y, left_rows, rng);
        let right = self.grow(x, y, right_rows, rng);
        self.nodes[id] = Node::Split {
            feature: best.feature,
            threshold: best.threshold,
            left,
            right,
        };
        id
    }

    fn predict(&self, x: &[f64]) -> f64 {
        let mut node = 0;
        loop {
            match &self.nodes[node] {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => node = if x[*feature] <= *threshold { *left } else { *right },
            }
        }
    }

    /// Impurity decrease shares for this tree, or `None` if it never split
    fn normalized_importances(&self) -> Option<Vec<f64>> {
        let total: f64 = self.decrease.iter().sum();
        (total > 0.0).then(|| self.decrease.iter().map(|d| d / total).collect())
    }
}

/// Best variance-reducing split over `features`, visited in the given order.
///
/// Only strictly better gains replace the current best, so earlier features win ties.
fn best_split(
    x: &[Vec<f64>],
    y: &[f64],
    rows: &[usize],
    features: &[usize],
    impurity: f64,
) -> Option<BestSplit> {
    let n = rows.len() as f64;
    let total_sum: f64 = rows.iter().map(|&r| y[r]).sum();
    let total_sq: f64 = rows.iter().map(|&r| y[r] * y[r]).sum();
    let mut best: Option<BestSplit> = None;

    for &feature in features {
        let mut sorted = rows.to_vec();
        sorted.sort_by(|&a, &b| x[a][feature].total_cmp(&x[b][feature]));

        let (mut left_sum, mut left_sq) = (0.0, 0.0);
        for i in 0..sorted.len() - 1 {
            let yi = y[sorted[i]];
            left_sum += yi;
            left_sq += yi * yi;

            let here = x[sorted[i]][feature];
            let next = x[sorted[i + 1]][feature];
            if here >= next {
                continue;
            }

            let nl = (i + 1) as f64;
            let nr = n - nl;
            let right_sum = total_sum - left_sum;
            let right_sq = total_sq - left_sq;
            let child = (left_sq - left_sum * left_sum / nl) + (right_sq - right_sum * right_sum / nr);
            let gain = impurity - child.max(0.0);

            if gain > 0.0 && best.as_ref().map_or(true, |b| gain > b.gain) {
                let mut threshold = here + (next - here) / 2.0;
                if threshold >= next {
                    threshold = here;
                }
                best = Some(BestSplit {
                    feature,
                    threshold,
                    gain,
                });
            }
        }
    }
    best
}

/// Fit the forest on a seeded split and evaluate it on the holdout rows
pub fn fit_predict(table: &CanonicalTable, params: &RegressionParams) -> Result<RegressionReport> {
    params.validate()?;
    if !features::is_usable(table, params.target) {
        return Err(AnalysisError::Schema {
            column: params.target.name().to_string(),
        });
    }
    let matrix = features::prepare(table, &params.features)?;
    let target = features::impute_mean(&table.numeric(params.target));

    let n = matrix.n_rows();
    let holdout_n = params.holdout_size(n);
    if n < 2 || holdout_n == 0 || holdout_n >= n {
        return Err(AnalysisError::InsufficientData {
            required: params.min_rows(),
            actual: n,
        });
    }

    let mut master = ChaCha20Rng::seed_from_u64(params.seed);
    let mut shuffled: Vec<usize> = (0..n).collect();
    shuffled.shuffle(&mut master);
    let mut test_idx = shuffled[..holdout_n].to_vec();
    let mut train_idx = shuffled[holdout_n..].to_vec();
    test_idx.sort_unstable();
    train_idx.sort_unstable();

    let x_train: Vec<Vec<f64>> = train_idx.iter().map(|&i| matrix.rows[i].clone()).collect();
    let y_train: Vec<f64> = train_idx.iter().map(|&i| target[i]).collect();
    debug!(
        "Training forest of {} trees on {} rows, holding out {}",
        params.n_trees,
        train_idx.len(),
        holdout_n
    );

    let tree_seeds: Vec<u64> = (0..params.n_trees).map(|_| master.random()).collect();
    let trees: Vec<RegressionTree> = tree_seeds
        .par_iter()
        .map(|&seed| {
            let mut rng = ChaCha20Rng::seed_from_u64(seed);
            let m = x_train.len();
            let bootstrap: Vec<usize> = (0..m).map(|_| rng.random_range(0..m)).collect();
            RegressionTree::fit(&x_train, &y_train, bootstrap, &mut rng)
        })
        .collect();

    let records = table.records();
    let holdout: Vec<HoldoutPrediction> = test_idx
        .iter()
        .map(|&i| {
            let predicted = trees.iter().map(|t| t.predict(&matrix.rows[i])).sum::<f64>()
                / trees.len() as f64;
            HoldoutPrediction {
                row: i,
                policy_number: records[i].policy_number.clone(),
                actual: target[i],
                predicted,
            }
        })
        .collect();

    let actual: Vec<f64> = holdout.iter().map(|h| h.actual).collect();
    let errors: Vec<f64> = holdout.iter().map(|h| h.predicted - h.actual).collect();
    let mse = stats::mean(&errors.iter().map(|e| e * e).collect::<Vec<_>>());
    let mae = stats::mean(&errors.iter().map(|e| e.abs()).collect::<Vec<_>>());
    let mean_actual = stats::mean(&actual);
    let ss_res: f64 = errors.iter().map(|e| e * e).sum();
    let ss_tot: f64 = actual.iter().map(|a| (a - mean_actual).powi(2)).sum();
    let r2 = if ss_tot > 0.0 {
        1.0 - ss_res / ss_tot
    } else if ss_res == 0.0 {
        1.0
    } else {
        0.0
    };

    let feature_importances = importances(&trees, &matrix.columns);
    let most_important_feature = feature_importances
        .iter()
        .fold(None::<&(Column, f64)>, |best, cur| match best {
            Some(b) if b.1 >= cur.1 => Some(b),
            _ => Some(cur),
        })
        .map(|(c, _)| *c);

    info!(
        "Random forest on {}: R2 {:.4}, RMSE {:.4} over {} holdout rows",
        params.target, r2, mse.sqrt(), holdout_n
    );

    Ok(RegressionReport {
        target: params.target,
        features: matrix.columns,
        r2,
        rmse: mse.sqrt(),
        mse,
        mae,
        accuracy: 100.0 - mae / mean_actual * 100.0,
        feature_importances,
        most_important_feature,
        holdout,
        train_rows: train_idx.len(),
    })
}

/// Mean of per-tree normalized decreases, renormalized; uniform if nothing split
fn importances(trees: &[RegressionTree], columns: &[Column]) -> Vec<(Column, f64)> {
    let mut totals = vec![0.0; columns.len()];
    for shares in trees.iter().filter_map(RegressionTree::normalized_importances) {
        for (t, s) in totals.iter_mut().zip(shares) {
            *t += s;
        }
    }
    let sum: f64 = totals.iter().sum();
    let weights: Vec<f64> = if sum > 0.0 {
        totals.iter().map(|t| t / sum).collect()
    } else {
        vec![1.0 / columns.len() as f64; columns.len()]
    };
    columns.iter().copied().zip(weights).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{canonicalize, RawTable, RawValue};
    use approx::assert_relative_eq;

    /// Reserve tracks actual claims closely; premium is noise
    fn table(n: usize) -> CanonicalTable {
        let mut raw = RawTable::new(
            ["POL_NUMBER", "ANNUAL_PREM", "RES_GP_PUPS", "PREM_GP_PUPS", "EXP_GP_PUP", "ACT_GP_PUP"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );
        for i in 0..n {
            let claims = 50.0 + i as f64 * 10.0;
            let premium = 1000.0 + ((i * 37) % 11) as f64 * 10.0;
            raw.push_row(vec![
                RawValue::from(format!("P{i}").as_str()),
                premium.into(),
                (claims * 5.0).into(),
                premium.into(),
                100.0.into(),
                claims.into(),
            ]);
        }
        canonicalize(&raw).unwrap()
    }

    #[test]
    fn test_holdout_size_and_order() {
        let t = table(23);
        let report = fit_predict(&t, &RegressionParams::default()).unwrap();
        assert_eq!(report.holdout.len(), 5);
        assert_eq!(report.train_rows, 18);
        assert!(report.holdout.windows(2).all(|w| w[0].row < w[1].row));
    }

    #[test]
    fn test_importances_sum_to_one() {
        let report = fit_predict(&table(40), &RegressionParams::default()).unwrap();
        let total: f64 = report.feature_importances.iter().map(|(_, w)| w).sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-9);
        assert!(report.feature_importances.iter().all(|(_, w)| *w >= 0.0));

        let order: Vec<Column> = report.feature_importances.iter().map(|(c, _)| *c).collect();
        assert_eq!(order, report.features);
        assert_eq!(report.most_important_feature, Some(Column::ActualClaims));
        assert!(report.r2 > 0.8);
    }

    #[test]
    fn test_repeated_fits_are_bit_identical() {
        let t = table(30);
        let a = fit_predict(&t, &RegressionParams::default()).unwrap();
        let b = fit_predict(&t, &RegressionParams::default()).unwrap();
        assert_eq!(a.r2.to_bits(), b.r2.to_bits());
        assert_eq!(a.rmse.to_bits(), b.rmse.to_bits());
    }

    #[test]
    fn test_constant_target_gets_uniform_importances() {
        let mut raw = RawTable::new(
            ["POL_NUMBER", "ANNUAL_PREM", "RES_GP_PUPS", "PREM_GP_PUPS", "EXP_GP_PUP", "ACT_GP_PUP"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );
        for i in 0..10 {
            let v = 100.0 + i as f64;
            raw.push_row(vec![RawValue::from(format!("P{i}").as_str()), v.into(), 7.0.into(), v.into(), v.into(), v.into()]);
        }
        let t = canonicalize(&raw).unwrap();
        let report = fit_predict(&t, &RegressionParams::default()).unwrap();
        assert!(report.feature_importances.iter().all(|(_, w)| (*w - 0.25).abs() < 1e-12));
        assert_eq!(report.r2, 1.0);
    }

    #[test]
    fn test_too_small_for_split() {
        let err = fit_predict(&table(1), &RegressionParams::default()).unwrap_err();
        assert!(matches!(err, AnalysisError::InsufficientData { required: 2, actual: 1 }));
    }

    #[test]
    fn test_minimum_rows_for_split() {
        let with = |test_fraction| RegressionParams {
            test_fraction,
            ..Default::default()
        };
        assert_eq!(with(0.2).min_rows(), 2);
        assert_eq!(with(0.5).min_rows(), 2);
        assert_eq!(with(0.75).min_rows(), 4);
        assert_eq!(with(0.9).min_rows(), 10);
    }

    #[test]
    fn test_near_one_test_fraction_fails_fast() {
        let params = RegressionParams {
            test_fraction: 0.999999999,
            ..Default::default()
        };
        match fit_predict(&table(10), &params).unwrap_err() {
            AnalysisError::InsufficientData { required, actual } => {
                assert_eq!(actual, 10);
                assert!(required > 100_000_000);
            }
            other => panic!("unexpected error: {other}"),
        }

        let params = RegressionParams {
            test_fraction: 0.9999999999999999,
            ..Default::default()
        };
        assert!(matches!(
            fit_predict(&table(10), &params),
            Err(AnalysisError::InsufficientData { .. })
        ));
    }

    #[test]
    fn test_missing_target_is_schema_error() {
        let params = RegressionParams {
            target: Column::NzReserve,
            ..Default::default()
        };
        assert!(matches!(
            fit_predict(&table(10), &params),
            Err(AnalysisError::Schema { .. })
        ));
    }
}
