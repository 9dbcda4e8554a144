//! K-means segmentation of policies over standardized features

use super::features::{self, FeatureMatrix};
use super::projection::{principal_components, Projection};
use super::{stats, DEFAULT_SEED};
use crate::error::{AnalysisError, Result};
use crate::policy::{CanonicalTable, Column, PolicyRecord};
use log::{debug, info};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Default feature set for clustering
pub const DEFAULT_CLUSTER_FEATURES: [Column; 4] = [
    Column::AnnualPremium,
    Column::LossRatio,
    Column::RiskScore,
    Column::ExpectedVsActual,
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterParams {
    pub features: Vec<Column>,
    pub k: usize,
    /// Independent k-means++ initializations; the lowest inertia wins
    pub restarts: usize,
    pub max_iter: usize,
    /// Convergence threshold on centroid movement, relative to mean feature variance
    pub tolerance: f64,
    pub seed: u64,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            features: DEFAULT_CLUSTER_FEATURES.to_vec(),
            k: 4,
            restarts: 10,
            max_iter: 300,
            tolerance: 1e-4,
            seed: DEFAULT_SEED,
        }
    }
}

impl ClusterParams {
    fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(AnalysisError::invalid("k", "must be at least 1"));
        }
        if self.restarts == 0 {
            return Err(AnalysisError::invalid("restarts", "must be at least 1"));
        }
        if self.max_iter == 0 {
            return Err(AnalysisError::invalid("max_iter", "must be at least 1"));
        }
        Ok(())
    }
}

/// Display name for a cluster id: A, B, C, ...
pub fn cluster_label(cluster: usize) -> String {
    match u8::try_from(cluster) {
        Ok(id) if id < 26 => format!("Premium Segment {}", (b'A' + id) as char),
        _ => format!("Premium Segment {}", cluster + 1),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterSummary {
    pub cluster: usize,
    pub label: String,
    pub count: usize,
    pub mean_premium: f64,
    pub total_premium: f64,
    pub mean_loss_ratio: f64,
    pub mean_risk_score: f64,
    pub mean_premium_adequacy: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterReport {
    /// Cluster id per canonical row, in table order
    pub cluster_ids: Vec<usize>,
    /// One entry per cluster id, ascending
    pub summary: Vec<ClusterSummary>,
    pub projection: Projection,
    pub features: Vec<Column>,
    /// Centroids in standardized feature space
    pub centroids: Vec<Vec<f64>>,
    pub inertia: f64,
    pub iterations: usize,
    pub best_cluster: Option<usize>,
    pub worst_cluster: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ElbowPoint {
    pub k: usize,
    pub inertia: f64,
}

struct KMeansFit {
    labels: Vec<usize>,
    centroids: Vec<Vec<f64>>,
    inertia: f64,
    iterations: usize,
}

fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Nearest centroid and its squared distance; ties go to the lower id
fn nearest(point: &[f64], centroids: &[Vec<f64>]) -> (usize, f64) {
    centroids
        .iter()
        .enumerate()
        .map(|(c, centroid)| (c, squared_distance(point, centroid)))
        .fold((0, f64::INFINITY), |best, cur| if cur.1 < best.1 { cur } else { best })
}

/// Draw an index with probability proportional to `weights`
fn weighted_pick(weights: &[f64], rng: &mut ChaCha20Rng) -> usize {
    let total: f64 = weights.iter().sum();
    if !(total > 0.0) {
        return rng.random_range(0..weights.len());
    }
    let target = rng.random::<f64>() * total;
    let mut acc = 0.0;
    for (i, w) in weights.iter().enumerate() {
        acc += w;
        if acc > target {
            return i;
        }
    }
    weights.len() - 1
}

/// Greedy k-means++ seeding: several candidates per step, keep the one that
/// lowers the total squared distance the most
fn kmeans_plus_plus(data: &[Vec<f64>], k: usize, rng: &mut ChaCha20Rng) -> Vec<Vec<f64>> {
    let n = data.len();
    let local_trials = 2 + (k as f64).ln().floor() as usize;

    let mut centroids = vec![data[rng.random_range(0..n)].clone()];
    let mut closest: Vec<f64> = data
        .iter()
        .map(|x| squared_distance(x, &centroids[0]))
        .collect();

    while centroids.len() < k {
        let mut best: Option<(usize, f64, Vec<f64>)> = None;
        for _ in 0..local_trials {
            let candidate = weighted_pick(&closest, rng);
            let updated: Vec<f64> = data
                .iter()
                .zip(&closest)
                .map(|(x, d)| d.min(squared_distance(x, &data[candidate])))
                .collect();
            let potential: f64 = updated.iter().sum();
            if best.as_ref().map_or(true, |(_, p, _)| potential < *p) {
                best = Some((candidate, potential, updated));
            }
        }
        if let Some((candidate, _, updated)) = best {
            centroids.push(data[candidate].clone());
            closest = updated;
        }
    }
    centroids
}

/// One Lloyd run from a k-means++ start
fn kmeans_once(data: &[Vec<f64>], k: usize, max_iter: usize, tol: f64, seed: u64) -> KMeansFit {
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    let dims = data[0].len();
    let mut centroids = kmeans_plus_plus(data, k, &mut rng);
    let mut labels = vec![0usize; data.len()];
    let mut iterations = 0;

    for iter in 1..=max_iter {
        iterations = iter;
        let assigned: Vec<(usize, f64)> = data.iter().map(|x| nearest(x, &centroids)).collect();
        for (label, (c, _)) in labels.iter_mut().zip(&assigned) {
            *label = *c;
        }

        let mut sums = vec![vec![0.0; dims]; k];
        let mut counts = vec![0usize; k];
        for (x, &c) in data.iter().zip(&labels) {
            counts[c] += 1;
            for (s, v) in sums[c].iter_mut().zip(x) {
                *s += v;
            }
        }

        // Reseed empty clusters at the points farthest from their centroid
        let mut far: Vec<usize> = (0..data.len()).collect();
        far.sort_by(|&a, &b| assigned[b].1.total_cmp(&assigned[a].1));
        let mut far_iter = far.into_iter();
        for c in 0..k {
            if counts[c] > 0 {
                continue;
            }
            if let Some(i) = far_iter.find(|&i| counts[labels[i]] > 1) {
                let old = labels[i];
                counts[old] -= 1;
                for (s, v) in sums[old].iter_mut().zip(&data[i]) {
                    *s -= v;
                }
                labels[i] = c;
                counts[c] = 1;
                sums[c] = data[i].clone();
            }
        }

        let updated: Vec<Vec<f64>> = (0..k)
            .map(|c| {
                if counts[c] == 0 {
                    centroids[c].clone()
                } else {
                    sums[c].iter().map(|s| s / counts[c] as f64).collect()
                }
            })
            .collect();

        let shift: f64 = centroids
            .iter()
            .zip(&updated)
            .map(|(a, b)| squared_distance(a, b))
            .sum();
        centroids = updated;
        if shift <= tol {
            break;
        }
    }

    // Final assignment against the converged centroids
    let mut inertia = 0.0;
    for (label, x) in labels.iter_mut().zip(data) {
        let (c, d) = nearest(x, &centroids);
        *label = c;
        inertia += d;
    }

    KMeansFit {
        labels,
        centroids,
        inertia,
        iterations,
    }
}

/// Number of distinct feature vectors; duplicates cannot seed separate clusters
fn distinct_rows(matrix: &FeatureMatrix) -> usize {
    matrix
        .rows
        .iter()
        .map(|row| row.iter().map(|v| (v + 0.0).to_bits()).collect::<Vec<u64>>())
        .collect::<HashSet<_>>()
        .len()
}

/// Best of `restarts` seeded runs; ties keep the earliest restart
fn fit_kmeans(matrix: &FeatureMatrix, params: &ClusterParams, k: usize) -> Result<KMeansFit> {
    let distinct = distinct_rows(matrix);
    if distinct < k {
        return Err(AnalysisError::InsufficientData {
            required: k,
            actual: distinct,
        });
    }

    let mean_variance = stats::mean(
        &(0..matrix.n_features())
            .map(|j| stats::population_std(&matrix.column_values(j)).powi(2))
            .collect::<Vec<_>>(),
    );
    let tol = params.tolerance * mean_variance;

    let mut master = ChaCha20Rng::seed_from_u64(params.seed);
    let seeds: Vec<u64> = (0..params.restarts).map(|_| master.random()).collect();

    let fits: Vec<KMeansFit> = seeds
        .par_iter()
        .map(|&seed| kmeans_once(&matrix.rows, k, params.max_iter, tol, seed))
        .collect();

    fits.into_iter()
        .min_by(|a, b| a.inertia.total_cmp(&b.inertia))
        .ok_or(AnalysisError::InsufficientData {
            required: 1,
            actual: 0,
        })
}

/// Assign every policy to one of `k` clusters and summarize each cluster
pub fn cluster(table: &CanonicalTable, params: &ClusterParams) -> Result<ClusterReport> {
    params.validate()?;
    let matrix = features::prepare(table, &params.features)?.standardized();
    let fit = fit_kmeans(&matrix, params, params.k)?;
    let projection = principal_components(&matrix);

    let records = table.records();
    let summary: Vec<ClusterSummary> = (0..params.k)
        .map(|c| {
            let members: Vec<&PolicyRecord> = fit
                .labels
                .iter()
                .zip(records)
                .filter(|(label, _)| **label == c)
                .map(|(_, r)| r)
                .collect();
            let column = |f: fn(&PolicyRecord) -> f64| -> Vec<f64> {
                members.iter().map(|r| f(r)).collect()
            };
            let premium = column(|r| r.annual_premium);
            ClusterSummary {
                cluster: c,
                label: cluster_label(c),
                count: members.len(),
                mean_premium: stats::mean(&premium),
                total_premium: stats::sum(&premium),
                mean_loss_ratio: stats::mean(&column(|r| r.loss_ratio)),
                mean_risk_score: stats::mean(&column(|r| r.risk_score)),
                mean_premium_adequacy: stats::mean(&column(|r| r.premium_adequacy)),
            }
        })
        .collect();

    let by_loss_ratio: Vec<&ClusterSummary> =
        summary.iter().filter(|s| !s.mean_loss_ratio.is_nan()).collect();
    let best_cluster = by_loss_ratio
        .iter()
        .min_by(|a, b| a.mean_loss_ratio.total_cmp(&b.mean_loss_ratio))
        .map(|s| s.cluster);
    let worst_cluster = by_loss_ratio
        .iter()
        .max_by(|a, b| a.mean_loss_ratio.total_cmp(&b.mean_loss_ratio))
        .map(|s| s.cluster);

    info!(
        "K-means with k={} converged in {} iterations (inertia {:.4})",
        params.k, fit.iterations, fit.inertia
    );

    Ok(ClusterReport {
        cluster_ids: fit.labels,
        summary,
        projection,
        features: matrix.columns,
        centroids: fit.centroids,
        inertia: fit.inertia,
        iterations: fit.iterations,
        best_cluster,
        worst_cluster,
    })
}

/// Inertia for each k in `k_values`, skipping any k larger than the number of distinct rows
pub fn elbow_curve(
    table: &CanonicalTable,
    params: &ClusterParams,
    k_values: std::ops::RangeInclusive<usize>,
) -> Result<Vec<ElbowPoint>> {
    params.validate()?;
    let matrix = features::prepare(table, &params.features)?.standardized();

    let distinct = distinct_rows(&matrix);
    let mut points = Vec::new();
    for k in k_values.filter(|k| *k >= 1 && *k <= distinct) {
        let fit = fit_kmeans(&matrix, params, k)?;
        debug!("Elbow k={} inertia={:.4}", k, fit.inertia);
        points.push(ElbowPoint {
            k,
            inertia: fit.inertia,
        });
    }
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{canonicalize, RawTable, RawValue};

    /// Three well separated groups of policies
    fn table() -> CanonicalTable {
        let mut raw = RawTable::new(
            ["POL_NUMBER", "ANNUAL_PREM", "RES_GP_PUPS", "PREM_GP_PUPS", "EXP_GP_PUP", "ACT_GP_PUP"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );
        let groups = [(1_000.0, 200.0), (10_000.0, 9_000.0), (50_000.0, 100_000.0)];
        for (g, (premium, reserve)) in groups.iter().enumerate() {
            for i in 0..10 {
                let jitter = 1.0 + i as f64 * 0.01;
                raw.push_row(vec![
                    RawValue::from(format!("G{g}-{i}").as_str()),
                    (premium * jitter).into(),
                    (reserve * jitter).into(),
                    (*premium).into(),
                    100.0.into(),
                    (100.0 * (g + 1) as f64).into(),
                ]);
            }
        }
        canonicalize(&raw).unwrap()
    }

    #[test]
    fn test_recovers_separated_groups() {
        let t = table();
        let params = ClusterParams {
            k: 3,
            ..Default::default()
        };
        let report = cluster(&t, &params).unwrap();

        assert_eq!(report.cluster_ids.len(), 30);
        for g in 0..3 {
            let ids = &report.cluster_ids[g * 10..(g + 1) * 10];
            assert!(ids.iter().all(|id| *id == ids[0]), "group {g} split: {ids:?}");
        }
        assert_ne!(report.cluster_ids[0], report.cluster_ids[10]);
        assert_ne!(report.cluster_ids[10], report.cluster_ids[20]);
        assert_ne!(report.cluster_ids[0], report.cluster_ids[20]);

        let ids: Vec<usize> = report.summary.iter().map(|s| s.cluster).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert!(report.summary.iter().all(|s| s.count == 10));
        assert_eq!(report.projection.points.len(), 30);
        assert_eq!(report.worst_cluster, Some(report.cluster_ids[20]));
    }

    #[test]
    fn test_same_seed_same_assignments() {
        let t = table();
        let params = ClusterParams {
            k: 3,
            ..Default::default()
        };
        let a = cluster(&t, &params).unwrap();
        let b = cluster(&t, &params).unwrap();
        assert_eq!(a.cluster_ids, b.cluster_ids);
        assert_eq!(a.inertia.to_bits(), b.inertia.to_bits());
    }

    #[test]
    fn test_too_few_rows_for_k() {
        let t = table().filter(&crate::policy::PolicyFilter {
            min_annual_premium: Some(53_250.0),
            ..Default::default()
        });
        assert_eq!(t.len(), 3);
        let err = cluster(&t, &ClusterParams::default()).unwrap_err();
        match err {
            AnalysisError::InsufficientData { required, actual } => {
                assert_eq!(required, 4);
                assert_eq!(actual, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_duplicate_rows_cannot_fill_k_clusters() {
        let mut raw = RawTable::new(
            ["POL_NUMBER", "ANNUAL_PREM", "RES_GP_PUPS", "PREM_GP_PUPS", "EXP_GP_PUP", "ACT_GP_PUP"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );
        for i in 0..6 {
            let (premium, reserve) = if i < 3 { (1_000.0, 200.0) } else { (50_000.0, 100_000.0) };
            raw.push_row(vec![
                RawValue::from(format!("D{i}").as_str()),
                premium.into(),
                reserve.into(),
                premium.into(),
                100.0.into(),
                100.0.into(),
            ]);
        }
        let t = canonicalize(&raw).unwrap();
        assert_eq!(t.len(), 6);

        match cluster(&t, &ClusterParams::default()).unwrap_err() {
            AnalysisError::InsufficientData { required, actual } => {
                assert_eq!(required, 4);
                assert_eq!(actual, 2);
            }
            other => panic!("unexpected error: {other}"),
        }

        let curve = elbow_curve(&t, &ClusterParams::default(), 2..=5).unwrap();
        assert_eq!(curve.iter().map(|p| p.k).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_elbow_inertia_decreases() {
        let curve = elbow_curve(&table(), &ClusterParams::default(), 2..=5).unwrap();
        assert_eq!(curve.len(), 4);
        assert!(curve[1].inertia < curve[0].inertia);
    }

    #[test]
    fn test_cluster_labels() {
        assert_eq!(cluster_label(0), "Premium Segment A");
        assert_eq!(cluster_label(3), "Premium Segment D");
        assert_eq!(cluster_label(30), "Premium Segment 31");
    }
}
