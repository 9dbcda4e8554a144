//! Analysis engine: aggregation, segmentation, anomaly detection, clustering
//! and regression over a canonical policy table
//!
//! Every analysis takes the table by shared reference and returns its own
//! result type; row-level results refer back to the table by row index.

pub mod stats;
pub mod features;
mod aggregate;
mod segmentation;
mod anomaly;
mod projection;
mod cluster;
mod regression;

use crate::policy::DEFAULT_REFERENCE_YEAR;
use serde::{Deserialize, Serialize};

pub use aggregate::{
    adequacy_distribution, band_performance, describe, portfolio_overview, rank_by, rank_factor_variance,
    rank_rows, summarize_by, temporal_patterns, AdequacyCategory, Aggregation, BandLossRatio, FactorVariance,
    GroupSummary, GroupValue, MetricSpec, PortfolioOverview, RankedGroup, RankedRow, TemporalPatterns,
    BAND_METRICS,
};
pub use segmentation::{
    segment_risk, RiskBins, RiskSegment, RiskWeights, SegmentSummary, SegmentationParams, SegmentationReport,
    SegmentedRow,
};
pub use anomaly::{detect_anomalies, AnomalyParams, AnomalyReport, AnomalyRow, DEFAULT_ANOMALY_FEATURES};
pub use projection::{principal_components, Projection};
pub use cluster::{
    cluster, cluster_label, elbow_curve, ClusterParams, ClusterReport, ClusterSummary, ElbowPoint,
    DEFAULT_CLUSTER_FEATURES,
};
pub use regression::{fit_predict, HoldoutPrediction, RegressionParams, RegressionReport, DEFAULT_REGRESSION_FEATURES};

/// Seed shared by every randomized analysis unless overridden
pub const DEFAULT_SEED: u64 = 42;

/// Tunables for a whole analysis session, loadable from JSON.
///
/// Missing fields take their defaults, so `{}` is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Year policy vintage is measured against
    #[serde(default = "default_reference_year")]
    pub reference_year: i32,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub risk_weights: RiskWeights,
    #[serde(default)]
    pub risk_bins: RiskBins,
    /// Expected anomaly share for the isolation forest
    #[serde(default = "default_contamination")]
    pub contamination: f64,
    #[serde(default = "default_trees")]
    pub anomaly_trees: usize,
    #[serde(default = "default_anomaly_max_samples")]
    pub anomaly_max_samples: usize,
    /// Cluster count k
    #[serde(default = "default_clusters")]
    pub clusters: usize,
    #[serde(default = "default_cluster_restarts")]
    pub cluster_restarts: usize,
    #[serde(default = "default_cluster_max_iter")]
    pub cluster_max_iter: usize,
    /// Holdout share for the regression split
    #[serde(default = "default_test_fraction")]
    pub test_fraction: f64,
    #[serde(default = "default_trees")]
    pub forest_trees: usize,
}

fn default_reference_year() -> i32 {
    DEFAULT_REFERENCE_YEAR
}

fn default_seed() -> u64 {
    DEFAULT_SEED
}

fn default_contamination() -> f64 {
    0.1
}

fn default_trees() -> usize {
    100
}

fn default_anomaly_max_samples() -> usize {
    256
}

fn default_clusters() -> usize {
    4
}

fn default_cluster_restarts() -> usize {
    10
}

fn default_cluster_max_iter() -> usize {
    300
}

fn default_test_fraction() -> f64 {
    0.2
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            reference_year: default_reference_year(),
            seed: default_seed(),
            risk_weights: RiskWeights::default(),
            risk_bins: RiskBins::default(),
            contamination: default_contamination(),
            anomaly_trees: default_trees(),
            anomaly_max_samples: default_anomaly_max_samples(),
            clusters: default_clusters(),
            cluster_restarts: default_cluster_restarts(),
            cluster_max_iter: default_cluster_max_iter(),
            test_fraction: default_test_fraction(),
            forest_trees: default_trees(),
        }
    }
}

impl AnalysisConfig {
    pub fn segmentation(&self) -> SegmentationParams {
        SegmentationParams {
            weights: self.risk_weights,
            bins: self.risk_bins,
        }
    }

    pub fn anomaly(&self) -> AnomalyParams {
        AnomalyParams {
            contamination: self.contamination,
            n_trees: self.anomaly_trees,
            max_samples: self.anomaly_max_samples,
            seed: self.seed,
            ..Default::default()
        }
    }

    pub fn clustering(&self) -> ClusterParams {
        ClusterParams {
            k: self.clusters,
            restarts: self.cluster_restarts,
            max_iter: self.cluster_max_iter,
            seed: self.seed,
            ..Default::default()
        }
    }

    pub fn regression(&self) -> RegressionParams {
        RegressionParams {
            test_fraction: self.test_fraction,
            n_trees: self.forest_trees,
            seed: self.seed,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: AnalysisConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.reference_year, 2024);
        assert_eq!(config.seed, 42);
        assert_eq!(config.clusters, 4);
        assert_eq!(config.forest_trees, 100);
        assert_eq!(config.risk_weights, RiskWeights::default());
    }

    #[test]
    fn test_partial_config_overrides() {
        let config: AnalysisConfig =
            serde_json::from_str(r#"{"seed": 7, "clusters": 3, "test_fraction": 0.25}"#).unwrap();
        let clustering = config.clustering();
        assert_eq!(clustering.k, 3);
        assert_eq!(clustering.seed, 7);
        assert_eq!(clustering.restarts, 10);
        assert_eq!(config.regression().test_fraction, 0.25);
        assert_eq!(config.anomaly().seed, 7);
        assert_eq!(config.anomaly().contamination, 0.1);
    }
}
