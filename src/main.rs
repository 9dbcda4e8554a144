//! Policy Analytics CLI
//!
//! Loads a policy CSV, canonicalizes it once, runs one analysis and prints
//! the result as JSON.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use policy_analytics::analysis::{
    self, adequacy_distribution, band_performance, cluster, detect_anomalies, elbow_curve, fit_predict,
    portfolio_overview, rank_by, rank_factor_variance, rank_rows, segment_risk, temporal_patterns, Aggregation,
};
use policy_analytics::policy::load_raw_table;
use policy_analytics::{canonicalize_with, AnalysisConfig, CanonicalTable, Column, PolicyFilter};
use serde::Serialize;
use serde_json::json;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

/// Exploratory analytics over policy-level insurance data
#[derive(Parser)]
#[command(name = "policy_analytics")]
#[command(about = "Derived actuarial metrics, segmentation and models for policy data", long_about = None)]
#[command(version)]
struct Cli {
    /// Policy CSV to analyse
    #[arg(short, long)]
    input: PathBuf,

    /// JSON analysis config; missing fields take defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Year policy vintage is measured against (overrides the config)
    #[arg(long)]
    reference_year: Option<i32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Portfolio headline figures, band performance and adequacy distribution
    Overview,

    /// Top groups by an aggregated metric
    RankGroups {
        /// One or two key columns, comma separated (e.g. CL_PBAND,CL_STATUS)
        #[arg(long, value_delimiter = ',', required = true)]
        by: Vec<Column>,

        #[arg(long, default_value = "LOSS_RATIO")]
        metric: Column,

        /// mean, sum, count or variance
        #[arg(long, default_value = "mean")]
        agg: Aggregation,

        #[arg(long, default_value_t = 10)]
        top: usize,
    },

    /// Top individual policies by a numeric column
    RankPolicies {
        #[arg(long, default_value = "LOSS_RATIO")]
        metric: Column,

        #[arg(long, default_value_t = 10)]
        top: usize,
    },

    /// Rating factors ranked by variance
    FactorVariance,

    /// Risk segmentation by combined risk score
    Segment,

    /// Isolation forest anomaly detection
    Anomalies {
        #[arg(long)]
        contamination: Option<f64>,

        /// Number of flagged policies to list by loss ratio
        #[arg(long, default_value_t = 10)]
        top: usize,
    },

    /// K-means clustering with a 2-D projection
    Cluster {
        #[arg(short)]
        k: Option<usize>,
    },

    /// Inertia across a range of cluster counts
    Elbow {
        #[arg(long, default_value_t = 2)]
        min_k: usize,

        #[arg(long, default_value_t = 7)]
        max_k: usize,
    },

    /// Random forest reserve prediction
    Predict {
        #[arg(long)]
        test_fraction: Option<f64>,

        #[arg(long)]
        trees: Option<usize>,
    },

    /// Entry year, month, season and vintage trends
    Temporal,

    /// Filter policies, describe numeric columns and optionally export
    Explore {
        #[arg(long)]
        band: Option<String>,

        #[arg(long)]
        min_premium: Option<f64>,

        #[arg(long)]
        max_loss_ratio: Option<f64>,

        /// Write the filtered canonical table to this CSV
        #[arg(long)]
        export: Option<PathBuf>,
    },
}

/// Envelope wrapped around every printed result
#[derive(Serialize)]
struct Report<T: Serialize> {
    analysis: &'static str,
    generated_at: DateTime<Utc>,
    rows: usize,
    result: T,
}

fn emit<T: Serialize>(analysis: &'static str, table: &CanonicalTable, result: T) -> Result<()> {
    let report = Report {
        analysis,
        generated_at: Utc::now(),
        rows: table.len(),
        result,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<AnalysisConfig> {
    match path {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("Failed to open config {}", path.display()))?;
            serde_json::from_reader(file)
                .with_context(|| format!("Failed to parse config {}", path.display()))
        }
        None => Ok(AnalysisConfig::default()),
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(year) = cli.reference_year {
        config.reference_year = year;
    }

    let raw = load_raw_table(&cli.input)
        .with_context(|| format!("Failed to load policies from {}", cli.input.display()))?;
    let table = canonicalize_with(&raw, config.reference_year)?;
    log::info!("Canonicalized {} policies", table.len());

    match cli.command {
        Commands::Overview => {
            let adequacy: Vec<_> = adequacy_distribution(&table)
                .into_iter()
                .map(|(category, count)| json!({ "category": category.label(), "count": count }))
                .collect();
            let bands = if table.is_available(Column::Band) {
                Some(band_performance(&table)?)
            } else {
                None
            };
            emit(
                "overview",
                &table,
                json!({
                    "portfolio": portfolio_overview(&table)?,
                    "band_performance": bands,
                    "adequacy_distribution": adequacy,
                }),
            )
        }
        Commands::RankGroups { by, metric, agg, top } => {
            emit("rank-groups", &table, rank_by(&table, &by, metric, agg, top)?)
        }
        Commands::RankPolicies { metric, top } => {
            emit("rank-policies", &table, rank_rows(&table, metric, top)?)
        }
        Commands::FactorVariance => emit("factor-variance", &table, rank_factor_variance(&table)),
        Commands::Segment => emit("segment", &table, segment_risk(&table, &config.segmentation())?),
        Commands::Anomalies { contamination, top } => {
            let mut params = config.anomaly();
            if let Some(c) = contamination {
                params.contamination = c;
            }
            let report = detect_anomalies(&table, &params)?;
            let top_rows = report.top_by_loss_ratio(top);
            emit(
                "anomalies",
                &table,
                json!({ "report": report, "top_by_loss_ratio": top_rows }),
            )
        }
        Commands::Cluster { k } => {
            let mut params = config.clustering();
            if let Some(k) = k {
                params.k = k;
            }
            emit("cluster", &table, cluster(&table, &params)?)
        }
        Commands::Elbow { min_k, max_k } => {
            let curve = elbow_curve(&table, &config.clustering(), min_k..=max_k)?;
            emit("elbow", &table, curve)
        }
        Commands::Predict { test_fraction, trees } => {
            let mut params = config.regression();
            if let Some(f) = test_fraction {
                params.test_fraction = f;
            }
            if let Some(n) = trees {
                params.n_trees = n;
            }
            emit("predict", &table, fit_predict(&table, &params)?)
        }
        Commands::Temporal => emit("temporal", &table, temporal_patterns(&table)?),
        Commands::Explore {
            band,
            min_premium,
            max_loss_ratio,
            export,
        } => {
            let filtered = table.filter(&PolicyFilter {
                band,
                min_annual_premium: min_premium,
                max_loss_ratio,
            });
            if let Some(path) = export {
                let file = File::create(&path)
                    .with_context(|| format!("Failed to create {}", path.display()))?;
                filtered.write_csv(BufWriter::new(file))?;
                log::info!("Exported {} policies to {}", filtered.len(), path.display());
            }
            let numeric: Vec<Column> = Column::ALL
                .iter()
                .copied()
                .filter(|c| c.is_numeric() && filtered.is_available(*c))
                .collect();
            emit("explore", &filtered, analysis::describe(&filtered, &numeric))
        }
    }
}
