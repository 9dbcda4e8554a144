//! Grouped aggregation, rankings and portfolio summaries

use super::stats;
use crate::error::{AnalysisError, Result};
use crate::policy::{CanonicalTable, CellValue, Column, PolicyRecord};
use log::debug;
use serde::{Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Reduction applied to a metric within a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Mean,
    Sum,
    Count,
    Variance,
}

impl Aggregation {
    pub fn apply(&self, values: &[f64]) -> f64 {
        match self {
            Aggregation::Mean => stats::mean(values),
            Aggregation::Sum => stats::sum(values),
            Aggregation::Count => stats::count(values) as f64,
            Aggregation::Variance => stats::variance(values),
        }
    }
}

impl FromStr for Aggregation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mean" => Ok(Aggregation::Mean),
            "sum" => Ok(Aggregation::Sum),
            "count" => Ok(Aggregation::Count),
            "variance" | "var" => Ok(Aggregation::Variance),
            other => Err(format!("Unknown aggregation: {}", other)),
        }
    }
}

/// Value of a grouping key
#[derive(Debug, Clone)]
pub enum GroupValue {
    Number(f64),
    Text(String),
}

impl GroupValue {
    fn from_cell(cell: CellValue<'_>) -> Option<Self> {
        match cell {
            CellValue::Number(v) if v.is_nan() => None,
            // -0.0 and 0.0 land in one group
            CellValue::Number(v) => Some(GroupValue::Number(v + 0.0)),
            CellValue::Text(s) => Some(GroupValue::Text(s.to_string())),
            CellValue::Missing => None,
        }
    }

    fn hash_key(&self) -> HashKey {
        match self {
            GroupValue::Number(v) => HashKey::Number(v.to_bits()),
            GroupValue::Text(s) => HashKey::Text(s.clone()),
        }
    }
}

impl PartialEq for GroupValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for GroupValue {}

impl PartialOrd for GroupValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GroupValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (GroupValue::Number(a), GroupValue::Number(b)) => a.total_cmp(b),
            (GroupValue::Number(_), GroupValue::Text(_)) => Ordering::Less,
            (GroupValue::Text(_), GroupValue::Number(_)) => Ordering::Greater,
            (GroupValue::Text(a), GroupValue::Text(b)) => a.cmp(b),
        }
    }
}

impl fmt::Display for GroupValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupValue::Number(v) => write!(f, "{}", v),
            GroupValue::Text(s) => f.write_str(s),
        }
    }
}

impl Serialize for GroupValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            GroupValue::Number(v) => serializer.serialize_f64(*v),
            GroupValue::Text(s) => serializer.serialize_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum HashKey {
    Number(u64),
    Text(String),
}

/// One reduced metric requested from `summarize_by`
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MetricSpec {
    pub column: Column,
    pub aggregation: Aggregation,
}

impl MetricSpec {
    pub const fn new(column: Column, aggregation: Aggregation) -> Self {
        Self {
            column,
            aggregation,
        }
    }
}

/// A group with its reduced metrics, in request order
#[derive(Debug, Clone, Serialize)]
pub struct GroupSummary {
    pub keys: Vec<GroupValue>,
    pub rows: usize,
    pub values: Vec<f64>,
}

/// One ranked group of `rank_by`
#[derive(Debug, Clone, Serialize)]
pub struct RankedGroup {
    pub keys: Vec<GroupValue>,
    pub rows: usize,
    pub value: f64,
}

/// One ranked policy of `rank_rows`
#[derive(Debug, Clone, Serialize)]
pub struct RankedRow {
    pub row: usize,
    pub policy_number: String,
    pub value: f64,
}

/// Variance of one rating factor across the table
#[derive(Debug, Clone, Serialize)]
pub struct FactorVariance {
    pub column: Column,
    pub variance: f64,
}

/// Group row indices by key, in first-encountered order.
/// Rows with a missing key value are dropped.
fn group_rows(records: &[PolicyRecord], keys: &[Column]) -> Vec<(Vec<GroupValue>, Vec<usize>)> {
    let mut index: HashMap<Vec<HashKey>, usize> = HashMap::new();
    let mut groups: Vec<(Vec<GroupValue>, Vec<usize>)> = Vec::new();

    for (row, record) in records.iter().enumerate() {
        let key: Option<Vec<GroupValue>> = keys
            .iter()
            .map(|c| GroupValue::from_cell(record.value(*c)))
            .collect();
        let Some(key) = key else { continue };

        let hashed: Vec<HashKey> = key.iter().map(GroupValue::hash_key).collect();
        match index.get(&hashed) {
            Some(&g) => groups[g].1.push(row),
            None => {
                index.insert(hashed, groups.len());
                groups.push((key, vec![row]));
            }
        }
    }
    groups
}

fn validate_keys(keys: &[Column], max: usize) -> Result<()> {
    if keys.is_empty() || keys.len() > max {
        return Err(AnalysisError::invalid(
            "group_keys",
            format!("expected 1 to {} grouping columns, got {}", max, keys.len()),
        ));
    }
    Ok(())
}

fn validate_metric(column: Column) -> Result<()> {
    if !column.is_numeric() {
        return Err(AnalysisError::invalid(
            "metric",
            format!("{} is not a numeric column", column),
        ));
    }
    Ok(())
}

/// Group by the key columns and reduce each metric; groups ordered by key ascending
pub fn summarize_by(
    table: &CanonicalTable,
    keys: &[Column],
    metrics: &[MetricSpec],
) -> Result<Vec<GroupSummary>> {
    validate_keys(keys, keys.len().max(1))?;
    for spec in metrics {
        validate_metric(spec.column)?;
    }

    let records = table.records();
    let mut summaries: Vec<GroupSummary> = group_rows(records, keys)
        .into_iter()
        .map(|(keys, rows)| {
            let values = metrics
                .iter()
                .map(|spec| {
                    let column: Vec<f64> =
                        rows.iter().map(|&i| records[i].number(spec.column)).collect();
                    spec.aggregation.apply(&column)
                })
                .collect();
            GroupSummary {
                keys,
                rows: rows.len(),
                values,
            }
        })
        .collect();

    summaries.sort_by(|a, b| a.keys.cmp(&b.keys));
    Ok(summaries)
}

/// Top-N groups by a reduced metric, descending.
///
/// Ties keep first-encountered group order. Accepts one or two key columns.
pub fn rank_by(
    table: &CanonicalTable,
    group_keys: &[Column],
    metric: Column,
    aggregation: Aggregation,
    top_n: usize,
) -> Result<Vec<RankedGroup>> {
    validate_keys(group_keys, 2)?;
    validate_metric(metric)?;

    let records = table.records();
    let mut ranked: Vec<RankedGroup> = group_rows(records, group_keys)
        .into_iter()
        .map(|(keys, rows)| {
            let values: Vec<f64> = rows.iter().map(|&i| records[i].number(metric)).collect();
            RankedGroup {
                keys,
                rows: rows.len(),
                value: aggregation.apply(&values),
            }
        })
        .collect();

    ranked.sort_by(|a, b| stats::descending_nan_last(a.value, b.value));
    ranked.truncate(top_n);
    debug!(
        "Ranked {:?} groups by {:?}({}): {} returned",
        group_keys,
        aggregation,
        metric,
        ranked.len()
    );
    Ok(ranked)
}

/// Top-N individual policies by a numeric column, descending
pub fn rank_rows(table: &CanonicalTable, metric: Column, top_n: usize) -> Result<Vec<RankedRow>> {
    validate_metric(metric)?;

    let mut ranked: Vec<RankedRow> = table
        .records()
        .iter()
        .enumerate()
        .map(|(row, r)| RankedRow {
            row,
            policy_number: r.policy_number.clone(),
            value: r.number(metric),
        })
        .collect();

    ranked.sort_by(|a, b| stats::descending_nan_last(a.value, b.value));
    ranked.truncate(top_n);
    Ok(ranked)
}

/// Numeric view of a rating factor.
///
/// Categorical factors count as numeric only when every present value parses.
fn factor_values(table: &CanonicalTable, column: Column) -> Option<Vec<f64>> {
    if column.is_numeric() {
        return Some(table.numeric(column));
    }
    let mut any = false;
    let mut values = Vec::with_capacity(table.len());
    for record in table.records() {
        match record.value(column) {
            CellValue::Text(s) => {
                values.push(s.trim().parse::<f64>().ok()?);
                any = true;
            }
            _ => values.push(f64::NAN),
        }
    }
    any.then_some(values)
}

/// Rank the numeric rating factors by sample variance, most dispersed first
pub fn rank_factor_variance(table: &CanonicalTable) -> Vec<FactorVariance> {
    let mut ranked: Vec<FactorVariance> = Column::RATING_FACTORS
        .iter()
        .filter(|c| table.is_available(**c))
        .filter_map(|c| {
            factor_values(table, *c).map(|values| FactorVariance {
                column: *c,
                variance: stats::variance(&values),
            })
        })
        .collect();

    ranked.sort_by(|a, b| stats::descending_nan_last(a.variance, b.variance));
    ranked
}

/// Headline figures for the whole portfolio
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioOverview {
    pub total_policies: usize,
    pub total_premium: f64,
    pub mean_loss_ratio: f64,
    pub profitable_policies: usize,
    pub profitable_ratio: f64,
    /// Policies whose risk score exceeds the 90th percentile
    pub high_risk_policies: usize,
    pub loss_ratio_above_1_5: usize,
    pub break_even_policies: usize,
    pub total_premium_adequacy: f64,
    pub loss_ratio_by_band: Vec<BandLossRatio>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BandLossRatio {
    pub band: GroupValue,
    pub mean_loss_ratio: f64,
    pub policies: usize,
    pub total_premium: f64,
}

pub fn portfolio_overview(table: &CanonicalTable) -> Result<PortfolioOverview> {
    let records = table.records();
    let premium = table.numeric(Column::AnnualPremium);
    let loss_ratio = table.numeric(Column::LossRatio);
    let risk = table.numeric(Column::RiskScore);

    let profitable = records.iter().filter(|r| r.premium_adequacy > 0.0).count();
    let risk_p90 = stats::quantile(&risk, 0.9);
    let high_risk = risk.iter().filter(|v| **v > risk_p90).count();

    let loss_ratio_by_band = if table.is_available(Column::Band) {
        summarize_by(
            table,
            &[Column::Band],
            &[
                MetricSpec::new(Column::LossRatio, Aggregation::Mean),
                MetricSpec::new(Column::AnnualPremium, Aggregation::Sum),
            ],
        )?
        .into_iter()
        .map(|g| BandLossRatio {
            band: g.keys[0].clone(),
            mean_loss_ratio: g.values[0],
            policies: g.rows,
            total_premium: g.values[1],
        })
        .collect()
    } else {
        Vec::new()
    };

    Ok(PortfolioOverview {
        total_policies: records.len(),
        total_premium: stats::sum(&premium),
        mean_loss_ratio: stats::mean(&loss_ratio),
        profitable_policies: profitable,
        profitable_ratio: if records.is_empty() {
            f64::NAN
        } else {
            profitable as f64 / records.len() as f64
        },
        high_risk_policies: high_risk,
        loss_ratio_above_1_5: loss_ratio.iter().filter(|v| **v > 1.5).count(),
        break_even_policies: loss_ratio.iter().filter(|v| **v <= 1.0).count(),
        total_premium_adequacy: stats::sum(&table.numeric(Column::PremiumAdequacy)),
        loss_ratio_by_band,
    })
}

/// Premium, reserve and profitability figures per premium band
pub fn band_performance(table: &CanonicalTable) -> Result<Vec<GroupSummary>> {
    summarize_by(table, &[Column::Band], &BAND_METRICS)
}

pub const BAND_METRICS: [MetricSpec; 8] = [
    MetricSpec::new(Column::AnnualPremium, Aggregation::Sum),
    MetricSpec::new(Column::AnnualPremium, Aggregation::Mean),
    MetricSpec::new(Column::AnnualPremium, Aggregation::Count),
    MetricSpec::new(Column::ReserveAmount, Aggregation::Sum),
    MetricSpec::new(Column::ReserveAmount, Aggregation::Mean),
    MetricSpec::new(Column::LossRatio, Aggregation::Mean),
    MetricSpec::new(Column::PremiumAdequacy, Aggregation::Mean),
    MetricSpec::new(Column::PremiumAdequacy, Aggregation::Sum),
];

/// Premium adequacy buckets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AdequacyCategory {
    HighlyInadequate,
    Inadequate,
    Adequate,
    HighlyAdequate,
}

impl AdequacyCategory {
    pub const ALL: [AdequacyCategory; 4] = [
        AdequacyCategory::HighlyInadequate,
        AdequacyCategory::Inadequate,
        AdequacyCategory::Adequate,
        AdequacyCategory::HighlyAdequate,
    ];

    /// Right-closed buckets split at -10000, 0 and 10000
    pub fn classify(adequacy: f64) -> Option<Self> {
        if adequacy.is_nan() {
            None
        } else if adequacy <= -10_000.0 {
            Some(AdequacyCategory::HighlyInadequate)
        } else if adequacy <= 0.0 {
            Some(AdequacyCategory::Inadequate)
        } else if adequacy <= 10_000.0 {
            Some(AdequacyCategory::Adequate)
        } else {
            Some(AdequacyCategory::HighlyAdequate)
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AdequacyCategory::HighlyInadequate => "Highly Inadequate",
            AdequacyCategory::Inadequate => "Inadequate",
            AdequacyCategory::Adequate => "Adequate",
            AdequacyCategory::HighlyAdequate => "Highly Adequate",
        }
    }
}

pub fn adequacy_distribution(table: &CanonicalTable) -> Vec<(AdequacyCategory, usize)> {
    let mut counts = [0usize; 4];
    for record in table.records() {
        if let Some(cat) = AdequacyCategory::classify(record.premium_adequacy) {
            counts[cat as usize] += 1;
        }
    }
    AdequacyCategory::ALL.iter().copied().zip(counts).collect()
}

/// Entry-date trends; sections are `None` when their key is unavailable
#[derive(Debug, Clone, Serialize)]
pub struct TemporalPatterns {
    /// Count, premium sum, mean loss ratio, reserve sum per entry year
    pub yearly: Option<Vec<GroupSummary>>,
    /// Count, premium mean, mean loss ratio per entry month
    pub monthly: Option<Vec<GroupSummary>>,
    /// Count, premium sum and mean, mean loss ratio, mean adequacy per season
    pub quarterly: Option<Vec<GroupSummary>>,
    /// Mean loss ratio, premium sum, count per vintage
    pub vintage: Option<Vec<GroupSummary>>,
    pub latest_year_loss_ratio: Option<f64>,
    pub best_month: Option<GroupValue>,
    pub worst_month: Option<GroupValue>,
}

pub fn temporal_patterns(table: &CanonicalTable) -> Result<TemporalPatterns> {
    use Aggregation::*;

    let section = |key: Column, metrics: &[MetricSpec]| -> Result<Option<Vec<GroupSummary>>> {
        if table.is_available(key) {
            summarize_by(table, &[key], metrics).map(Some)
        } else {
            Ok(None)
        }
    };

    let yearly = section(
        Column::EntryYear,
        &[
            MetricSpec::new(Column::AnnualPremium, Sum),
            MetricSpec::new(Column::LossRatio, Mean),
            MetricSpec::new(Column::ReserveAmount, Sum),
        ],
    )?;
    let monthly = section(
        Column::EntryMonth,
        &[
            MetricSpec::new(Column::AnnualPremium, Mean),
            MetricSpec::new(Column::LossRatio, Mean),
        ],
    )?;
    let quarterly = section(
        Column::EntrySeason,
        &[
            MetricSpec::new(Column::AnnualPremium, Sum),
            MetricSpec::new(Column::AnnualPremium, Mean),
            MetricSpec::new(Column::LossRatio, Mean),
            MetricSpec::new(Column::PremiumAdequacy, Mean),
        ],
    )?;
    let vintage = section(
        Column::PolicyVintage,
        &[
            MetricSpec::new(Column::LossRatio, Mean),
            MetricSpec::new(Column::AnnualPremium, Sum),
        ],
    )?;

    // Years are sorted ascending, so the last group is the latest
    let latest_year_loss_ratio = yearly
        .as_ref()
        .and_then(|groups| groups.last())
        .map(|g| g.values[1]);

    let (best_month, worst_month) = match &monthly {
        Some(groups) => {
            let by_loss_ratio = |want: Ordering| {
                groups
                    .iter()
                    .filter(|g| !g.values[1].is_nan())
                    .reduce(|acc, g| {
                        if g.values[1].total_cmp(&acc.values[1]) == want {
                            g
                        } else {
                            acc
                        }
                    })
                    .map(|g| g.keys[0].clone())
            };
            (by_loss_ratio(Ordering::Less), by_loss_ratio(Ordering::Greater))
        }
        None => (None, None),
    };

    Ok(TemporalPatterns {
        yearly,
        monthly,
        quarterly,
        vintage,
        latest_year_loss_ratio,
        best_month,
        worst_month,
    })
}

/// Explorer statistics for each requested numeric column
pub fn describe(table: &CanonicalTable, columns: &[Column]) -> Vec<(Column, stats::Describe)> {
    columns
        .iter()
        .filter(|c| c.is_numeric())
        .map(|c| (*c, stats::describe(&table.numeric(*c))))
        .collect()
}
