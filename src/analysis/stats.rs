//! NaN-skipping descriptive statistics shared by the analyses

use serde::Serialize;

fn present(values: &[f64]) -> impl Iterator<Item = f64> + '_ {
    values.iter().copied().filter(|v| !v.is_nan())
}

/// Number of non-NaN values
pub fn count(values: &[f64]) -> usize {
    present(values).count()
}

/// Sum of non-NaN values (0 when there are none)
pub fn sum(values: &[f64]) -> f64 {
    present(values).sum()
}

/// Mean of non-NaN values (NaN when there are none)
pub fn mean(values: &[f64]) -> f64 {
    let n = count(values);
    if n == 0 {
        f64::NAN
    } else {
        sum(values) / n as f64
    }
}

/// Sample variance (n - 1 denominator) of non-NaN values
pub fn variance(values: &[f64]) -> f64 {
    let n = count(values);
    if n < 2 {
        return f64::NAN;
    }
    let m = mean(values);
    present(values).map(|v| (v - m).powi(2)).sum::<f64>() / (n - 1) as f64
}

/// Population standard deviation; used for feature scaling
pub fn population_std(values: &[f64]) -> f64 {
    let n = count(values);
    if n == 0 {
        return f64::NAN;
    }
    let m = mean(values);
    (present(values).map(|v| (v - m).powi(2)).sum::<f64>() / n as f64).sqrt()
}

pub fn min(values: &[f64]) -> f64 {
    present(values).fold(f64::NAN, f64::min)
}

pub fn max(values: &[f64]) -> f64 {
    present(values).fold(f64::NAN, f64::max)
}

/// Quantile with linear interpolation between closest ranks.
///
/// `q` is a fraction in [0, 1]. NaN values are ignored.
pub fn quantile(values: &[f64], q: f64) -> f64 {
    let mut sorted: Vec<f64> = present(values).collect();
    if sorted.is_empty() {
        return f64::NAN;
    }
    sorted.sort_by(f64::total_cmp);
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    let frac = pos - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * frac
}

/// Order for descending rankings: larger first, NaN last
pub fn descending_nan_last(a: f64, b: f64) -> std::cmp::Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => std::cmp::Ordering::Equal,
        (true, false) => std::cmp::Ordering::Greater,
        (false, true) => std::cmp::Ordering::Less,
        (false, false) => b.total_cmp(&a),
    }
}

/// Summary statistics of one column
#[derive(Debug, Clone, Serialize)]
pub struct Describe {
    pub count: usize,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub p25: f64,
    pub median: f64,
    pub p75: f64,
    pub max: f64,
}

pub fn describe(values: &[f64]) -> Describe {
    Describe {
        count: count(values),
        mean: mean(values),
        std: variance(values).sqrt(),
        min: min(values),
        p25: quantile(values, 0.25),
        median: quantile(values, 0.5),
        p75: quantile(values, 0.75),
        max: max(values),
    }
}
