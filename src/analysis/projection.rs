//! Principal component projection for handing clusters to a 2-D plot

use super::features::FeatureMatrix;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct Projection {
    /// Loadings of each component over the input features
    pub components: Vec<Vec<f64>>,
    pub explained_variance_ratio: Vec<f64>,
    /// Row coordinates on the components, in table order
    pub points: Vec<[f64; 2]>,
}

/// Eigen-decomposition of a symmetric matrix by cyclic Jacobi rotations.
///
/// Returns eigenvalues and eigenvectors (as columns of the second matrix), unsorted.
fn symmetric_eigen(mut a: Vec<Vec<f64>>) -> (Vec<f64>, Vec<Vec<f64>>) {
    let n = a.len();
    let mut v: Vec<Vec<f64>> = (0..n)
        .map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
        .collect();

    for _ in 0..100 {
        let off: f64 = (0..n)
            .flat_map(|i| (0..n).filter(move |j| *j != i).map(move |j| (i, j)))
            .map(|(i, j)| a[i][j] * a[i][j])
            .sum();
        if off < 1e-22 {
            break;
        }

        for p in 0..n {
            for q in (p + 1)..n {
                if a[p][q].abs() < 1e-300 {
                    continue;
                }
                let theta = (a[q][q] - a[p][p]) / (2.0 * a[p][q]);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                for k in 0..n {
                    let (akp, akq) = (a[k][p], a[k][q]);
                    a[k][p] = c * akp - s * akq;
                    a[k][q] = s * akp + c * akq;
                }
                for k in 0..n {
                    let (apk, aqk) = (a[p][k], a[q][k]);
                    a[p][k] = c * apk - s * aqk;
                    a[q][k] = s * apk + c * aqk;
                }
                for row in v.iter_mut() {
                    let (vkp, vkq) = (row[p], row[q]);
                    row[p] = c * vkp - s * vkq;
                    row[q] = s * vkp + c * vkq;
                }
            }
        }
    }

    let values = (0..n).map(|i| a[i][i]).collect();
    (values, v)
}

/// Project rows onto the top two principal components.
///
/// Components are sign-normalized so their largest-magnitude loading is positive.
pub fn principal_components(matrix: &FeatureMatrix) -> Projection {
    let n = matrix.n_rows();
    let p = matrix.n_features();

    let means: Vec<f64> = (0..p)
        .map(|j| matrix.rows.iter().map(|r| r[j]).sum::<f64>() / n.max(1) as f64)
        .collect();
    let centered: Vec<Vec<f64>> = matrix
        .rows
        .iter()
        .map(|r| r.iter().zip(&means).map(|(v, m)| v - m).collect())
        .collect();

    let denom = n.saturating_sub(1).max(1) as f64;
    let covariance: Vec<Vec<f64>> = (0..p)
        .map(|i| {
            (0..p)
                .map(|j| centered.iter().map(|r| r[i] * r[j]).sum::<f64>() / denom)
                .collect()
        })
        .collect();

    let (values, vectors) = symmetric_eigen(covariance);
    let mut order: Vec<usize> = (0..p).collect();
    order.sort_by(|&a, &b| values[b].total_cmp(&values[a]));

    let total: f64 = values.iter().map(|v| v.max(0.0)).sum();
    let n_components = p.min(2);

    let components: Vec<Vec<f64>> = order[..n_components]
        .iter()
        .map(|&c| {
            let mut loading: Vec<f64> = (0..p).map(|i| vectors[i][c]).collect();
            let dominant = loading
                .iter()
                .copied()
                .fold(0.0_f64, |acc, x| if x.abs() > acc.abs() { x } else { acc });
            if dominant < 0.0 {
                loading.iter_mut().for_each(|x| *x = -*x);
            }
            loading
        })
        .collect();

    let explained_variance_ratio = order[..n_components]
        .iter()
        .map(|&c| if total > 0.0 { values[c].max(0.0) / total } else { 0.0 })
        .collect();

    let points = centered
        .iter()
        .map(|r| {
            let mut point = [0.0; 2];
            for (slot, component) in point.iter_mut().zip(&components) {
                *slot = r.iter().zip(component).map(|(x, w)| x * w).sum();
            }
            point
        })
        .collect();

    Projection {
        components,
        explained_variance_ratio,
        points,
    }
}
