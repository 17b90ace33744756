//! Cauchy combination test (CCT) for folding correlated p-values.
//!
//! Each p-value is mapped to a standard Cauchy quantile, the quantiles are
//! averaged with non-negative weights, and the average is mapped back through
//! the Cauchy survival function. The transform is dominated by the smallest
//! inputs, which makes it robust to arbitrary dependence between tests.
use crate::error::{Result, StaarError};
use ndarray::{Array1, ArrayView2, Axis};
use std::f64::consts::PI;

/// Cutoffs for the asymptotic branches of the transform.
#[derive(Debug, Clone, Copy)]
pub struct CauchyOptions {
    /// p-values below this use `1 / (p * pi)` instead of `tan((0.5 - p) * pi)`
    pub small_p_cutoff: f64,
    /// statistics above this use `1 / (T * pi)` instead of the survival function
    pub large_stat_cutoff: f64,
}

impl Default for CauchyOptions {
    fn default() -> Self {
        Self {
            small_p_cutoff: 1e-16,
            large_stat_cutoff: 1e15,
        }
    }
}

/// Combines p-values with uniform weights.
pub fn cauchy_combination(pvalues: &[f64]) -> Result<f64> {
    cauchy_combination_weighted(pvalues, None, &CauchyOptions::default())
}

/// Combines p-values with optional weights.
///
/// NaN p-values (and their weights) are dropped. Returns
/// `NumericalDegeneracy` when nothing usable remains.
pub fn cauchy_combination_weighted(
    pvalues: &[f64],
    weights: Option<&[f64]>,
    opts: &CauchyOptions,
) -> Result<f64> {
    if let Some(w) = weights {
        if w.len() != pvalues.len() {
            return Err(StaarError::Input(format!(
                "{} weights supplied for {} p-values",
                w.len(),
                pvalues.len()
            )));
        }
        if w.iter().any(|&x| x < 0.0 || !x.is_finite()) {
            return Err(StaarError::Input("Cauchy weights must be finite and non-negative".into()));
        }
    }

    let mut used: Vec<(f64, f64)> = Vec::with_capacity(pvalues.len());
    let mut has_zero = false;
    for (i, &p) in pvalues.iter().enumerate() {
        if p.is_nan() {
            continue;
        }
        if !(0.0..=1.0).contains(&p) {
            return Err(StaarError::Input(format!("p-value {} is outside [0, 1]", p)));
        }
        if p == 0.0 {
            has_zero = true;
        }
        used.push((p, weights.map_or(1.0, |w| w[i])));
    }

    if used.is_empty() {
        return Err(StaarError::NumericalDegeneracy(
            "all p-values passed to the Cauchy combination are undefined".into(),
        ));
    }
    if has_zero {
        return Ok(0.0);
    }
    let weight_sum: f64 = used.iter().map(|&(_, w)| w).sum();
    if weight_sum <= 0.0 {
        return Err(StaarError::NumericalDegeneracy(
            "Cauchy combination weights sum to zero".into(),
        ));
    }

    // bounded by the largest quantile, whatever the number of inputs
    let stat: f64 = used
        .iter()
        .filter(|&&(_, w)| w > 0.0)
        .map(|&(p, w)| (w / weight_sum) * cauchy_quantile(p, opts))
        .sum();
    Ok(cauchy_survival(stat, opts).max(f64::MIN_POSITIVE))
}

/// Column-wise combination: rows are the statistics, columns the voxels.
///
/// Columns without any defined p-value are NaN in the output.
pub fn cauchy_combination_columns(pvalues: ArrayView2<f64>, opts: &CauchyOptions) -> Array1<f64> {
    pvalues
        .axis_iter(Axis(1))
        .map(|col| {
            let col = col.to_vec();
            cauchy_combination_weighted(&col, None, opts).unwrap_or(f64::NAN)
        })
        .collect()
}

#[inline]
fn cauchy_quantile(p: f64, opts: &CauchyOptions) -> f64 {
    if p < opts.small_p_cutoff {
        1.0 / (p * PI)
    } else if p < 0.5 {
        // tan((0.5 - p) * pi) == 1 / tan(p * pi), without cancellation near 0
        1.0 / (p * PI).tan()
    } else {
        ((0.5 - p) * PI).tan()
    }
}

#[inline]
fn cauchy_survival(stat: f64, opts: &CauchyOptions) -> f64 {
    if stat > opts.large_stat_cutoff {
        1.0 / (stat * PI)
    } else if stat > 0.0 {
        (1.0 / stat).atan() / PI
    } else {
        (0.5 - stat.atan() / PI).min(1.0)
    }
}
