//! Numeric helpers for the set tests: MAF weights, chi-square tails and the
//! null distribution of a weighted sum of chi-squares.
use nalgebra::DMatrix;
use ndarray::{Array1, Array2, ArrayView2};
use statrs::distribution::{ChiSquared, ContinuousCDF, Normal};
use statrs::function::beta::ln_beta;
use statrs::function::erf::erfc;
use statrs::function::gamma::ln_gamma;

/// Liu p-values below this are recomputed with the saddlepoint approximation.
pub const SADDLEPOINT_CUTOFF: f64 = 1e-4;

/// Beta(a, b) density at `x`, with `x` clamped away from 0 and 1.
pub fn beta_density(x: f64, a: f64, b: f64) -> f64 {
    let x = x.clamp(1e-12, 1.0 - 1e-12);
    ((a - 1.0) * x.ln() + (b - 1.0) * (1.0 - x).ln() - ln_beta(a, b)).exp()
}

/// MAF-based Beta weights, e.g. Beta(1, 25) to upweight rarer variants.
pub fn beta_weights(mafs: &[f64], a: f64, b: f64) -> Vec<f64> {
    mafs.iter().map(|&maf| beta_density(maf, a, b)).collect()
}

/// Upper tail of a 1-df chi-square, accurate far into the tail.
#[inline]
pub fn chisq1_sf(stat: f64) -> f64 {
    if !stat.is_finite() || stat < 0.0 {
        return f64::NAN;
    }
    erfc((stat / 2.0).sqrt())
}

/// Upper tail of a central chi-square with `df` degrees of freedom.
pub fn chisq_sf(stat: f64, df: f64) -> f64 {
    if stat.is_nan() {
        return f64::NAN;
    }
    if stat == f64::INFINITY {
        return 0.0;
    }
    match ChiSquared::new(df) {
        Ok(dist) => dist.sf(stat.max(0.0)),
        Err(_) => f64::NAN,
    }
}

/// Upper tail of a noncentral chi-square, as a Poisson mixture of central ones.
pub fn noncentral_chisq_sf(stat: f64, df: f64, ncp: f64) -> f64 {
    if ncp <= 0.0 {
        return chisq_sf(stat, df);
    }
    let half = ncp / 2.0;
    let mut total = 0.0;
    let mut mass = 0.0;
    for k in 0..10_000u32 {
        let kf = k as f64;
        let log_w = -half + kf * half.ln() - ln_gamma(kf + 1.0);
        let w = log_w.exp();
        total += w * chisq_sf(stat, df + 2.0 * kf);
        mass += w;
        if kf > half && 1.0 - mass < 1e-14 {
            break;
        }
    }
    total.clamp(0.0, 1.0)
}

/// Liu et al. (2009) moment-matching p-value for `Q = sum(lambda_k * chi2_1)`.
pub fn liu_pvalue(q: f64, lambdas: &[f64]) -> f64 {
    let c1: f64 = lambdas.iter().sum();
    let c2: f64 = lambdas.iter().map(|l| l.powi(2)).sum();
    let c3: f64 = lambdas.iter().map(|l| l.powi(3)).sum();
    let c4: f64 = lambdas.iter().map(|l| l.powi(4)).sum();
    if c2 <= 0.0 {
        return f64::NAN;
    }

    let s1 = c3 / c2.powf(1.5);
    let s2 = c4 / (c2 * c2);
    let (a, d, l) = if s1 * s1 > s2 {
        let a = 1.0 / (s1 - (s1 * s1 - s2).sqrt());
        let d = s1 * a.powi(3) - a * a;
        (a, d, a * a - 2.0 * d)
    } else {
        let l = 1.0 / s2;
        (l.sqrt(), 0.0, l)
    };

    let mu_q = c1;
    let sigma_q = (2.0 * c2).sqrt();
    let mu_x = l + d;
    let sigma_x = std::f64::consts::SQRT_2 * a;

    let q_norm = (q - mu_q) / sigma_q * sigma_x + mu_x;
    noncentral_chisq_sf(q_norm, l, d)
}

/// Saddlepoint approximation (Kuonen 1999) for `Q = sum(lambda_k * chi2_1)`.
///
/// Returns `None` when the saddlepoint equation cannot be solved or sits too
/// close to the origin for the approximation to be stable.
pub fn saddlepoint_pvalue(q: f64, lambdas: &[f64]) -> Option<f64> {
    let lambda_max = lambdas.iter().cloned().fold(f64::MIN, f64::max);
    if lambda_max <= 0.0 || q <= 0.0 {
        return None;
    }

    let k = |t: f64| -> f64 { -0.5 * lambdas.iter().map(|l| (1.0 - 2.0 * t * l).ln()).sum::<f64>() };
    let k1 = |t: f64| -> f64 { lambdas.iter().map(|l| l / (1.0 - 2.0 * t * l)).sum() };
    let k2 = |t: f64| -> f64 {
        lambdas
            .iter()
            .map(|l| 2.0 * l * l / (1.0 - 2.0 * t * l).powi(2))
            .sum()
    };

    let upper = 0.5 / lambda_max * (1.0 - 1e-10);
    let lower = (-(lambdas.len() as f64) / (2.0 * q)).min(0.0);

    let t_hat = safeguarded_newton(|t| k1(t) - q, k2, lower, upper, 1e-10, 200).ok()?;
    if t_hat.abs() < 1e-8 {
        return None;
    }

    let w_sq = 2.0 * (t_hat * q - k(t_hat));
    if !(w_sq > 0.0) {
        return None;
    }
    let w = t_hat.signum() * w_sq.sqrt();
    let v = t_hat * k2(t_hat).sqrt();
    if v / w <= 0.0 {
        return None;
    }

    let z = w + (v / w).ln() / w;
    let normal = Normal::new(0.0, 1.0).ok()?;
    let p = normal.sf(z);
    p.is_finite().then_some(p)
}

/// p-value for a quadratic form with eigenvalue spectrum `lambdas`.
pub fn mixture_chisq_pvalue(q: f64, lambdas: &[f64]) -> f64 {
    let p = liu_pvalue(q, lambdas);
    if p < SADDLEPOINT_CUTOFF {
        if let Some(sp) = saddlepoint_pvalue(q, lambdas) {
            return sp;
        }
    }
    p
}

/// Replaces a p-value that underflowed to zero with the smallest positive double.
#[inline]
pub fn floor_pvalue(p: f64) -> f64 {
    if p == 0.0 {
        f64::MIN_POSITIVE
    } else if p > 1.0 {
        1.0
    } else {
        p
    }
}

/// Floors a column of p-values, warning once if any underflowed.
pub fn floor_underflow(pvalues: &mut Array1<f64>, what: &str) {
    let n_zero = pvalues.iter().filter(|&&p| p == 0.0).count();
    if n_zero > 0 {
        log::warn!(
            "{}: {} p-value(s) underflowed to 0; reporting {:e}",
            what,
            n_zero,
            f64::MIN_POSITIVE
        );
    }
    pvalues.mapv_inplace(floor_pvalue);
}

pub(crate) fn to_dmatrix(a: ArrayView2<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(a.nrows(), a.ncols(), |i, j| a[[i, j]])
}

pub(crate) fn from_dmatrix(m: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| m[(i, j)])
}

/// Newton-Raphson root finder kept inside `[lower, upper]` by bisection.
///
/// `f` must be increasing on the bracket.
pub fn safeguarded_newton<F, FPrime>(
    f: F,
    f_prime: FPrime,
    mut lower: f64,
    mut upper: f64,
    tolerance: f64,
    max_iter: u32,
) -> Result<f64, &'static str>
where
    F: Fn(f64) -> f64,
    FPrime: Fn(f64) -> f64,
{
    if f(lower) > 0.0 || f(upper) < 0.0 {
        return Err("Root is not bracketed");
    }
    let mut x0 = 0.5 * (lower + upper);

    for _ in 0..max_iter {
        let y = f(x0);
        if y > 0.0 {
            upper = x0;
        } else {
            lower = x0;
        }

        let y_prime = f_prime(x0);
        let mut x1 = if y_prime.abs() > 1e-300 { x0 - y / y_prime } else { f64::NAN };
        if !(x1 > lower && x1 < upper) {
            x1 = 0.5 * (lower + upper);
        }

        if (x1 - x0).abs() < tolerance * (1.0 + x0.abs()) {
            return Ok(x1);
        }
        x0 = x1;
    }

    Err("Newton-Raphson failed to converge")
}
