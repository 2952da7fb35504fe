use ndarray::{Array2, ArrayView2, Axis};
use ndarray_stats::CorrelationExt;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::geometry;

/// Covariance estimator family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EstimatorMethod {
    /// Plain sample covariance (divisor n - 1). May be singular when the
    /// number of samples is small relative to the number of variables.
    Sample,
    /// Ledoit-Wolf linear shrinkage toward a scaled-identity target, with
    /// the analytic data-driven intensity. Positive-definite even when
    /// n < p.
    LedoitWolf,
}

/// Transforms a multichannel time series into a covariance matrix.
///
/// The input is `samples x variables` (rows = time points, columns =
/// regions/channels). Estimator bias is a function of the sample count, so
/// callers comparing estimates across records should equalize the number of
/// rows per record before calling this; that policy lives in the caller,
/// not here.
pub struct Covariances {
    method: EstimatorMethod,
}

impl Covariances {
    pub fn new(method: EstimatorMethod) -> Self {
        Covariances { method }
    }

    pub fn method(&self) -> EstimatorMethod {
        self.method
    }

    /// Estimate the covariance of one observation matrix.
    pub fn transform(&self, x: ArrayView2<f64>) -> Result<Array2<f64>> {
        let (n, p) = x.dim();
        if n < 2 {
            return Err(Error::InvalidInput(format!(
                "need at least 2 samples to estimate a covariance, got {n}"
            )));
        }
        if p == 0 {
            return Err(Error::InvalidInput("observation matrix has no variables".into()));
        }
        if x.iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidInput("non-finite value in observations".into()));
        }

        match self.method {
            EstimatorMethod::Sample => sample_covariance(x),
            EstimatorMethod::LedoitWolf => ledoit_wolf(x),
        }
    }
}

/// Sample covariance with divisor n - 1. Rows of the ndarray-stats input
/// are random variables, hence the transpose.
fn sample_covariance(x: ArrayView2<f64>) -> Result<Array2<f64>> {
    x.t()
        .cov(1.0)
        .map_err(|e| Error::InvalidInput(format!("sample covariance failed: {e}")))
}

/// Ledoit-Wolf shrinkage estimate.
///
/// Blends the (1/n) sample covariance S toward `mu * I` with
/// `mu = tr(S) / p`. The intensity is the analytic risk-minimizing rule:
/// `s = min(beta_bar, delta) / delta`, where `delta = ||S - mu I||_F^2 / p`
/// measures the dispersion of S around the target and `beta_bar` estimates
/// the sampling noise from the per-sample outer products. For noisy data
/// `s > 0`, so every eigenvalue of the blend is at least `s * mu > 0` and
/// the output is positive-definite even when n < p.
fn ledoit_wolf(x: ArrayView2<f64>) -> Result<Array2<f64>> {
    let (n, p) = x.dim();
    let nf = n as f64;
    let pf = p as f64;

    let mean = x
        .mean_axis(Axis(0))
        .ok_or_else(|| Error::InvalidInput("empty observation matrix".into()))?;
    let centered = &x - &mean;

    let emp = centered.t().dot(&centered) / nf;
    let mu = emp.diag().sum() / pf;
    if mu <= 0.0 {
        return Err(Error::InvalidInput(
            "zero total variance (constant observations), shrinkage target is degenerate".into(),
        ));
    }

    // delta = ||S - mu I||_F^2 / p
    let mut delta = 0.0;
    for i in 0..p {
        for j in 0..p {
            let target = if i == j { mu } else { 0.0 };
            let d = emp[[i, j]] - target;
            delta += d * d;
        }
    }
    delta /= pf;
    if delta <= f64::EPSILON * mu * mu {
        return Err(Error::InvalidInput(
            "sample covariance coincides with the shrinkage target, intensity is undefined".into(),
        ));
    }

    // beta_bar = (1/(n^2 p)) * sum_i ||x_i x_i^T - S||_F^2
    //          = (1/(n p)) * (sum((X^2)^T X^2) / n - sum(S^2))
    let squared = centered.mapv(|v| v * v);
    let outer_moment = squared.t().dot(&squared).sum() / nf;
    let beta_bar = (outer_moment - emp.mapv(|v| v * v).sum()) / (nf * pf);

    let beta = beta_bar.clamp(0.0, delta);
    let shrinkage = beta / delta;

    let mut shrunk = emp * (1.0 - shrinkage);
    for i in 0..p {
        shrunk[[i, i]] += shrinkage * mu;
    }

    geometry::check_spd(&shrunk)?;
    Ok(shrunk)
}
