//! Affine-invariant Riemannian geometry on the manifold of symmetric
//! positive-definite (SPD) matrices.
//!
//! Covariance matrices from multichannel recordings live on the SPD
//! manifold, not in a vector space. This module provides the geodesic
//! distance, the log/exp maps between the manifold and the tangent space at
//! a base point, parallel transport between tangent spaces, and the
//! Fréchet (Karcher) mean. These operations are mutual inverses/duals of
//! each other, which is the correctness property the tests below pin down.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::debug;

use nalgebra::linalg::{Cholesky, SymmetricEigen};
use nalgebra::DMatrix;

use crate::error::{Error, Result};

/// Default iteration budget for the Fréchet mean fixed point.
pub const MEAN_MAX_ITER: usize = 50;

/// Default convergence tolerance on the Frobenius norm of the mean tangent.
pub const MEAN_TOLERANCE: f64 = 1e-9;

const SYMMETRY_TOLERANCE: f64 = 1e-8;

/// A tangent vector together with the base point it was produced at.
///
/// A tangent vector has no meaning on its own; entry `(i, j)` only reads as
/// "covariance between variables i and j relative to `base`" when paired
/// with that base. Keeping the pair in one value makes `expmap` and
/// `transport` unambiguous.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TangentVector {
    /// Symmetric matrix in the tangent space at `base`.
    pub matrix: Array2<f64>,
    /// SPD base point of the tangent space.
    pub base: Array2<f64>,
}

/// Check that a matrix is square, symmetric and positive-definite.
///
/// Positive-definiteness is established via a Cholesky factorization.
pub fn check_spd(m: &Array2<f64>) -> Result<()> {
    check_symmetric(m)?;
    if Cholesky::new(to_dmatrix(m)).is_none() {
        return Err(Error::NotSpd(
            "Cholesky factorization failed (matrix is not positive-definite)".into(),
        ));
    }
    Ok(())
}

fn check_symmetric(m: &Array2<f64>) -> Result<()> {
    let (r, c) = m.dim();
    if r != c {
        return Err(Error::NotSpd(format!("matrix is {r}x{c}, not square")));
    }
    if r == 0 {
        return Err(Error::InvalidInput("empty matrix".into()));
    }
    let scale = m.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
    let tol = SYMMETRY_TOLERANCE * (1.0 + scale);
    for i in 0..r {
        for j in (i + 1)..c {
            if (m[[i, j]] - m[[j, i]]).abs() > tol {
                return Err(Error::NotSpd(format!(
                    "asymmetry at ({i}, {j}): {} vs {}",
                    m[[i, j]],
                    m[[j, i]]
                )));
            }
        }
    }
    Ok(())
}

fn check_same_dim(a: &Array2<f64>, b: &Array2<f64>) -> Result<()> {
    if a.nrows() != b.nrows() {
        return Err(Error::DimensionMismatch {
            expected: a.nrows(),
            found: b.nrows(),
        });
    }
    Ok(())
}

fn to_dmatrix(m: &Array2<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(m.nrows(), m.ncols(), |i, j| m[[i, j]])
}

fn symmetrize(m: &Array2<f64>) -> Array2<f64> {
    (m + &m.t()) * 0.5
}

/// Frobenius norm of a dense matrix.
pub fn frobenius_norm(m: &Array2<f64>) -> f64 {
    m.iter().map(|v| v * v).sum::<f64>().sqrt()
}

/// Apply `f` to the eigenvalues of a symmetric matrix and reconstruct
/// `U diag(f(lambda)) U^T`. `f` may reject an eigenvalue with an error.
fn eig_map(m: &Array2<f64>, f: impl Fn(f64) -> Result<f64>) -> Result<Array2<f64>> {
    check_symmetric(m)?;
    let p = m.nrows();
    let eigen = SymmetricEigen::new(to_dmatrix(m));
    let mut mapped = Vec::with_capacity(p);
    for k in 0..p {
        mapped.push(f(eigen.eigenvalues[k])?);
    }
    let u = &eigen.eigenvectors;
    let mut out = Array2::zeros((p, p));
    for i in 0..p {
        for j in 0..p {
            let mut sum = 0.0;
            for k in 0..p {
                sum += u[(i, k)] * mapped[k] * u[(j, k)];
            }
            out[[i, j]] = sum;
        }
    }
    Ok(out)
}

/// Matrix square root of an SPD matrix.
pub fn sqrtm(m: &Array2<f64>) -> Result<Array2<f64>> {
    eig_map(m, |v| {
        if v < 0.0 {
            Err(Error::NotSpd(format!("negative eigenvalue {v}")))
        } else {
            Ok(v.sqrt())
        }
    })
}

/// Inverse matrix square root of an SPD matrix.
pub fn invsqrtm(m: &Array2<f64>) -> Result<Array2<f64>> {
    eig_map(m, |v| {
        if v <= 0.0 {
            Err(Error::NotSpd(format!("non-positive eigenvalue {v}")))
        } else {
            Ok(1.0 / v.sqrt())
        }
    })
}

/// Matrix logarithm of an SPD matrix.
pub fn logm(m: &Array2<f64>) -> Result<Array2<f64>> {
    eig_map(m, |v| {
        if v <= 0.0 {
            Err(Error::NotSpd(format!("non-positive eigenvalue {v}")))
        } else {
            Ok(v.ln())
        }
    })
}

/// Matrix exponential of a symmetric matrix. The result is SPD.
pub fn expm(m: &Array2<f64>) -> Result<Array2<f64>> {
    eig_map(m, |v| Ok(v.exp()))
}

/// Geodesic (affine-invariant) distance between two SPD matrices:
/// `|| log(A^{-1/2} B A^{-1/2}) ||_F`, i.e. the root sum of squared log
/// generalized eigenvalues of the pencil (A, B).
///
/// Cost is cubic in the matrix dimension; a full pairwise distance matrix
/// over m items is O(m^2 p^3).
pub fn distance(a: &Array2<f64>, b: &Array2<f64>) -> Result<f64> {
    check_spd(a)?;
    check_spd(b)?;
    check_same_dim(a, b)?;

    let a_inv_sqrt = invsqrtm(a)?;
    let whitened = symmetrize(&a_inv_sqrt.dot(b).dot(&a_inv_sqrt));
    let eigen = SymmetricEigen::new(to_dmatrix(&whitened));

    let mut sum_sq = 0.0;
    for k in 0..whitened.nrows() {
        let v = eigen.eigenvalues[k];
        if v <= 0.0 {
            return Err(Error::NotSpd(format!(
                "non-positive generalized eigenvalue {v}"
            )));
        }
        let l = v.ln();
        sum_sq += l * l;
    }
    Ok(sum_sq.sqrt())
}

/// Logarithmic map: project `point` into the tangent space at `base`.
///
/// `log_B(P) = B^{1/2} log(B^{-1/2} P B^{-1/2}) B^{1/2}`.
/// `logmap(base, base)` is the zero tangent vector.
pub fn logmap(point: &Array2<f64>, base: &Array2<f64>) -> Result<TangentVector> {
    check_spd(point)?;
    check_spd(base)?;
    check_same_dim(point, base)?;

    let b_sqrt = sqrtm(base)?;
    let b_inv_sqrt = invsqrtm(base)?;
    let whitened = symmetrize(&b_inv_sqrt.dot(point).dot(&b_inv_sqrt));
    let log_whitened = logm(&whitened)?;
    let matrix = symmetrize(&b_sqrt.dot(&log_whitened).dot(&b_sqrt));

    Ok(TangentVector {
        matrix,
        base: base.clone(),
    })
}

/// Exponential map: project a tangent vector back onto the manifold at its
/// base point. Exact inverse of [`logmap`]:
/// `exp_B(S) = B^{1/2} exp(B^{-1/2} S B^{-1/2}) B^{1/2}`.
pub fn expmap(vector: &TangentVector) -> Result<Array2<f64>> {
    check_symmetric(&vector.matrix)?;
    check_spd(&vector.base)?;
    check_same_dim(&vector.matrix, &vector.base)?;

    let b_sqrt = sqrtm(&vector.base)?;
    let b_inv_sqrt = invsqrtm(&vector.base)?;
    let whitened = symmetrize(&b_inv_sqrt.dot(&vector.matrix).dot(&b_inv_sqrt));
    let exp_whitened = expm(&whitened)?;
    Ok(symmetrize(&b_sqrt.dot(&exp_whitened).dot(&b_sqrt)))
}

/// Parallel-transport a tangent vector from its base point to the tangent
/// space at `to`, along the connecting geodesic.
///
/// Uses `E = (to . from^{-1})^{1/2}`, evaluated as
/// `from^{1/2} (from^{-1/2} to from^{-1/2})^{1/2} from^{-1/2}` so only
/// symmetric eigendecompositions are needed; the transported vector is
/// `E v E^T`. Transport onto the same base point is the identity.
pub fn transport(vector: &TangentVector, to: &Array2<f64>) -> Result<TangentVector> {
    check_symmetric(&vector.matrix)?;
    check_spd(&vector.base)?;
    check_spd(to)?;
    check_same_dim(&vector.base, to)?;
    check_same_dim(&vector.matrix, to)?;

    let f_sqrt = sqrtm(&vector.base)?;
    let f_inv_sqrt = invsqrtm(&vector.base)?;
    let whitened = symmetrize(&f_inv_sqrt.dot(to).dot(&f_inv_sqrt));
    let whitened_sqrt = sqrtm(&whitened)?;
    let e = f_sqrt.dot(&whitened_sqrt).dot(&f_inv_sqrt);

    let matrix = symmetrize(&e.dot(&vector.matrix).dot(&e.t()));
    Ok(TangentVector {
        matrix,
        base: to.clone(),
    })
}

/// Move an SPD matrix from the neighborhood of `from` to the neighborhood
/// of `to`: log-map at `from`, parallel-transport the tangent vector to
/// `to`, exp-map back onto the manifold.
///
/// This is the only implementation; callers needing the intermediate
/// tangent vector can run the three steps themselves and get the exact
/// same result.
pub fn translate(point: &Array2<f64>, from: &Array2<f64>, to: &Array2<f64>) -> Result<Array2<f64>> {
    let tangent = logmap(point, from)?;
    let transported = transport(&tangent, to)?;
    expmap(&transported)
}

/// Fréchet (Karcher) mean of a set of SPD matrices: the minimizer of the
/// sum of squared geodesic distances.
///
/// Karcher flow with adaptive step size: average the log-maps of all points
/// at the current estimate, exponentiate the (scaled) average, repeat until
/// the mean tangent's Frobenius norm drops below `tolerance`. A single
/// input is returned unchanged with zero iterations. Exceeding `max_iter`
/// is an error, never a best-effort result.
pub fn frechet_mean(points: &[Array2<f64>], max_iter: usize, tolerance: f64) -> Result<Array2<f64>> {
    if points.is_empty() {
        return Err(Error::InvalidInput("mean of an empty matrix set".into()));
    }
    let p = points[0].nrows();
    for m in points {
        check_spd(m)?;
        check_same_dim(&points[0], m)?;
    }
    let n = points.len();
    if n == 1 {
        return Ok(points[0].clone());
    }

    // Arithmetic mean as the starting estimate.
    let mut g = Array2::<f64>::zeros((p, p));
    for m in points {
        g += m;
    }
    g /= n as f64;

    let mut nu = 1.0;
    let mut prev_norm = f64::INFINITY;
    let mut residual = f64::INFINITY;

    for iter in 0..max_iter {
        let g_sqrt = sqrtm(&g)?;
        let g_inv_sqrt = invsqrtm(&g)?;

        // Mean tangent vector at the current estimate.
        let mut j = Array2::<f64>::zeros((p, p));
        for m in points {
            let whitened = symmetrize(&g_inv_sqrt.dot(m).dot(&g_inv_sqrt));
            j += &logm(&whitened)?;
        }
        j /= n as f64;

        residual = frobenius_norm(&j);
        if residual < tolerance {
            debug!(iterations = iter, residual, "frechet mean converged");
            return Ok(g);
        }

        if residual < prev_norm {
            nu *= 0.95;
        } else {
            nu *= 0.5;
        }
        prev_norm = residual;

        let step = expm(&(&j * nu))?;
        g = symmetrize(&g_sqrt.dot(&step).dot(&g_sqrt));
    }

    Err(Error::ConvergenceFailure {
        iterations: max_iter,
        residual,
    })
}
