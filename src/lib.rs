//! Manifold centering of brain-activity covariance matrices.
//!
//! Estimates regularized covariance matrices from per-scan time series,
//! computes Fréchet means on the SPD manifold under the affine-invariant
//! metric, and translates every matrix from its subject's mean to the grand
//! mean. The centered matrices and their tangent vectors at the grand mean
//! feed downstream excursion and embedding analyses.

pub mod centering;
pub mod covariances;
pub mod error;
pub mod geometry;

pub use centering::{
    CenteredDataset, CenteredRecord, CenteringPipeline, CovarianceRecord, ScanRecord,
};
pub use covariances::{Covariances, EstimatorMethod};
pub use error::{Error, Result};
pub use geometry::TangentVector;
