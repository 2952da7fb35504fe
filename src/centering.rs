//! Re-centers per-scan covariance matrices from their subject's Fréchet
//! mean to the grand mean of the whole dataset.
//!
//! Tangent vectors are taken at the grand mean on purpose: a positive entry
//! (i, j) in any record's tangent vector then reads the same way across all
//! records (covariance between variables i and j above the grand average).
//! Without the centering step, per-subject baseline differences dominate
//! any downstream embedding of the raw covariances.

use std::collections::BTreeMap;

use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::covariances::Covariances;
use crate::error::{Error, Result};
use crate::geometry::{self, TangentVector, MEAN_MAX_ITER, MEAN_TOLERANCE};

/// One scan: raw multichannel time series keyed by subject and condition.
/// Rows are time samples, columns are measured variables.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanRecord {
    pub subject: String,
    pub condition: String,
    pub observations: Array2<f64>,
}

/// A record whose covariance has already been estimated.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CovarianceRecord {
    pub subject: String,
    pub condition: String,
    pub covariance: Array2<f64>,
}

/// Output record: the original covariance estimate, its translation to the
/// grand mean, and the tangent vector at the grand mean.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CenteredRecord {
    pub subject: String,
    pub condition: String,
    pub covariance: Array2<f64>,
    pub centered: Array2<f64>,
    pub tangent: TangentVector,
}

/// Full pipeline output, including the per-subject means and the grand mean
/// needed by downstream excursion/embedding/plotting tooling.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CenteredDataset {
    pub records: Vec<CenteredRecord>,
    pub subject_means: BTreeMap<String, Array2<f64>>,
    pub grand_mean: Array2<f64>,
}

impl CenteredDataset {
    pub fn from_json(json_str: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(json_str)
    }

    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn to_json_pretty(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Batch centering pipeline.
///
/// Estimation is independent per record and subject means are independent
/// per subject; both stages run on rayon workers. The grand mean and the
/// per-record translation only start once every subject mean is finalized,
/// and the means are shared read-only from then on.
pub struct CenteringPipeline {
    estimator: Covariances,
    mean_max_iter: usize,
    mean_tolerance: f64,
}

impl CenteringPipeline {
    pub fn new(estimator: Covariances) -> Self {
        Self {
            estimator,
            mean_max_iter: MEAN_MAX_ITER,
            mean_tolerance: MEAN_TOLERANCE,
        }
    }

    /// Override the Fréchet-mean iteration budget and tolerance.
    pub fn with_mean_budget(mut self, max_iter: usize, tolerance: f64) -> Self {
        self.mean_max_iter = max_iter;
        self.mean_tolerance = tolerance;
        self
    }

    /// Estimate a covariance per scan, then center the whole collection.
    pub fn run(&self, scans: &[ScanRecord]) -> Result<CenteredDataset> {
        if scans.is_empty() {
            return Err(Error::InvalidInput("no scan records".into()));
        }
        debug!(records = scans.len(), "estimating covariances");
        let records: Vec<CovarianceRecord> = scans
            .par_iter()
            .map(|scan| {
                let covariance = self.estimator.transform(scan.observations.view())?;
                Ok(CovarianceRecord {
                    subject: scan.subject.clone(),
                    condition: scan.condition.clone(),
                    covariance,
                })
            })
            .collect::<Result<_>>()?;
        self.center(&records)
    }

    /// Center records that already carry an estimated SPD matrix.
    ///
    /// Subject means come from each subject's own matrices; the grand mean
    /// is the Fréchet mean over the full multiset of all matrices (not a
    /// mean of subject means), so subjects with unequal record counts are
    /// weighted by their records.
    pub fn center(&self, records: &[CovarianceRecord]) -> Result<CenteredDataset> {
        if records.is_empty() {
            return Err(Error::InvalidInput("no covariance records".into()));
        }
        let p = records[0].covariance.nrows();
        for r in records {
            if r.covariance.nrows() != p {
                return Err(Error::DimensionMismatch {
                    expected: p,
                    found: r.covariance.nrows(),
                });
            }
        }

        // One-shot grouping; the index is read-only from here on.
        let mut groups: BTreeMap<&str, Vec<&Array2<f64>>> = BTreeMap::new();
        for r in records {
            groups.entry(&r.subject).or_default().push(&r.covariance);
        }
        debug!(
            subjects = groups.len(),
            records = records.len(),
            "computing subject means"
        );

        let subject_means: BTreeMap<String, Array2<f64>> = groups
            .par_iter()
            .map(|(subject, matrices)| {
                let owned: Vec<Array2<f64>> = matrices.iter().map(|m| (*m).clone()).collect();
                let mean = geometry::frechet_mean(&owned, self.mean_max_iter, self.mean_tolerance)?;
                Ok((subject.to_string(), mean))
            })
            .collect::<Result<_>>()?;

        debug!("computing grand mean");
        let all: Vec<Array2<f64>> = records.iter().map(|r| r.covariance.clone()).collect();
        let grand_mean = geometry::frechet_mean(&all, self.mean_max_iter, self.mean_tolerance)?;

        debug!("translating records to the grand mean");
        let centered_records: Vec<CenteredRecord> = records
            .par_iter()
            .map(|r| {
                let subject_mean = subject_means.get(&r.subject).ok_or_else(|| {
                    Error::InvalidInput(format!("no mean for subject {}", r.subject))
                })?;
                let centered = geometry::translate(&r.covariance, subject_mean, &grand_mean)?;
                let tangent = geometry::logmap(&centered, &grand_mean)?;
                Ok(CenteredRecord {
                    subject: r.subject.clone(),
                    condition: r.condition.clone(),
                    covariance: r.covariance.clone(),
                    centered,
                    tangent,
                })
            })
            .collect::<Result<_>>()?;

        Ok(CenteredDataset {
            records: centered_records,
            subject_means,
            grand_mean,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covariances::EstimatorMethod;
    use crate::geometry::{distance, frobenius_norm};
    use ndarray::arr2;

    fn pipeline() -> CenteringPipeline {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_target(false)
            .try_init();
        CenteringPipeline::new(Covariances::new(EstimatorMethod::LedoitWolf))
    }

    /// X_{s,c} = D_s C_c D_s: a fixed condition-level signal pushed around
    /// by a subject-specific congruence.
    fn synthetic_covariance_records() -> Vec<CovarianceRecord> {
        let conditions = [
            arr2(&[[2.0, 0.5, 0.2], [0.5, 1.5, 0.3], [0.2, 0.3, 1.0]]),
            arr2(&[[1.0, -0.2, 0.1], [-0.2, 2.0, 0.4], [0.1, 0.4, 1.8]]),
        ];
        let subjects = [
            ("s01", [1.0, 1.0, 1.0]),
            ("s02", [2.0, 1.5, 0.8]),
            ("s03", [0.6, 1.8, 1.2]),
        ];

        let mut records = Vec::new();
        for (subject, d) in &subjects {
            for (ci, c) in conditions.iter().enumerate() {
                let mut x = c.clone();
                for i in 0..3 {
                    for j in 0..3 {
                        x[[i, j]] *= d[i] * d[j];
                    }
                }
                records.push(CovarianceRecord {
                    subject: subject.to_string(),
                    condition: format!("cond{}", ci + 1),
                    covariance: x,
                });
            }
        }
        records
    }

    fn condition_templates() -> [Array2<f64>; 2] {
        [
            arr2(&[
                [1.10, -0.42, 0.30],
                [-0.75, 0.98, -0.11],
                [0.34, 0.27, -1.22],
                [-1.40, -0.58, 0.77],
                [0.05, 1.31, 0.49],
                [0.88, -0.93, -0.65],
                [-0.27, 0.44, 1.05],
                [0.61, -0.87, -0.39],
            ]),
            arr2(&[
                [0.20, 1.15, -0.80],
                [1.32, -0.25, 0.46],
                [-0.94, 0.71, 0.88],
                [0.57, -1.24, -0.33],
                [-0.46, 0.39, -1.10],
                [1.01, 0.82, 0.12],
                [-0.68, -0.51, 0.95],
                [0.15, -0.90, -0.57],
            ]),
        ]
    }

    /// 4 subjects x 2 conditions, 8x3 observations; the subject effect is a
    /// per-variable gain, which maps to a diagonal congruence on the
    /// covariance.
    fn synthetic_scans() -> Vec<ScanRecord> {
        let templates = condition_templates();
        let subjects = [
            ("s01", [1.0, 1.0, 1.0]),
            ("s02", [2.0, 1.5, 0.8]),
            ("s03", [0.6, 1.8, 1.2]),
            ("s04", [1.4, 0.7, 2.2]),
        ];

        let mut scans = Vec::new();
        for (subject, gains) in &subjects {
            for (ci, template) in templates.iter().enumerate() {
                let mut observations = template.clone();
                for mut row in observations.rows_mut() {
                    for (j, v) in row.iter_mut().enumerate() {
                        *v *= gains[j];
                    }
                }
                scans.push(ScanRecord {
                    subject: subject.to_string(),
                    condition: format!("cond{}", ci + 1),
                    observations,
                });
            }
        }
        scans
    }

    #[test]
    fn empty_input_is_invalid() {
        assert!(matches!(
            pipeline().run(&[]),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            pipeline().center(&[]),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn mixed_dimensions_are_rejected() {
        let records = vec![
            CovarianceRecord {
                subject: "s01".into(),
                condition: "a".into(),
                covariance: Array2::eye(3),
            },
            CovarianceRecord {
                subject: "s01".into(),
                condition: "b".into(),
                covariance: Array2::eye(4),
            },
        ];
        assert!(matches!(
            pipeline().center(&records),
            Err(Error::DimensionMismatch {
                expected: 3,
                found: 4
            })
        ));
    }

    #[test]
    fn originals_are_left_untouched() {
        let records = synthetic_covariance_records();
        let dataset = pipeline().center(&records).unwrap();
        for (before, after) in records.iter().zip(dataset.records.iter()) {
            assert_eq!(before.covariance, after.covariance);
            assert_eq!(before.subject, after.subject);
            assert_eq!(before.condition, after.condition);
        }
    }

    #[test]
    fn tangent_vectors_are_based_at_the_grand_mean() {
        let dataset = pipeline().center(&synthetic_covariance_records()).unwrap();
        for r in &dataset.records {
            assert_eq!(r.tangent.base, dataset.grand_mean);
            crate::geometry::check_spd(&r.centered).unwrap();
        }
    }

    #[test]
    fn grand_mean_is_over_the_full_multiset() {
        // Unequal record counts per subject: the grand mean must match the
        // Fréchet mean of all matrices, not a mean of subject means.
        let records = vec![
            CovarianceRecord {
                subject: "s01".into(),
                condition: "a".into(),
                covariance: arr2(&[[4.0, 0.0], [0.0, 1.0]]),
            },
            CovarianceRecord {
                subject: "s01".into(),
                condition: "b".into(),
                covariance: arr2(&[[4.0, 0.0], [0.0, 1.0]]),
            },
            CovarianceRecord {
                subject: "s02".into(),
                condition: "a".into(),
                covariance: arr2(&[[1.0, 0.0], [0.0, 4.0]]),
            },
        ];
        let dataset = pipeline().center(&records).unwrap();

        let all: Vec<Array2<f64>> = records.iter().map(|r| r.covariance.clone()).collect();
        let direct =
            crate::geometry::frechet_mean(&all, MEAN_MAX_ITER, MEAN_TOLERANCE).unwrap();
        for (a, b) in dataset.grand_mean.iter().zip(direct.iter()) {
            assert!((a - b).abs() < 1e-8);
        }
    }

    #[test]
    fn centering_reduces_same_condition_dispersion() {
        let records = synthetic_covariance_records();
        let dataset = pipeline().center(&records).unwrap();

        let mut before = 0.0;
        let mut after = 0.0;
        for i in 0..records.len() {
            for j in (i + 1)..records.len() {
                if records[i].condition != records[j].condition {
                    continue;
                }
                let d0 = distance(&records[i].covariance, &records[j].covariance).unwrap();
                let d1 = distance(
                    &dataset.records[i].centered,
                    &dataset.records[j].centered,
                )
                .unwrap();
                before += d0 * d0;
                after += d1 * d1;
            }
        }
        assert!(
            after <= before + 1e-9,
            "dispersion after centering ({after}) exceeds before ({before})"
        );
        assert!(after < before, "centering did not reduce dispersion");
    }

    #[test]
    fn end_to_end_tangents_cluster_by_condition() {
        let scans = synthetic_scans();
        let dataset = pipeline().run(&scans).unwrap();
        assert_eq!(dataset.records.len(), 8);
        assert_eq!(dataset.subject_means.len(), 4);

        let mut geodesic_before = 0.0;
        let mut tangent_after = 0.0;
        for i in 0..dataset.records.len() {
            for j in (i + 1)..dataset.records.len() {
                let (a, b) = (&dataset.records[i], &dataset.records[j]);
                if a.condition != b.condition {
                    continue;
                }
                geodesic_before += distance(&a.covariance, &b.covariance).unwrap();
                tangent_after += frobenius_norm(&(&a.tangent.matrix - &b.tangent.matrix));
            }
        }
        assert!(
            tangent_after < geodesic_before,
            "same-condition tangents ({tangent_after}) are not tighter than the raw \
             covariances were ({geodesic_before})"
        );
    }

    #[test]
    fn run_matches_transform_then_center() {
        let scans = synthetic_scans();
        let estimator = Covariances::new(EstimatorMethod::LedoitWolf);
        let records: Vec<CovarianceRecord> = scans
            .iter()
            .map(|s| CovarianceRecord {
                subject: s.subject.clone(),
                condition: s.condition.clone(),
                covariance: estimator.transform(s.observations.view()).unwrap(),
            })
            .collect();

        let from_run = pipeline().run(&scans).unwrap();
        let from_center = pipeline().center(&records).unwrap();
        for (a, b) in from_run.records.iter().zip(from_center.records.iter()) {
            for (x, y) in a.centered.iter().zip(b.centered.iter()) {
                assert!((x - y).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn dataset_json_round_trip() {
        let dataset = pipeline().center(&synthetic_covariance_records()).unwrap();
        let json = dataset.to_json().unwrap();
        let back = CenteredDataset::from_json(&json).unwrap();
        assert_eq!(back.records.len(), dataset.records.len());
        assert_eq!(back.grand_mean, dataset.grand_mean);
        assert_eq!(
            back.records[0].tangent.matrix,
            dataset.records[0].tangent.matrix
        );
    }
}
