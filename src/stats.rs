//! Site-local sufficient statistics for the normal equations.

use crate::error::PhaseError;
use crate::linalg::faer_ndarray::{blocked_atb, fast_ata};
use crate::linalg::utils::{KahanSum, first_non_finite};
use crate::matrix::{DesignMatrix, ResponseMatrix};
use ndarray::{Array1, Array2, Axis};

/// XᵗX, Xᵗy, and the per-voxel response mean and count for one site.
///
/// λ is carried for the aggregator and never applied here.
#[derive(Debug, Clone)]
pub struct SufficientStatistics {
    pub xtx: Array2<f64>,
    pub xty: Array2<f64>,
    pub mean_y: Array1<f64>,
    pub count_y: Vec<usize>,
    pub labels: Vec<String>,
    pub lambda: f64,
}

impl SufficientStatistics {
    /// Computes the statistics for `design` against `response`.
    ///
    /// Both products go through the fixed-block kernels, so repeated calls on the same
    /// matrices give bit-identical results whatever the rayon pool size.
    pub fn compute(
        design: &DesignMatrix,
        response: &ResponseMatrix,
        lambda: f64,
    ) -> Result<Self, PhaseError> {
        if design.subjects() != response.subjects() {
            return Err(PhaseError::DataInsufficiency(
                "design and response rows do not list the same subjects".to_string(),
            ));
        }
        if response.nrows() == 0 || response.nvoxels() == 0 {
            return Err(PhaseError::DataInsufficiency(format!(
                "response matrix is empty ({} subjects x {} voxels)",
                response.nrows(),
                response.nvoxels()
            )));
        }

        let x = design.values();
        let y = response.values();
        let xtx = fast_ata(x);
        let xty = blocked_atb(x, y);
        let (mean_y, count_y) = mean_and_count(y);

        Ok(Self {
            xtx,
            xty,
            mean_y,
            count_y,
            labels: design.labels().to_vec(),
            lambda,
        })
    }

    /// Fails on the first NaN or infinity in any aggregator-visible statistic.
    pub fn ensure_finite(&self) -> Result<(), PhaseError> {
        if let Some((row, col)) = first_non_finite(&self.xtx) {
            return Err(PhaseError::NonFiniteStatistic {
                statistic: "XtransposeX_local",
                row,
                col,
            });
        }
        if let Some((row, col)) = first_non_finite(&self.xty) {
            return Err(PhaseError::NonFiniteStatistic {
                statistic: "Xtransposey_local",
                row,
                col,
            });
        }
        if let Some(col) = self.mean_y.iter().position(|v| !v.is_finite()) {
            return Err(PhaseError::NonFiniteStatistic {
                statistic: "mean_y_local",
                row: 0,
                col,
            });
        }
        Ok(())
    }
}

/// Per-voxel mean and count of the response over the site's subjects.
pub fn mean_and_count(y: &Array2<f64>) -> (Array1<f64>, Vec<usize>) {
    let n = y.nrows();
    let mean = y
        .axis_iter(Axis(1))
        .map(|column| {
            if n == 0 {
                f64::NAN
            } else {
                column.iter().copied().collect::<KahanSum>().sum() / n as f64
            }
        })
        .collect::<Array1<f64>>();
    (mean, vec![n; y.ncols()])
}
