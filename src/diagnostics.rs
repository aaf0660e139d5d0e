//! Informational per-voxel OLS fit on the site's own data.
//!
//! Nothing here feeds the aggregation arithmetic; the numbers are reported so that an
//! operator can sanity-check a site. Undefined quantities are `None` (JSON `null`).

use crate::linalg::faer_ndarray::{
    FaerArrayView, FaerLinalgError, factorize_symmetric_with_fallback, fast_ab, fast_ata,
    fast_atb, map_column_blocks, mat_to_array,
};
use crate::linalg::utils::KahanSum;
use crate::matrix::{DesignMatrix, ResponseMatrix};
use crate::probability::student_t_two_sided_p;
use faer::{Mat, Side};
use ndarray::{Array2, s};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoxelDiagnostics {
    #[serde(rename = "Coefficient")]
    pub coefficient: Vec<Option<f64>>,
    #[serde(rename = "Sum Square of Errors")]
    pub sse: Option<f64>,
    #[serde(rename = "t Stat")]
    pub t_stat: Vec<Option<f64>>,
    #[serde(rename = "P-value")]
    pub p_value: Vec<Option<f64>>,
    #[serde(rename = "R Squared")]
    pub r_squared: Option<f64>,
    pub covariate_labels: Vec<String>,
}

/// Lower bound on cond(XᵗX) above which the local system is treated as singular.
const MAX_CONDITION: f64 = 1e12;

fn finite(v: f64) -> Option<f64> {
    v.is_finite().then_some(v)
}

/// Fits y_v = Xβ_v by ordinary least squares for every voxel v.
///
/// Fails when XᵗX cannot be inverted, e.g. fewer subjects than columns or a constant
/// covariate colliding with the bias column.
pub fn local_diagnostics(
    design: &DesignMatrix,
    response: &ResponseMatrix,
) -> Result<Vec<VoxelDiagnostics>, FaerLinalgError> {
    let x = design.values();
    let y = response.values();
    let (n, p) = x.dim();

    let xtx = fast_ata(x);
    let xtx_view = FaerArrayView::new(&xtx);
    let factor = factorize_symmetric_with_fallback(xtx_view.as_ref(), Side::Lower)?;
    let identity = Mat::<f64>::identity(p, p);
    let inverse = mat_to_array(factor.solve(identity.as_ref()).as_ref());
    if inverse.iter().any(|v| !v.is_finite()) || (0..p).any(|j| inverse[[j, j]] <= 0.0) {
        return Err(FaerLinalgError::FactorizationFailed);
    }
    // max diag(A) * max diag(A^-1) <= cond(A) for symmetric positive definite A. An
    // LLT with a rounding-sized pivot passes the checks above, this one does not.
    let max_diag = (0..p).map(|j| xtx[[j, j]]).fold(0.0f64, f64::max);
    let max_inv_diag = (0..p).map(|j| inverse[[j, j]]).fold(0.0f64, f64::max);
    if max_diag * max_inv_diag > MAX_CONDITION {
        return Err(FaerLinalgError::FactorizationFailed);
    }

    let dof = n as f64 - p as f64;
    let labels = design.labels().to_vec();

    let blocks = map_column_blocks(y.ncols(), |cols| {
        let y_block = y.slice(s![.., cols]);
        let beta = fast_ab(&inverse, &fast_atb(x, &y_block));
        let fitted = fast_ab(x, &beta);
        (0..y_block.ncols())
            .map(|j| {
                let observed = y_block.column(j).to_vec();
                voxel_diagnostics(&observed, &fitted, &beta, j, &inverse, dof, &labels)
            })
            .collect::<Vec<_>>()
    });

    Ok(blocks.into_iter().flatten().collect())
}

fn voxel_diagnostics(
    observed: &[f64],
    fitted: &Array2<f64>,
    beta: &Array2<f64>,
    j: usize,
    inverse: &Array2<f64>,
    dof: f64,
    labels: &[String],
) -> VoxelDiagnostics {
    let n = observed.len() as f64;
    let mean = observed.iter().copied().collect::<KahanSum>().sum() / n;
    let sse = observed
        .iter()
        .zip(fitted.column(j).iter())
        .map(|(o, f)| (o - f) * (o - f))
        .collect::<KahanSum>()
        .sum();
    let sst = observed
        .iter()
        .map(|o| (o - mean) * (o - mean))
        .collect::<KahanSum>()
        .sum();

    let r_squared = if sst > 0.0 { finite(1.0 - sse / sst) } else { None };
    let sigma2 = if dof > 0.0 { sse / dof } else { f64::NAN };

    let coefficient: Vec<Option<f64>> = beta.column(j).iter().map(|&b| finite(b)).collect();
    let t_stat: Vec<Option<f64>> = beta
        .column(j)
        .iter()
        .enumerate()
        .map(|(k, &b)| {
            let se = (sigma2 * inverse[[k, k]]).sqrt();
            if se > 0.0 { finite(b / se) } else { None }
        })
        .collect();
    let p_value = t_stat
        .iter()
        .map(|t| t.and_then(|t| student_t_two_sided_p(t, dof).ok()))
        .collect();

    VoxelDiagnostics {
        coefficient,
        sse: finite(sse),
        t_stat,
        p_value,
        r_squared,
        covariate_labels: labels.to_vec(),
    }
}
