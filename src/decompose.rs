//! Residual variance of the site's data under globally fitted parameters.

use crate::linalg::faer_ndarray::{fast_ab, fast_ata, map_column_blocks};
use crate::linalg::utils::KahanSum;
use ndarray::{Array1, Array2, s};

/// SSE and SST per voxel plus the site's XᵗX, all evaluated against global parameters.
#[derive(Debug, Clone)]
pub struct ErrorDecomposition {
    pub sse: Array1<f64>,
    pub sst: Array1<f64>,
    pub var_x: Array2<f64>,
}

/// Evaluates the global fit on local data without refitting it.
///
/// `x` is subjects × p, `y` subjects × v, `beta` p × v (column v is voxel v's global
/// coefficients) and `mean_global` has one entry per voxel.
pub fn decompose(
    x: &Array2<f64>,
    y: &Array2<f64>,
    beta: &Array2<f64>,
    mean_global: &Array1<f64>,
) -> ErrorDecomposition {
    debug_assert_eq!(x.nrows(), y.nrows());
    debug_assert_eq!(x.ncols(), beta.nrows());
    debug_assert_eq!(y.ncols(), beta.ncols());
    debug_assert_eq!(y.ncols(), mean_global.len());

    let blocks = map_column_blocks(y.ncols(), |cols| {
        let fitted = fast_ab(x, &beta.slice(s![.., cols.clone()]));
        let mut sse = Vec::with_capacity(cols.len());
        let mut sst = Vec::with_capacity(cols.len());
        for (j, voxel) in cols.enumerate() {
            let observed = y.column(voxel);
            let predicted = fitted.column(j);
            let mean = mean_global[voxel];
            sse.push(
                observed
                    .iter()
                    .zip(predicted.iter())
                    .map(|(o, p)| (o - p) * (o - p))
                    .collect::<KahanSum>()
                    .sum(),
            );
            sst.push(
                observed
                    .iter()
                    .map(|o| (o - mean) * (o - mean))
                    .collect::<KahanSum>()
                    .sum(),
            );
        }
        (sse, sst)
    });

    let mut sse = Vec::with_capacity(y.ncols());
    let mut sst = Vec::with_capacity(y.ncols());
    for (block_sse, block_sst) in blocks {
        sse.extend(block_sse);
        sst.extend(block_sst);
    }

    ErrorDecomposition {
        sse: Array1::from(sse),
        sst: Array1::from(sst),
        var_x: fast_ata(x),
    }
}
