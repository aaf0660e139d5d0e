use faer::linalg::matmul::matmul;
use faer::linalg::solvers::{self, Solve};
pub use faer::linalg::solvers::{Ldlt as FaerLdlt, Llt as FaerLlt};
use faer::{Accum, Mat, MatMut, MatRef, Par, Side};
use ndarray::{Array2, ArrayBase, Data, Ix2, s};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use std::marker::PhantomData;
use std::ops::Range;
use thiserror::Error;

/// Voxel columns per work unit in the blocked kernels.
///
/// The width is a constant rather than a function of the pool size: every block is
/// multiplied by a single worker, so the accumulation order of each output column is
/// the same whether the pool has one thread or sixty-four.
pub const VOXEL_BLOCK_WIDTH: usize = 256;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("Factorization failed")]
    FactorizationFailed,
    #[error("LDLT factorization failed: {0:?}")]
    Ldlt(solvers::LdltError),
}

pub enum FaerSymmetricFactor {
    Llt(FaerLlt<f64>),
    Ldlt(FaerLdlt<f64>),
}

impl FaerSymmetricFactor {
    #[inline]
    pub fn solve(&self, rhs: MatRef<'_, f64>) -> Mat<f64> {
        match self {
            FaerSymmetricFactor::Llt(f) => f.solve(rhs),
            FaerSymmetricFactor::Ldlt(f) => f.solve(rhs),
        }
    }
}

/// Factorize a symmetric system with an LLT first attempt and LDLT fallback.
#[inline]
pub fn factorize_symmetric_with_fallback(
    matrix: MatRef<'_, f64>,
    side: Side,
) -> Result<FaerSymmetricFactor, FaerLinalgError> {
    if matrix.nrows() != matrix.ncols() || matrix.nrows() == 0 {
        return Err(FaerLinalgError::FactorizationFailed);
    }
    if let Ok(llt) = FaerLlt::new(matrix, side) {
        return Ok(FaerSymmetricFactor::Llt(llt));
    }
    let ldlt = FaerLdlt::new(matrix, side).map_err(FaerLinalgError::Ldlt)?;
    Ok(FaerSymmetricFactor::Ldlt(ldlt))
}

#[inline]
fn should_use_faer_matmul(m: usize, n: usize, k: usize) -> bool {
    // Stay on ndarray for tiny products to avoid setup overhead. The choice only
    // depends on the shape, so it never changes between identical runs.
    const MIN_DIM: usize = 32;
    const MIN_FLOP_SCALE: usize = 64 * 64;
    (m >= MIN_DIM || n >= MIN_DIM || k >= MIN_DIM)
        && m.saturating_mul(n).saturating_mul(k) >= MIN_FLOP_SCALE
}

#[inline]
pub fn array2_to_mat_mut(array: &mut Array2<f64>) -> MatMut<'_, f64> {
    let (rows, cols) = array.dim();
    let strides = array.strides();
    let s0 = strides[0];
    let s1 = strides[1];

    // SAFETY: dimensions and strides come straight from the owned array, which stays
    // mutably borrowed for the lifetime of the returned view.
    unsafe { MatMut::from_raw_parts_mut(array.as_mut_ptr(), rows, cols, s0, s1) }
}

pub(crate) fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    let mut out = Array2::<f64>::zeros((mat.nrows(), mat.ncols()));
    for j in 0..mat.ncols() {
        for i in 0..mat.nrows() {
            out[[i, j]] = mat[(i, j)];
        }
    }
    out
}

/// Splits `0..ncols` into consecutive [`VOXEL_BLOCK_WIDTH`] ranges, runs `f` on each
/// range on the rayon pool and returns the results in block order.
pub fn map_column_blocks<T, F>(ncols: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(Range<usize>) -> T + Sync + Send,
{
    let n_blocks = ncols.div_ceil(VOXEL_BLOCK_WIDTH);
    (0..n_blocks)
        .into_par_iter()
        .map(|blk| {
            let start = blk * VOXEL_BLOCK_WIDTH;
            let end = (start + VOXEL_BLOCK_WIDTH).min(ncols);
            f(start..end)
        })
        .collect()
}

/// Compute A^T * A with a single worker and mirror the lower triangle, so the
/// result is exactly symmetric.
///
/// For a matrix A of shape (n, p), this computes the (p, p) result.
pub fn fast_ata<S: Data<Elem = f64>>(a: &ArrayBase<S, Ix2>) -> Array2<f64> {
    let (n, p) = a.dim();

    let mut out = if should_use_faer_matmul(p, p, n) {
        let mut result = Array2::<f64>::zeros((p, p));
        {
            let mut out_view = array2_to_mat_mut(&mut result);
            let a_view = FaerArrayView::new(a);
            let a_ref = a_view.as_ref();
            matmul(
                out_view.as_mut(),
                Accum::Replace,
                a_ref.transpose(),
                a_ref,
                1.0,
                Par::Seq,
            );
        }
        result
    } else {
        a.t().dot(a)
    };

    for i in 0..p {
        for j in (i + 1)..p {
            out[[i, j]] = out[[j, i]];
        }
    }
    out
}

/// Compute A^T * B for one column block with a single worker.
pub fn fast_atb<S1: Data<Elem = f64>, S2: Data<Elem = f64>>(
    a: &ArrayBase<S1, Ix2>,
    b: &ArrayBase<S2, Ix2>,
) -> Array2<f64> {
    let (n_a, p) = a.dim();
    let (n_b, q) = b.dim();
    debug_assert_eq!(n_a, n_b, "A and B must have same number of rows");

    if !should_use_faer_matmul(p, q, n_a) {
        return a.t().dot(b);
    }

    let mut result = Array2::<f64>::zeros((p, q));
    {
        let mut out_view = array2_to_mat_mut(&mut result);
        let a_view = FaerArrayView::new(a);
        let b_view = FaerArrayView::new(b);
        matmul(
            out_view.as_mut(),
            Accum::Replace,
            a_view.as_ref().transpose(),
            b_view.as_ref(),
            1.0,
            Par::Seq,
        );
    }
    result
}

/// Compute A * B for one column block with a single worker.
/// For A of shape (n, p) and B of shape (p, q), this computes the (n, q) result.
pub fn fast_ab<S1: Data<Elem = f64>, S2: Data<Elem = f64>>(
    a: &ArrayBase<S1, Ix2>,
    b: &ArrayBase<S2, Ix2>,
) -> Array2<f64> {
    let (n, p) = a.dim();
    let (p_b, q) = b.dim();
    debug_assert_eq!(p, p_b, "A and B must have compatible inner dimensions");

    if !should_use_faer_matmul(n, q, p) {
        return a.dot(b);
    }

    let mut result = Array2::<f64>::zeros((n, q));
    {
        let mut out_view = array2_to_mat_mut(&mut result);
        let a_view = FaerArrayView::new(a);
        let b_view = FaerArrayView::new(b);
        matmul(
            out_view.as_mut(),
            Accum::Replace,
            a_view.as_ref(),
            b_view.as_ref(),
            1.0,
            Par::Seq,
        );
    }
    result
}

/// Compute A^T * B over fixed-width column blocks of B in parallel.
///
/// Each output column is produced by exactly one [`fast_atb`] call on a block whose
/// boundaries depend only on `B`'s width, so the result is bit-identical for any
/// rayon pool size.
pub fn blocked_atb<S1, S2>(a: &ArrayBase<S1, Ix2>, b: &ArrayBase<S2, Ix2>) -> Array2<f64>
where
    S1: Data<Elem = f64> + Sync,
    S2: Data<Elem = f64> + Sync,
{
    let p = a.ncols();
    let q = b.ncols();
    let blocks = map_column_blocks(q, |cols| fast_atb(a, &b.slice(s![.., cols])));

    let mut out = Array2::<f64>::zeros((p, q));
    let mut start = 0usize;
    for block in blocks {
        let width = block.ncols();
        out.slice_mut(s![.., start..start + width]).assign(&block);
        start += width;
    }
    out
}

pub struct FaerArrayView<'a> {
    ptr: *const f64,
    rows: usize,
    cols: usize,
    row_stride: isize,
    col_stride: isize,
    owned: Option<Array2<f64>>,
    _marker: PhantomData<&'a f64>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let (rows, cols) = array.dim();
        let strides = array.strides();
        // Negative or zero strides can alias or reverse traversal, which faer kernels
        // do not expect. Such layouts are materialized into a compact owned copy.
        if strides[0] <= 0 || strides[1] <= 0 {
            let owned = array.to_owned();
            let owned_strides = owned.strides();
            return Self {
                ptr: owned.as_ptr(),
                rows,
                cols,
                row_stride: owned_strides[0],
                col_stride: owned_strides[1],
                owned: Some(owned),
                _marker: PhantomData,
            };
        }

        Self {
            ptr: array.as_ptr(),
            rows,
            cols,
            row_stride: strides[0],
            col_stride: strides[1],
            owned: None,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        let (ptr, rows, cols, row_stride, col_stride) = if let Some(owned) = &self.owned {
            let strides = owned.strides();
            (
                owned.as_ptr(),
                owned.nrows(),
                owned.ncols(),
                strides[0],
                strides[1],
            )
        } else {
            (
                self.ptr,
                self.rows,
                self.cols,
                self.row_stride,
                self.col_stride,
            )
        };
        // SAFETY: pointer/shape/strides either come directly from a live ndarray
        // view with positive strides, or from an owned compact copy stored inside
        // this wrapper, which guarantees validity for the returned view lifetime.
        unsafe { MatRef::from_raw_parts(ptr, rows, cols, row_stride, col_stride) }
    }
}
