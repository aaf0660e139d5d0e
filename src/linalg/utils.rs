use ndarray::Array2;

/// Compensated summation for the per-voxel reductions (means, SSE, SST).
#[derive(Default, Clone, Copy)]
pub(crate) struct KahanSum {
    sum: f64,
    c: f64,
}

impl KahanSum {
    pub(crate) fn add(&mut self, value: f64) {
        let y = value - self.c;
        let t = self.sum + y;
        self.c = (t - self.sum) - y;
        self.sum = t;
    }

    pub(crate) fn sum(self) -> f64 {
        self.sum
    }
}

impl FromIterator<f64> for KahanSum {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        let mut acc = KahanSum::default();
        for value in iter {
            acc.add(value);
        }
        acc
    }
}

/// Position of the first non-finite entry in row-major order.
pub(crate) fn first_non_finite(matrix: &Array2<f64>) -> Option<(usize, usize)> {
    matrix
        .indexed_iter()
        .find(|(_, v)| !v.is_finite())
        .map(|(idx, _)| idx)
}

#[cfg(test)]
mod tests {
    use super::{KahanSum, first_non_finite};
    use ndarray::array;

    #[test]
    fn kahan_sum_recovers_small_terms_lost_by_naive_summation() {
        let mut values = vec![1.0e16];
        values.extend(std::iter::repeat_n(1.0, 1000));
        let naive: f64 = values.iter().sum();
        let compensated = values.iter().copied().collect::<KahanSum>().sum();
        assert_eq!(compensated, 1.0e16 + 1000.0);
        assert_ne!(naive, compensated);
    }

    #[test]
    fn first_non_finite_reports_row_major_position() {
        assert_eq!(first_non_finite(&array![[1.0, 2.0], [3.0, 4.0]]), None);
        let m = array![[1.0, 2.0, 3.0], [f64::INFINITY, 5.0, f64::NAN]];
        assert_eq!(first_non_finite(&m), Some((1, 0)));
    }
}
