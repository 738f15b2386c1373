use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

/// Pivot magnitude below which a matrix is treated as singular.
const SINGULAR_PIVOT: f64 = 1e-300;

pub struct MatrixHelper;

impl MatrixHelper {
    /// Multiply two 2D arrays.
    pub fn multiply(lhs: ArrayView2<f64>, rhs: ArrayView2<f64>) -> Array2<f64> {
        lhs.dot(&rhs)
    }

    /// Quadratic form `gᵀ C g`, the first-order variance of a derived quantity.
    pub fn quadratic_form(gradient: ArrayView1<f64>, covariance: ArrayView2<f64>) -> f64 {
        gradient.dot(&covariance.dot(&gradient))
    }

    /// Lower-triangular Cholesky factor, `None` unless the matrix is
    /// symmetric positive definite.
    pub fn cholesky(matrix: ArrayView2<f64>) -> Option<Array2<f64>> {
        let n = matrix.nrows();
        if n != matrix.ncols() {
            return None;
        }

        let mut lower = Array2::<f64>::zeros((n, n));
        for j in 0..n {
            let mut diag = matrix[[j, j]];
            for k in 0..j {
                diag -= lower[[j, k]] * lower[[j, k]];
            }
            if !diag.is_finite() || diag <= 0.0 {
                return None;
            }
            let pivot = diag.sqrt();
            lower[[j, j]] = pivot;

            for i in (j + 1)..n {
                let mut value = matrix[[i, j]];
                for k in 0..j {
                    value -= lower[[i, k]] * lower[[j, k]];
                }
                lower[[i, j]] = value / pivot;
            }
        }
        Some(lower)
    }

    /// Solve `L Lᵀ x = b` given the Cholesky factor `L`.
    pub fn cholesky_solve(lower: ArrayView2<f64>, rhs: ArrayView1<f64>) -> Array1<f64> {
        let n = lower.nrows();
        let mut y = Array1::<f64>::zeros(n);
        for i in 0..n {
            let mut value = rhs[i];
            for k in 0..i {
                value -= lower[[i, k]] * y[k];
            }
            y[i] = value / lower[[i, i]];
        }

        let mut x = Array1::<f64>::zeros(n);
        for i in (0..n).rev() {
            let mut value = y[i];
            for k in (i + 1)..n {
                value -= lower[[k, i]] * x[k];
            }
            x[i] = value / lower[[i, i]];
        }
        x
    }

    pub fn solve_spd(matrix: ArrayView2<f64>, rhs: ArrayView1<f64>) -> Option<Array1<f64>> {
        let lower = Self::cholesky(matrix)?;
        let solution = Self::cholesky_solve(lower.view(), rhs);
        solution.iter().all(|v| v.is_finite()).then_some(solution)
    }

    /// Inverse of a symmetric positive-definite matrix.
    pub fn invert_spd(matrix: ArrayView2<f64>) -> Option<Array2<f64>> {
        let n = matrix.nrows();
        let lower = Self::cholesky(matrix)?;
        let mut inverse = Array2::<f64>::zeros((n, n));
        let mut unit = Array1::<f64>::zeros(n);
        for col in 0..n {
            unit.fill(0.0);
            unit[col] = 1.0;
            let column = Self::cholesky_solve(lower.view(), unit.view());
            inverse.column_mut(col).assign(&column);
        }
        Some(inverse)
    }

    /// Gauss-Jordan inverse with partial pivoting. Used when the matrix is
    /// not positive definite.
    pub fn invert_pivoted(matrix: ArrayView2<f64>) -> Option<Array2<f64>> {
        let n = matrix.nrows();
        if n != matrix.ncols() {
            return None;
        }

        let mut work = matrix.to_owned();
        let mut inverse = Array2::<f64>::eye(n);

        for col in 0..n {
            let pivot_row = (col..n).max_by(|&a, &b| {
                work[[a, col]]
                    .abs()
                    .partial_cmp(&work[[b, col]].abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })?;
            let pivot = work[[pivot_row, col]];
            if !pivot.is_finite() || pivot.abs() < SINGULAR_PIVOT {
                return None;
            }

            if pivot_row != col {
                for k in 0..n {
                    work.swap([pivot_row, k], [col, k]);
                    inverse.swap([pivot_row, k], [col, k]);
                }
            }

            for k in 0..n {
                work[[col, k]] /= pivot;
                inverse[[col, k]] /= pivot;
            }

            for row in 0..n {
                if row == col {
                    continue;
                }
                let factor = work[[row, col]];
                if factor == 0.0 {
                    continue;
                }
                for k in 0..n {
                    work[[row, k]] -= factor * work[[col, k]];
                    inverse[[row, k]] -= factor * inverse[[col, k]];
                }
            }
        }

        Some(inverse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn cholesky_solve_recovers_known_solution() {
        let a = array![[4.0, 2.0, 0.6], [2.0, 5.0, 1.0], [0.6, 1.0, 3.0]];
        let x = array![1.0, -2.0, 0.5];
        let b = a.dot(&x);
        let solved = MatrixHelper::solve_spd(a.view(), b.view()).unwrap();
        for (lhs, rhs) in solved.iter().zip(x.iter()) {
            assert!((lhs - rhs).abs() < 1e-12);
        }
    }

    #[test]
    fn cholesky_rejects_indefinite_matrix() {
        let a = array![[1.0, 2.0], [2.0, 1.0]];
        assert!(MatrixHelper::cholesky(a.view()).is_none());
    }

    #[test]
    fn spd_and_pivoted_inverses_agree() {
        let a = array![[2.0, 0.5], [0.5, 1.0]];
        let spd = MatrixHelper::invert_spd(a.view()).unwrap();
        let pivoted = MatrixHelper::invert_pivoted(a.view()).unwrap();
        let identity = MatrixHelper::multiply(a.view(), spd.view());
        for i in 0..2 {
            for j in 0..2 {
                assert!((spd[[i, j]] - pivoted[[i, j]]).abs() < 1e-12);
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((identity[[i, j]] - expected).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn pivoted_inverse_handles_indefinite_matrix() {
        let a = array![[0.0, 1.0], [1.0, 0.0]];
        let inverse = MatrixHelper::invert_pivoted(a.view()).unwrap();
        assert_eq!(inverse, array![[0.0, 1.0], [1.0, 0.0]]);
    }

    #[test]
    fn pivoted_inverse_rejects_singular_matrix() {
        let a = array![[1.0, 2.0], [2.0, 4.0]];
        assert!(MatrixHelper::invert_pivoted(a.view()).is_none());
    }

    #[test]
    fn quadratic_form_matches_manual_sum() {
        let c = array![[1.0, 0.5], [0.5, 2.0]];
        let g = array![2.0, 1.0];
        assert!((MatrixHelper::quadratic_form(g.view(), c.view()) - 8.0).abs() < 1e-12);
    }
}
