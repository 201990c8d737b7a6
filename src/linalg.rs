// src/linalg.rs

//! Dense matrix kernel used by the ComBat estimator and the PCA engine.
//!
//! The operations are written directly over `ndarray` storage: a transpose into
//! standard layout, a plain triple-loop product, and Gauss-Jordan inversion with
//! partial pivoting.

use ndarray::{Array2, ArrayView2};

use crate::error::{CorrectionError, Result};

/// Pivots with magnitude below this are treated as zero during inversion.
pub const SINGULAR_PIVOT_TOLERANCE: f64 = 1e-20;

/// Returns the transpose of `matrix` as a new, standard-layout array.
pub fn transpose(matrix: &ArrayView2<f64>) -> Array2<f64> {
    let (rows, cols) = matrix.dim();
    Array2::from_shape_fn((cols, rows), |(i, j)| matrix[[j, i]])
}

/// Dense product `a · b`.
///
/// # Panics
/// Panics if `a.ncols() != b.nrows()`.
pub fn multiply(a: &ArrayView2<f64>, b: &ArrayView2<f64>) -> Array2<f64> {
    let (n, inner) = a.dim();
    let (inner_b, m) = b.dim();
    assert_eq!(
        inner, inner_b,
        "multiply: left operand has {} columns but right operand has {} rows",
        inner, inner_b
    );

    let mut product = Array2::<f64>::zeros((n, m));
    for i in 0..n {
        for k in 0..inner {
            let a_ik = a[[i, k]];
            if a_ik == 0.0 {
                continue;
            }
            for j in 0..m {
                product[[i, j]] += a_ik * b[[k, j]];
            }
        }
    }
    product
}

/// Inverts a square matrix by Gauss-Jordan elimination with partial pivoting.
///
/// The matrix is reduced alongside an identity of the same order; once the left
/// side is the identity the right side holds the inverse.
///
/// # Errors
/// Returns [`CorrectionError::SingularMatrix`] when the largest available pivot in
/// a column is smaller than [`SINGULAR_PIVOT_TOLERANCE`].
///
/// # Panics
/// Panics if `matrix` is not square.
pub fn invert(matrix: &ArrayView2<f64>) -> Result<Array2<f64>> {
    let (n, cols) = matrix.dim();
    assert_eq!(n, cols, "invert: matrix must be square, got {}x{}", n, cols);

    let mut left = matrix.to_owned();
    let mut right = Array2::<f64>::eye(n);

    for col in 0..n {
        // Row with the largest magnitude in the current column
        let mut pivot_row = col;
        let mut pivot_mag = left[[col, col]].abs();
        for row in col + 1..n {
            let mag = left[[row, col]].abs();
            if mag > pivot_mag {
                pivot_row = row;
                pivot_mag = mag;
            }
        }
        if pivot_mag < SINGULAR_PIVOT_TOLERANCE {
            return Err(CorrectionError::SingularMatrix {
                column: col,
                pivot: pivot_mag,
            });
        }

        if pivot_row != col {
            swap_rows(&mut left, col, pivot_row);
            swap_rows(&mut right, col, pivot_row);
        }

        let pivot = left[[col, col]];
        for j in 0..n {
            left[[col, j]] /= pivot;
            right[[col, j]] /= pivot;
        }

        // Clear the column everywhere except the pivot row
        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = left[[row, col]];
            if factor == 0.0 {
                continue;
            }
            for j in 0..n {
                left[[row, j]] -= factor * left[[col, j]];
                right[[row, j]] -= factor * right[[col, j]];
            }
        }
    }

    Ok(right)
}

fn swap_rows(matrix: &mut Array2<f64>, i: usize, j: usize) {
    for k in 0..matrix.ncols() {
        matrix.swap([i, k], [j, k]);
    }
}
