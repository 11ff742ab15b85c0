//! Small dense-vector helpers shared by the polytope and aggregation code.

use nalgebra::DMatrix;

/// Default numeric tolerance.
///
/// Used for intersection tests (biased toward reporting an intersection),
/// subsumption checks, direction rank decisions and duplicate detection.
pub const DEFAULT_TOLERANCE: f64 = 1e-9;

pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    assert_eq!(a.len(), b.len(), "dot product of vectors with different lengths");
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn norm(a: &[f64]) -> f64 {
    dot(a, a).sqrt()
}

pub fn allclose(a: &[f64], b: &[f64], tol: f64) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() <= tol)
}

/// Returns the index of the only nonzero entry, if there is exactly one.
pub fn single_nonzero(a: &[f64], tol: f64) -> Option<usize> {
    let mut found = None;
    for (i, &v) in a.iter().enumerate() {
        if v.abs() > tol {
            if found.is_some() {
                return None;
            }
            found = Some(i);
        }
    }
    found
}

pub fn row_vec(m: &DMatrix<f64>, r: usize) -> Vec<f64> {
    m.row(r).iter().copied().collect()
}

/// Builds a matrix whose rows are the given vectors.
pub fn matrix_from_rows(rows: &[Vec<f64>], ncols: usize) -> DMatrix<f64> {
    DMatrix::from_fn(rows.len(), ncols, |r, c| rows[r][c])
}

/// Checks whether every entry of a matrix is exactly zero.
pub fn is_zero_matrix(m: &DMatrix<f64>) -> bool {
    m.iter().all(|&v| v == 0.0)
}
