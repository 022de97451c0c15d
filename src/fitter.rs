//! Weighted linear least-squares solves via dense SVD.
//!
//! Every fit stage reduces to the same shape of problem: one design matrix
//! shared by the x and y axes, two target vectors, optional per-row weights.
//! The SVD is computed once and reused for both right-hand sides.

use nalgebra::{DMatrix, DVector};

/// Relative singular-value cutoff below which the design is treated as
/// singular rather than silently pseudo-inverted.
const SV_RCOND: f64 = 1e-12;

/// Solve `min ‖√W (A·x − b)‖` for the two right-hand sides `bx`, `by`.
///
/// Weights apply per row; rows and targets are scaled by `√w`. Callers must
/// already have dropped zero-weight rows. Returns a static message on a
/// rank-deficient or ill-conditioned design, which the engine wraps with
/// stage context.
pub(crate) fn solve_pair(
    design: &DMatrix<f64>,
    bx: &DVector<f64>,
    by: &DVector<f64>,
    weights: Option<&[f64]>,
) -> Result<(DVector<f64>, DVector<f64>), &'static str> {
    let (nrows, ncols) = design.shape();
    if nrows < ncols {
        return Err("fewer rows than unknowns");
    }

    let (a, bx, by) = match weights {
        Some(w) => {
            debug_assert_eq!(w.len(), nrows);
            let mut a = design.clone();
            let mut bx = bx.clone();
            let mut by = by.clone();
            for (i, &wi) in w.iter().enumerate() {
                let s = wi.sqrt();
                for j in 0..ncols {
                    a[(i, j)] *= s;
                }
                bx[i] *= s;
                by[i] *= s;
            }
            (a, bx, by)
        }
        None => (design.clone(), bx.clone(), by.clone()),
    };

    let svd = a.svd(true, true);
    let max_sv = svd.singular_values.max();
    let min_sv = svd.singular_values.min();
    if max_sv <= 0.0 || min_sv < SV_RCOND * max_sv {
        return Err("design matrix is singular or ill-conditioned");
    }

    let x = svd.solve(&bx, SV_RCOND)?;
    let y = svd.solve(&by, SV_RCOND)?;
    Ok((x, y))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solve_exact_system() {
        // y = 2 + 3x sampled without noise; both axes share the design.
        let xs = [0.0, 1.0, 2.0, 3.0, 4.0];
        let mut a = DMatrix::zeros(5, 2);
        let mut bx = DVector::zeros(5);
        let mut by = DVector::zeros(5);
        for (i, &x) in xs.iter().enumerate() {
            a[(i, 0)] = 1.0;
            a[(i, 1)] = x;
            bx[i] = 2.0 + 3.0 * x;
            by[i] = -1.0 + 0.5 * x;
        }
        let (sx, sy) = solve_pair(&a, &bx, &by, None).unwrap();
        assert!((sx[0] - 2.0).abs() < 1e-12);
        assert!((sx[1] - 3.0).abs() < 1e-12);
        assert!((sy[0] + 1.0).abs() < 1e-12);
        assert!((sy[1] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_weights_downweight_outlier() {
        // Last row is garbage but has negligible weight.
        let xs = [0.0, 1.0, 2.0, 3.0, 4.0];
        let mut a = DMatrix::zeros(6, 2);
        let mut bx = DVector::zeros(6);
        let mut by = DVector::zeros(6);
        for (i, &x) in xs.iter().enumerate() {
            a[(i, 0)] = 1.0;
            a[(i, 1)] = x;
            bx[i] = 1.0 + 2.0 * x;
            by[i] = 1.0 + 2.0 * x;
        }
        a[(5, 0)] = 1.0;
        a[(5, 1)] = 2.0;
        bx[5] = 1000.0;
        by[5] = 1000.0;
        let w = [1.0, 1.0, 1.0, 1.0, 1.0, 1e-14];
        let (sx, _) = solve_pair(&a, &bx, &by, Some(&w)).unwrap();
        assert!((sx[0] - 1.0).abs() < 1e-6);
        assert!((sx[1] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_singular_design_rejected() {
        // Second column is a multiple of the first.
        let mut a = DMatrix::zeros(4, 2);
        let mut b = DVector::zeros(4);
        for i in 0..4 {
            a[(i, 0)] = i as f64 + 1.0;
            a[(i, 1)] = 2.0 * (i as f64 + 1.0);
            b[i] = i as f64;
        }
        assert!(solve_pair(&a, &b, &b, None).is_err());
    }

    #[test]
    fn test_underdetermined_shape_rejected() {
        let a = DMatrix::zeros(2, 3);
        let b = DVector::zeros(2);
        assert!(solve_pair(&a, &b, &b, None).is_err());
    }
}
