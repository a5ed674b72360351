use nalgebra::{DMatrix, DVector};

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, PartialEq)]
pub struct StandardScaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl StandardScaler {
    /// Fits on the given rows only. Columns with no spread keep a scale of 1.
    pub fn fit(rows: &[Vec<f64>]) -> Self {
        let width = rows.first().map_or(0, Vec::len);
        let n = rows.len().max(1) as f64;
        let mut mean = vec![0.0; width];
        let mut scale = vec![1.0; width];

        for j in 0..width {
            let m = rows.iter().map(|r| r[j]).sum::<f64>() / n;
            let var = rows.iter().map(|r| (r[j] - m).powi(2)).sum::<f64>() / n;
            let std = var.sqrt();
            mean[j] = m;
            if std > 1e-12 * m.abs().max(1.0) {
                scale[j] = std;
            }
        }

        Self { mean, scale }
    }

    pub fn transform_row(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .zip(self.mean.iter().zip(&self.scale))
            .map(|(v, (m, s))| (v - m) / s)
            .collect()
    }

    pub fn transform(&self, rows: &[Vec<f64>]) -> DMatrix<f64> {
        let width = self.mean.len();
        DMatrix::from_row_iterator(
            rows.len(),
            width,
            rows.iter().flat_map(|r| self.transform_row(r)),
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinearModel {
    pub intercept: f64,
    pub coef: DVector<f64>,
}

impl LinearModel {
    pub fn predict(&self, row: &[f64]) -> f64 {
        self.intercept + self.coef.iter().zip(row).map(|(w, x)| w * x).sum::<f64>()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Estimator {
    Ols,
    Ridge { alpha: f64 },
    Lasso { alpha: f64, max_iter: usize, tol: f64 },
}

impl Estimator {
    pub fn fit(&self, x: &DMatrix<f64>, y: &DVector<f64>) -> EngineResult<LinearModel> {
        if x.nrows() != y.len() || x.nrows() == 0 {
            return Err(EngineError::FitFailed(format!(
                "{} rows of features for {} targets",
                x.nrows(),
                y.len()
            )));
        }

        let x_mean = x.row_mean();
        let y_mean = y.mean();
        let mut xc = x.clone();
        for (j, mut col) in xc.column_iter_mut().enumerate() {
            col.add_scalar_mut(-x_mean[j]);
        }
        let yc = y.add_scalar(-y_mean);

        let coef = match *self {
            Estimator::Ols => least_squares(&xc, &yc)?,
            Estimator::Ridge { alpha } => ridge(&xc, &yc, alpha)?,
            Estimator::Lasso {
                alpha,
                max_iter,
                tol,
            } => coordinate_descent(&xc, &yc, alpha, max_iter, tol),
        };

        let intercept = y_mean - x_mean.transpose().dot(&coef);
        Ok(LinearModel { intercept, coef })
    }
}

fn least_squares(x: &DMatrix<f64>, y: &DVector<f64>) -> EngineResult<DVector<f64>> {
    let svd = x.clone().svd(true, true);
    let largest = svd.singular_values.max();
    let eps = f64::EPSILON * x.nrows().max(x.ncols()) as f64 * largest;
    svd.solve(y, eps)
        .map_err(|e| EngineError::FitFailed(format!("least squares: {e}")))
}

/// Solves `(XᵀX + αI) w = Xᵀy`.
fn ridge(x: &DMatrix<f64>, y: &DVector<f64>, alpha: f64) -> EngineResult<DVector<f64>> {
    let p = x.ncols();
    let gram = x.transpose() * x + DMatrix::identity(p, p) * alpha;
    let rhs = x.transpose() * y;

    if let Some(chol) = gram.clone().cholesky() {
        return Ok(chol.solve(&rhs));
    }
    gram.lu()
        .solve(&rhs)
        .ok_or_else(|| EngineError::FitFailed("ridge system is singular".to_string()))
}

/// Cyclic coordinate descent on `(1/2n)‖y − Xw‖² + α‖w‖₁`.
fn coordinate_descent(
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    alpha: f64,
    max_iter: usize,
    tol: f64,
) -> DVector<f64> {
    let n = x.nrows() as f64;
    let p = x.ncols();
    let mut w = DVector::zeros(p);
    let mut residual = y.clone();
    let col_norms: Vec<f64> = x.column_iter().map(|c| c.norm_squared() / n).collect();

    for _ in 0..max_iter {
        let mut max_delta = 0.0f64;
        let mut max_weight = 0.0f64;

        for j in 0..p {
            if col_norms[j] == 0.0 {
                continue;
            }
            let col = x.column(j);
            let old = w[j];
            let rho = col.dot(&residual) / n + col_norms[j] * old;
            let new = soft_threshold(rho, alpha) / col_norms[j];

            if new != old {
                residual.axpy(old - new, &col, 1.0);
                w[j] = new;
            }
            max_delta = max_delta.max((new - old).abs());
            max_weight = max_weight.max(new.abs());
        }

        if max_weight == 0.0 || max_delta <= tol * max_weight {
            break;
        }
    }

    w
}

fn soft_threshold(value: f64, threshold: f64) -> f64 {
    if value > threshold {
        value - threshold
    } else if value < -threshold {
        value + threshold
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() < tol
    }

    fn design() -> (DMatrix<f64>, DVector<f64>) {
        // y = 3 + 2·x0 − 1.5·x1
        let rows = [
            [1.0, 4.0],
            [2.0, 1.0],
            [3.0, 5.0],
            [4.0, 2.0],
            [5.0, 7.0],
            [6.0, 3.0],
        ];
        let x = DMatrix::from_row_iterator(6, 2, rows.iter().flatten().copied());
        let y = DVector::from_iterator(6, rows.iter().map(|r| 3.0 + 2.0 * r[0] - 1.5 * r[1]));
        (x, y)
    }

    #[test]
    fn scaler_uses_population_std() {
        let rows = vec![vec![1.0, 7.0], vec![3.0, 7.0]];
        let scaler = StandardScaler::fit(&rows);
        assert_eq!(scaler.mean, vec![2.0, 7.0]);
        assert_eq!(scaler.scale, vec![1.0, 1.0]);
        assert_eq!(scaler.transform_row(&[3.0, 7.0]), vec![1.0, 0.0]);

        let wider = StandardScaler::fit(&[vec![0.0], vec![4.0]]);
        assert_eq!(wider.scale, vec![2.0]);
        let scaled = wider.transform(&[vec![0.0], vec![4.0], vec![6.0]]);
        assert_eq!(scaled[(2, 0)], 2.0);
    }

    #[test]
    fn ols_recovers_exact_relationship() {
        let (x, y) = design();
        let model = Estimator::Ols.fit(&x, &y).unwrap();
        assert!(approx(model.intercept, 3.0, 1e-9));
        assert!(approx(model.coef[0], 2.0, 1e-9));
        assert!(approx(model.coef[1], -1.5, 1e-9));
        assert!(approx(model.predict(&[10.0, 1.0]), 21.5, 1e-8));
    }

    #[test]
    fn ols_handles_duplicate_columns() {
        let x = DMatrix::from_row_slice(4, 2, &[1.0, 1.0, 2.0, 2.0, 3.0, 3.0, 4.0, 4.0]);
        let y = DVector::from_vec(vec![2.0, 4.0, 6.0, 8.0]);
        let model = Estimator::Ols.fit(&x, &y).unwrap();
        assert!(approx(model.coef[0], 1.0, 1e-9));
        assert!(approx(model.coef[1], 1.0, 1e-9));
        assert!(approx(model.predict(&[5.0, 5.0]), 10.0, 1e-8));
    }

    #[test]
    fn ridge_matches_closed_form() {
        let x = DMatrix::from_column_slice(3, 1, &[-1.0, 0.0, 1.0]);
        let y = DVector::from_vec(vec![-2.0, 0.0, 2.0]);
        let model = Estimator::Ridge { alpha: 1.0 }.fit(&x, &y).unwrap();
        assert!(approx(model.coef[0], 4.0 / 3.0, 1e-12));
        assert!(approx(model.intercept, 0.0, 1e-12));
    }

    #[test]
    fn lasso_matches_soft_thresholded_solution() {
        let x = DMatrix::from_column_slice(3, 1, &[-1.0, 0.0, 1.0]);
        let y = DVector::from_vec(vec![-2.0, 0.0, 2.0]);
        let lasso = Estimator::Lasso {
            alpha: 0.1,
            max_iter: 1000,
            tol: 1e-4,
        };
        let model = lasso.fit(&x, &y).unwrap();
        assert!(approx(model.coef[0], 1.85, 1e-12));
    }

    #[test]
    fn heavy_lasso_penalty_zeroes_coefficients() {
        let (x, y) = design();
        let lasso = Estimator::Lasso {
            alpha: 1e6,
            max_iter: 1000,
            tol: 1e-4,
        };
        let model = lasso.fit(&x, &y).unwrap();
        assert!(model.coef.iter().all(|w| *w == 0.0));
        assert!(approx(model.intercept, y.mean(), 1e-12));
    }

    #[test]
    fn light_lasso_penalty_approaches_ols() {
        let (x, y) = design();
        let lasso = Estimator::Lasso {
            alpha: 1e-6,
            max_iter: 10_000,
            tol: 1e-10,
        };
        let model = lasso.fit(&x, &y).unwrap();
        assert!(approx(model.coef[0], 2.0, 1e-3));
        assert!(approx(model.coef[1], -1.5, 1e-3));
    }

    #[test]
    fn ridge_shrinks_towards_zero() {
        let (x, y) = design();
        let ols = Estimator::Ols.fit(&x, &y).unwrap();
        let ridge = Estimator::Ridge { alpha: 10.0 }.fit(&x, &y).unwrap();
        assert!(ridge.coef.norm() < ols.coef.norm());
    }
}
