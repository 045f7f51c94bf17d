//! Local minimizers over a scalar objective.
//!
//! The fitting stages treat these as black boxes: given `f(x)` and a
//! starting point, run a fixed number of descent steps and return the best
//! point seen. Gradients are numeric (central differences) because the
//! posterior energy has no convenient closed-form derivatives once the
//! covariance matrix is involved.
//!
//! Both minimizers are deterministic and bounded: objectives may return
//! `f64::INFINITY` to reject out-of-bounds parameter values, and the line
//! search backs off until it finds a finite improvement, then lengthens
//! the step while the objective keeps dropping.

use nalgebra::{DMatrix, DVector};

const GRAD_STEP: f64 = 1e-6;
const HESS_STEP: f64 = 1e-4;

/// Central-difference gradient of `f` at `x`.
///
/// The step is scaled to the magnitude of each coordinate so that
/// parameters living on very different scales (e.g. `G` vs `lambda`) get
/// comparable relative perturbations.
pub fn numeric_gradient<F: Fn(&[f64]) -> f64>(f: &F, x: &[f64]) -> Vec<f64> {
    let n = x.len();
    let mut grad = vec![0.0; n];
    let mut xp = x.to_vec();
    for i in 0..n {
        let h = GRAD_STEP * (1.0 + x[i].abs());
        xp[i] = x[i] + h;
        let fp = f(&xp);
        xp[i] = x[i] - h;
        let fm = f(&xp);
        xp[i] = x[i];
        grad[i] = if fp.is_finite() && fm.is_finite() {
            (fp - fm) / (2.0 * h)
        } else {
            0.0
        };
    }
    grad
}

/// Symmetric finite-difference Hessian of `f` at `x`.
pub fn numeric_hessian<F: Fn(&[f64]) -> f64>(f: &F, x: &[f64]) -> DMatrix<f64> {
    let n = x.len();
    let f0 = f(x);
    let mut hess = DMatrix::<f64>::zeros(n, n);
    let steps: Vec<f64> = x.iter().map(|v| HESS_STEP * (1.0 + v.abs())).collect();
    let mut xp = x.to_vec();

    // Diagonal terms from the standard second-difference stencil.
    for i in 0..n {
        let h = steps[i];
        xp[i] = x[i] + h;
        let fp = f(&xp);
        xp[i] = x[i] - h;
        let fm = f(&xp);
        xp[i] = x[i];
        hess[(i, i)] = (fp - 2.0 * f0 + fm) / (h * h);
    }

    // Off-diagonal terms from the four-point cross stencil.
    for i in 0..n {
        for j in (i + 1)..n {
            let hi = steps[i];
            let hj = steps[j];
            xp[i] = x[i] + hi;
            xp[j] = x[j] + hj;
            let fpp = f(&xp);
            xp[j] = x[j] - hj;
            let fpm = f(&xp);
            xp[i] = x[i] - hi;
            let fmm = f(&xp);
            xp[j] = x[j] + hj;
            let fmp = f(&xp);
            xp[i] = x[i];
            xp[j] = x[j];
            let v = (fpp - fpm - fmp + fmm) / (4.0 * hi * hj);
            hess[(i, j)] = v;
            hess[(j, i)] = v;
        }
    }
    hess
}

/// Line search along `dir` from `x`: backtrack to the first finite
/// improvement, then double the step while the objective keeps dropping.
///
/// Returns the accepted point and its objective value, or `None` when no
/// finite improvement was found within the backoff budget.
fn line_search<F: Fn(&[f64]) -> f64>(
    f: &F,
    x: &[f64],
    fx: f64,
    dir: &[f64],
) -> Option<(Vec<f64>, f64)> {
    let norm: f64 = dir.iter().map(|d| d * d).sum::<f64>().sqrt();
    if !(norm.is_finite() && norm > 0.0) {
        return None;
    }
    let at = |alpha: f64| {
        let cand: Vec<f64> =
            x.iter().zip(dir.iter()).map(|(xi, di)| xi + alpha * di).collect();
        let fc = f(&cand);
        (cand, fc)
    };
    let mut alpha = 1.0 / norm.max(1.0);
    let mut accepted = None;
    for _ in 0..40 {
        let (cand, fc) = at(alpha);
        if fc.is_finite() && fc < fx {
            accepted = Some((cand, fc));
            break;
        }
        alpha *= 0.5;
    }
    let (mut best, mut fbest) = accepted?;
    for _ in 0..40 {
        alpha *= 2.0;
        let (cand, fc) = at(alpha);
        if fc.is_finite() && fc < fbest {
            best = cand;
            fbest = fc;
        } else {
            break;
        }
    }
    Some((best, fbest))
}

/// Polak-Ribiere conjugate gradient with a fixed step budget.
///
/// Returns the best point seen and its objective value.
pub fn conjugate_gradient<F: Fn(&[f64]) -> f64>(
    f: &F,
    x0: &[f64],
    steps: usize,
) -> (Vec<f64>, f64) {
    let mut x = x0.to_vec();
    let mut fx = f(&x);
    if !fx.is_finite() {
        return (x, fx);
    }

    let mut grad = numeric_gradient(f, &x);
    let mut dir: Vec<f64> = grad.iter().map(|g| -g).collect();

    for _ in 0..steps {
        let Some((xn, fn_)) = line_search(f, &x, fx, &dir) else {
            break;
        };
        let grad_new = numeric_gradient(f, &xn);
        // Polak-Ribiere beta, clamped at zero (automatic restart).
        let num: f64 = grad_new
            .iter()
            .zip(grad.iter())
            .map(|(gn, g)| gn * (gn - g))
            .sum();
        let den: f64 = grad.iter().map(|g| g * g).sum();
        let beta = if den > 0.0 { (num / den).max(0.0) } else { 0.0 };
        dir = grad_new
            .iter()
            .zip(dir.iter())
            .map(|(gn, d)| -gn + beta * d)
            .collect();
        x = xn;
        fx = fn_;
        grad = grad_new;
        let gnorm: f64 = grad.iter().map(|g| g * g).sum::<f64>().sqrt();
        if gnorm < 1e-10 {
            break;
        }
    }
    (x, fx)
}

/// BFGS quasi-Newton with a fixed step budget.
///
/// Returns the best point seen and its objective value.
pub fn quasi_newton<F: Fn(&[f64]) -> f64>(f: &F, x0: &[f64], steps: usize) -> (Vec<f64>, f64) {
    let n = x0.len();
    let mut x = DVector::from_row_slice(x0);
    let mut fx = f(x.as_slice());
    if !fx.is_finite() {
        return (x0.to_vec(), fx);
    }

    let mut grad = DVector::from_vec(numeric_gradient(f, x.as_slice()));
    let mut h_inv = DMatrix::<f64>::identity(n, n);

    for _ in 0..steps {
        let dir = -(&h_inv * &grad);
        let Some((xn, fn_)) = line_search(f, x.as_slice(), fx, dir.as_slice()) else {
            break;
        };
        let xn = DVector::from_vec(xn);
        let grad_new = DVector::from_vec(numeric_gradient(f, xn.as_slice()));

        let s = &xn - &x;
        let y = &grad_new - &grad;
        let sy = s.dot(&y);
        if sy > 1e-12 {
            // Standard BFGS inverse update.
            let rho = 1.0 / sy;
            let i = DMatrix::<f64>::identity(n, n);
            let left = &i - rho * (&s * y.transpose());
            let right = &i - rho * (&y * s.transpose());
            h_inv = &left * &h_inv * &right + rho * (&s * s.transpose());
        } else {
            // Curvature condition failed; restart from the identity.
            h_inv = DMatrix::<f64>::identity(n, n);
        }

        x = xn;
        fx = fn_;
        grad = grad_new;
        if grad.norm() < 1e-10 {
            break;
        }
    }
    (x.as_slice().to_vec(), fx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quadratic(x: &[f64]) -> f64 {
        (x[0] - 3.0).powi(2) + 2.0 * (x[1] + 1.0).powi(2)
    }

    #[test]
    fn conjugate_gradient_finds_quadratic_minimum() {
        let (x, fx) = conjugate_gradient(&quadratic, &[0.0, 0.0], 100);
        assert!((x[0] - 3.0).abs() < 1e-4, "x0={}", x[0]);
        assert!((x[1] + 1.0).abs() < 1e-4, "x1={}", x[1]);
        assert!(fx < 1e-7);
    }

    #[test]
    fn line_search_reaches_distant_shallow_minimum() {
        // The gradient at the start is tiny, so only a lengthening step
        // can cross the distance to the minimum in a few iterations.
        let shallow = |x: &[f64]| 1e-4 * (x[0] - 50.0).powi(2);
        let (x, fx) = quasi_newton(&shallow, &[0.0], 50);
        assert!((x[0] - 50.0).abs() < 1e-2, "x0={}", x[0]);
        assert!(fx < 1e-7);
    }

    #[test]
    fn quasi_newton_finds_rosenbrock_valley() {
        let rosenbrock =
            |x: &[f64]| (1.0 - x[0]).powi(2) + 100.0 * (x[1] - x[0] * x[0]).powi(2);
        let (x, fx) = quasi_newton(&rosenbrock, &[-1.2, 1.0], 400);
        assert!(fx < 1e-3, "fx={fx}, x={x:?}");
    }

    #[test]
    fn optimizers_are_deterministic() {
        let (x1, f1) = quasi_newton(&quadratic, &[5.0, 5.0], 50);
        let (x2, f2) = quasi_newton(&quadratic, &[5.0, 5.0], 50);
        assert_eq!(x1, x2);
        assert_eq!(f1, f2);
    }

    #[test]
    fn infinite_start_returns_immediately() {
        let f = |_: &[f64]| f64::INFINITY;
        let (x, fx) = quasi_newton(&f, &[1.0], 10);
        assert_eq!(x, vec![1.0]);
        assert!(fx.is_infinite());
    }

    #[test]
    fn numeric_hessian_of_quadratic() {
        let h = numeric_hessian(&quadratic, &[3.0, -1.0]);
        assert!((h[(0, 0)] - 2.0).abs() < 1e-3);
        assert!((h[(1, 1)] - 4.0).abs() < 1e-3);
        assert!(h[(0, 1)].abs() < 1e-3);
    }
}
