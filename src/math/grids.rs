//! Grid generation.
//!
//! The covariance search is a deterministic grid search over `lambda` and
//! the `tau^2/sigma2` ratio. Grid search avoids the local-minima issues of
//! nonlinear optimization and is reproducible given the same inputs.

use crate::error::AppError;

/// Generate `num` evenly spaced points between `min` and `max` (inclusive).
pub fn linspace(min: f64, max: f64, num: usize) -> Vec<f64> {
    if num == 0 {
        return Vec::new();
    }
    if num == 1 {
        return vec![min];
    }
    let step = (max - min) / (num as f64 - 1.0);
    (0..num).map(|i| min + step * i as f64).collect()
}

/// Generate `steps` log-spaced points between `min` and `max` (inclusive).
pub fn log_space(min: f64, max: f64, steps: usize) -> Result<Vec<f64>, AppError> {
    if !(min.is_finite() && max.is_finite() && min > 0.0 && max > 0.0 && max > min) {
        return Err(AppError::new(
            2,
            format!("Invalid grid range: min={min}, max={max} (must be finite, >0, and max>min)."),
        ));
    }
    if steps < 2 {
        return Err(AppError::new(2, "Grid steps must be >= 2."));
    }

    let ln_min = min.ln();
    let ln_max = max.ln();
    let step = (ln_max - ln_min) / (steps as f64 - 1.0);

    let mut out = Vec::with_capacity(steps);
    for i in 0..steps {
        out.push((ln_min + step * i as f64).exp());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linspace_includes_endpoints() {
        let v = linspace(0.0, 1.0, 11);
        assert_eq!(v.len(), 11);
        assert!((v[0] - 0.0).abs() < 1e-12);
        assert!((v[10] - 1.0).abs() < 1e-12);
        assert!((v[5] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn log_space_includes_endpoints() {
        let v = log_space(0.1, 10.0, 5).unwrap();
        assert!((v[0] - 0.1).abs() < 1e-12);
        assert!((v[v.len() - 1] - 10.0).abs() < 1e-12);
    }

    #[test]
    fn log_space_rejects_bad_range() {
        assert!(log_space(1.0, 0.5, 5).is_err());
        assert!(log_space(0.0, 1.0, 5).is_err());
    }
}
