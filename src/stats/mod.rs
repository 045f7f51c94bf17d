//! Student-t tests used by the cleanup and classification stages.

use statrs::distribution::{ContinuousCDF, StudentsT};

/// Outcome of a t-test: p-value, test statistic, degrees of freedom.
#[derive(Debug, Clone, Copy)]
pub struct TestResult {
    pub pval: f64,
    pub t: f64,
    pub nu: f64,
}

fn t_cdf(t: f64, nu: f64) -> f64 {
    // Guard against degenerate degrees of freedom; the caller treats a NaN
    // p-value as a rejected point.
    if !(nu.is_finite() && nu > 0.0) || !t.is_finite() {
        return f64::NAN;
    }
    match StudentsT::new(0.0, 1.0, nu) {
        Ok(dist) => dist.cdf(t),
        Err(_) => f64::NAN,
    }
}

/// One-sample right-tailed t-test of `mu` against 0, with standard error
/// `s` and `n` repeats.
pub fn ttest_one(mu: f64, s: f64, n: usize) -> TestResult {
    let v = s * s / n as f64;
    let t = mu / v.sqrt();
    let nu = (n - 1) as f64;
    let pval = 1.0 - t_cdf(t, nu);
    TestResult { pval, t, nu }
}

/// Welch's two-sample two-sided t-test.
///
/// Degrees of freedom by Welch-Satterthwaite.
pub fn ttest_two(mu1: f64, s1: f64, n1: usize, mu2: f64, s2: f64, n2: usize) -> TestResult {
    let v1 = s1 * s1 / n1 as f64;
    let v2 = s2 * s2 / n2 as f64;
    let t = (mu1 - mu2) / (v1 + v2).sqrt();
    let nu = (v1 + v2).powi(2) / (v1 * v1 / (n1 as f64 - 1.0) + v2 * v2 / (n2 as f64 - 1.0));
    let pval = 2.0 * (1.0 - t_cdf(t.abs(), nu));
    TestResult { pval, t, nu }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_sample_high_snr_is_significant() {
        let r = ttest_one(100.0, 1.0, 10);
        assert!(r.pval < 1e-10);
        assert!((r.nu - 9.0).abs() < 1e-12);
    }

    #[test]
    fn one_sample_zero_mean_is_not_significant() {
        let r = ttest_one(0.0, 1.0, 10);
        assert!((r.pval - 0.5).abs() < 1e-9);
    }

    #[test]
    fn welch_identical_samples_fail_to_reject() {
        let r = ttest_two(5.0, 1.0, 10, 5.0, 1.0, 10);
        assert!((r.pval - 1.0).abs() < 1e-9, "pval={}", r.pval);
        assert!((r.t - 0.0).abs() < 1e-12);
    }

    #[test]
    fn welch_distant_means_reject() {
        let r = ttest_two(10.0, 1.0, 10, 0.0, 1.0, 10);
        assert!(r.pval < 1e-6);
    }

    #[test]
    fn welch_satterthwaite_dof_equal_variances() {
        // Equal variances and sample sizes give nu = 2(n-1).
        let r = ttest_two(1.0, 2.0, 8, 0.0, 2.0, 8);
        assert!((r.nu - 14.0).abs() < 1e-9);
    }
}
