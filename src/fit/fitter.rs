//! The two optimization stages of one fit.
//!
//! Stage one (`find_fit_mean`) shapes the mean function against the data
//! with the covariance pinned to a diagonal approximation. Stage two
//! (`find_fit_by_gridding`) freezes the mean and searches the covariance
//! scales on a deterministic log grid, then polishes the best cell with a
//! few quasi-Newton restarts.

use nalgebra::DVector;
use rayon::prelude::*;

use crate::domain::{FitParams, MeanFamily, ParamName};
use crate::error::FitError;
use crate::gp;
use crate::gp::FitData;
use crate::math::{conjugate_gradient, log_space, quasi_newton};

/// Upper bound on the fitted noise scale; grid cells beyond it are noise
/// fits, not signal fits.
const SIGMA2_BOUND: f64 = 1000.0;

const LAMBDA_GRID: usize = 10;
const RATIO_GRID: usize = 9;

fn check_nan(names: &[ParamName], p: &FitParams, stage: &str) -> Result<(), FitError> {
    if names.iter().any(|n| p.get(*n).is_nan()) {
        return Err(FitError::NanParameters(stage.to_string()));
    }
    Ok(())
}

/// Optimize the mean-function parameters of `family` in place, with the
/// covariance fixed at the diagonal `tau = 0` approximation.
///
/// Schedule: two rounds of 100-step conjugate gradient with `Rg` frozen,
/// two more with `Rg` free, then two rounds of 100-step quasi-Newton.
pub fn find_fit_mean(
    family: MeanFamily,
    params: &mut FitParams,
    data: &FitData,
    verbose: u8,
) -> Result<(), FitError> {
    let free = family.mean_params();
    let no_rg: Vec<ParamName> = free
        .iter()
        .copied()
        .filter(|n| *n != ParamName::Rg)
        .collect();

    let run = |params: &mut FitParams, names: &[ParamName], newton: bool| {
        let base = *params;
        let f = move |x: &[f64]| {
            let mut p = base;
            p.unpack(names, x);
            p.tau = 0.0;
            gp::neg_log_likelihood(family, &p, data)
        };
        let x0 = params.pack(names);
        let (x, fx) = if newton {
            quasi_newton(&f, &x0, 100)
        } else {
            conjugate_gradient(&f, &x0, 100)
        };
        params.unpack(names, &x);
        fx
    };

    for round in 0..2 {
        let e = run(params, &no_rg, false);
        if verbose >= 3 {
            println!("    mean stage (Rg frozen) round {}: energy {e:.4}", round + 1);
        }
    }
    for round in 0..2 {
        let e = run(params, free, false);
        if verbose >= 3 {
            println!("    mean stage round {}: energy {e:.4}", round + 1);
        }
    }
    for round in 0..2 {
        let e = run(params, free, true);
        if verbose >= 3 {
            println!("    mean polish round {}: energy {e:.4}", round + 1);
        }
    }
    check_nan(free, params, "mean stage")
}

struct GridCell {
    energy: f64,
    tau: f64,
    lambda: f64,
    sigma2: f64,
}

/// Evaluate one `(lambda, ratio)` cell: with `tau^2 = ratio * sigma2` the
/// covariance factors as `sigma2 * P`, so the Jeffreys-prior MAP for the
/// noise scale is closed-form, `sigma2 = chi2_P / (n + 2)`.
fn eval_cell(
    family: MeanFamily,
    base: &FitParams,
    data: &FitData,
    r: &DVector<f64>,
    lambda: f64,
    ratio: f64,
) -> Option<GridCell> {
    let n = data.len();
    let nreps = data.nreps.max(1) as f64;
    let mut p_mat = nalgebra::DMatrix::<f64>::zeros(n, n);
    let inv2l2 = 1.0 / (2.0 * lambda * lambda);
    for i in 0..n {
        for j in i..n {
            let dq = data.q[i] - data.q[j];
            let v = ratio * (-dq * dq * inv2l2).exp();
            p_mat[(i, j)] = v;
            p_mat[(j, i)] = v;
        }
    }
    for i in 0..n {
        p_mat[(i, i)] += data.err[i] * data.err[i] / nreps;
    }
    let chol = p_mat.cholesky()?;
    let x = chol.solve(r);
    let chi2 = r.dot(&x);
    if !(chi2.is_finite() && chi2 > 0.0) {
        return None;
    }
    let sigma2 = chi2 / (n as f64 + 2.0);
    if !(sigma2.is_finite() && sigma2 > 0.0) || sigma2 > SIGMA2_BOUND {
        return None;
    }
    let tau = (ratio * sigma2).sqrt();
    let mut p = *base;
    p.tau = tau;
    p.lambda = lambda;
    p.sigma2 = sigma2;
    let energy = gp::neg_log_posterior(family, &p, data);
    if !energy.is_finite() {
        return None;
    }
    Some(GridCell {
        energy,
        tau,
        lambda,
        sigma2,
    })
}

/// Optimize the covariance scales of `params` in place, with the mean
/// frozen.
///
/// `lambdamin` is the user-facing hard floor on the correlation length;
/// the effective floor is additionally twice the mean inter-point spacing
/// so the kernel cannot fit between the samples.
pub fn find_fit_by_gridding(
    family: MeanFamily,
    params: &mut FitParams,
    data: &FitData,
    lambdamin: f64,
    verbose: u8,
) -> Result<(), FitError> {
    let lambda_low = lambdamin.max(2.0 * data.mean_spacing());
    let mut lambda_high = data.q_range();
    if !(lambda_high > lambda_low) {
        lambda_high = lambda_low * 10.0;
    }
    let lambdas = log_space(lambda_low, lambda_high, LAMBDA_GRID)
        .map_err(|_| FitError::EmptyGrid)?;
    // tau^2 / sigma2, four decades around 1.
    let ratios = log_space(1e-2, 1e2, RATIO_GRID).map_err(|_| FitError::EmptyGrid)?;

    let r = DVector::from_iterator(
        data.len(),
        data.q
            .iter()
            .zip(data.i.iter())
            .map(|(&q, &i)| i - gp::mean_value(family, params, q)),
    );

    let cells: Vec<(f64, f64)> = lambdas
        .iter()
        .flat_map(|&l| ratios.iter().map(move |&t| (l, t)))
        .collect();

    let base = *params;
    let best = cells
        .par_iter()
        .filter_map(|&(lambda, ratio)| eval_cell(family, &base, data, &r, lambda, ratio))
        .min_by(|a, b| a.energy.total_cmp(&b.energy))
        .ok_or(FitError::EmptyGrid)?;

    if verbose >= 3 {
        println!(
            "    grid best: lambda={:.4} tau={:.4} sigma2={:.4} energy={:.4}",
            best.lambda, best.tau, best.sigma2, best.energy
        );
    }

    // Polish in log space from the best cell and two deterministic
    // perturbations of it.
    let cov_names = ParamName::covariance_params();
    let f = {
        let base = *params;
        move |x: &[f64]| {
            let mut p = base;
            p.tau = x[0].exp();
            p.lambda = x[1].exp();
            p.sigma2 = x[2].exp();
            gp::neg_log_posterior(family, &p, data)
        }
    };
    let starts = [
        [best.tau.ln(), best.lambda.ln(), best.sigma2.ln()],
        [best.tau.ln(), (best.lambda * 2.0).ln(), best.sigma2.ln()],
        [(best.tau * 2.0).ln(), (best.lambda * 0.5).ln(), best.sigma2.ln()],
    ];
    let mut winner = (starts[0], best.energy);
    for start in starts {
        let (x, fx) = quasi_newton(&f, &start, 10);
        if fx < winner.1 {
            winner = ([x[0], x[1], x[2]], fx);
        }
    }

    params.tau = winner.0[0].exp();
    // The polish is unconstrained in log space; re-apply the hard floor.
    params.lambda = winner.0[1].exp().max(lambda_low);
    params.sigma2 = winner.0[2].exp();
    if verbose >= 3 {
        println!(
            "    refined: lambda={:.4} tau={:.4} sigma2={:.4} energy={:.4}",
            params.lambda, params.tau, params.sigma2, winner.1
        );
    }
    check_nan(cov_names, params, "covariance stage")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gp::mean_value;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn noisy_simple_curve() -> (FitParams, FitData) {
        let truth = FitParams {
            g: 20.0,
            rg: 15.0,
            a: 0.5,
            ..FitParams::default()
        };
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let noise = Normal::new(0.0, 0.05).unwrap();
        let n = 60;
        let q: Vec<f64> = (0..n).map(|k| 0.005 + 0.3 * k as f64 / (n - 1) as f64).collect();
        let i: Vec<f64> = q
            .iter()
            .map(|&q| mean_value(MeanFamily::Simple, &truth, q) + noise.sample(&mut rng))
            .collect();
        let err = vec![0.05; n];
        (truth, FitData { q, i, err, nreps: 10 })
    }

    #[test]
    fn mean_stage_recovers_simple_parameters() {
        let (truth, data) = noisy_simple_curve();
        let imin = data.i.iter().cloned().fold(f64::INFINITY, f64::min);
        let imax = data.i.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let mut p = FitParams {
            g: imax - imin,
            a: imin,
            ..FitParams::default()
        };
        find_fit_mean(MeanFamily::Simple, &mut p, &data, 0).unwrap();
        assert!((p.g - truth.g).abs() / truth.g < 0.2, "g={}", p.g);
        assert!((p.rg - truth.rg).abs() / truth.rg < 0.2, "rg={}", p.rg);
    }

    #[test]
    fn gridding_returns_positive_scales() {
        let (truth, data) = noisy_simple_curve();
        let mut p = truth;
        find_fit_by_gridding(MeanFamily::Simple, &mut p, &data, 0.005, 0).unwrap();
        assert!(p.tau >= 0.0);
        assert!(p.lambda >= 0.005);
        assert!(p.sigma2 > 0.0);
        assert!(p.sigma2 < SIGMA2_BOUND);
    }

    #[test]
    fn gridding_is_deterministic() {
        let (truth, data) = noisy_simple_curve();
        let mut p1 = truth;
        let mut p2 = truth;
        find_fit_by_gridding(MeanFamily::Simple, &mut p1, &data, 0.005, 0).unwrap();
        find_fit_by_gridding(MeanFamily::Simple, &mut p2, &data, 0.005, 0).unwrap();
        assert_eq!(p1, p2);
    }
}
