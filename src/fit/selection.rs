//! Model selection across the nested mean-function families.
//!
//! Each candidate family is fit independently (mean stage, then covariance
//! grid), then scored by a Laplace-approximated Bayes factor. The family
//! with the lowest minus-log-Bayes-factor wins. A failed fit only
//! disqualifies that family; it is fatal when it was the sole candidate.

use nalgebra::DMatrix;

use crate::domain::{ComparisonEntry, FitConfig, FitParams, MeanFamily, ParamName};
use crate::error::FitError;
use crate::fit::{Fitted, find_fit_by_gridding, find_fit_mean};
use crate::gp;
use crate::gp::{FitData, GaussianProcess};
use crate::math::numeric_hessian;
use crate::profile::subsample_indices;

/// Starting point for a fresh fit: offset at the lowest observed
/// intensity, forward scattering at the observed dynamic range.
fn initial_params(data: &FitData) -> FitParams {
    let imin = data.i.iter().cloned().fold(f64::INFINITY, f64::min);
    let imax = data.i.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    FitParams {
        g: (imax - imin).max(1e-3),
        a: imin,
        ..FitParams::default()
    }
}

fn limited(data: &FitData, limit: usize) -> FitData {
    if limit == 0 || limit >= data.len() {
        return data.clone();
    }
    data.subset(&subsample_indices(&data.q, limit))
}

struct FamilyFit {
    params: FitParams,
    free: Vec<ParamName>,
    hessian: DMatrix<f64>,
    entry: ComparisonEntry,
}

/// Hessian of the posterior energy over all optimized parameters, plus the
/// comparison scores derived from it.
fn bayes_factor(
    family: MeanFamily,
    params: &FitParams,
    free: &[ParamName],
    data: &FitData,
    verbose: u8,
) -> (DMatrix<f64>, ComparisonEntry) {
    let base = *params;
    let f = move |x: &[f64]| {
        let mut p = base;
        p.unpack(free, x);
        gp::neg_log_posterior(family, &p, data)
    };
    let x0 = params.pack(free);
    let hessian = numeric_hessian(&f, &x0);

    let np = free.len();
    let n = data.len() as f64;
    let mp = gp::neg_log_posterior(family, params, data);
    let ml = gp::neg_log_likelihood(family, params, data);

    // Cholesky keeps the log-determinant finite for stiff Hessians.
    let minus_log_bf = match hessian.clone().cholesky() {
        Some(chol) => {
            let log_det: f64 = (0..np).map(|k| chol.l()[(k, k)].ln()).sum::<f64>() * 2.0;
            mp - np as f64 / 2.0 * (2.0 * std::f64::consts::PI).ln() + log_det / 2.0
        }
        None => {
            if verbose >= 1 {
                eprintln!(
                    "Warning: Hessian not positive-definite for the {} family; \
                     excluding it from the comparison.",
                    family.display_name()
                );
            }
            f64::INFINITY
        }
    };

    let entry = ComparisonEntry {
        family,
        num_params: np,
        map_energy: mp,
        ml_energy: ml,
        minus_log_bf,
        bic: 2.0 * ml + np as f64 * n.ln(),
        aic: 2.0 * ml + 2.0 * np as f64,
    };
    (hessian, entry)
}

/// Fit one curve's data, optionally comparing all families up to the
/// configured one, and return the winning fit with its comparison table.
///
/// `seed` pre-loads the parameter vector (used when re-fitting the merged
/// curve from the reference curve's solution); without it the start point
/// is derived from the data.
pub fn find_fit(
    data: &FitData,
    config: &FitConfig,
    seed: Option<FitParams>,
    verbose: u8,
) -> Result<Fitted, FitError> {
    let families = if config.comparison {
        config.family.nested_up_to()
    } else {
        vec![config.family]
    };
    let sole_family = families.len() == 1;

    let fit_data = limited(data, config.limit_fitting);
    let hess_data = limited(data, config.limit_hessian);

    let mut fits: Vec<FamilyFit> = Vec::new();
    let mut last_err = None;
    for family in families {
        if verbose >= 2 {
            println!("  fitting the {} family", family.display_name());
        }
        let mut params = seed.unwrap_or_else(|| initial_params(&fit_data));
        let attempt = find_fit_mean(family, &mut params, &fit_data, verbose).and_then(|_| {
            find_fit_by_gridding(family, &mut params, &fit_data, config.lambdamin, verbose)
        });
        if let Err(e) = attempt {
            if sole_family {
                return Err(e);
            }
            if verbose >= 1 {
                eprintln!(
                    "Warning: {} family failed to fit ({e}); skipping it.",
                    family.display_name()
                );
            }
            last_err = Some(e);
            continue;
        }

        let mut free = family.mean_params().to_vec();
        free.extend_from_slice(ParamName::covariance_params());
        let (hessian, entry) = bayes_factor(family, &params, &free, &hess_data, verbose);
        fits.push(FamilyFit {
            params,
            free,
            hessian,
            entry,
        });
    }

    let comparison: Vec<ComparisonEntry> = fits.iter().map(|f| f.entry.clone()).collect();
    let winner_idx = fits
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.entry.minus_log_bf.total_cmp(&b.1.entry.minus_log_bf))
        .map(|(k, _)| k)
        .ok_or_else(|| last_err.unwrap_or(FitError::EmptyGrid))?;
    let winner = fits.swap_remove(winner_idx);
    if verbose >= 2 {
        println!(
            "  selected the {} family (-log BF = {:.3})",
            winner.entry.family.display_name(),
            winner.entry.minus_log_bf
        );
    }

    let gp = GaussianProcess::new(winner.entry.family, winner.params, fit_data)?;
    Ok(Fitted {
        gp,
        free: winner.free,
        hessian: winner.hessian,
        comparison,
    })
}
