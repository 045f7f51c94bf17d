//! Gaussian-process regression over one scattering curve.
//!
//! The model is `I(q) ~ GP(m(q), k(q, q'))` with
//!
//! - a Guinier-Porod family mean `m(q)` (see [`mean_value`]),
//! - a squared-exponential kernel `k(q, q') = tau^2 exp(-(q-q')^2 / (2 lambda^2))`,
//! - heteroscedastic observation noise `sigma2 * err_i^2 / N` on the
//!   diagonal, where `N` is the number of repeat measurements the curve
//!   averages over.
//!
//! Energies are negative log densities, so lower is better everywhere. The
//! posterior energy adds Jeffreys priors (`ln tau + ln lambda + ln sigma2`)
//! on the covariance scales; the `tau` term is skipped while `tau` is
//! pinned at zero during the mean-only stage.

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};

use crate::domain::{FitParams, MeanFamily};
use crate::error::FitError;

/// The observations one fit works on.
#[derive(Debug, Clone)]
pub struct FitData {
    pub q: Vec<f64>,
    pub i: Vec<f64>,
    pub err: Vec<f64>,
    /// Number of repeat measurements averaged into this curve.
    pub nreps: usize,
}

impl FitData {
    pub fn len(&self) -> usize {
        self.q.len()
    }

    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    /// Mean spacing between consecutive abscissas.
    pub fn mean_spacing(&self) -> f64 {
        if self.q.len() < 2 {
            return 0.0;
        }
        (self.q[self.q.len() - 1] - self.q[0]) / (self.q.len() - 1) as f64
    }

    pub fn q_range(&self) -> f64 {
        if self.q.is_empty() {
            0.0
        } else {
            self.q[self.q.len() - 1] - self.q[0]
        }
    }

    /// Keep only the points at `indices` (sorted, in range).
    pub fn subset(&self, indices: &[usize]) -> FitData {
        FitData {
            q: indices.iter().map(|&k| self.q[k]).collect(),
            i: indices.iter().map(|&k| self.i[k]).collect(),
            err: indices.iter().map(|&k| self.err[k]).collect(),
            nreps: self.nreps,
        }
    }
}

/// Guinier-Porod mean function.
///
/// For the `Generalized` and `Full` families the curve switches from the
/// Guinier branch to a `D/q^d` power law at
/// `Q1 = sqrt((d-s)(3-s)/2)/Rg`, with `D` chosen so the two branches agree
/// at `Q1`. `Simple` has no power-law branch and `Flat` is the constant
/// offset `A`.
pub fn mean_value(family: MeanFamily, p: &FitParams, q: f64) -> f64 {
    match family {
        MeanFamily::Flat => p.a,
        MeanFamily::Simple => p.a + p.g * (-q * q * p.rg * p.rg / 3.0).exp(),
        MeanFamily::Generalized => guinier_porod(p.g, p.rg, p.d, 0.0, p.a, q),
        MeanFamily::Full => guinier_porod(p.g, p.rg, p.d, p.s, p.a, q),
    }
}

fn guinier_porod(g: f64, rg: f64, d: f64, s: f64, a: f64, q: f64) -> f64 {
    // q = 0 with s > 0 has no finite power-law factor; fall back to the
    // Guinier limit I(0) = A + G.
    if q <= 0.0 {
        return a + g;
    }
    let q1 = ((d - s) * (3.0 - s) / 2.0).sqrt() / rg;
    if q <= q1 {
        a + g / q.powf(s) * (-q * q * rg * rg / (3.0 - s)).exp()
    } else {
        let big_d = g * q1.powf(d - s) * (-q1 * q1 * rg * rg / (3.0 - s)).exp();
        a + big_d / q.powf(d)
    }
}

/// Parameter-domain check shared by all energy evaluations. Out-of-bounds
/// parameter vectors get an infinite energy so optimizers back off.
pub fn params_in_bounds(family: MeanFamily, p: &FitParams) -> bool {
    let finite = [p.g, p.rg, p.d, p.s, p.a, p.tau, p.lambda, p.sigma2]
        .iter()
        .all(|v| v.is_finite());
    if !finite {
        return false;
    }
    if !(p.tau >= 0.0 && p.lambda > 0.0 && p.sigma2 > 0.0) {
        return false;
    }
    match family {
        MeanFamily::Flat => true,
        MeanFamily::Simple => p.g > 0.0 && p.rg > 0.0,
        MeanFamily::Generalized => p.g > 0.0 && p.rg > 0.0 && p.d > 0.0,
        MeanFamily::Full => {
            p.g > 0.0 && p.rg > 0.0 && p.s >= 0.0 && p.s < 3.0 && p.d > p.s
        }
    }
}

/// Full observation covariance `tau^2 K + sigma2 diag(err^2 / N)`.
pub fn covariance_matrix(p: &FitParams, data: &FitData) -> DMatrix<f64> {
    let n = data.len();
    let nreps = data.nreps.max(1) as f64;
    let mut omega = DMatrix::<f64>::zeros(n, n);
    if p.tau > 0.0 {
        let tau2 = p.tau * p.tau;
        let inv2l2 = 1.0 / (2.0 * p.lambda * p.lambda);
        for i in 0..n {
            for j in i..n {
                let dq = data.q[i] - data.q[j];
                let v = tau2 * (-dq * dq * inv2l2).exp();
                omega[(i, j)] = v;
                omega[(j, i)] = v;
            }
        }
    }
    for i in 0..n {
        omega[(i, i)] += p.sigma2 * data.err[i] * data.err[i] / nreps;
    }
    omega
}

fn residual(family: MeanFamily, p: &FitParams, data: &FitData) -> DVector<f64> {
    DVector::from_iterator(
        data.len(),
        data.q
            .iter()
            .zip(data.i.iter())
            .map(|(&q, &i)| i - mean_value(family, p, q)),
    )
}

/// Negative log likelihood of the data under the GP,
/// `0.5 [r' Omega^-1 r + ln det Omega + n ln 2 pi]`.
pub fn neg_log_likelihood(family: MeanFamily, p: &FitParams, data: &FitData) -> f64 {
    if !params_in_bounds(family, p) || data.is_empty() {
        return f64::INFINITY;
    }
    let omega = covariance_matrix(p, data);
    let Some(chol) = omega.cholesky() else {
        return f64::INFINITY;
    };
    let r = residual(family, p, data);
    let x = chol.solve(&r);
    let chi2 = r.dot(&x);
    let lndet = 2.0 * chol.l().diagonal().iter().map(|v| v.ln()).sum::<f64>();
    let n = data.len() as f64;
    let e = 0.5 * (chi2 + lndet + n * (2.0 * std::f64::consts::PI).ln());
    if e.is_finite() { e } else { f64::INFINITY }
}

/// Negative log posterior: likelihood plus Jeffreys priors on the
/// covariance scales.
pub fn neg_log_posterior(family: MeanFamily, p: &FitParams, data: &FitData) -> f64 {
    let nll = neg_log_likelihood(family, p, data);
    if !nll.is_finite() {
        return f64::INFINITY;
    }
    let mut e = nll + p.lambda.ln() + p.sigma2.ln();
    if p.tau > 0.0 {
        e += p.tau.ln();
    }
    if e.is_finite() { e } else { f64::INFINITY }
}

/// A fitted Gaussian process with its Cholesky factor, ready for
/// posterior queries at arbitrary abscissas.
#[derive(Debug, Clone)]
pub struct GaussianProcess {
    family: MeanFamily,
    params: FitParams,
    data: FitData,
    chol: Cholesky<f64, Dyn>,
    /// `Omega^-1 (I - m)`, reused by every posterior-mean query.
    alpha: DVector<f64>,
}

impl GaussianProcess {
    pub fn new(family: MeanFamily, params: FitParams, data: FitData) -> Result<Self, FitError> {
        if !params_in_bounds(family, &params) {
            return Err(FitError::Degenerate(
                "parameters outside the model domain".into(),
            ));
        }
        if data.is_empty() {
            return Err(FitError::Degenerate("no data points".into()));
        }
        let omega = covariance_matrix(&params, &data);
        let chol = omega.cholesky().ok_or_else(|| {
            FitError::Degenerate("covariance matrix is not positive-definite".into())
        })?;
        let r = residual(family, &params, &data);
        let alpha = chol.solve(&r);
        Ok(GaussianProcess {
            family,
            params,
            data,
            chol,
            alpha,
        })
    }

    pub fn family(&self) -> MeanFamily {
        self.family
    }

    pub fn params(&self) -> &FitParams {
        &self.params
    }

    pub fn data(&self) -> &FitData {
        &self.data
    }

    /// Prior mean function at `q`.
    pub fn mean(&self, q: f64) -> f64 {
        mean_value(self.family, &self.params, q)
    }

    fn kernel_vector(&self, q: f64) -> DVector<f64> {
        let tau2 = self.params.tau * self.params.tau;
        let inv2l2 = 1.0 / (2.0 * self.params.lambda * self.params.lambda);
        DVector::from_iterator(
            self.data.len(),
            self.data
                .q
                .iter()
                .map(|&qi| tau2 * (-(q - qi) * (q - qi) * inv2l2).exp()),
        )
    }

    /// Posterior mean at `q`.
    pub fn posterior_mean(&self, q: f64) -> f64 {
        self.mean(q) + self.kernel_vector(q).dot(&self.alpha)
    }

    /// Posterior variance of the latent function at `q`, clamped at zero
    /// against round-off.
    pub fn posterior_variance(&self, q: f64) -> f64 {
        let k = self.kernel_vector(q);
        let x = self.chol.solve(&k);
        let tau2 = self.params.tau * self.params.tau;
        (tau2 - k.dot(&x)).max(0.0)
    }
}

/// One-shot posterior variance for a hypothetical parameter vector.
///
/// Builds the full factorization each call; used only by the Laplace
/// parameter-averaging correction, which differentiates the variance with
/// respect to the parameters numerically.
pub fn posterior_variance_for(family: MeanFamily, p: &FitParams, data: &FitData, q: f64) -> f64 {
    match GaussianProcess::new(family, *p, data.clone()) {
        Ok(gp) => gp.posterior_variance(q),
        Err(_) => f64::NAN,
    }
}
