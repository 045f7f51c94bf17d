//! Shared domain types.
//!
//! These types are intentionally kept lightweight and serializable so they
//! can be:
//!
//! - used in-memory during the merge pipeline
//! - exported to JSON for downstream plotting or comparisons
//! - echoed into the summary report

use std::path::PathBuf;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Mean-function family, from simplest to most complex.
///
/// The families are nested: `Flat` (constant offset `A`) is contained in
/// `Simple` (adds the Guinier parameters `G`, `Rg`), which is contained in
/// `Generalized` (adds the Porod exponent `d`), which is contained in
/// `Full` (adds the low-angle shape exponent `s`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MeanFamily {
    Flat,
    Simple,
    Generalized,
    Full,
}

impl MeanFamily {
    /// Human-readable label for report output.
    pub fn display_name(self) -> &'static str {
        match self {
            MeanFamily::Flat => "Flat",
            MeanFamily::Simple => "Simple",
            MeanFamily::Generalized => "Generalized",
            MeanFamily::Full => "Full",
        }
    }

    /// Free mean-function parameters for this family.
    pub fn mean_params(self) -> &'static [ParamName] {
        use ParamName::*;
        match self {
            MeanFamily::Flat => &[A],
            MeanFamily::Simple => &[G, Rg, A],
            MeanFamily::Generalized => &[G, Rg, D, A],
            MeanFamily::Full => &[G, Rg, D, S, A],
        }
    }

    /// Families to try when model comparison is enabled, up to and
    /// including this one.
    pub fn nested_up_to(self) -> Vec<MeanFamily> {
        [
            MeanFamily::Flat,
            MeanFamily::Simple,
            MeanFamily::Generalized,
            MeanFamily::Full,
        ]
        .into_iter()
        .filter(|f| *f <= self)
        .collect()
    }

}

/// All fit parameters, by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamName {
    G,
    Rg,
    D,
    S,
    A,
    Tau,
    Lambda,
    Sigma2,
}

impl ParamName {
    pub fn label(self) -> &'static str {
        match self {
            ParamName::G => "G",
            ParamName::Rg => "Rg",
            ParamName::D => "d",
            ParamName::S => "s",
            ParamName::A => "A",
            ParamName::Tau => "tau",
            ParamName::Lambda => "lambda",
            ParamName::Sigma2 => "sigma2",
        }
    }

    /// Covariance-side parameters, in reporting order.
    pub fn covariance_params() -> &'static [ParamName] {
        &[ParamName::Tau, ParamName::Lambda, ParamName::Sigma2]
    }
}

/// The full parameter set of one Gaussian-process fit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitParams {
    pub g: f64,
    pub rg: f64,
    pub d: f64,
    pub s: f64,
    pub a: f64,
    pub tau: f64,
    pub lambda: f64,
    pub sigma2: f64,
}

impl FitParams {
    pub fn get(&self, name: ParamName) -> f64 {
        match name {
            ParamName::G => self.g,
            ParamName::Rg => self.rg,
            ParamName::D => self.d,
            ParamName::S => self.s,
            ParamName::A => self.a,
            ParamName::Tau => self.tau,
            ParamName::Lambda => self.lambda,
            ParamName::Sigma2 => self.sigma2,
        }
    }

    pub fn set(&mut self, name: ParamName, value: f64) {
        match name {
            ParamName::G => self.g = value,
            ParamName::Rg => self.rg = value,
            ParamName::D => self.d = value,
            ParamName::S => self.s = value,
            ParamName::A => self.a = value,
            ParamName::Tau => self.tau = value,
            ParamName::Lambda => self.lambda = value,
            ParamName::Sigma2 => self.sigma2 = value,
        }
    }

    /// Pack the named parameters into a flat vector (optimizer order).
    pub fn pack(&self, names: &[ParamName]) -> Vec<f64> {
        names.iter().map(|n| self.get(*n)).collect()
    }

    /// Unpack a flat vector back into the named slots.
    pub fn unpack(&mut self, names: &[ParamName], values: &[f64]) {
        for (n, v) in names.iter().zip(values.iter()) {
            self.set(*n, *v);
        }
    }
}

impl Default for FitParams {
    fn default() -> Self {
        // Starting point for the mean-stage optimization. G and A are set
        // from the data before fitting; the rest are generic scales.
        FitParams {
            g: 10.0,
            rg: 10.0,
            d: 4.0,
            s: 0.0,
            a: 0.0,
            tau: 1.0,
            lambda: 1.0,
            sigma2: 1.0,
        }
    }
}

/// Rescaling model used to align a curve to the reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum RescaleModel {
    /// `I0 ~ gamma * I1`, weighted least squares.
    Normal,
    /// `I0 ~ gamma * (I1 + c)`, closed-form weighted least squares.
    NormalOffset,
    /// `log I0 ~ log(gamma * I1)`; no offset support.
    Lognormal,
}

/// Which input curve ends up with the identity transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceCurve {
    First,
    Last,
}

/// Pipeline stages, in default execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Cleanup,
    Fitting,
    Rescaling,
    Classification,
    Merging,
}

impl Stage {
    pub fn display_name(self) -> &'static str {
        match self {
            Stage::Cleanup => "cleanup",
            Stage::Fitting => "fitting",
            Stage::Rescaling => "rescaling",
            Stage::Classification => "classification",
            Stage::Merging => "merging",
        }
    }
}

/// Which flags the output writers emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutLevel {
    /// q, I, err only.
    Sparse,
    /// Adds origin columns (and the extrapolation flag for mean files).
    Normal,
    /// All flags.
    Full,
}

/// Knobs for one invocation of the curve fitter.
#[derive(Debug, Clone)]
pub struct FitConfig {
    /// Most complex mean family to consider.
    pub family: MeanFamily,
    /// Fit all nested families and select by Bayes factor.
    pub comparison: bool,
    /// Laplace-average the posterior variance over parameter uncertainty.
    pub average: bool,
    /// Subsample the data to at most this many points before fitting
    /// (0 = use everything).
    pub limit_fitting: usize,
    /// Subsample the data to at most this many points before Hessian
    /// evaluation (0 = use everything).
    pub limit_hessian: usize,
    /// Hard lower bound on the covariance correlation length.
    pub lambdamin: f64,
}

/// A full run's configuration as understood by the pipeline.
///
/// This is derived from CLI flags (plus defaults).
#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Raw input tokens (`path=N` suffix and glob patterns still intact).
    pub filenames: Vec<String>,
    pub verbose: u8,

    pub mergename: String,
    pub sumname: String,
    pub destdir: PathBuf,
    pub header: bool,
    pub outlevel: OutLevel,
    pub allfiles: bool,
    pub export_curve: Option<PathBuf>,

    pub aalpha: f64,
    pub acutoff: f64,

    pub bfit: FitConfig,

    pub cmodel: RescaleModel,
    pub creference: ReferenceCurve,
    pub cnpoints: usize,

    pub dalpha: f64,

    pub efit: FitConfig,
    pub eextrapolate: u32,
    pub enoextrapolate: bool,
    pub npoints: i64,

    pub stop: Stage,
    pub postpone_cleanup: bool,
}

impl MergeConfig {
    /// Stage order for this run: `--postpone_cleanup` moves cleanup after
    /// rescaling, `--stop` truncates the list.
    pub fn stage_order(&self) -> Vec<Stage> {
        let order = if self.postpone_cleanup {
            vec![
                Stage::Fitting,
                Stage::Rescaling,
                Stage::Cleanup,
                Stage::Classification,
                Stage::Merging,
            ]
        } else {
            vec![
                Stage::Cleanup,
                Stage::Fitting,
                Stage::Rescaling,
                Stage::Classification,
                Stage::Merging,
            ]
        };
        let mut out = Vec::new();
        for stage in order {
            out.push(stage);
            if stage == self.stop {
                break;
            }
        }
        out
    }
}

/// One row of the Bayes-factor comparison table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonEntry {
    pub family: MeanFamily,
    /// Number of optimized parameters.
    pub num_params: usize,
    /// Negative log posterior at the MAP.
    pub map_energy: f64,
    /// Negative log likelihood at the MAP.
    pub ml_energy: f64,
    /// Minus log Bayes factor (lower is better; +inf when the Hessian was
    /// not positive-definite).
    pub minus_log_bf: f64,
    pub bic: f64,
    pub aic: f64,
}
