//! Maximum-a-posteriori Gaussian-process fitting with model selection.

pub mod fitter;
pub mod selection;

pub use fitter::{find_fit_by_gridding, find_fit_mean};
pub use selection::find_fit;

use nalgebra::DMatrix;

use crate::domain::{ComparisonEntry, FitParams, MeanFamily, ParamName};
use crate::gp::GaussianProcess;

/// Everything a finished fit carries: the queryable process, the set of
/// parameters that were optimized, the Hessian of the posterior energy at
/// the optimum, and the model-comparison table that led to this family.
#[derive(Debug, Clone)]
pub struct Fitted {
    pub(crate) gp: GaussianProcess,
    pub(crate) free: Vec<ParamName>,
    pub(crate) hessian: DMatrix<f64>,
    pub(crate) comparison: Vec<ComparisonEntry>,
}

impl Fitted {
    pub fn gp(&self) -> &GaussianProcess {
        &self.gp
    }

    pub fn family(&self) -> MeanFamily {
        self.gp.family()
    }

    pub fn params(&self) -> &FitParams {
        self.gp.params()
    }

    pub fn free_params(&self) -> &[ParamName] {
        &self.free
    }

    pub fn hessian(&self) -> &DMatrix<f64> {
        &self.hessian
    }

    pub fn comparison(&self) -> &[ComparisonEntry] {
        &self.comparison
    }

    /// Standard errors `sqrt(diag(H^-1))`, aligned with `free_params`.
    /// `None` when the Hessian is not invertible.
    pub fn stderrs(&self) -> Option<Vec<f64>> {
        let inv = self.hessian.clone().try_inverse()?;
        Some(
            (0..self.free.len())
                .map(|k| inv[(k, k)].max(0.0).sqrt())
                .collect(),
        )
    }
}
