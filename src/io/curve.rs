//! Machine-readable JSON export of the merged fit.
//!
//! The JSON carries the selected mean family, the full parameter vector,
//! the model-comparison table, and a precomputed posterior grid so
//! downstream plotting does not need to re-run the fit.

use std::fs::File;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::{ComparisonEntry, FitParams, MeanFamily};
use crate::error::AppError;
use crate::profile::{Average, MeanSelect, SaxsProfile};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurveGrid {
    pub q: Vec<f64>,
    pub i: Vec<f64>,
    pub err: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurveFile {
    pub tool: String,
    pub family: MeanFamily,
    pub params: FitParams,
    pub comparison: Vec<ComparisonEntry>,
    pub grid: CurveGrid,
}

/// Write the fitted curve to JSON. Requires a bound interpolant.
pub fn write_curve_json(path: &Path, profile: &SaxsProfile) -> Result<(), AppError> {
    let fitted = profile.fitted().ok_or_else(|| {
        AppError::new(
            3,
            format!("Curve '{}' has no fit to export.", profile.name()),
        )
    })?;

    let sel = MeanSelect {
        num: 101,
        average: Average::Map,
        ..MeanSelect::default()
    };
    let pts = profile.get_mean(&sel)?;
    let grid = CurveGrid {
        q: pts.iter().map(|p| p.q).collect(),
        i: pts.iter().map(|p| p.i).collect(),
        err: pts.iter().map(|p| p.err).collect(),
    };

    let curve = CurveFile {
        tool: "saxsmerge".to_string(),
        family: fitted.family(),
        params: *fitted.params(),
        comparison: fitted.comparison().to_vec(),
        grid,
    };

    let file = File::create(path).map_err(|e| {
        AppError::new(2, format!("Failed to create curve JSON '{}': {e}", path.display()))
    })?;
    serde_json::to_writer_pretty(file, &curve)
        .map_err(|e| AppError::new(2, format!("Failed to write curve JSON: {e}")))?;
    Ok(())
}
