//! Command-line parsing for the statistical merge pipeline.
//!
//! Argument parsing stays separate from the numerical code; this module
//! only translates flags into a [`MergeConfig`].

use std::path::PathBuf;

use clap::Parser;

use crate::domain::{
    FitConfig, MeanFamily, MergeConfig, OutLevel, ReferenceCurve, RescaleModel, Stage,
};

/// Statistical merging of SAXS profiles.
///
/// Reads several measurements of the same scattering curve, flags invalid
/// points, fits each curve with a Gaussian process, rescales them onto a
/// common intensity scale, classifies compatible points, and merges them
/// into one curve.
#[derive(Debug, Parser)]
#[command(name = "saxsmerge", version, about)]
pub struct Cli {
    /// Input files (`q I err` columns). Each token may carry an `=N`
    /// repeat-count suffix (default 10) and may be a glob pattern.
    #[arg(required = true)]
    pub files: Vec<String>,

    /// Increase verbosity (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Name of the merged output curve.
    #[arg(long, default_value = "merged.dat")]
    pub mergename: String,

    /// Name of the summary file.
    #[arg(long, default_value = "summary.txt")]
    pub sumname: String,

    /// Destination directory for all output files.
    #[arg(long, default_value = ".")]
    pub destdir: PathBuf,

    /// Write a header line in the output files.
    #[arg(long)]
    pub header: bool,

    /// Which flags the output files carry.
    #[arg(long, value_enum, default_value_t = OutLevel::Normal)]
    pub outlevel: OutLevel,

    /// Also write data/mean files for every input curve.
    #[arg(long)]
    pub allfiles: bool,

    /// Export the merged fit (family, parameters, grid) to JSON.
    #[arg(long = "export-curve")]
    pub export_curve: Option<PathBuf>,

    /// Cleanup: type I error for the significance test.
    #[arg(long, default_value_t = 1e-7)]
    pub aalpha: f64,

    /// Cleanup: once a point at q >= CUTOFF is discarded, so is everything
    /// after it.
    #[arg(long, default_value_t = 0.1, value_name = "CUTOFF")]
    pub acutoff: f64,

    /// Fitting: most complex mean family to try.
    #[arg(long, value_enum, default_value_t = MeanFamily::Full)]
    pub bmean: MeanFamily,

    /// Fitting: disable model comparison, fit only the requested family.
    #[arg(long)]
    pub bnocomp: bool,

    /// Fitting: Laplace-average the reported error bars over parameter
    /// uncertainty.
    #[arg(long)]
    pub baverage: bool,

    /// Fitting: cap on the number of points used by the optimizers
    /// (0 = no cap).
    #[arg(long = "blimit_fitting", default_value_t = 240)]
    pub blimit_fitting: usize,

    /// Fitting: cap on the number of points used for Hessian evaluation
    /// (0 = no cap).
    #[arg(long = "blimit_hessian", default_value_t = 80)]
    pub blimit_hessian: usize,

    /// Fitting: hard lower bound on the covariance correlation length.
    #[arg(long, default_value_t = 0.005)]
    pub lambdamin: f64,

    /// Rescaling: intensity model.
    #[arg(long, value_enum, default_value_t = RescaleModel::Lognormal)]
    pub cmodel: RescaleModel,

    /// Rescaling: which input curve keeps the identity transform.
    #[arg(long, value_enum, default_value_t = ReferenceCurve::Last)]
    pub creference: ReferenceCurve,

    /// Rescaling: target number of probe points.
    #[arg(long, default_value_t = 200, value_name = "NUM")]
    pub cnpoints: usize,

    /// Classification: type I error for the compatibility test.
    #[arg(long, default_value_t = 0.05)]
    pub dalpha: f64,

    /// Merging: most complex mean family to try for the merged curve.
    #[arg(long, value_enum, default_value_t = MeanFamily::Full)]
    pub emean: MeanFamily,

    /// Merging: disable model comparison for the merged curve.
    #[arg(long)]
    pub enocomp: bool,

    /// Merging: Laplace-average the merged curve's error bars.
    #[arg(long)]
    pub eaverage: bool,

    /// Merging: cap on the number of points used by the optimizers
    /// (0 = no cap).
    #[arg(long = "elimit_fitting", default_value_t = 240)]
    pub elimit_fitting: usize,

    /// Merging: cap on the number of points used for Hessian evaluation
    /// (0 = no cap).
    #[arg(long = "elimit_hessian", default_value_t = 80)]
    pub elimit_hessian: usize,

    /// Merging: extrapolate the mean curve NUM percent past the data on
    /// the high-q side.
    #[arg(long, default_value_t = 0, value_name = "NUM")]
    pub eextrapolate: u32,

    /// Merging: do not extrapolate the mean curve down to q = 0.
    #[arg(long)]
    pub enoextrapolate: bool,

    /// Mean output grid size; negative means "use the first input file's
    /// q grid".
    #[arg(long, default_value_t = 200, allow_hyphen_values = true)]
    pub npoints: i64,

    /// Stop the pipeline after this stage.
    #[arg(long, value_enum, default_value_t = Stage::Merging)]
    pub stop: Stage,

    /// Run cleanup after rescaling instead of before fitting.
    #[arg(long = "postpone_cleanup")]
    pub postpone_cleanup: bool,
}

impl Cli {
    pub fn to_config(&self) -> MergeConfig {
        MergeConfig {
            filenames: self.files.clone(),
            verbose: self.verbose,
            mergename: self.mergename.clone(),
            sumname: self.sumname.clone(),
            destdir: self.destdir.clone(),
            header: self.header,
            outlevel: self.outlevel,
            allfiles: self.allfiles,
            export_curve: self.export_curve.clone(),
            aalpha: self.aalpha,
            acutoff: self.acutoff,
            bfit: FitConfig {
                family: self.bmean,
                comparison: !self.bnocomp,
                average: self.baverage,
                limit_fitting: self.blimit_fitting,
                limit_hessian: self.blimit_hessian,
                lambdamin: self.lambdamin,
            },
            cmodel: self.cmodel,
            creference: self.creference,
            cnpoints: self.cnpoints,
            dalpha: self.dalpha,
            efit: FitConfig {
                family: self.emean,
                comparison: !self.enocomp,
                average: self.eaverage,
                limit_fitting: self.elimit_fitting,
                limit_hessian: self.elimit_hessian,
                lambdamin: self.lambdamin,
            },
            eextrapolate: self.eextrapolate,
            enoextrapolate: self.enoextrapolate,
            npoints: self.npoints,
            stop: self.stop,
            postpone_cleanup: self.postpone_cleanup,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_surface() {
        let cli = Cli::parse_from(["saxsmerge", "in.dat"]);
        let config = cli.to_config();
        assert_eq!(config.filenames, vec!["in.dat"]);
        assert_eq!(config.aalpha, 1e-7);
        assert_eq!(config.acutoff, 0.1);
        assert_eq!(config.bfit.family, MeanFamily::Full);
        assert!(config.bfit.comparison);
        assert_eq!(config.cmodel, RescaleModel::Lognormal);
        assert_eq!(config.creference, ReferenceCurve::Last);
        assert_eq!(config.cnpoints, 200);
        assert_eq!(config.dalpha, 0.05);
        assert_eq!(config.npoints, 200);
        assert_eq!(config.stop, Stage::Merging);
        assert!(!config.postpone_cleanup);
    }

    #[test]
    fn no_input_files_is_a_usage_error() {
        assert!(Cli::try_parse_from(["saxsmerge"]).is_err());
    }

    #[test]
    fn kebab_and_underscore_flags_parse() {
        let cli = Cli::parse_from([
            "saxsmerge",
            "--cmodel",
            "normal-offset",
            "--blimit_fitting",
            "100",
            "--postpone_cleanup",
            "--npoints",
            "-1",
            "in.dat=5",
        ]);
        let config = cli.to_config();
        assert_eq!(config.cmodel, RescaleModel::NormalOffset);
        assert_eq!(config.bfit.limit_fitting, 100);
        assert!(config.postpone_cleanup);
        assert_eq!(config.npoints, -1);
    }
}
