//! Top-level orchestration: parse arguments, run the pipeline, write the
//! outputs.

use clap::Parser;

use crate::cli::Cli;
use crate::domain::{FitConfig, MergeConfig};
use crate::error::AppError;
use crate::io::{curve, export};
use crate::math::linspace;
use crate::profile::{Average, SaxsProfile};
use crate::report;

pub mod pipeline;

pub fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let config = cli.to_config();
    let argv: String = std::env::args().collect::<Vec<_>>().join(" ");
    let run = pipeline::run_merge(&config)?;
    write_outputs(&run, &config, &argv)
}

fn average_for(fit: &FitConfig) -> Average {
    if !fit.average {
        Average::Map
    } else if fit.limit_hessian == 0 {
        Average::All
    } else {
        Average::Limit(fit.limit_hessian)
    }
}

/// Output grid for a single input's mean file.
fn input_grid(profile: &SaxsProfile, npoints: i64) -> Vec<f64> {
    if npoints < 0 {
        profile.get_raw_data().0.to_vec()
    } else {
        linspace(profile.qmin(), profile.qmax(), npoints as usize)
    }
}

/// Output grid for the merged mean file. The range follows the
/// extrapolation intervals; a negative `npoints` reuses the first input's
/// q grid restricted to that range.
fn merged_grid(
    merged: &SaxsProfile,
    first_input: &SaxsProfile,
    config: &MergeConfig,
) -> Result<Vec<f64>, AppError> {
    let intervals = merged.get_flag_intervals("eextrapol")?;
    let qmax = intervals
        .iter()
        .map(|iv| iv.qmax)
        .fold(f64::NEG_INFINITY, f64::max);
    let qmin = intervals
        .iter()
        .map(|iv| iv.qmin)
        .fold(f64::INFINITY, f64::min);
    if !qmin.is_finite() || !qmax.is_finite() {
        return Err(AppError::new(4, "Merged curve has an empty q range."));
    }
    if config.npoints < 0 {
        Ok(first_input
            .get_raw_data()
            .0
            .iter()
            .copied()
            .filter(|&q| q >= qmin && q <= qmax)
            .collect())
    } else {
        Ok(linspace(qmin, qmax, config.npoints as usize))
    }
}

fn write_outputs(
    run: &pipeline::RunOutput,
    config: &MergeConfig,
    argv: &str,
) -> Result<(), AppError> {
    std::fs::create_dir_all(&config.destdir).map_err(|e| {
        AppError::new(
            2,
            format!(
                "Failed to create output directory '{}': {e}",
                config.destdir.display()
            ),
        )
    })?;

    if config.allfiles {
        for p in &run.profiles {
            export::write_data_file(&config.destdir, p, config.outlevel, config.header)?;
            if p.fitted().is_some() {
                let qvals = input_grid(p, config.npoints);
                export::write_mean_file(
                    &config.destdir,
                    p,
                    &qvals,
                    config.outlevel,
                    config.header,
                    average_for(&config.bfit),
                )?;
            }
        }
    }

    if let Some(merged) = &run.merged {
        export::write_data_file(&config.destdir, merged, config.outlevel, config.header)?;
        let qvals = merged_grid(merged, &run.profiles[0], config)?;
        export::write_mean_file(
            &config.destdir,
            merged,
            &qvals,
            config.outlevel,
            config.header,
            average_for(&config.efit),
        )?;
        if let Some(path) = &config.export_curve {
            curve::write_curve_json(path, merged)?;
        }
    }

    let summary = report::format_summary(
        argv,
        &run.profiles,
        run.merged.as_ref(),
        run.transforms.as_deref(),
    )?;
    let sumpath = config.destdir.join(&config.sumname);
    std::fs::write(&sumpath, summary).map_err(|e| {
        AppError::new(
            2,
            format!("Failed to write summary '{}': {e}", sumpath.display()),
        )
    })?;
    if config.verbose >= 1 {
        println!("Wrote {}", sumpath.display());
    }
    Ok(())
}
