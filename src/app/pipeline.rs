//! The merge pipeline.
//!
//! Stages run in the order given by [`MergeConfig::stage_order`]:
//! cleanup, fitting, rescaling, classification, merging by default, with
//! cleanup postponed past rescaling on request and the list truncated at
//! the configured stop stage. Within a stage curves are processed in input
//! order; only the per-curve fits are parallel, since they share nothing.

use rayon::prelude::*;

use crate::classify;
use crate::domain::{MergeConfig, Stage};
use crate::error::AppError;
use crate::fit::find_fit;
use crate::gp::FitData;
use crate::io::ingest;
use crate::profile::{
    AddDataOptions, DataRow, DataSelect, FlagKind, FlagValue, SaxsProfile,
};
use crate::rescale::{self, Transform};
use crate::stats::ttest_one;

/// Everything a run produces, for output writing and reporting.
pub struct RunOutput {
    pub profiles: Vec<SaxsProfile>,
    pub merged: Option<SaxsProfile>,
    pub transforms: Option<Vec<Transform>>,
}

/// Execute the pipeline over the configured input files.
pub fn run_merge(config: &MergeConfig) -> Result<RunOutput, AppError> {
    let specs = ingest::parse_input_tokens(&config.filenames)?;
    let mut profiles = ingest::load_profiles(&specs, config.verbose)?;

    let mut transforms: Option<Vec<Transform>> = None;
    let mut merged = None;
    for stage in config.stage_order() {
        if config.verbose >= 1 {
            println!("{}", stage.display_name());
        }
        match stage {
            Stage::Cleanup => {
                let kept = cleanup(&mut profiles, config)?;
                // Under postponed cleanup the transforms already exist;
                // keep them aligned with the surviving curves.
                if let Some(ts) = transforms.as_mut() {
                    let mut it = kept.into_iter();
                    ts.retain(|_| it.next().unwrap_or(false));
                }
            }
            Stage::Fitting => fitting(&mut profiles, config)?,
            Stage::Rescaling => {
                transforms = Some(rescale::rescale(
                    &mut profiles,
                    config.cmodel,
                    config.creference,
                    config.cnpoints,
                    config.verbose,
                )?);
            }
            Stage::Classification => {
                classify::classify(&mut profiles, config.dalpha, config.verbose)?;
            }
            Stage::Merging => merged = Some(merging(&profiles, config)?),
        }
    }
    Ok(RunOutput {
        profiles,
        merged,
        transforms,
    })
}

/// Flag each point's significance with a right-tailed t-test of `I`
/// against zero. A rejected point at `q >= acutoff` invalidates everything
/// after it; zero-error points are invalid but never arm that latch.
/// Curves left without a single good point are dropped; the returned mask
/// records which incoming curves survived.
fn cleanup(profiles: &mut Vec<SaxsProfile>, config: &MergeConfig) -> Result<Vec<bool>, AppError> {
    let mut kept = Vec::with_capacity(profiles.len());
    let mut survived = Vec::with_capacity(profiles.len());
    for mut p in profiles.drain(..) {
        p.new_flag("agood", FlagKind::Bool)?;
        p.new_flag("apvalue", FlagKind::Float)?;
        let (q, i, err) = {
            let (q, i, err) = p.get_raw_data();
            (q.to_vec(), i.to_vec(), err.to_vec())
        };
        let nreps = p.nreps();
        let mut had_outlier = false;
        let mut good_count = 0usize;
        for id in 0..q.len() {
            if err[id] == 0.0 {
                p.set_flag(id, "agood", FlagValue::Bool(false))?;
                p.set_flag(id, "apvalue", FlagValue::Float(-1.0))?;
                continue;
            }
            let t = ttest_one(i[id], err[id], nreps);
            let mut good = t.pval <= config.aalpha;
            if had_outlier {
                good = false;
            }
            if !good && q[id] >= config.acutoff {
                had_outlier = true;
            }
            p.set_flag(id, "agood", FlagValue::Bool(good))?;
            p.set_flag(id, "apvalue", FlagValue::Float(t.pval))?;
            if good {
                good_count += 1;
            }
        }
        p.create_intervals_from_data("agood")?;
        if good_count == 0 {
            eprintln!(
                "Warning: no significant points in '{}'; dropping it.",
                p.name()
            );
            survived.push(false);
            continue;
        }
        if config.verbose >= 2 {
            println!("  {}: {good_count} of {} points significant", p.name(), q.len());
        }
        survived.push(true);
        kept.push(p);
    }
    if kept.is_empty() {
        return Err(AppError::new(4, "Cleanup discarded every input curve."));
    }
    *profiles = kept;
    Ok(survived)
}

/// Fit every curve over its valid points (all points when cleanup has not
/// run yet). Fits are independent and run in parallel.
fn fitting(profiles: &mut [SaxsProfile], config: &MergeConfig) -> Result<(), AppError> {
    let verbose = config.verbose;
    profiles.par_iter_mut().try_for_each(|p| {
        let filter = if p.has_flag("agood") {
            vec!["agood".to_string()]
        } else {
            Vec::new()
        };
        let (_, q, i, err) = p.get_columns(&DataSelect {
            filter,
            ..DataSelect::default()
        })?;
        let data = FitData {
            q,
            i,
            err,
            nreps: p.nreps(),
        };
        if verbose >= 1 {
            println!(" fitting {}", p.name());
        }
        let fitted = find_fit(&data, &config.bfit, None, verbose).map_err(AppError::from)?;
        p.set_interpolant(fitted);
        Ok(())
    })
}

/// Union all accepted points into a fresh curve, tag their origins, set
/// the extrapolation intervals, and re-fit the result seeded with the
/// reference curve's solution.
fn merging(profiles: &[SaxsProfile], config: &MergeConfig) -> Result<SaxsProfile, AppError> {
    let mut merged = SaxsProfile::new(config.mergename.clone());
    merged.new_flag("dselfref", FlagKind::Bool)?;
    merged.new_flag("drefnum", FlagKind::Int)?;
    merged.new_flag("drefname", FlagKind::Str)?;
    merged.new_flag("eorigin", FlagKind::Int)?;
    merged.new_flag("eoriname", FlagKind::Str)?;
    merged.new_flag("eextrapol", FlagKind::Bool)?;

    let mut rows = Vec::new();
    for (i, p) in profiles.iter().enumerate() {
        let sel = DataSelect {
            filter: vec!["dgood".to_string()],
            ..DataSelect::default()
        };
        for pt in p.get_data(&sel)? {
            rows.push(DataRow {
                q: pt.q,
                i: pt.i,
                err: pt.err,
                flags: vec![
                    p.get_flag(pt.id, "dselfref")?,
                    p.get_flag(pt.id, "drefnum")?,
                    p.get_flag(pt.id, "drefname")?,
                    Some(FlagValue::Int(i as i64)),
                    Some(FlagValue::Str(p.name().to_string())),
                    Some(FlagValue::Bool(false)),
                ],
            });
        }
    }
    if rows.is_empty() {
        return Err(AppError::new(4, "No compatible points left to merge."));
    }
    merged.add_data_rows(rows, &AddDataOptions::default())?;
    merged.set_nreps(profiles.iter().map(|p| p.nreps()).min().unwrap_or(1));
    for name in ["dselfref", "drefnum", "drefname", "eorigin", "eoriname"] {
        merged.create_intervals_from_data(name)?;
    }

    let (qmin, qmax) = (merged.qmin(), merged.qmax());
    merged.set_flag_interval("eextrapol", qmin, qmax, Some(FlagValue::Bool(false)))?;
    if !config.enoextrapolate {
        merged.set_flag_interval("eextrapol", 0.0, qmin, Some(FlagValue::Bool(true)))?;
    }
    if config.eextrapolate > 0 {
        let ext = qmax * (1.0 + config.eextrapolate as f64 / 100.0);
        merged.set_flag_interval("eextrapol", qmax, ext, Some(FlagValue::Bool(true)))?;
    }

    // Seed the merged fit with the reference curve's solution (the one
    // whose transform stayed the identity).
    let seed = profiles
        .iter()
        .find(|p| (p.gamma() - 1.0).abs() < 1e-9)
        .and_then(|p| p.fitted())
        .map(|f| *f.params());
    let (q, i, err) = merged.get_raw_data();
    let data = FitData {
        q: q.to_vec(),
        i: i.to_vec(),
        err: err.to_vec(),
        nreps: merged.nreps(),
    };
    if config.verbose >= 1 {
        println!(" fitting the merged curve ({} points)", data.len());
    }
    let fitted = find_fit(&data, &config.efit, seed, config.verbose).map_err(AppError::from)?;
    merged.set_interpolant(fitted);
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FitConfig, FitParams, MeanFamily, OutLevel, ReferenceCurve, RescaleModel};
    use crate::gp::mean_value;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};
    use std::io::Write;

    fn write_synthetic_curve(dir: &std::path::Path, name: &str, seed: u64) -> std::path::PathBuf {
        let truth = FitParams {
            g: 20.0,
            rg: 15.0,
            a: 0.5,
            ..FitParams::default()
        };
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let noise = Normal::new(0.0, 0.1).unwrap();
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "# synthetic Guinier curve").unwrap();
        let n = 60;
        for k in 0..n {
            let q = 0.005 + 0.3 * k as f64 / (n - 1) as f64;
            let i = mean_value(MeanFamily::Simple, &truth, q) + noise.sample(&mut rng);
            writeln!(f, "{q:.6} {i:.6} 0.1").unwrap();
        }
        path
    }

    fn test_config(files: Vec<String>) -> MergeConfig {
        let fit = FitConfig {
            family: MeanFamily::Generalized,
            comparison: true,
            average: false,
            limit_fitting: 0,
            limit_hessian: 40,
            lambdamin: 0.005,
        };
        MergeConfig {
            filenames: files,
            verbose: 0,
            mergename: "merged.dat".into(),
            sumname: "summary.txt".into(),
            destdir: ".".into(),
            header: false,
            outlevel: OutLevel::Normal,
            allfiles: false,
            export_curve: None,
            aalpha: 1e-7,
            acutoff: 0.1,
            bfit: fit.clone(),
            cmodel: RescaleModel::Lognormal,
            creference: ReferenceCurve::Last,
            cnpoints: 100,
            dalpha: 0.05,
            efit: fit,
            eextrapolate: 0,
            enoextrapolate: false,
            npoints: 100,
            stop: Stage::Merging,
            postpone_cleanup: false,
        }
    }

    #[test]
    fn end_to_end_merges_compatible_curves() {
        let dir = tempfile::tempdir().unwrap();
        let files: Vec<String> = [1u64, 2, 3]
            .iter()
            .map(|&s| {
                write_synthetic_curve(dir.path(), &format!("c{s}.dat"), s)
                    .display()
                    .to_string()
            })
            .collect();
        let config = test_config(files);
        let run = run_merge(&config).unwrap();

        // Cleanup keeps every curve.
        assert_eq!(run.profiles.len(), 3);

        // Model comparison never settles on a constant mean for curved data.
        let families: Vec<MeanFamily> =
            run.profiles.iter().map(|p| p.fitted().unwrap().family()).collect();
        assert!(families.iter().all(|f| *f != MeanFamily::Flat), "{families:?}");

        // The reference (last) curve keeps the identity transform.
        let transforms = run.transforms.as_ref().unwrap();
        assert!((transforms[2].gamma - 1.0).abs() < 1e-12);
        assert!(transforms[2].offset.abs() < 1e-12);

        // Merged point count is exactly the sum of accepted points.
        let merged = run.merged.as_ref().unwrap();
        let dgood_total: usize = run
            .profiles
            .iter()
            .map(|p| {
                let sel = DataSelect {
                    filter: vec!["dgood".into()],
                    ..DataSelect::default()
                };
                p.get_data(&sel).unwrap().len()
            })
            .sum();
        assert_eq!(merged.len(), dgood_total);

        // Forward scattering of the merged fit agrees with each input's.
        let merged_i0 = {
            let p = merged.fitted().unwrap().params();
            p.a + p.g
        };
        for profile in &run.profiles {
            let p = profile.fitted().unwrap().params();
            let i0 = p.a + p.g;
            assert!(
                (merged_i0 - i0).abs() / i0 < 0.25,
                "merged I(0)={merged_i0}, input I(0)={i0}"
            );
        }
    }

    #[test]
    fn stop_after_rescaling_leaves_no_merge() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![
            write_synthetic_curve(dir.path(), "a.dat", 5)
                .display()
                .to_string(),
        ];
        let mut config = test_config(files);
        config.bfit.comparison = false;
        config.bfit.family = MeanFamily::Simple;
        config.stop = Stage::Rescaling;
        let run = run_merge(&config).unwrap();
        assert!(run.merged.is_none());
        let transforms = run.transforms.unwrap();
        // A curve rescaled against itself keeps the identity transform.
        assert!((transforms[0].gamma - 1.0).abs() < 1e-12);
        assert!(transforms[0].offset.abs() < 1e-12);
        assert!(run.profiles[0].has_flag("cgood"));
        assert!(!run.profiles[0].has_flag("dgood"));
    }

    #[test]
    fn postponed_cleanup_drops_transforms_with_curves() {
        let dir = tempfile::tempdir().unwrap();
        let signal = write_synthetic_curve(dir.path(), "signal.dat", 9);
        let noise = dir.path().join("noise.dat");
        let mut f = std::fs::File::create(&noise).unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(21);
        let dist = Normal::new(0.0, 1.0).unwrap();
        for k in 0..60 {
            let q = 0.005 + 0.3 * k as f64 / 59.0;
            writeln!(f, "{q:.6} {:.6} 10.0", dist.sample(&mut rng)).unwrap();
        }
        drop(f);
        let mut config = test_config(vec![
            signal.display().to_string(),
            noise.display().to_string(),
        ]);
        config.postpone_cleanup = true;
        config.stop = Stage::Cleanup;
        config.bfit.comparison = false;
        config.bfit.family = MeanFamily::Flat;
        config.creference = ReferenceCurve::First;
        config.cmodel = RescaleModel::Normal;
        let run = run_merge(&config).unwrap();

        // The noise curve is discarded, along with its transform.
        assert_eq!(run.profiles.len(), 1);
        let transforms = run.transforms.unwrap();
        assert_eq!(transforms.len(), 1);
        // The survivor is the reference, so its transform is the identity.
        assert!((transforms[0].gamma - 1.0).abs() < 1e-12);
        assert!(transforms[0].offset.abs() < 1e-12);
    }

    #[test]
    fn zero_error_points_do_not_latch() {
        let rows: Vec<DataRow> = (1..=50)
            .map(|k| {
                let q = k as f64 * 0.01;
                DataRow {
                    q,
                    i: 10.0,
                    err: if (q - 0.15).abs() < 1e-9 { 0.0 } else { 0.1 },
                    flags: vec![],
                }
            })
            .collect();
        let mut p = SaxsProfile::new("zero-err");
        let opts = AddDataOptions {
            require_positive_error: false,
            ..AddDataOptions::default()
        };
        p.add_data_rows(rows, &opts).unwrap();
        let mut profiles = vec![p];
        let config = test_config(vec![]);
        cleanup(&mut profiles, &config).unwrap();

        let p = &profiles[0];
        let (q, _, _) = p.get_raw_data();
        for id in 0..p.len() {
            let good = p
                .get_flag(id, "agood")
                .unwrap()
                .and_then(|v| v.as_bool())
                .unwrap();
            if (q[id] - 0.15).abs() < 1e-9 {
                assert!(!good);
                assert_eq!(
                    p.get_flag(id, "apvalue").unwrap(),
                    Some(FlagValue::Float(-1.0))
                );
            } else {
                // The unmeasured point must not invalidate the tail.
                assert!(good, "q={} should be valid", q[id]);
            }
        }
    }

    #[test]
    fn sticky_outlier_invalidates_the_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outlier.dat");
        let mut f = std::fs::File::create(&path).unwrap();
        let qs: Vec<f64> = (1..=50).map(|k| k as f64 * 0.01).collect();
        for &q in &qs {
            // One insignificant point at q = 0.15, strong signal elsewhere.
            let i = if (q - 0.15).abs() < 1e-9 { 0.0 } else { 10.0 };
            writeln!(f, "{q:.6} {i:.6} 0.1").unwrap();
        }
        drop(f);
        let mut config = test_config(vec![path.display().to_string()]);
        config.stop = Stage::Cleanup;
        let run = run_merge(&config).unwrap();
        let p = &run.profiles[0];
        let (q, _, _) = p.get_raw_data();
        for id in 0..p.len() {
            let good = p
                .get_flag(id, "agood")
                .unwrap()
                .and_then(|v| v.as_bool())
                .unwrap();
            if q[id] >= 0.15 {
                assert!(!good, "q={} should be invalid", q[id]);
            } else {
                assert!(good, "q={} should be valid", q[id]);
            }
        }
    }
}
