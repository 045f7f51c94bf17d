//! Point classification against earlier curves.
//!
//! Every valid point of curve `i` is compared, through the fitted means,
//! against the earliest curve in `[0..=i]` whose validity intervals cover
//! that `q` (possibly curve `i` itself). Points whose Welch test cannot
//! reject equality are accepted for merging. The reference search order is
//! the input order and is load-bearing: it decides which curve "owns" each
//! `q` region.

use crate::error::AppError;
use crate::profile::{Average, FlagKind, FlagValue, MeanSelect, SaxsProfile};
use crate::stats::ttest_two;

struct PointVerdict {
    id: usize,
    refnum: usize,
    pval: f64,
    good: bool,
}

fn valid_at(curve: &SaxsProfile, q: f64) -> bool {
    curve
        .get_flag_at(q, "agood")
        .ok()
        .flatten()
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

fn mean_at(curve: &SaxsProfile, q: f64) -> Result<(f64, f64), AppError> {
    let sel = MeanSelect {
        qvalues: Some(vec![q]),
        average: Average::Map,
        ..MeanSelect::default()
    };
    let pts = curve.get_mean(&sel)?;
    let p = pts.first().ok_or_else(|| {
        AppError::new(
            4,
            format!("Empty mean evaluation for curve '{}' at q={q}.", curve.name()),
        )
    })?;
    if !(p.i.is_finite() && p.err.is_finite()) {
        return Err(AppError::new(
            4,
            format!(
                "NaN in the fitted mean of curve '{}' at q={q} during classification.",
                curve.name()
            ),
        ));
    }
    Ok((p.i, p.err))
}

/// Classify every curve's valid points and record the `d*` flags.
pub fn classify(profiles: &mut [SaxsProfile], dalpha: f64, verbose: u8) -> Result<(), AppError> {
    for i in 0..profiles.len() {
        let curve = &profiles[i];
        let qs = curve.get_raw_data().0.to_vec();
        let mut verdicts = Vec::new();
        for id in 0..curve.len() {
            let own_good = curve
                .get_flag(id, "agood")?
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if !own_good {
                continue;
            }
            let q = qs[id];
            let refnum = (0..=i)
                .find(|&j| valid_at(&profiles[j], q))
                .unwrap_or(i);
            let (mi, si) = mean_at(curve, q)?;
            let (mr, sr) = mean_at(&profiles[refnum], q)?;
            let t = ttest_two(mi, si, curve.nreps(), mr, sr, profiles[refnum].nreps());
            verdicts.push(PointVerdict {
                id,
                refnum,
                pval: t.pval,
                good: t.pval >= dalpha,
            });
        }

        let ref_names: Vec<String> = profiles.iter().map(|p| p.name().to_string()).collect();
        let curve = &mut profiles[i];
        curve.new_flag("drefnum", FlagKind::Int)?;
        curve.new_flag("drefname", FlagKind::Str)?;
        curve.new_flag("dselfref", FlagKind::Bool)?;
        curve.new_flag("dgood", FlagKind::Bool)?;
        curve.new_flag("dpvalue", FlagKind::Float)?;
        let mut accepted = 0usize;
        for v in &verdicts {
            curve.set_flag(v.id, "drefnum", FlagValue::Int(v.refnum as i64))?;
            curve.set_flag(v.id, "drefname", FlagValue::Str(ref_names[v.refnum].clone()))?;
            curve.set_flag(v.id, "dselfref", FlagValue::Bool(v.refnum == i))?;
            curve.set_flag(v.id, "dgood", FlagValue::Bool(v.good))?;
            curve.set_flag(v.id, "dpvalue", FlagValue::Float(v.pval))?;
            if v.good {
                accepted += 1;
            }
        }
        // dpvalue stays point-wise.
        for name in ["drefnum", "drefname", "dselfref", "dgood"] {
            curve.create_intervals_from_data(name)?;
        }
        if verbose >= 2 {
            println!(
                "  {}: {accepted} of {} valid points accepted",
                curve.name(),
                verdicts.len()
            );
        }
    }
    Ok(())
}
