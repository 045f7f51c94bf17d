//! The human-readable summary report.
//!
//! Formatting lives in one place so the pipeline stays clean and output
//! changes are localized. The layout follows the order of the pipeline:
//! merged curve first, then one section per input file.

use crate::domain::{ComparisonEntry, MeanFamily};
use crate::error::AppError;
use crate::fit::Fitted;
use crate::profile::{DataSelect, FlagValue, SaxsProfile};
use crate::rescale::Transform;

/// Derived Guinier-Porod quantities for the report.
fn derived_lines(fitted: &Fitted) -> Vec<String> {
    let p = fitted.params();
    let mut out = Vec::new();
    out.push(format!("   I(0) : {:.6}", p.a + p.g));
    match fitted.family() {
        MeanFamily::Flat | MeanFamily::Simple => {}
        MeanFamily::Generalized | MeanFamily::Full => {
            let s = if fitted.family() == MeanFamily::Full {
                p.s
            } else {
                0.0
            };
            let q1 = ((p.d - s) * (3.0 - s) / 2.0).sqrt() / p.rg;
            out.push(format!("   Q1 : {q1:.6}"));
            out.push(format!("   Q1.Rg : {:.6}", q1 * p.rg));
        }
    }
    out
}

fn param_lines(fitted: &Fitted) -> Vec<String> {
    let errs = fitted.stderrs();
    fitted
        .free_params()
        .iter()
        .enumerate()
        .map(|(k, name)| {
            let value = fitted.params().get(*name);
            match errs.as_ref().map(|e| e[k]) {
                Some(err) => format!("   {} : {value:.6} +- {err:.6}", name.label()),
                None => format!("   {} : {value:.6}", name.label()),
            }
        })
        .collect()
}

fn comparison_table(entries: &[ComparisonEntry], selected: MeanFamily) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "   {:<13} {:>3} {:>12} {:>12} {:>12} {:>12} {:>12}\n",
        "family", "Np", "-log10(BF)", "-log(P)", "-log(L)", "BIC", "AIC"
    ));
    for e in entries {
        let marker = if e.family == selected { "*" } else { " " };
        out.push_str(&format!(
            " {marker} {:<13} {:>3} {:>12.3} {:>12.3} {:>12.3} {:>12.3} {:>12.3}\n",
            e.family.display_name(),
            e.num_params,
            e.minus_log_bf / std::f64::consts::LN_10,
            e.map_energy,
            e.ml_energy,
            e.bic,
            e.aic
        ));
    }
    out
}

fn count_and_range(profile: &SaxsProfile, filter: &[&str]) -> Result<(usize, f64, f64), AppError> {
    let sel = DataSelect {
        filter: filter.iter().map(|s| s.to_string()).collect(),
        ..DataSelect::default()
    };
    let pts = profile.get_data(&sel)?;
    if pts.is_empty() {
        return Ok((0, 0.0, 0.0));
    }
    Ok((pts.len(), pts[0].q, pts[pts.len() - 1].q))
}

fn merged_section(merged: &SaxsProfile, inputs: &[SaxsProfile]) -> Result<String, AppError> {
    let mut out = String::new();
    out.push_str("Merge file\n  General\n");
    out.push_str(&format!("   Filename: {}\n", merged.name()));
    let (n, qmin, qmax) = count_and_range(merged, &[])?;
    out.push_str(&format!("   Number of points: {n}\n"));
    out.push_str(&format!("   Data range: {qmin:.5} {qmax:.5}\n"));
    for (i, input) in inputs.iter().enumerate() {
        let mut count = 0usize;
        for id in 0..merged.len() {
            if merged.get_flag(id, "eorigin")? == Some(FlagValue::Int(i as i64)) {
                count += 1;
            }
        }
        out.push_str(&format!(
            "   {count} points from profile {i} ({})\n",
            input.name()
        ));
    }
    if let Some(fitted) = merged.fitted() {
        out.push_str("  Gaussian Process parameters\n");
        out.push_str(&format!(
            "   mean function : {}\n",
            fitted.family().display_name()
        ));
        for line in param_lines(fitted) {
            out.push_str(&line);
            out.push('\n');
        }
        for line in derived_lines(fitted) {
            out.push_str(&line);
            out.push('\n');
        }
        if fitted.comparison().len() > 1 {
            out.push_str("  Model comparison\n");
            out.push_str(&comparison_table(fitted.comparison(), fitted.family()));
        }
    }
    out.push('\n');
    Ok(out)
}

fn input_section(
    i: usize,
    profile: &SaxsProfile,
    transform: Option<&Transform>,
) -> Result<String, AppError> {
    let mut out = String::new();
    out.push_str(&format!("Input file {i}\n  General\n"));
    let shown = profile
        .filename()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| profile.name().to_string());
    out.push_str(&format!("   Filename: {shown}\n"));
    let (q, _, _) = profile.get_raw_data();
    out.push_str(&format!("   Number of points: {}\n", q.len()));
    if !q.is_empty() {
        out.push_str(&format!(
            "   Data range: {:.5} {:.5}\n",
            q[0],
            q[q.len() - 1]
        ));
    }
    out.push_str(&format!("   Repeat count: {}\n", profile.nreps()));

    if profile.has_flag("agood") {
        let (n, qmin, qmax) = count_and_range(profile, &["agood"])?;
        out.push_str("  1. Cleanup\n");
        out.push_str(&format!("   Number of significant points: {n}\n"));
        out.push_str(&format!("   Data range: {qmin:.5} {qmax:.5}\n"));
    }
    if let Some(fitted) = profile.fitted() {
        out.push_str("  2. GP parameters (values for non-rescaled curve)\n");
        out.push_str(&format!(
            "   mean function : {}\n",
            fitted.family().display_name()
        ));
        for line in param_lines(fitted) {
            out.push_str(&line);
            out.push('\n');
        }
        if fitted.comparison().len() > 1 {
            out.push_str(&comparison_table(fitted.comparison(), fitted.family()));
        }
    }
    if let Some(t) = transform {
        out.push_str("  3. Rescaling\n");
        out.push_str(&format!("   gamma : {:.6}\n", t.gamma));
        out.push_str(&format!("   offset : {:.6}\n", t.offset));
    }
    if profile.has_flag("dgood") {
        let (n, qmin, qmax) = count_and_range(profile, &["dgood"])?;
        out.push_str("  4. Classification\n");
        out.push_str(&format!("   Number of valid points: {n}\n"));
        out.push_str(&format!("   Data range: {qmin:.5} {qmax:.5}\n"));
    }
    out.push('\n');
    Ok(out)
}

/// Format the full summary: argument echo, merged-curve section, then one
/// section per input file.
pub fn format_summary(
    argv: &str,
    profiles: &[SaxsProfile],
    merged: Option<&SaxsProfile>,
    transforms: Option<&[Transform]>,
) -> Result<String, AppError> {
    let mut out = String::new();
    out.push_str("#STATISTICAL MERGE: SUMMARY\n\n");
    out.push_str("Ran with the following arguments:\n");
    out.push_str(argv);
    out.push_str("\n\n");
    if let Some(merged) = merged {
        out.push_str(&merged_section(merged, profiles)?);
    }
    for (i, p) in profiles.iter().enumerate() {
        let t = transforms.and_then(|ts| ts.get(i));
        out.push_str(&input_section(i, p, t)?);
    }
    Ok(out)
}
