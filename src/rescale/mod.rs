//! Rescaling of every curve onto a common intensity scale.
//!
//! Each curve gets a transform `(gamma, offset)` aligning its fitted mean
//! to the reference curve's fitted mean over the mutually-valid `q` domain,
//! then all transforms are renormalized so the designated reference ends at
//! the identity `(1, 0)`.

use crate::domain::{ReferenceCurve, RescaleModel};
use crate::error::AppError;
use crate::math::linspace;
use crate::profile::{Average, FlagKind, FlagValue, MeanSelect, SaxsProfile};

/// One curve's fitted rescaling transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub gamma: f64,
    pub offset: f64,
}

pub fn reference_index(n: usize, reference: ReferenceCurve) -> usize {
    match reference {
        ReferenceCurve::First => 0,
        ReferenceCurve::Last => n - 1,
    }
}

/// True when the reference considers `q` valid. Falls back to the
/// reference's raw `q` range when it carries no validity intervals.
fn reference_valid_at(reference: &SaxsProfile, q: f64) -> Result<bool, AppError> {
    if reference.has_flag("agood") && !reference.get_flag_intervals("agood")?.is_empty() {
        return Ok(reference
            .get_flag_at(q, "agood")?
            .and_then(|v| v.as_bool())
            .unwrap_or(false));
    }
    Ok(q >= reference.qmin() && q <= reference.qmax())
}

/// Probe abscissas over the curve's `cgood` intervals, distributed
/// proportionally to interval width and targeting `npoints` in total.
/// Intervals that would receive a single point or less are skipped.
fn probe_points(curve: &SaxsProfile, npoints: usize) -> Result<Vec<f64>, AppError> {
    let good: Vec<(f64, f64)> = curve
        .get_flag_intervals("cgood")?
        .iter()
        .filter(|iv| iv.value.as_ref().and_then(|v| v.as_bool()) == Some(true))
        .map(|iv| (iv.qmin, iv.qmax))
        .collect();
    let total: f64 = good.iter().map(|(a, b)| b - a).sum();
    let mut qvals = Vec::new();
    if total <= 0.0 {
        return Ok(qvals);
    }
    for (a, b) in good {
        let share = ((b - a) / total * npoints as f64).round() as usize;
        if share <= 1 {
            continue;
        }
        qvals.extend(linspace(a, b, share));
    }
    Ok(qvals)
}

fn mean_at(curve: &SaxsProfile, qvals: &[f64]) -> Result<(Vec<f64>, Vec<f64>), AppError> {
    let sel = MeanSelect {
        qvalues: Some(qvals.to_vec()),
        average: Average::Map,
        ..MeanSelect::default()
    };
    let pts = curve.get_mean(&sel)?;
    let mut i = Vec::with_capacity(pts.len());
    let mut err = Vec::with_capacity(pts.len());
    for p in &pts {
        if !(p.i.is_finite() && p.err.is_finite()) {
            return Err(AppError::new(
                4,
                format!(
                    "NaN in the fitted mean of curve '{}' at q={} during rescaling.",
                    curve.name(),
                    p.q
                ),
            ));
        }
        i.push(p.i);
        err.push(p.err);
    }
    Ok((i, err))
}

/// `I0 ~ gamma * I1` by inverse-variance weighted mean of the ratios.
fn fit_normal(i0: &[f64], s0: &[f64], i1: &[f64], s1: &[f64]) -> Transform {
    let mut num = 0.0;
    let mut den = 0.0;
    for k in 0..i0.len() {
        let ratio = i0[k] / i1[k];
        let w = 1.0 / (s0[k] * s0[k] + (s1[k] * ratio) * (s1[k] * ratio));
        num += w * ratio;
        den += w;
    }
    Transform {
        gamma: num / den,
        offset: 0.0,
    }
}

/// `I0 ~ gamma * (I1 + c)` by closed-form weighted least squares on the
/// four weighted moments.
fn fit_normal_offset(i0: &[f64], s0: &[f64], i1: &[f64], s1: &[f64]) -> Transform {
    let mut sw = 0.0;
    let mut swx = 0.0;
    let mut swy = 0.0;
    let mut swxx = 0.0;
    let mut swxy = 0.0;
    for k in 0..i0.len() {
        let w = 1.0 / (s0[k] * s0[k] + s1[k] * s1[k]);
        sw += w;
        swx += w * i1[k];
        swy += w * i0[k];
        swxx += w * i1[k] * i1[k];
        swxy += w * i1[k] * i0[k];
    }
    let gamma = (sw * swxy - swx * swy) / (sw * swxx - swx * swx);
    let intercept = (swy - gamma * swx) / sw;
    Transform {
        gamma,
        offset: intercept / gamma,
    }
}

/// `log I0 ~ log(gamma * I1)` by weighted mean of the log ratios.
fn fit_lognormal(i0: &[f64], s0: &[f64], i1: &[f64], s1: &[f64]) -> Transform {
    let mut num = 0.0;
    let mut den = 0.0;
    for k in 0..i0.len() {
        let rel = s0[k] / i0[k] + s1[k] / i1[k];
        let w = 1.0 / (rel * rel);
        num += w * (i0[k] / i1[k]).ln();
        den += w;
    }
    Transform {
        gamma: (num / den).exp(),
        offset: 0.0,
    }
}

/// Compute and apply the rescaling transforms for all curves. Returns the
/// final (pivot-normalized) transform per curve for reporting.
pub fn rescale(
    profiles: &mut [SaxsProfile],
    model: RescaleModel,
    reference: ReferenceCurve,
    npoints: usize,
    verbose: u8,
) -> Result<Vec<Transform>, AppError> {
    let ref_idx = reference_index(profiles.len(), reference);

    // cgood: the curve's own validity AND the reference's validity at q.
    for i in 0..profiles.len() {
        let curve = &profiles[i];
        let qs = curve.get_raw_data().0.to_vec();
        // Before cleanup has run (postponed-cleanup order) every point is
        // considered valid.
        let agood: Vec<bool> = if curve.has_flag("agood") {
            (0..curve.len())
                .map(|id| {
                    curve
                        .get_flag(id, "agood")
                        .ok()
                        .flatten()
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false)
                })
                .collect()
        } else {
            vec![true; curve.len()]
        };
        let mut cgood = Vec::with_capacity(agood.len());
        for (own, &q) in agood.iter().zip(qs.iter()) {
            cgood.push(*own && reference_valid_at(&profiles[ref_idx], q)?);
        }
        let curve = &mut profiles[i];
        curve.new_flag("cgood", FlagKind::Bool)?;
        for (id, good) in cgood.into_iter().enumerate() {
            curve.set_flag(id, "cgood", FlagValue::Bool(good))?;
        }
        curve.create_intervals_from_data("cgood")?;
    }

    let mut raw = Vec::with_capacity(profiles.len());
    for i in 0..profiles.len() {
        let qvals = probe_points(&profiles[i], npoints)?;
        if qvals.is_empty() {
            return Err(AppError::new(
                4,
                format!(
                    "No mutually-valid points between curve '{}' and the reference.",
                    profiles[i].name()
                ),
            ));
        }
        let (i1, s1) = mean_at(&profiles[i], &qvals)?;
        let (i0, s0) = mean_at(&profiles[ref_idx], &qvals)?;
        let t = match model {
            RescaleModel::Normal => fit_normal(&i0, &s0, &i1, &s1),
            RescaleModel::NormalOffset => fit_normal_offset(&i0, &s0, &i1, &s1),
            RescaleModel::Lognormal => fit_lognormal(&i0, &s0, &i1, &s1),
        };
        if !(t.gamma.is_finite() && t.offset.is_finite()) {
            return Err(AppError::new(
                4,
                format!(
                    "Rescaling produced a non-finite transform for curve '{}'.",
                    profiles[i].name()
                ),
            ));
        }
        raw.push(t);
    }

    // Renormalize around the reference so it ends at the identity.
    let pivot = raw[ref_idx];
    let mut out = Vec::with_capacity(raw.len());
    for (i, t) in raw.iter().enumerate() {
        let gamma = t.gamma / pivot.gamma;
        let offset = t.offset - pivot.offset * pivot.gamma / t.gamma;
        profiles[i].set_gamma(gamma);
        profiles[i].set_offset(offset);
        if verbose >= 2 {
            println!(
                "  {}: gamma = {gamma:.6}, offset = {offset:.6}",
                profiles[i].name()
            );
        }
        out.push(Transform { gamma, offset });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_model_recovers_a_pure_scale() {
        let i1 = vec![1.0, 2.0, 3.0, 4.0];
        let i0: Vec<f64> = i1.iter().map(|v| 2.5 * v).collect();
        let s = vec![0.1; 4];
        let t = fit_normal(&i0, &s, &i1, &s);
        assert!((t.gamma - 2.5).abs() < 1e-9);
        assert_eq!(t.offset, 0.0);
    }

    #[test]
    fn normal_offset_model_recovers_scale_and_shift() {
        let i1 = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let i0: Vec<f64> = i1.iter().map(|v| 3.0 * (v + 0.7)).collect();
        let s = vec![0.1; 5];
        let t = fit_normal_offset(&i0, &s, &i1, &s);
        assert!((t.gamma - 3.0).abs() < 1e-9, "gamma={}", t.gamma);
        assert!((t.offset - 0.7).abs() < 1e-9, "offset={}", t.offset);
    }

    #[test]
    fn lognormal_model_recovers_a_pure_scale() {
        let i1 = vec![1.0, 2.0, 4.0, 8.0];
        let i0: Vec<f64> = i1.iter().map(|v| 0.5 * v).collect();
        let s = vec![0.05; 4];
        let t = fit_lognormal(&i0, &s, &i1, &s);
        assert!((t.gamma - 0.5).abs() < 1e-9);
    }

    #[test]
    fn pivot_normalization_is_identity_for_the_reference() {
        // Composing a transform with the pivot's inverse must give (1, 0)
        // for the pivot itself.
        let pivot = Transform {
            gamma: 2.0,
            offset: 0.3,
        };
        let gamma = pivot.gamma / pivot.gamma;
        let offset = pivot.offset - pivot.offset * pivot.gamma / pivot.gamma;
        assert_eq!(gamma, 1.0);
        assert_eq!(offset, 0.0);
    }
}
