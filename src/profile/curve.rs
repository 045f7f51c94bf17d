//! The scattering-curve store.
//!
//! A [`SaxsProfile`] owns three fixed columns (`q`, `I`, `err`), an ordered
//! list of typed flag columns, a rescaling transform `(gamma, offset)`, and
//! (after fitting) the bound interpolant. Raw point content is immutable
//! once loaded; pipeline stages only add flags, set intervals, and bind the
//! transform and the fit.

use std::path::{Path, PathBuf};

use nalgebra::DMatrix;

use crate::error::AppError;
use crate::fit::Fitted;
use crate::gp;
use crate::math::{linspace, numeric_hessian};
use crate::profile::flags::{FlagColumn, FlagKind, FlagValue, Interval};

/// Deterministic index-preserving reduction of a sorted abscissa array to
/// at most `n` points: `n` evenly spaced query values from the first to the
/// last abscissa, each resolved to the last point at or below it.
pub fn subsample_indices(q: &[f64], n: usize) -> Vec<usize> {
    if n == 0 || n >= q.len() {
        return (0..q.len()).collect();
    }
    let mut out = Vec::with_capacity(n);
    let mut idx = 0usize;
    for query in linspace(q[0], q[q.len() - 1], n) {
        while idx + 1 < q.len() && q[idx + 1] <= query {
            idx += 1;
        }
        if out.last() != Some(&idx) {
            out.push(idx);
        }
    }
    out
}

/// Ingest policy for one `add_data` call.
#[derive(Debug, Clone)]
pub struct AddDataOptions {
    /// Leading columns to drop before `q I err`.
    pub discard_leading_columns: usize,
    pub require_positive_intensity: bool,
    pub require_positive_error: bool,
    /// Multiplier applied to `I` and `err` on ingest.
    pub scale: f64,
}

impl Default for AddDataOptions {
    fn default() -> Self {
        AddDataOptions {
            discard_leading_columns: 0,
            require_positive_intensity: false,
            // Rows with a nonpositive error carry no usable weight.
            require_positive_error: true,
            scale: 1.0,
        }
    }
}

/// One in-memory row for programmatic ingestion (the merging stage).
#[derive(Debug, Clone)]
pub struct DataRow {
    pub q: f64,
    pub i: f64,
    pub err: f64,
    /// One entry per declared flag, in declaration order.
    pub flags: Vec<Option<FlagValue>>,
}

/// Windowed, filtered point selection.
#[derive(Debug, Clone, Default)]
pub struct DataSelect {
    pub qmin: Option<f64>,
    pub qmax: Option<f64>,
    /// Boolean flag names; a point must have all of them `true`.
    pub filter: Vec<String>,
    /// `> 0` caps the result via deterministic subsampling.
    pub maxpoints: i64,
}

/// One selected point. `id` is the position in the full store; `i` and
/// `err` carry the rescaling transform.
#[derive(Debug, Clone, Copy)]
pub struct SelectedPoint {
    pub id: usize,
    pub q: f64,
    pub i: f64,
    pub err: f64,
}

/// How `get_mean` treats parameter uncertainty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Average {
    /// Maximum-a-posteriori estimate only.
    Map,
    /// Laplace-average over parameter uncertainty using the full fit set.
    All,
    /// Laplace-average using a subsampled working set.
    Limit(usize),
}

/// Query for the fitted mean curve.
#[derive(Debug, Clone)]
pub struct MeanSelect {
    /// Explicit abscissas; otherwise `num` evenly spaced points.
    pub qvalues: Option<Vec<f64>>,
    pub num: usize,
    pub qmin: Option<f64>,
    pub qmax: Option<f64>,
    /// Boolean flag names, resolved through intervals.
    pub filter: Vec<String>,
    pub average: Average,
}

impl Default for MeanSelect {
    fn default() -> Self {
        MeanSelect {
            qvalues: None,
            num: 200,
            qmin: None,
            qmax: None,
            filter: Vec::new(),
            average: Average::Map,
        }
    }
}

/// One evaluated mean point. `i`/`err` are the posterior mean and standard
/// deviation, `mean` the prior mean function, all rescaled.
#[derive(Debug, Clone, Copy)]
pub struct MeanPoint {
    pub q: f64,
    pub i: f64,
    pub err: f64,
    pub mean: f64,
}

#[derive(Debug, Clone)]
pub struct SaxsProfile {
    name: String,
    filename: Option<PathBuf>,
    gamma: f64,
    offset: f64,
    nreps: usize,
    q: Vec<f64>,
    i: Vec<f64>,
    err: Vec<f64>,
    flags: Vec<FlagColumn>,
    fitted: Option<Fitted>,
}

impl SaxsProfile {
    pub fn new(name: impl Into<String>) -> Self {
        SaxsProfile {
            name: name.into(),
            filename: None,
            gamma: 1.0,
            offset: 0.0,
            nreps: 10,
            q: Vec::new(),
            i: Vec::new(),
            err: Vec::new(),
            flags: Vec::new(),
            fitted: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn filename(&self) -> Option<&Path> {
        self.filename.as_deref()
    }

    pub fn set_filename(&mut self, path: impl Into<PathBuf>) {
        self.filename = Some(path.into());
    }

    pub fn len(&self) -> usize {
        self.q.len()
    }

    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    pub fn qmin(&self) -> f64 {
        self.q.first().copied().unwrap_or(0.0)
    }

    pub fn qmax(&self) -> f64 {
        self.q.last().copied().unwrap_or(0.0)
    }

    pub fn nreps(&self) -> usize {
        self.nreps
    }

    pub fn set_nreps(&mut self, nreps: usize) {
        self.nreps = nreps.max(1);
    }

    pub fn gamma(&self) -> f64 {
        self.gamma
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    pub fn set_gamma(&mut self, gamma: f64) {
        self.gamma = gamma;
    }

    pub fn set_offset(&mut self, offset: f64) {
        self.offset = offset;
    }

    // ---- flags ----

    pub fn flag_names(&self) -> Vec<&str> {
        self.flags.iter().map(|c| c.name()).collect()
    }

    pub fn has_flag(&self, name: &str) -> bool {
        self.flags.iter().any(|c| c.name() == name)
    }

    fn flag_col(&self, name: &str) -> Result<&FlagColumn, AppError> {
        self.flags
            .iter()
            .find(|c| c.name() == name)
            .ok_or_else(|| {
                AppError::new(3, format!("Unknown flag '{name}' on curve '{}'.", self.name))
            })
    }

    fn flag_col_mut(&mut self, name: &str) -> Result<&mut FlagColumn, AppError> {
        let curve = self.name.clone();
        self.flags
            .iter_mut()
            .find(|c| c.name() == name)
            .ok_or_else(|| AppError::new(3, format!("Unknown flag '{name}' on curve '{curve}'.")))
    }

    /// Declare a flag column, back-filling `None` for every existing point.
    /// Redeclaring a name is an error.
    pub fn new_flag(&mut self, name: impl Into<String>, kind: FlagKind) -> Result<(), AppError> {
        let name = name.into();
        if self.has_flag(&name) {
            return Err(AppError::new(
                3,
                format!("Flag '{name}' already declared on curve '{}'.", self.name),
            ));
        }
        let len = self.len();
        self.flags.push(FlagColumn::new(name, kind, len));
        Ok(())
    }

    pub fn set_flag(
        &mut self,
        id: usize,
        name: &str,
        value: FlagValue,
    ) -> Result<(), AppError> {
        let len = self.len();
        let curve = self.name.clone();
        let col = self.flag_col_mut(name)?;
        if id >= len {
            return Err(AppError::new(
                3,
                format!("Point id {id} out of range on curve '{curve}'."),
            ));
        }
        let kind = col.kind();
        let cast = value.clone().cast(kind).ok_or_else(|| {
            AppError::new(3, format!("Cannot cast {value:?} to flag '{name}'."))
        })?;
        col.values[id] = Some(cast);
        Ok(())
    }

    /// Stored value for a point id, `None` when unset.
    pub fn get_flag(&self, id: usize, name: &str) -> Result<Option<FlagValue>, AppError> {
        let col = self.flag_col(name)?;
        Ok(col.values.get(id).cloned().flatten())
    }

    /// Interval lookup at an abscissa; `None` when no interval covers it.
    pub fn get_flag_at(&self, q: f64, name: &str) -> Result<Option<FlagValue>, AppError> {
        let col = self.flag_col(name)?;
        Ok(col.value_at(q).cloned().flatten())
    }

    pub fn set_flag_interval(
        &mut self,
        name: &str,
        qmin: f64,
        qmax: f64,
        value: Option<FlagValue>,
    ) -> Result<(), AppError> {
        self.flag_col_mut(name)?.set_interval(qmin, qmax, value);
        Ok(())
    }

    pub fn get_flag_intervals(&self, name: &str) -> Result<&[Interval], AppError> {
        Ok(self.flag_col(name)?.intervals())
    }

    /// Replace a flag's intervals with runs derived from its per-point
    /// values.
    pub fn create_intervals_from_data(&mut self, name: &str) -> Result<(), AppError> {
        let q = self.q.clone();
        self.flag_col_mut(name)?.rebuild_intervals_from_values(&q);
        Ok(())
    }

    // ---- data ----

    /// Read whitespace-delimited `q I err [flags...]` rows from a file.
    /// Comment lines and malformed rows are skipped.
    pub fn add_data_from_file(
        &mut self,
        path: &Path,
        opts: &AddDataOptions,
    ) -> Result<(), AppError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            AppError::new(2, format!("Cannot read '{}': {e}", path.display()))
        })?;
        let nflags = self.flags.len();
        let mut rows = Vec::new();
        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let toks: Vec<&str> = trimmed
                .split_whitespace()
                .skip(opts.discard_leading_columns)
                .collect();
            if toks.len() < 3 + nflags {
                continue;
            }
            let num = |s: &str| s.parse::<f64>().ok().filter(|v| v.is_finite());
            let (Some(q), Some(i), Some(err)) = (num(toks[0]), num(toks[1]), num(toks[2]))
            else {
                continue;
            };
            let flags = toks[3..3 + nflags]
                .iter()
                .zip(self.flags.iter())
                .map(|(t, col)| num(t).and_then(|v| FlagValue::Float(v).cast(col.kind())))
                .collect();
            rows.push(DataRow { q, i, err, flags });
        }
        self.set_filename(path);
        self.insert_rows(rows, opts);
        Ok(())
    }

    /// Append in-memory rows. Each row must carry exactly one entry per
    /// declared flag.
    pub fn add_data_rows(
        &mut self,
        rows: Vec<DataRow>,
        opts: &AddDataOptions,
    ) -> Result<(), AppError> {
        let nflags = self.flags.len();
        for row in &rows {
            if row.flags.len() != nflags {
                return Err(AppError::new(
                    3,
                    format!(
                        "Row at q={} carries {} flag values, expected {nflags}.",
                        row.q,
                        row.flags.len()
                    ),
                ));
            }
        }
        self.insert_rows(rows, opts);
        Ok(())
    }

    fn insert_rows(&mut self, rows: Vec<DataRow>, opts: &AddDataOptions) {
        for row in rows {
            if opts.require_positive_intensity && row.i <= 0.0 {
                continue;
            }
            if opts.require_positive_error && row.err <= 0.0 {
                continue;
            }
            self.q.push(row.q);
            self.i.push(row.i * opts.scale);
            self.err.push(row.err * opts.scale);
            for (col, v) in self.flags.iter_mut().zip(row.flags) {
                col.values.push(v);
            }
        }
        self.sort_by_q();
    }

    fn sort_by_q(&mut self) {
        let mut order: Vec<usize> = (0..self.q.len()).collect();
        order.sort_by(|&a, &b| self.q[a].total_cmp(&self.q[b]));
        self.q = order.iter().map(|&k| self.q[k]).collect();
        self.i = order.iter().map(|&k| self.i[k]).collect();
        self.err = order.iter().map(|&k| self.err[k]).collect();
        for col in &mut self.flags {
            col.values = order.iter().map(|&k| col.values[k].clone()).collect();
        }
    }

    /// Unscaled `(q, I, err)` triples.
    pub fn get_raw_data(&self) -> (&[f64], &[f64], &[f64]) {
        (&self.q, &self.i, &self.err)
    }

    fn point_passes(&self, id: usize, filter: &[String]) -> Result<bool, AppError> {
        for name in filter {
            let col = self.flag_col(name)?;
            let ok = col.values[id]
                .as_ref()
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if !ok {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Windowed, filtered, optionally subsampled points with the rescaling
    /// transform applied.
    pub fn get_data(&self, sel: &DataSelect) -> Result<Vec<SelectedPoint>, AppError> {
        let qmin = sel.qmin.unwrap_or(f64::NEG_INFINITY);
        let qmax = sel.qmax.unwrap_or(f64::INFINITY);
        let mut ids = Vec::new();
        for id in 0..self.len() {
            if self.q[id] < qmin || self.q[id] > qmax {
                continue;
            }
            if !self.point_passes(id, &sel.filter)? {
                continue;
            }
            ids.push(id);
        }
        if sel.maxpoints > 0 && (sel.maxpoints as usize) < ids.len() {
            let qs: Vec<f64> = ids.iter().map(|&k| self.q[k]).collect();
            ids = subsample_indices(&qs, sel.maxpoints as usize)
                .into_iter()
                .map(|k| ids[k])
                .collect();
        }
        Ok(ids
            .into_iter()
            .map(|id| SelectedPoint {
                id,
                q: self.q[id],
                i: self.gamma * (self.i[id] + self.offset),
                err: self.gamma * self.err[id],
            })
            .collect())
    }

    /// Column-wise variant of [`get_data`](Self::get_data).
    pub fn get_columns(
        &self,
        sel: &DataSelect,
    ) -> Result<(Vec<usize>, Vec<f64>, Vec<f64>, Vec<f64>), AppError> {
        let pts = self.get_data(sel)?;
        let mut ids = Vec::with_capacity(pts.len());
        let mut q = Vec::with_capacity(pts.len());
        let mut i = Vec::with_capacity(pts.len());
        let mut err = Vec::with_capacity(pts.len());
        for p in pts {
            ids.push(p.id);
            q.push(p.q);
            i.push(p.i);
            err.push(p.err);
        }
        Ok((ids, q, i, err))
    }

    // ---- fitted state ----

    pub fn set_interpolant(&mut self, fitted: Fitted) {
        self.fitted = Some(fitted);
    }

    pub fn fitted(&self) -> Option<&Fitted> {
        self.fitted.as_ref()
    }

    fn passes_interval_filter(&self, filter: &[String], q: f64) -> Result<bool, AppError> {
        for name in filter {
            let ok = self
                .get_flag_at(q, name)?
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if !ok {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Evaluate the fitted mean curve.
    ///
    /// Requires a bound interpolant. With [`Average::All`] or
    /// [`Average::Limit`], the posterior variance at each point is
    /// corrected for parameter uncertainty by the Laplace factor
    /// `det(I + H^-1 Hl)^(-1/2)`, where `H` is the fit-energy Hessian and
    /// `Hl` the per-point Hessian of the negative log variance.
    pub fn get_mean(&self, sel: &MeanSelect) -> Result<Vec<MeanPoint>, AppError> {
        let fitted = self.fitted.as_ref().ok_or_else(|| {
            AppError::new(
                3,
                format!("No interpolant bound for curve '{}'.", self.name),
            )
        })?;
        let qvals: Vec<f64> = match &sel.qvalues {
            Some(v) => v.clone(),
            None => {
                let qmin = sel.qmin.unwrap_or_else(|| self.qmin());
                let qmax = sel.qmax.unwrap_or_else(|| self.qmax());
                linspace(qmin, qmax, sel.num)
            }
        };

        let avg_data = match sel.average {
            Average::Map => None,
            Average::All => Some(fitted.gp().data().clone()),
            Average::Limit(n) => {
                let data = fitted.gp().data();
                if n == 0 || n >= data.len() {
                    Some(data.clone())
                } else {
                    Some(data.subset(&subsample_indices(&data.q, n)))
                }
            }
        };
        let h_inv = avg_data
            .as_ref()
            .and_then(|_| fitted.hessian().clone().try_inverse());

        let mut out = Vec::with_capacity(qvals.len());
        for q in qvals {
            if !self.passes_interval_filter(&sel.filter, q)? {
                continue;
            }
            let pm = fitted.gp().posterior_mean(q);
            let mut var = fitted.gp().posterior_variance(q);
            if let (Some(data), Some(h_inv)) = (&avg_data, &h_inv) {
                var *= laplace_factor(fitted, data, h_inv, q);
            }
            out.push(MeanPoint {
                q,
                i: self.gamma * (pm + self.offset),
                err: self.gamma * var.sqrt(),
                mean: self.gamma * (fitted.gp().mean(q) + self.offset),
            });
        }
        Ok(out)
    }
}

fn laplace_factor(fitted: &Fitted, data: &gp::FitData, h_inv: &DMatrix<f64>, q: f64) -> f64 {
    let family = fitted.family();
    let base = *fitted.params();
    let free = fitted.free_params().to_vec();
    let f = move |x: &[f64]| {
        let mut p = base;
        p.unpack(&free, x);
        let v = gp::posterior_variance_for(family, &p, data, q);
        if v.is_finite() && v > 0.0 {
            -v.ln()
        } else {
            f64::INFINITY
        }
    };
    let x0 = base.pack(fitted.free_params());
    let hl = numeric_hessian(&f, &x0);
    let n = h_inv.nrows();
    let m = DMatrix::<f64>::identity(n, n) + h_inv * hl;
    let det = m.determinant();
    if det.is_finite() && det > 0.0 {
        det.powf(-0.5)
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FitConfig, MeanFamily};
    use crate::fit::find_fit;
    use crate::gp::FitData;

    fn rows(points: &[(f64, f64, f64)]) -> Vec<DataRow> {
        points
            .iter()
            .map(|&(q, i, err)| DataRow {
                q,
                i,
                err,
                flags: vec![],
            })
            .collect()
    }

    #[test]
    fn points_are_sorted_after_add_data() {
        let mut p = SaxsProfile::new("c");
        p.add_data_rows(
            rows(&[(0.3, 1.0, 0.1), (0.1, 2.0, 0.1), (0.2, 3.0, 0.1)]),
            &AddDataOptions::default(),
        )
        .unwrap();
        let (q, i, _) = p.get_raw_data();
        assert_eq!(q, &[0.1, 0.2, 0.3]);
        assert_eq!(i, &[2.0, 3.0, 1.0]);
    }

    #[test]
    fn new_flag_backfills_none_and_rejects_duplicates() {
        let mut p = SaxsProfile::new("c");
        p.add_data_rows(
            rows(&[(0.1, 1.0, 0.1), (0.2, 2.0, 0.1)]),
            &AddDataOptions::default(),
        )
        .unwrap();
        p.new_flag("good", FlagKind::Bool).unwrap();
        assert_eq!(p.get_flag(0, "good").unwrap(), None);
        assert_eq!(p.get_flag(1, "good").unwrap(), None);
        assert!(p.new_flag("good", FlagKind::Bool).is_err());
    }

    #[test]
    fn rescaling_roundtrip_through_get_data() {
        let mut p = SaxsProfile::new("c");
        p.add_data_rows(
            rows(&[(0.1, 2.0, 0.4), (0.2, 3.0, 0.5)]),
            &AddDataOptions::default(),
        )
        .unwrap();
        p.set_gamma(2.0);
        p.set_offset(0.5);
        let pts = p.get_data(&DataSelect::default()).unwrap();
        let (_, i_raw, err_raw) = p.get_raw_data();
        for (k, pt) in pts.iter().enumerate() {
            assert!((pt.i - 2.0 * (i_raw[k] + 0.5)).abs() < 1e-12);
            assert!((pt.err - 2.0 * err_raw[k]).abs() < 1e-12);
        }
    }

    #[test]
    fn filter_excludes_unset_and_false_flags() {
        let mut p = SaxsProfile::new("c");
        p.add_data_rows(
            rows(&[(0.1, 1.0, 0.1), (0.2, 2.0, 0.1), (0.3, 3.0, 0.1)]),
            &AddDataOptions::default(),
        )
        .unwrap();
        p.new_flag("good", FlagKind::Bool).unwrap();
        p.set_flag(0, "good", FlagValue::Bool(true)).unwrap();
        p.set_flag(1, "good", FlagValue::Bool(false)).unwrap();
        // Point 2 stays unset.
        let sel = DataSelect {
            filter: vec!["good".into()],
            ..DataSelect::default()
        };
        let pts = p.get_data(&sel).unwrap();
        assert_eq!(pts.len(), 1);
        assert_eq!(pts[0].id, 0);
    }

    #[test]
    fn subsample_is_deterministic_and_identity_when_large() {
        let q: Vec<f64> = (0..100).map(|k| k as f64 / 99.0).collect();
        let a = subsample_indices(&q, 10);
        let b = subsample_indices(&q, 10);
        assert_eq!(a, b);
        assert!(a.len() <= 10);
        assert_eq!(a.first(), Some(&0));
        assert_eq!(a.last(), Some(&99));
        assert_eq!(subsample_indices(&q, 200), (0..100).collect::<Vec<_>>());
        assert_eq!(subsample_indices(&q, 0), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn interval_coverage_from_point_values() {
        let mut p = SaxsProfile::new("c");
        p.add_data_rows(
            rows(&[(1.0, 1.0, 0.1), (2.0, 1.0, 0.1), (3.0, 1.0, 0.1), (4.0, 1.0, 0.1)]),
            &AddDataOptions::default(),
        )
        .unwrap();
        p.new_flag("good", FlagKind::Bool).unwrap();
        for (id, v) in [true, false, true, true].iter().enumerate() {
            p.set_flag(id, "good", FlagValue::Bool(*v)).unwrap();
        }
        p.create_intervals_from_data("good").unwrap();
        let ivs = p.get_flag_intervals("good").unwrap();
        assert_eq!(ivs.len(), 3);
        assert_eq!((ivs[0].qmin, ivs[0].qmax), (1.0, 2.0));
        assert_eq!((ivs[1].qmin, ivs[1].qmax), (2.0, 3.0));
        assert_eq!((ivs[2].qmin, ivs[2].qmax), (3.0, 4.0));
    }

    #[test]
    fn get_mean_requires_interpolant_and_applies_transform() {
        let mut p = SaxsProfile::new("c");
        let pts: Vec<(f64, f64, f64)> = (0..40)
            .map(|k| {
                let q = 0.01 + 0.3 * k as f64 / 39.0;
                (q, 5.0 * (-q * q * 100.0 / 3.0).exp() + 0.2, 0.05)
            })
            .collect();
        p.add_data_rows(rows(&pts), &AddDataOptions::default()).unwrap();
        assert!(p.get_mean(&MeanSelect::default()).is_err());

        let (q, i, err) = p.get_raw_data();
        let data = FitData {
            q: q.to_vec(),
            i: i.to_vec(),
            err: err.to_vec(),
            nreps: 10,
        };
        let config = FitConfig {
            family: MeanFamily::Simple,
            comparison: false,
            average: false,
            limit_fitting: 0,
            limit_hessian: 0,
            lambdamin: 0.005,
        };
        let fitted = find_fit(&data, &config, None, 0).unwrap();
        p.set_interpolant(fitted);
        p.set_gamma(2.0);
        p.set_offset(1.0);

        let sel = MeanSelect {
            num: 10,
            ..MeanSelect::default()
        };
        let means = p.get_mean(&sel).unwrap();
        assert_eq!(means.len(), 10);
        let fitted = p.fitted().unwrap();
        for m in &means {
            let pm = fitted.gp().posterior_mean(m.q);
            assert!((m.i - 2.0 * (pm + 1.0)).abs() < 1e-9);
            assert!(m.err >= 0.0);
        }
    }
}
