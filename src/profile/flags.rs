//! Typed flag columns and their interval representation.
//!
//! A flag column stores one optional value per data point plus a piecewise
//! description of the same flag over `q` ranges. Intervals are kept sorted
//! by `qmin` and never overlap; inserting a new interval merges with
//! equal-valued neighbors and truncates or splits conflicting ones.

/// Declared type of a flag column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagKind {
    Bool,
    Int,
    Float,
    Str,
}

/// One flag value.
#[derive(Debug, Clone, PartialEq)]
pub enum FlagValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl FlagValue {
    pub fn kind(&self) -> FlagKind {
        match self {
            FlagValue::Bool(_) => FlagKind::Bool,
            FlagValue::Int(_) => FlagKind::Int,
            FlagValue::Float(_) => FlagKind::Float,
            FlagValue::Str(_) => FlagKind::Str,
        }
    }

    /// Convert to the target kind. Numeric kinds convert freely (bools as
    /// 0/1, floats truncate); strings only match strings.
    pub fn cast(self, kind: FlagKind) -> Option<FlagValue> {
        match (self, kind) {
            (v, k) if v.kind() == k => Some(v),
            (FlagValue::Bool(b), FlagKind::Int) => Some(FlagValue::Int(b as i64)),
            (FlagValue::Bool(b), FlagKind::Float) => Some(FlagValue::Float(b as i64 as f64)),
            (FlagValue::Int(v), FlagKind::Float) => Some(FlagValue::Float(v as f64)),
            (FlagValue::Int(v), FlagKind::Bool) => Some(FlagValue::Bool(v != 0)),
            (FlagValue::Float(v), FlagKind::Bool) => Some(FlagValue::Bool(v != 0.0)),
            (FlagValue::Float(v), FlagKind::Int) if v.is_finite() => {
                Some(FlagValue::Int(v as i64))
            }
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FlagValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

/// A half-open `q` range carrying one flag value. The very end of the last
/// interval is treated as included on lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct Interval {
    pub qmin: f64,
    pub qmax: f64,
    pub value: Option<FlagValue>,
}

/// One named flag column: per-point values plus intervals.
#[derive(Debug, Clone)]
pub struct FlagColumn {
    pub(crate) name: String,
    pub(crate) kind: FlagKind,
    pub(crate) values: Vec<Option<FlagValue>>,
    pub(crate) intervals: Vec<Interval>,
}

impl FlagColumn {
    pub fn new(name: impl Into<String>, kind: FlagKind, len: usize) -> Self {
        FlagColumn {
            name: name.into(),
            kind,
            values: vec![None; len],
            intervals: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> FlagKind {
        self.kind
    }

    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }

    /// Insert `[qmin, qmax) -> value`, reconciling with what is already
    /// stored: equal-valued overlapping or touching intervals are merged
    /// into one, conflicting ones are truncated, split, or discarded.
    pub fn set_interval(&mut self, mut qmin: f64, mut qmax: f64, value: Option<FlagValue>) {
        if !(qmin < qmax) {
            return;
        }
        let mut kept = Vec::with_capacity(self.intervals.len() + 1);
        for old in self.intervals.drain(..) {
            if old.value == value && old.qmax >= qmin && old.qmin <= qmax {
                qmin = qmin.min(old.qmin);
                qmax = qmax.max(old.qmax);
                continue;
            }
            if old.qmax <= qmin || old.qmin >= qmax {
                kept.push(old);
                continue;
            }
            // Conflicting overlap: keep whatever sticks out on either side.
            if old.qmin < qmin {
                kept.push(Interval {
                    qmin: old.qmin,
                    qmax: qmin,
                    value: old.value.clone(),
                });
            }
            if old.qmax > qmax {
                kept.push(Interval {
                    qmin: qmax,
                    qmax: old.qmax,
                    value: old.value,
                });
            }
        }
        kept.push(Interval { qmin, qmax, value });
        kept.sort_by(|a, b| a.qmin.total_cmp(&b.qmin));
        self.intervals = kept;
    }

    /// Value of the interval covering `q`, if any. Intervals are half-open,
    /// but a `q` sitting exactly on a trailing edge with no successor is
    /// still resolved to that interval.
    pub fn value_at(&self, q: f64) -> Option<&Option<FlagValue>> {
        let mut at_edge = None;
        for iv in &self.intervals {
            if q >= iv.qmin && q < iv.qmax {
                return Some(&iv.value);
            }
            if q == iv.qmax {
                at_edge = Some(&iv.value);
            }
        }
        at_edge
    }

    /// Rebuild the intervals from the per-point values: consecutive runs of
    /// equal values become one interval each, spanning from the run's first
    /// abscissa to the next run's first abscissa (the last run ends at the
    /// last abscissa).
    pub fn rebuild_intervals_from_values(&mut self, q: &[f64]) {
        self.intervals.clear();
        if q.is_empty() {
            return;
        }
        let mut start = 0usize;
        for i in 1..q.len() {
            if self.values[i] != self.values[start] {
                self.intervals.push(Interval {
                    qmin: q[start],
                    qmax: q[i],
                    value: self.values[start].clone(),
                });
                start = i;
            }
        }
        if q[start] < q[q.len() - 1] {
            self.intervals.push(Interval {
                qmin: q[start],
                qmax: q[q.len() - 1],
                value: self.values[start].clone(),
            });
        }
    }
}
