//! Columnar text writers for the per-point data and fitted-mean files.
//!
//! Output width is fixed at 15 characters per column; booleans are written
//! as 0/1 so the files stay trivially parseable.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::domain::OutLevel;
use crate::error::AppError;
use crate::profile::{Average, DataSelect, FlagValue, MeanSelect, SaxsProfile};

fn fmt_float(v: f64) -> String {
    format!("{v:15.6}")
}

fn fmt_flag(v: Option<&FlagValue>) -> String {
    match v {
        None => format!("{:>15}", "-"),
        Some(FlagValue::Bool(b)) => format!("{:>15}", *b as i64),
        Some(FlagValue::Int(i)) => format!("{i:>15}"),
        Some(FlagValue::Float(f)) => fmt_float(*f),
        Some(FlagValue::Str(s)) => format!("{s:>15}"),
    }
}

/// Flags emitted at this output level, restricted to what the curve
/// actually carries.
fn selected_flags(profile: &SaxsProfile, level: OutLevel, mean_file: bool) -> Vec<String> {
    let wanted: Vec<&str> = match level {
        OutLevel::Sparse => Vec::new(),
        OutLevel::Normal => {
            if mean_file {
                vec!["eorigin", "eoriname", "eextrapol"]
            } else {
                vec!["eorigin", "eoriname"]
            }
        }
        OutLevel::Full => {
            return profile.flag_names().iter().map(|s| s.to_string()).collect();
        }
    };
    wanted
        .into_iter()
        .filter(|n| profile.has_flag(n))
        .map(str::to_string)
        .collect()
}

fn create(path: &Path) -> Result<File, AppError> {
    File::create(path)
        .map_err(|e| AppError::new(2, format!("Failed to create '{}': {e}", path.display())))
}

fn emit(file: &mut File, line: &str, path: &Path) -> Result<(), AppError> {
    writeln!(file, "{line}")
        .map_err(|e| AppError::new(2, format!("Failed to write '{}': {e}", path.display())))
}

fn header_line(fixed: &[&str], flags: &[String]) -> String {
    let mut cols: Vec<String> = fixed.iter().map(|s| s.to_string()).collect();
    cols.extend(flags.iter().cloned());
    let mut out = String::from("#");
    for (k, name) in cols.iter().enumerate() {
        out.push_str(&format!("{}:{name} ", k + 1));
    }
    out.trim_end().to_string()
}

/// Write `data_<name>`: every point with the rescaling transform applied,
/// plus the flags selected by the output level.
pub fn write_data_file(
    dir: &Path,
    profile: &SaxsProfile,
    level: OutLevel,
    header: bool,
) -> Result<PathBuf, AppError> {
    let path = dir.join(format!("data_{}", profile.name()));
    let mut file = create(&path)?;
    let flags = selected_flags(profile, level, false);
    if header {
        emit(&mut file, &header_line(&["q", "I", "err"], &flags), &path)?;
    }
    for p in profile.get_data(&DataSelect::default())? {
        let mut line = format!("{} {} {}", fmt_float(p.q), fmt_float(p.i), fmt_float(p.err));
        for name in &flags {
            let v = profile.get_flag(p.id, name)?;
            line.push(' ');
            line.push_str(&fmt_flag(v.as_ref()));
        }
        emit(&mut file, &line, &path)?;
    }
    Ok(path)
}

/// Write `mean_<name>`: the fitted mean evaluated on `qvals`, flags
/// resolved through the curve's intervals.
pub fn write_mean_file(
    dir: &Path,
    profile: &SaxsProfile,
    qvals: &[f64],
    level: OutLevel,
    header: bool,
    average: Average,
) -> Result<PathBuf, AppError> {
    let path = dir.join(format!("mean_{}", profile.name()));
    let mut file = create(&path)?;
    let flags = selected_flags(profile, level, true);
    if header {
        emit(&mut file, &header_line(&["q", "I", "err", "mean"], &flags), &path)?;
    }
    let sel = MeanSelect {
        qvalues: Some(qvals.to_vec()),
        average,
        ..MeanSelect::default()
    };
    for p in profile.get_mean(&sel)? {
        let mut line = format!(
            "{} {} {} {}",
            fmt_float(p.q),
            fmt_float(p.i),
            fmt_float(p.err),
            fmt_float(p.mean)
        );
        for name in &flags {
            let v = profile.get_flag_at(p.q, name)?;
            line.push(' ');
            line.push_str(&fmt_flag(v.as_ref()));
        }
        emit(&mut file, &line, &path)?;
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{AddDataOptions, DataRow, FlagKind};

    fn profile_with_origin() -> SaxsProfile {
        let mut p = SaxsProfile::new("merged.dat");
        p.new_flag("eorigin", FlagKind::Int).unwrap();
        p.new_flag("eoriname", FlagKind::Str).unwrap();
        let rows = vec![
            DataRow {
                q: 0.1,
                i: 1.0,
                err: 0.1,
                flags: vec![
                    Some(FlagValue::Int(0)),
                    Some(FlagValue::Str("a.dat".into())),
                ],
            },
            DataRow {
                q: 0.2,
                i: 2.0,
                err: 0.2,
                flags: vec![
                    Some(FlagValue::Int(1)),
                    Some(FlagValue::Str("b.dat".into())),
                ],
            },
        ];
        p.add_data_rows(rows, &AddDataOptions::default()).unwrap();
        p
    }

    #[test]
    fn sparse_level_emits_three_columns() {
        let dir = tempfile::tempdir().unwrap();
        let p = profile_with_origin();
        let path = write_data_file(dir.path(), &p, OutLevel::Sparse, true).unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap().trim(), "#1:q 2:I 3:err");
        let first = lines.next().unwrap();
        assert_eq!(first.split_whitespace().count(), 3);
    }

    #[test]
    fn normal_level_adds_origin_columns() {
        let dir = tempfile::tempdir().unwrap();
        let p = profile_with_origin();
        let path = write_data_file(dir.path(), &p, OutLevel::Normal, false).unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        let first = text.lines().next().unwrap();
        let cols: Vec<&str> = first.split_whitespace().collect();
        assert_eq!(cols.len(), 5);
        assert_eq!(cols[3], "0");
        assert_eq!(cols[4], "a.dat");
    }

    #[test]
    fn missing_flags_are_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = SaxsProfile::new("plain.dat");
        p.add_data_rows(
            vec![DataRow {
                q: 0.1,
                i: 1.0,
                err: 0.1,
                flags: vec![],
            }],
            &AddDataOptions::default(),
        )
        .unwrap();
        // Normal level wants origin flags this curve does not carry.
        let path = write_data_file(dir.path(), &p, OutLevel::Normal, false).unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert_eq!(text.lines().next().unwrap().split_whitespace().count(), 3);
    }
}
