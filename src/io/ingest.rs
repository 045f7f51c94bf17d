//! Input token parsing and curve loading.
//!
//! Each command-line token names one or more input files: an optional
//! `=N` suffix declares how many repeat measurements the file averages
//! over, and the path part is expanded as a glob pattern.

use std::path::PathBuf;

use glob::glob;

use crate::error::AppError;
use crate::profile::{AddDataOptions, SaxsProfile};

/// Repeat count assumed when a token carries no `=N` suffix.
pub const DEFAULT_NREPS: usize = 10;

/// One resolved input file.
#[derive(Debug, Clone)]
pub struct InputSpec {
    pub path: PathBuf,
    pub nreps: usize,
}

/// Expand `path=N` tokens into concrete files. A token whose pattern
/// matches nothing is an error.
pub fn parse_input_tokens(tokens: &[String]) -> Result<Vec<InputSpec>, AppError> {
    let mut out = Vec::new();
    for token in tokens {
        let (pattern, nreps) = match token.rsplit_once('=') {
            Some((path, n)) => match n.parse::<usize>() {
                Ok(n) if n >= 1 => (path.to_string(), n),
                _ => (token.clone(), DEFAULT_NREPS),
            },
            None => (token.clone(), DEFAULT_NREPS),
        };
        let entries = glob(&pattern)
            .map_err(|e| AppError::new(2, format!("Invalid file pattern '{pattern}': {e}")))?;
        let mut matched = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| {
                AppError::new(2, format!("Cannot access a file matching '{pattern}': {e}"))
            })?;
            matched.push(path);
        }
        if matched.is_empty() {
            return Err(AppError::new(2, format!("No input files match '{pattern}'.")));
        }
        matched.sort();
        out.extend(matched.into_iter().map(|path| InputSpec { path, nreps }));
    }
    Ok(out)
}

/// Load every input file into a curve. Files with no parseable rows are an
/// error rather than an empty curve.
pub fn load_profiles(specs: &[InputSpec], verbose: u8) -> Result<Vec<SaxsProfile>, AppError> {
    let mut out = Vec::with_capacity(specs.len());
    for spec in specs {
        let name = spec
            .path
            .file_name()
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| spec.path.display().to_string());
        let mut profile = SaxsProfile::new(name);
        profile.add_data_from_file(&spec.path, &AddDataOptions::default())?;
        profile.set_nreps(spec.nreps);
        if profile.is_empty() {
            return Err(AppError::new(
                2,
                format!("No valid data rows in '{}'.", spec.path.display()),
            ));
        }
        if verbose >= 1 {
            println!(
                "read {} points from {} (N = {})",
                profile.len(),
                spec.path.display(),
                spec.nreps
            );
        }
        out.push(profile);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn repeat_count_suffix_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("curve.dat");
        std::fs::File::create(&path).unwrap();
        let token = format!("{}=25", path.display());
        let specs = parse_input_tokens(&[token]).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].nreps, 25);
        assert_eq!(specs[0].path, path);
    }

    #[test]
    fn missing_suffix_defaults_to_ten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("curve.dat");
        std::fs::File::create(&path).unwrap();
        let specs = parse_input_tokens(&[path.display().to_string()]).unwrap();
        assert_eq!(specs[0].nreps, DEFAULT_NREPS);
    }

    #[test]
    fn zero_matches_is_an_error() {
        assert!(parse_input_tokens(&["/nonexistent/dir/*.dat".to_string()]).is_err());
    }

    #[test]
    fn nonpositive_error_rows_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("curve.dat");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "0.01 10.0 0.1").unwrap();
        writeln!(f, "0.02 9.5 -0.1").unwrap();
        writeln!(f, "0.03 9.0 0.0").unwrap();
        writeln!(f, "0.04 8.5 0.1").unwrap();
        drop(f);
        let specs = parse_input_tokens(&[path.display().to_string()]).unwrap();
        let profiles = load_profiles(&specs, 0).unwrap();
        let (q, _, _) = profiles[0].get_raw_data();
        assert_eq!(q, &[0.01, 0.04]);
    }

    #[test]
    fn comments_and_malformed_rows_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("curve.dat");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "# a comment").unwrap();
        writeln!(f, "0.01 10.0 0.1").unwrap();
        writeln!(f, "not numbers here").unwrap();
        writeln!(f, "0.02 nan 0.1").unwrap();
        writeln!(f, "0.03 9.0 0.1").unwrap();
        drop(f);
        let specs = parse_input_tokens(&[path.display().to_string()]).unwrap();
        let profiles = load_profiles(&specs, 0).unwrap();
        assert_eq!(profiles[0].len(), 2);
    }
}
