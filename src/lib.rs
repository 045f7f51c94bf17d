//! `saxs-merge` library crate.
//!
//! The binary (`saxsmerge`) is a thin wrapper around this library so that:
//!
//! - the pipeline is testable without spawning processes
//! - the profile and fitting layers are reusable from other tools
//! - code stays easy to navigate as the project grows

pub mod app;
pub mod classify;
pub mod cli;
pub mod domain;
pub mod error;
pub mod fit;
pub mod gp;
pub mod io;
pub mod math;
pub mod profile;
pub mod report;
pub mod rescale;
pub mod stats;
