//! Error types for the merge pipeline.
//!
//! Two layers:
//!
//! - `AppError` is the user-facing error: a message plus the process exit
//!   code. Everything that aborts the run ends up here.
//! - `FitError` is the numerical-fitting error. It is a separate type so
//!   that callers can decide whether a failed fit is fatal (single-family
//!   fit) or tolerated (one family of a model-comparison loop).

#[derive(Clone)]
pub struct AppError {
    exit_code: u8,
    message: String,
}

impl AppError {
    pub fn new(exit_code: u8, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            message: message.into(),
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.exit_code
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::fmt::Debug for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppError")
            .field("exit_code", &self.exit_code)
            .field("message", &self.message)
            .finish()
    }
}

impl std::error::Error for AppError {}

/// Numerical fitting failure for a single curve and mean family.
#[derive(Debug, Clone, PartialEq)]
pub enum FitError {
    /// An optimization stage produced a NaN parameter.
    NanParameters(String),
    /// The covariance grid search found no valid cell.
    EmptyGrid,
    /// The posterior could not be evaluated (singular covariance matrix).
    Degenerate(String),
}

impl std::fmt::Display for FitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FitError::NanParameters(what) => {
                write!(f, "fit produced NaN parameters during {what}")
            }
            FitError::EmptyGrid => write!(f, "covariance grid search found no valid cell"),
            FitError::Degenerate(what) => write!(f, "degenerate fit: {what}"),
        }
    }
}

impl std::error::Error for FitError {}

impl From<FitError> for AppError {
    fn from(err: FitError) -> Self {
        AppError::new(4, format!("Fitting failed: {err}"))
    }
}
