//! Error types for Trueno-CV
//!
//! Toyota Way: Clear error messages with actionable guidance (Respect for People)
//!
//! Only *faults* live here. A fit that failed under a non-raising error
//! policy is not an error: it becomes [`crate::sentinel::Value::Failure`]
//! and flows through the rest of the evaluation as data.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Trueno-CV error types
#[derive(Error, Debug)]
pub enum Error {
    /// Dataset containers disagree in sample count
    #[error("Found input variables with inconsistent numbers of samples: {lengths:?} ({context})")]
    InconsistentLength {
        /// Which containers were compared
        context: String,
        /// Sample count of each container, in argument order
        lengths: Vec<usize>,
    },

    /// Pairwise mode requested on a container that is not a square kernel
    #[error("Invalid kernel matrix: {0}")]
    InvalidKernel(String),

    /// A per-fold fit raised while the error policy was `Raise`
    #[error("Model fit failed: {source}")]
    FitFault {
        /// The fault reported by the model
        #[source]
        source: anyhow::Error,
    },

    /// The final refit of the best candidate on the full dataset raised
    #[error("Refit of best candidate failed: {0}")]
    RefitFault(#[source] anyhow::Error),

    /// The scorer raised while scoring a fitted model
    #[error("Scoring failed: {0}")]
    ScoreFault(#[source] anyhow::Error),

    /// Fold index outside the cache's fold sequence
    #[error("Fold index {index} out of range (cache has {n_splits} folds)")]
    FoldOutOfRange {
        /// Requested fold
        index: usize,
        /// Number of folds in the cache
        n_splits: usize,
    },

    /// Invalid input parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Result export error (Parquet)
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Arrow error
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for [`Error::InconsistentLength`].
    #[must_use]
    pub fn inconsistent_length(context: impl Into<String>, lengths: Vec<usize>) -> Self {
        Self::InconsistentLength {
            context: context.into(),
            lengths,
        }
    }

    /// True for the fault kinds that abort a whole search.
    ///
    /// Every variant is fatal at the point it is returned; this only
    /// distinguishes model faults from structural input errors.
    #[must_use]
    pub const fn is_model_fault(&self) -> bool {
        matches!(
            self,
            Self::FitFault { .. } | Self::RefitFault(_) | Self::ScoreFault(_)
        )
    }
}
