//! Error taxonomy for the build pipeline (spec.md §7)

use thiserror::Error;

/// A build-and-deploy stage failure. Distinguishes transient (retried on the
/// next change) from fatal (sets `EngineState.fatal_error`, may terminate the
/// Store) with a typed marker rather than matching on an error string.
#[derive(Debug, Error, Clone)]
pub enum BuildError {
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Fatal(String),
}

impl BuildError {
    pub fn fatal(&self) -> bool {
        matches!(self, BuildError::Fatal(_))
    }

    pub fn message(&self) -> &str {
        match self {
            BuildError::Transient(m) => m,
            BuildError::Fatal(m) => m,
        }
    }
}
