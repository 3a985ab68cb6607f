// src/error.rs
use thiserror::Error;

/// Errors raised while replaying a single logical record.
///
/// Protocol errors (`NoHeader`, `UnresolvedKey`) mean the file itself cannot be
/// trusted any further and end the run. Everything else is recorded against
/// the record and the run carries on.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("No P row supplied before first V row at line {line}")]
    NoHeader { line: usize },

    #[error("Key mapping not found for: {reference} at line {line}")]
    UnresolvedKey { line: usize, reference: String },

    #[error("dispatch failed at line {line}: {source:#}")]
    Dispatch {
        line: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("reading input: {0:#}")]
    Source(#[from] anyhow::Error),
}

impl ReplayError {
    /// Whether this error must abort the whole run immediately.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ReplayError::NoHeader { .. } | ReplayError::UnresolvedKey { .. } | ReplayError::Source(_)
        )
    }
}
