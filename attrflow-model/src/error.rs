//! Error types for the model layer.

use crate::ClientId;
use thiserror::Error;

/// Result type for model operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A rejection produced by an entity kind's validator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ValidationError {
    /// Human-readable reason.
    pub message: String,
    /// The offending attribute, when the validator names one.
    pub attribute: Option<String>,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            attribute: None,
        }
    }

    /// Attaches the offending attribute name.
    #[must_use]
    pub fn on(mut self, attribute: impl Into<String>) -> Self {
        self.attribute = Some(attribute.into());
        self
    }
}

/// Errors that can occur in model operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The validator rejected a `set`. Nothing was written.
    #[error("validation failed: {0}")]
    Invalid(#[from] ValidationError),

    /// `sort` was called on a collection without a comparator.
    #[error("cannot sort a collection without a comparator")]
    MissingComparator,

    /// A compute shares its name with a default or relation.
    #[error("attribute `{0}` is declared both as a compute and as a plain attribute")]
    ComputeConflict(String),

    /// Computes depend on each other in a cycle.
    #[error("compute dependency cycle through `{0}`")]
    ComputeCycle(String),

    /// Parent propagation reached the same entity twice.
    #[error("parent change propagation cycle at entity {0}")]
    PropagationCycle(ClientId),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A persistence port failed to store a snapshot.
    #[error("persistence error: {0}")]
    Persistence(String),
}
