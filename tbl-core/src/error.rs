//! Error types for the duplication engine

use thiserror::Error;

/// Errors raised while duplicating a subtree or one of its capacities
#[derive(Error, Debug)]
pub enum CopyError {
    /// A source node, capacity or variable does not exist
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A nested formula/condition/table could not be copied
    #[error("Failed to copy dependency {reference}: {reason}")]
    DependencyCopyFailure { reference: String, reason: String },

    /// An insert collided with an existing id or unique key
    #[error("Conflict creating {entity}: {key} already exists")]
    ConflictOnCreate { entity: &'static str, key: String },

    /// The pass-scoped disambiguation counter ran out of candidates
    #[error("No free disambiguation suffix left for {entity} {key}")]
    DisambiguationExhausted { entity: &'static str, key: String },

    /// Variable copies fail loud: a missing variable leaves its display node dangling
    #[error("Variable copy failed for {variable_id}: {source}")]
    FatalVariableCopy {
        variable_id: String,
        #[source]
        source: Box<CopyError>,
    },

    /// Persistence layer failure
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl CopyError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        CopyError::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Wraps an error raised while copying a variable
    pub fn fatal_variable(variable_id: impl Into<String>, source: CopyError) -> Self {
        match source {
            // Already wrapped by a nested variable copy
            CopyError::FatalVariableCopy { .. } => source,
            other => CopyError::FatalVariableCopy {
                variable_id: variable_id.into(),
                source: Box::new(other),
            },
        }
    }
}

pub type CopyResult<T> = std::result::Result<T, CopyError>;
