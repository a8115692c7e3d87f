// Error taxonomy for the graph store and the spend aggregator
//
// An empty aggregation result is never an error. Store failures
// (Connectivity / Store) are kept apart from data problems so callers can
// tell "nothing matched" from "could not ask".

use std::path::PathBuf;

/// Which node kind an error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Profile,
    Store,
    Purchase,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Profile => "profile",
            EntityKind::Store => "store",
            EntityKind::Purchase => "purchase",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// The database could not be opened at all
    #[error("cannot reach store at {path}: {source}")]
    Connectivity {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// A statement failed against an open store
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("{kind} not found: {id}")]
    MissingEndpoint { kind: EntityKind, id: String },

    #[error("{kind} already exists: {id}")]
    DuplicateEntity { kind: EntityKind, id: String },

    #[error("invalid purchase amount {amount}: must be finite and non-negative")]
    InvalidAmount { amount: f64 },

    #[error("{kind} id must not be empty")]
    InvalidId { kind: EntityKind },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GraphError {
    /// True when the failure came from the backing store rather than the data
    pub fn is_connectivity(&self) -> bool {
        matches!(self, GraphError::Connectivity { .. } | GraphError::Store(_))
    }
}

pub type GraphResult<T> = Result<T, GraphError>;
