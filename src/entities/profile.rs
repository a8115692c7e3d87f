// 👤 Profile Entity - customer-like node
//
// "Profile id is IDENTITY (unique), country is the VALUE we filter on"
//
// Profiles are created once and never updated. The country is compared
// byte-for-byte by the spend aggregator ("IL" and "il" are different).

use crate::error::{EntityKind, GraphError, GraphResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// PROFILE ENTITY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Unique identifier supplied by the caller
    pub id: String,

    /// Low-cardinality attribute (e.g. "il", "us")
    pub country: String,

    /// When this profile was recorded in our system
    pub created_at: DateTime<Utc>,
}

impl Profile {
    /// Create a new profile, rejecting blank ids
    pub fn new(id: impl Into<String>, country: impl Into<String>) -> GraphResult<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(GraphError::InvalidId {
                kind: EntityKind::Profile,
            });
        }

        Ok(Profile {
            id,
            country: country.into(),
            created_at: Utc::now(),
        })
    }

    /// Exact, case-sensitive country comparison
    pub fn is_from(&self, country: &str) -> bool {
        self.country == country
    }
}
