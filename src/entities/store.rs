// 🏪 Store Entity - merchant-like node
//
// A store only carries its identity. Purchases point at it by id.

use crate::error::{EntityKind, GraphError, GraphResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Store {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

impl Store {
    pub fn new(id: impl Into<String>) -> GraphResult<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(GraphError::InvalidId {
                kind: EntityKind::Store,
            });
        }

        Ok(Store {
            id,
            created_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_creation() {
        let store = Store::new("store1").unwrap();
        assert_eq!(store.id, "store1");
    }

    #[test]
    fn test_blank_store_id_rejected() {
        assert!(matches!(
            Store::new(""),
            Err(GraphError::InvalidId {
                kind: EntityKind::Store
            })
        ));
    }
}
