// 🧾 Purchase Edge - timestamped, weighted Profile → Store relationship
//
// Purchases are append-only. The same profile may buy from the same store
// many times, even with identical amount and time, so there is no natural
// key. Only rows that came from a CSV file get an import key, which makes
// re-importing the same file a no-op.

use crate::error::{GraphError, GraphResult};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SubsecRound, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Naive layouts accepted besides RFC 3339 (all read as UTC)
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

// ============================================================================
// PURCHASE EDGE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Purchase {
    /// Stable identity (UUID) of this edge
    pub purchase_id: String,

    /// Source endpoint (Profile id)
    pub profile_id: String,

    /// Target endpoint (Store id)
    pub store_id: String,

    /// Business time: when the purchase happened
    pub when: DateTime<Utc>,

    /// Finite, non-negative amount
    pub amount: f64,

    /// SHA-256 of (source file, line) for CSV-sourced rows
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub import_key: Option<String>,

    /// System time: when we recorded it
    pub recorded_at: DateTime<Utc>,
}

impl Purchase {
    pub fn new(
        profile_id: impl Into<String>,
        store_id: impl Into<String>,
        when: DateTime<Utc>,
        amount: f64,
    ) -> GraphResult<Self> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(GraphError::InvalidAmount { amount });
        }

        Ok(Purchase {
            purchase_id: uuid::Uuid::new_v4().to_string(),
            profile_id: profile_id.into(),
            store_id: store_id.into(),
            // Stored with microsecond precision
            when: when.trunc_subsecs(6),
            amount,
            import_key: None,
            recorded_at: Utc::now(),
        })
    }

    /// Tag this purchase with the file position it was read from
    pub fn with_import_key(mut self, source_file: &str, line_number: u64) -> Self {
        self.import_key = Some(compute_import_key(source_file, line_number));
        self
    }

    /// Storage representation of `when`
    pub fn when_micros(&self) -> i64 {
        self.when.timestamp_micros()
    }
}

/// Hash used to deduplicate purchases loaded from files
pub fn compute_import_key(source_file: &str, line_number: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}", source_file, line_number));
    format!("{:x}", hasher.finalize())
}

/// Inverse of `Purchase::when_micros`
pub fn from_micros(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(micros)
}

/// Parse a point in time from RFC 3339, a naive date-time, or a bare date
///
/// Naive inputs carry no offset and are taken as UTC.
pub fn parse_when(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.with_timezone(&Utc));
    }

    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}
