// 💰 Spend Aggregator - who spent more than X at store S during a window
//
// Two stages, in both implementations:
//   1. Group the store's incoming purchases inside [start, end) by profile
//      and sum their amounts. Profiles without a qualifying purchase never
//      reach stage 2 (inner join).
//   2. Keep profiles whose sum is strictly above the threshold and whose
//      country matches exactly.
//
// `total_spent_above` runs this as one SQL statement against the store.
// `total_spent_above_in_memory` runs it as a map/filter over loaded rows.
// Both must return the same set for the same data, so both sum through
// `SpendSum` (registered in SQLite as `spend_sum`).

use crate::entities::{Profile, Purchase};
use crate::error::GraphResult;
use chrono::{DateTime, Utc};
use rusqlite::functions::{Aggregate, Context, FunctionFlags};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info};

// ============================================================================
// TIME WINDOW
// ============================================================================

/// Half-open interval `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        TimeWindow { start, end }
    }

    /// `start` is included, `end` is not
    pub fn contains(&self, when: DateTime<Utc>) -> bool {
        self.start <= when && when < self.end
    }

    /// True when no instant can fall inside (including inverted bounds)
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

// ============================================================================
// QUERY
// ============================================================================

/// Ordering applied to results only when the caller asks for one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpendOrder {
    /// Whatever order the store produced
    #[default]
    Unspecified,
    /// Largest total first, ties by profile id
    TotalDescending,
    /// Profile id ascending
    ProfileId,
}

impl SpendOrder {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unspecified" | "none" => Some(SpendOrder::Unspecified),
            "total" | "total_descending" => Some(SpendOrder::TotalDescending),
            "profile" | "profile_id" => Some(SpendOrder::ProfileId),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendQuery {
    /// Store whose incoming purchases are summed
    pub store_id: String,
    pub window: TimeWindow,
    /// Exact, case-sensitive country filter
    pub country: String,
    /// Exclusive lower bound on the per-profile sum
    pub threshold: f64,
    #[serde(default)]
    pub order: SpendOrder,
}

impl SpendQuery {
    pub fn new(
        store_id: impl Into<String>,
        window: TimeWindow,
        country: impl Into<String>,
        threshold: f64,
    ) -> Self {
        SpendQuery {
            store_id: store_id.into(),
            window,
            country: country.into(),
            threshold,
            order: SpendOrder::Unspecified,
        }
    }

    pub fn ordered_by(mut self, order: SpendOrder) -> Self {
        self.order = order;
        self
    }
}

/// One retained profile paired with its windowed total
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSpend {
    pub profile: Profile,
    pub total_spent: f64,
}

fn apply_order(results: &mut [ProfileSpend], order: SpendOrder) {
    match order {
        SpendOrder::Unspecified => {}
        SpendOrder::TotalDescending => results.sort_by(|a, b| {
            b.total_spent
                .total_cmp(&a.total_spent)
                .then_with(|| a.profile.id.cmp(&b.profile.id))
        }),
        SpendOrder::ProfileId => results.sort_by(|a, b| a.profile.id.cmp(&b.profile.id)),
    }
}

// ============================================================================
// SUMMATION
// ============================================================================

/// Name of the SQL aggregate backed by `SpendSum`
pub const SPEND_SUM_FN: &str = "spend_sum";

/// Compensated sum that does not depend on input order
///
/// Amounts are sorted before a Neumaier pass, so the same multiset of
/// amounts always produces the same total whichever order the rows arrive in.
#[derive(Debug, Clone, Default)]
pub struct SpendSum {
    amounts: Vec<f64>,
}

impl SpendSum {
    pub fn add(&mut self, amount: f64) {
        self.amounts.push(amount);
    }

    pub fn total(mut self) -> f64 {
        self.amounts.sort_by(f64::total_cmp);

        let mut sum = 0.0;
        let mut compensation = 0.0;
        for amount in self.amounts {
            let next = sum + amount;
            if f64::abs(sum) >= f64::abs(amount) {
                compensation += (sum - next) + amount;
            } else {
                compensation += (amount - next) + sum;
            }
            sum = next;
        }
        sum + compensation
    }
}

struct SpendSumAggregate;

impl Aggregate<SpendSum, Option<f64>> for SpendSumAggregate {
    fn init(&self, _ctx: &mut Context<'_>) -> rusqlite::Result<SpendSum> {
        Ok(SpendSum::default())
    }

    fn step(&self, ctx: &mut Context<'_>, acc: &mut SpendSum) -> rusqlite::Result<()> {
        acc.add(ctx.get::<f64>(0)?);
        Ok(())
    }

    fn finalize(&self, _ctx: &mut Context<'_>, acc: Option<SpendSum>) -> rusqlite::Result<Option<f64>> {
        Ok(acc.map(SpendSum::total))
    }
}

/// Make `spend_sum(amount)` available on this connection
pub fn register_spend_sum(conn: &Connection) -> GraphResult<()> {
    conn.create_aggregate_function(
        SPEND_SUM_FN,
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        SpendSumAggregate,
    )?;
    Ok(())
}

// ============================================================================
// STORE-BACKED AGGREGATION
// ============================================================================

/// Run the spend query as a single statement against the store
///
/// An unknown store, an empty or inverted window, or a NaN threshold all
/// produce an empty result. Only store failures are errors. The connection
/// must have `spend_sum` registered (`setup_database` does this).
pub fn total_spent_above(conn: &Connection, query: &SpendQuery) -> GraphResult<Vec<ProfileSpend>> {
    if query.window.is_empty() {
        debug!(
            start = %query.window.start,
            end = %query.window.end,
            "empty window, skipping store round-trip"
        );
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare_cached(
        "WITH spent AS (
            SELECT pu.profile_id AS profile_id, spend_sum(pu.amount) AS total_spent
            FROM purchases pu
            WHERE pu.store_id = ?1
              AND pu.when_micros >= ?2
              AND pu.when_micros < ?3
            GROUP BY pu.profile_id
        )
        SELECT p.id, p.country, p.created_at, s.total_spent
        FROM spent s
        JOIN profiles p ON p.id = s.profile_id
        WHERE s.total_spent > ?4
          AND p.country = ?5",
    )?;

    let rows = stmt.query_map(
        params![
            query.store_id,
            query.window.start.timestamp_micros(),
            query.window.end.timestamp_micros(),
            query.threshold,
            query.country,
        ],
        |row| {
            let created_at: String = row.get(2)?;
            let created_at = DateTime::parse_from_rfc3339(&created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        2,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?;

            Ok(ProfileSpend {
                profile: Profile {
                    id: row.get(0)?,
                    country: row.get(1)?,
                    created_at,
                },
                total_spent: row.get(3)?,
            })
        },
    )?;

    let mut results = rows.collect::<Result<Vec<_>, _>>()?;
    apply_order(&mut results, query.order);
    Ok(results)
}

// ============================================================================
// IN-MEMORY AGGREGATION
// ============================================================================

/// Same two-stage pipeline over rows already in memory
pub fn total_spent_above_in_memory(
    profiles: &[Profile],
    purchases: &[Purchase],
    query: &SpendQuery,
) -> Vec<ProfileSpend> {
    if query.window.is_empty() {
        return Vec::new();
    }

    // Stage 1: windowed group-by-sum over the store's incoming edges
    let mut groups: HashMap<&str, SpendSum> = HashMap::new();
    for purchase in purchases
        .iter()
        .filter(|p| p.store_id == query.store_id && query.window.contains(p.when))
    {
        groups
            .entry(purchase.profile_id.as_str())
            .or_default()
            .add(purchase.amount);
    }
    let sums: HashMap<&str, f64> = groups
        .into_iter()
        .map(|(profile_id, sum)| (profile_id, sum.total()))
        .collect();

    // Stage 2: threshold + attribute filter over grouped profiles
    let mut results: Vec<ProfileSpend> = profiles
        .iter()
        .filter_map(|profile| {
            let total = *sums.get(profile.id.as_str())?;
            (total > query.threshold && profile.is_from(&query.country)).then(|| ProfileSpend {
                profile: profile.clone(),
                total_spent: total,
            })
        })
        .collect();

    apply_order(&mut results, query.order);
    results
}

// ============================================================================
// REPORT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpendReport {
    pub query: SpendQuery,
    pub results: Vec<ProfileSpend>,
    pub executed_at: DateTime<Utc>,
    pub elapsed_ms: f64,
}

impl SpendReport {
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn total_for(&self, profile_id: &str) -> Option<f64> {
        self.results
            .iter()
            .find(|r| r.profile.id == profile_id)
            .map(|r| r.total_spent)
    }

    pub fn summary(&self) -> String {
        format!(
            "Store {} [{} → {}), country {}, more than {:.2}: {} profile(s), query took {:.2} ms",
            self.query.store_id,
            self.query.window.start.to_rfc3339(),
            self.query.window.end.to_rfc3339(),
            self.query.country,
            self.query.threshold,
            self.results.len(),
            self.elapsed_ms
        )
    }
}

/// Run the store-backed query and time it
pub fn run_spend_report(conn: &Connection, query: &SpendQuery) -> GraphResult<SpendReport> {
    let executed_at = Utc::now();
    let started = Instant::now();

    let results = total_spent_above(conn, query)?;
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

    info!(
        store_id = %query.store_id,
        country = %query.country,
        threshold = query.threshold,
        matched = results.len(),
        elapsed_ms,
        "spend query finished"
    );

    Ok(SpendReport {
        query: query.clone(),
        results,
        executed_at,
        elapsed_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{get_all_profiles, get_all_purchases, open_in_memory, record_profile, record_purchase, record_store};
    use chrono::{Duration, TimeZone};

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn may_window() -> TimeWindow {
        TimeWindow::new(at(2021, 2, 1, 10, 41), at(2021, 6, 1, 10, 40))
    }

    /// Store-backed and in-memory results, sorted by profile id
    fn both(conn: &Connection, query: &SpendQuery) -> (Vec<ProfileSpend>, Vec<ProfileSpend>) {
        let query = query.clone().ordered_by(SpendOrder::ProfileId);
        let from_store = total_spent_above(conn, &query).unwrap();
        let profiles = get_all_profiles(conn).unwrap();
        let purchases = get_all_purchases(conn).unwrap();
        let in_memory = total_spent_above_in_memory(&profiles, &purchases, &query);
        (from_store, in_memory)
    }

    fn ids(results: &[ProfileSpend]) -> Vec<&str> {
        results.iter().map(|r| r.profile.id.as_str()).collect()
    }

    #[test]
    fn test_window_is_half_open() {
        let window = may_window();

        assert!(window.contains(window.start));
        assert!(!window.contains(window.end));
        assert!(window.contains(window.end - Duration::microseconds(1)));
        assert!(!window.contains(window.start - Duration::microseconds(1)));
        assert!(!window.is_empty());
        assert!(TimeWindow::new(window.end, window.start).is_empty());
        assert!(TimeWindow::new(window.start, window.start).is_empty());
    }

    #[test]
    fn test_reference_scenario() {
        let conn = open_in_memory().unwrap();
        record_profile(&conn, "profile1", "il").unwrap();
        record_profile(&conn, "profile2", "us").unwrap();
        record_profile(&conn, "profile3", "us").unwrap();
        record_profile(&conn, "profile4", "il").unwrap();
        record_store(&conn, "store1").unwrap();

        record_purchase(&conn, "profile1", "store1", Utc::now(), 2200.0).unwrap();
        record_purchase(&conn, "profile2", "store1", at(2021, 5, 20, 10, 40), 100.00).unwrap();
        record_purchase(&conn, "profile2", "store1", at(2021, 5, 20, 10, 41), 1900.01).unwrap();
        record_purchase(&conn, "profile3", "store1", at(2021, 5, 20, 10, 40), 1999.63).unwrap();
        record_purchase(&conn, "profile4", "store1", at(2021, 5, 20, 10, 40), 2000.63).unwrap();

        let query = SpendQuery::new("store1", may_window(), "il", 2000.0);
        let results = total_spent_above(&conn, &query).unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].profile.id, "profile4");
        assert_eq!(results[0].total_spent, 2000.63);

        let (from_store, in_memory) = both(&conn, &query);
        assert_eq!(from_store, in_memory);
    }

    #[test]
    fn test_window_boundaries() {
        let conn = open_in_memory().unwrap();
        record_profile(&conn, "a", "il").unwrap();
        record_store(&conn, "s").unwrap();

        let window = may_window();
        record_purchase(&conn, "a", "s", window.start, 10.0).unwrap();
        record_purchase(&conn, "a", "s", window.end, 1000.0).unwrap();
        record_purchase(&conn, "a", "s", window.start - Duration::seconds(1), 1000.0).unwrap();

        let query = SpendQuery::new("s", window, "il", 0.0);
        let (from_store, in_memory) = both(&conn, &query);

        assert_eq!(from_store.len(), 1);
        assert_eq!(from_store[0].total_spent, 10.0);
        assert_eq!(from_store, in_memory);
    }

    #[test]
    fn test_threshold_is_strict() {
        let conn = open_in_memory().unwrap();
        record_profile(&conn, "exact", "il").unwrap();
        record_profile(&conn, "cent_more", "il").unwrap();
        record_store(&conn, "s").unwrap();

        let when = at(2021, 5, 20, 10, 40);
        record_purchase(&conn, "exact", "s", when, 2000.0).unwrap();
        record_purchase(&conn, "cent_more", "s", when, 2000.01).unwrap();

        let query = SpendQuery::new("s", may_window(), "il", 2000.0);
        let (from_store, in_memory) = both(&conn, &query);

        assert_eq!(ids(&from_store), vec!["cent_more"]);
        assert_eq!(from_store, in_memory);
    }

    #[test]
    fn test_country_filter_is_exact() {
        let conn = open_in_memory().unwrap();
        record_profile(&conn, "lower", "il").unwrap();
        record_profile(&conn, "upper", "IL").unwrap();
        record_profile(&conn, "other", "us").unwrap();
        record_store(&conn, "s").unwrap();

        let when = at(2021, 5, 20, 10, 40);
        for id in ["lower", "upper", "other"] {
            record_purchase(&conn, id, "s", when, 5000.0).unwrap();
        }

        let query = SpendQuery::new("s", may_window(), "il", 2000.0);
        let (from_store, in_memory) = both(&conn, &query);

        assert_eq!(ids(&from_store), vec!["lower"]);
        assert_eq!(from_store, in_memory);
    }

    #[test]
    fn test_profiles_without_purchases_never_appear() {
        let conn = open_in_memory().unwrap();
        record_profile(&conn, "idle", "il").unwrap();
        record_profile(&conn, "out_of_window", "il").unwrap();
        record_profile(&conn, "elsewhere", "il").unwrap();
        record_store(&conn, "s").unwrap();
        record_store(&conn, "t").unwrap();

        record_purchase(&conn, "out_of_window", "s", at(2020, 1, 1, 0, 0), 10.0).unwrap();
        record_purchase(&conn, "elsewhere", "t", at(2021, 5, 20, 10, 40), 10.0).unwrap();

        // A negative threshold would admit any real sum, even zero
        let query = SpendQuery::new("s", may_window(), "il", -1.0);
        let (from_store, in_memory) = both(&conn, &query);

        assert!(from_store.is_empty());
        assert!(in_memory.is_empty());
    }

    #[test]
    fn test_only_target_store_contributes() {
        let conn = open_in_memory().unwrap();
        record_profile(&conn, "a", "il").unwrap();
        record_store(&conn, "s").unwrap();
        record_store(&conn, "t").unwrap();

        let when = at(2021, 5, 20, 10, 40);
        record_purchase(&conn, "a", "s", when, 1500.0).unwrap();
        record_purchase(&conn, "a", "t", when, 1500.0).unwrap();

        let query = SpendQuery::new("s", may_window(), "il", 2000.0);
        assert!(total_spent_above(&conn, &query).unwrap().is_empty());

        let query = SpendQuery::new("s", may_window(), "il", 1000.0);
        let results = total_spent_above(&conn, &query).unwrap();
        assert_eq!(results[0].total_spent, 1500.0);
    }

    #[test]
    fn test_unknown_store_and_inverted_window_are_empty() {
        let conn = open_in_memory().unwrap();
        record_profile(&conn, "a", "il").unwrap();
        record_store(&conn, "s").unwrap();
        record_purchase(&conn, "a", "s", at(2021, 5, 20, 10, 40), 5000.0).unwrap();

        let unknown = SpendQuery::new("nowhere", may_window(), "il", 0.0);
        assert!(total_spent_above(&conn, &unknown).unwrap().is_empty());

        let window = may_window();
        let inverted = SpendQuery::new("s", TimeWindow::new(window.end, window.start), "il", 0.0);
        assert!(total_spent_above(&conn, &inverted).unwrap().is_empty());
        assert!(total_spent_above_in_memory(&[], &[], &inverted).is_empty());
    }

    #[test]
    fn test_nan_threshold_matches_nothing() {
        let conn = open_in_memory().unwrap();
        record_profile(&conn, "a", "il").unwrap();
        record_store(&conn, "s").unwrap();
        record_purchase(&conn, "a", "s", at(2021, 5, 20, 10, 40), 5000.0).unwrap();

        let query = SpendQuery::new("s", may_window(), "il", f64::NAN);
        let (from_store, in_memory) = both(&conn, &query);

        assert!(from_store.is_empty());
        assert!(in_memory.is_empty());
    }

    #[test]
    fn test_sums_keep_cents() {
        let conn = open_in_memory().unwrap();
        record_profile(&conn, "a", "il").unwrap();
        record_store(&conn, "s").unwrap();

        let when = at(2021, 5, 20, 10, 40);
        record_purchase(&conn, "a", "s", when, 100.00).unwrap();
        record_purchase(&conn, "a", "s", when, 1900.01).unwrap();

        let query = SpendQuery::new("s", may_window(), "il", 2000.0);
        let results = total_spent_above(&conn, &query).unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].total_spent, 2000.01);
    }

    #[test]
    fn test_spend_sum_ignores_input_order() {
        let orders = [[1e16, 1.0, -1e16], [1.0, -1e16, 1e16], [-1e16, 1e16, 1.0]];
        for amounts in orders {
            let mut sum = SpendSum::default();
            for amount in amounts {
                sum.add(amount);
            }
            assert_eq!(sum.total(), 1.0, "order {:?}", amounts);
        }

        let mut tenths = SpendSum::default();
        for _ in 0..10 {
            tenths.add(0.1);
        }
        assert_eq!(tenths.total(), 1.0);
        assert_eq!(SpendSum::default().total(), 0.0);
    }

    #[test]
    fn test_sum_landing_on_threshold_agrees() {
        let conn = open_in_memory().unwrap();
        record_profile(&conn, "a", "il").unwrap();
        record_store(&conn, "s").unwrap();

        // Inserted out of order on purpose
        for (minute, amount) in [(42, 0.3), (40, 0.1), (41, 0.2)] {
            record_purchase(&conn, "a", "s", at(2021, 5, 20, 10, minute), amount).unwrap();
        }

        let on_threshold = SpendQuery::new("s", may_window(), "il", 0.6);
        let (from_store, in_memory) = both(&conn, &on_threshold);
        assert!(from_store.is_empty());
        assert!(in_memory.is_empty());

        let below = SpendQuery::new("s", may_window(), "il", 0.5);
        let (from_store, in_memory) = both(&conn, &below);
        assert_eq!(from_store.len(), 1);
        assert_eq!(from_store[0].total_spent, 0.6);
        assert_eq!(from_store, in_memory);
    }

    #[test]
    fn test_requested_ordering() {
        let conn = open_in_memory().unwrap();
        record_store(&conn, "s").unwrap();
        let when = at(2021, 5, 20, 10, 40);
        for (id, amount) in [("b", 300.0), ("a", 100.0), ("c", 200.0)] {
            record_profile(&conn, id, "il").unwrap();
            record_purchase(&conn, id, "s", when, amount).unwrap();
        }

        let query = SpendQuery::new("s", may_window(), "il", 0.0);

        let by_total = total_spent_above(&conn, &query.clone().ordered_by(SpendOrder::TotalDescending)).unwrap();
        assert_eq!(ids(&by_total), vec!["b", "c", "a"]);

        let by_id = total_spent_above(&conn, &query.ordered_by(SpendOrder::ProfileId)).unwrap();
        assert_eq!(ids(&by_id), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_query_is_idempotent() {
        let conn = open_in_memory().unwrap();
        record_profile(&conn, "a", "il").unwrap();
        record_profile(&conn, "b", "il").unwrap();
        record_store(&conn, "s").unwrap();
        record_purchase(&conn, "a", "s", at(2021, 5, 20, 10, 40), 2500.0).unwrap();
        record_purchase(&conn, "b", "s", at(2021, 3, 1, 9, 0), 3100.0).unwrap();

        let query = SpendQuery::new("s", may_window(), "il", 2000.0).ordered_by(SpendOrder::ProfileId);
        let first = total_spent_above(&conn, &query).unwrap();
        let second = total_spent_above(&conn, &query).unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
    }

    #[test]
    fn test_spend_order_parse() {
        assert_eq!(SpendOrder::parse("total"), Some(SpendOrder::TotalDescending));
        assert_eq!(SpendOrder::parse("profile_id"), Some(SpendOrder::ProfileId));
        assert_eq!(SpendOrder::parse("none"), Some(SpendOrder::Unspecified));
        assert_eq!(SpendOrder::parse("random"), None);
    }

    #[test]
    fn test_report_summary() {
        let conn = open_in_memory().unwrap();
        record_profile(&conn, "a", "il").unwrap();
        record_store(&conn, "s").unwrap();
        record_purchase(&conn, "a", "s", at(2021, 5, 20, 10, 40), 2500.0).unwrap();

        let query = SpendQuery::new("s", may_window(), "il", 2000.0);
        let report = run_spend_report(&conn, &query).unwrap();

        assert!(!report.is_empty());
        assert_eq!(report.total_for("a"), Some(2500.0));
        assert_eq!(report.total_for("b"), None);
        assert!(report.summary().contains("1 profile(s)"));
        assert!(report.elapsed_ms >= 0.0);
    }
}
