// Reference data set: four profiles, one store, five purchases.
//
// profile1's purchase is stamped "now" and falls outside the May 2021
// window; profile2 sums to 2000.01 but is from "us"; profile3 stays below
// the threshold. Only profile4 (il, 2000.63) qualifies.

use crate::aggregator::{SpendQuery, TimeWindow};
use crate::db::{record_profile, record_purchase, record_store};
use crate::error::GraphResult;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;

pub const STORE_ID: &str = "store1";
pub const COUNTRY: &str = "il";
pub const THRESHOLD: f64 = 2000.0;

// Only called with the fixed calendar dates below
fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, 0)
        .single()
        .expect("reference timestamps are valid UTC dates")
}

/// `[2021-02-01T10:41, 2021-06-01T10:40)`
pub fn reference_window() -> TimeWindow {
    TimeWindow::new(utc(2021, 2, 1, 10, 41), utc(2021, 6, 1, 10, 40))
}

pub fn reference_query() -> SpendQuery {
    SpendQuery::new(STORE_ID, reference_window(), COUNTRY, THRESHOLD)
}

/// Insert the reference data set into an empty store
pub fn seed_reference_scenario(conn: &Connection) -> GraphResult<()> {
    record_profile(conn, "profile1", "il")?;
    record_profile(conn, "profile2", "us")?;
    record_profile(conn, "profile3", "us")?;
    record_profile(conn, "profile4", "il")?;

    record_store(conn, STORE_ID)?;

    record_purchase(conn, "profile1", STORE_ID, Utc::now(), 2200.0)?;
    record_purchase(conn, "profile2", STORE_ID, utc(2021, 5, 20, 10, 40), 100.00)?;
    record_purchase(conn, "profile2", STORE_ID, utc(2021, 5, 20, 10, 41), 1900.01)?;
    record_purchase(conn, "profile3", STORE_ID, utc(2021, 5, 20, 10, 40), 1999.63)?;
    record_purchase(conn, "profile4", STORE_ID, utc(2021, 5, 20, 10, 40), 2000.63)?;

    Ok(())
}
