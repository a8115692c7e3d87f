use crate::aggregator::register_spend_sum;
use crate::entities::{from_micros, Profile, Purchase, Store};
use crate::error::{EntityKind, GraphError, GraphResult};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Actor recorded on events when the caller does not name one
pub const DEFAULT_ACTOR: &str = "spend_graph";

/// Event for audit trail (every insert is an event)
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

/// Row counts per table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GraphCounts {
    pub profiles: i64,
    pub stores: i64,
    pub purchases: i64,
}

/// Open (or create) a database file and make sure the schema exists
pub fn open_database(path: &Path) -> GraphResult<Connection> {
    let conn = Connection::open(path).map_err(|source| GraphError::Connectivity {
        path: path.to_path_buf(),
        source,
    })?;
    // SQLite may defer I/O failures to the first statement
    setup_database(&conn).map_err(|e| match e {
        GraphError::Store(source) => GraphError::Connectivity {
            path: path.to_path_buf(),
            source,
        },
        other => other,
    })?;
    debug!(path = %path.display(), "store opened");
    Ok(conn)
}

/// Fresh in-memory store with the schema applied
pub fn open_in_memory() -> GraphResult<Connection> {
    let conn = Connection::open_in_memory().map_err(|source| GraphError::Connectivity {
        path: ":memory:".into(),
        source,
    })?;
    setup_database(&conn)?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> GraphResult<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    register_spend_sum(conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS profiles (
            id TEXT PRIMARY KEY NOT NULL,
            country TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS stores (
            id TEXT PRIMARY KEY NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // `when_micros` is an integer so range predicates compare exactly
    conn.execute(
        "CREATE TABLE IF NOT EXISTS purchases (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            purchase_id TEXT UNIQUE NOT NULL,
            profile_id TEXT NOT NULL REFERENCES profiles(id),
            store_id TEXT NOT NULL REFERENCES stores(id),
            when_micros INTEGER NOT NULL,
            amount REAL NOT NULL CHECK (amount >= 0),
            import_key TEXT UNIQUE,
            recorded_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_purchases_store_when ON purchases(store_id, when_micros)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_purchases_profile ON purchases(profile_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_profiles_country ON profiles(country)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// WRITES
// ============================================================================

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

/// Insert a profile and its creation event atomically
pub fn create_profile(conn: &Connection, profile: &Profile, actor: &str) -> GraphResult<()> {
    let tx = conn.unchecked_transaction()?;

    let result = tx.execute(
        "INSERT INTO profiles (id, country, created_at) VALUES (?1, ?2, ?3)",
        params![profile.id, profile.country, profile.created_at.to_rfc3339()],
    );

    match result {
        Ok(_) => {}
        Err(e) if is_constraint_violation(&e) => {
            return Err(GraphError::DuplicateEntity {
                kind: EntityKind::Profile,
                id: profile.id.clone(),
            });
        }
        Err(e) => return Err(e.into()),
    }

    let event = Event::new(
        "profile_created",
        EntityKind::Profile.as_str(),
        &profile.id,
        serde_json::json!({ "country": profile.country }),
        actor,
    );
    insert_event(&tx, &event)?;
    tx.commit()?;

    debug!(profile_id = %profile.id, country = %profile.country, "profile created");
    Ok(())
}

/// Insert a store and its creation event atomically
pub fn create_store(conn: &Connection, store: &Store, actor: &str) -> GraphResult<()> {
    let tx = conn.unchecked_transaction()?;

    let result = tx.execute(
        "INSERT INTO stores (id, created_at) VALUES (?1, ?2)",
        params![store.id, store.created_at.to_rfc3339()],
    );

    match result {
        Ok(_) => {}
        Err(e) if is_constraint_violation(&e) => {
            return Err(GraphError::DuplicateEntity {
                kind: EntityKind::Store,
                id: store.id.clone(),
            });
        }
        Err(e) => return Err(e.into()),
    }

    let event = Event::new(
        "store_created",
        EntityKind::Store.as_str(),
        &store.id,
        serde_json::json!({}),
        actor,
    );
    insert_event(&tx, &event)?;
    tx.commit()?;

    debug!(store_id = %store.id, "store created");
    Ok(())
}

/// Insert a purchase edge after checking both endpoints exist
///
/// Returns `false` when the purchase carries an import key that was already
/// recorded (nothing is written in that case).
pub fn create_purchase(conn: &Connection, purchase: &Purchase, actor: &str) -> GraphResult<bool> {
    let tx = conn.unchecked_transaction()?;

    if !profile_exists(&tx, &purchase.profile_id)? {
        return Err(GraphError::MissingEndpoint {
            kind: EntityKind::Profile,
            id: purchase.profile_id.clone(),
        });
    }
    if !store_exists(&tx, &purchase.store_id)? {
        return Err(GraphError::MissingEndpoint {
            kind: EntityKind::Store,
            id: purchase.store_id.clone(),
        });
    }

    // import_key conflicts are absorbed by ON CONFLICT, so a remaining
    // UNIQUE failure can only be purchase_id
    let result = tx.execute(
        "INSERT INTO purchases (
            purchase_id, profile_id, store_id, when_micros, amount, import_key, recorded_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(import_key) DO NOTHING",
        params![
            purchase.purchase_id,
            purchase.profile_id,
            purchase.store_id,
            purchase.when_micros(),
            purchase.amount,
            purchase.import_key,
            purchase.recorded_at.to_rfc3339(),
        ],
    );

    let inserted = match result {
        Ok(n) => n,
        Err(e) if is_unique_violation(&e) => {
            return Err(GraphError::DuplicateEntity {
                kind: EntityKind::Purchase,
                id: purchase.purchase_id.clone(),
            });
        }
        Err(e) => return Err(e.into()),
    };

    if inserted == 0 {
        debug!(purchase_id = %purchase.purchase_id, "purchase already imported, skipped");
        return Ok(false);
    }

    let event = Event::new(
        "purchase_recorded",
        EntityKind::Purchase.as_str(),
        &purchase.purchase_id,
        serde_json::json!({
            "profile_id": purchase.profile_id,
            "store_id": purchase.store_id,
            "when": purchase.when.to_rfc3339(),
            "amount": purchase.amount,
        }),
        actor,
    );
    insert_event(&tx, &event)?;
    tx.commit()?;

    debug!(
        purchase_id = %purchase.purchase_id,
        profile_id = %purchase.profile_id,
        store_id = %purchase.store_id,
        amount = purchase.amount,
        "purchase recorded"
    );
    Ok(true)
}

/// Build and insert a profile in one call
pub fn record_profile(conn: &Connection, id: &str, country: &str) -> GraphResult<Profile> {
    let profile = Profile::new(id, country)?;
    create_profile(conn, &profile, DEFAULT_ACTOR)?;
    Ok(profile)
}

/// Build and insert a store in one call
pub fn record_store(conn: &Connection, id: &str) -> GraphResult<Store> {
    let store = Store::new(id)?;
    create_store(conn, &store, DEFAULT_ACTOR)?;
    Ok(store)
}

/// Build and insert a purchase in one call
pub fn record_purchase(
    conn: &Connection,
    profile_id: &str,
    store_id: &str,
    when: DateTime<Utc>,
    amount: f64,
) -> GraphResult<Purchase> {
    let purchase = Purchase::new(profile_id, store_id, when, amount)?;
    create_purchase(conn, &purchase, DEFAULT_ACTOR)?;
    Ok(purchase)
}

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> GraphResult<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

// ============================================================================
// READS
// ============================================================================

fn parse_timestamp(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn profile_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Profile> {
    let created_at: String = row.get(2)?;
    Ok(Profile {
        id: row.get(0)?,
        country: row.get(1)?,
        created_at: parse_timestamp(2, &created_at)?,
    })
}

fn purchase_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Purchase> {
    let when_micros: i64 = row.get(3)?;
    let recorded_at: String = row.get(6)?;

    Ok(Purchase {
        purchase_id: row.get(0)?,
        profile_id: row.get(1)?,
        store_id: row.get(2)?,
        when: from_micros(when_micros).ok_or(rusqlite::Error::IntegralValueOutOfRange(3, when_micros))?,
        amount: row.get(4)?,
        import_key: row.get(5)?,
        recorded_at: parse_timestamp(6, &recorded_at)?,
    })
}

pub fn profile_exists(conn: &Connection, id: &str) -> GraphResult<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM profiles WHERE id = ?1", [id], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

pub fn store_exists(conn: &Connection, id: &str) -> GraphResult<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM stores WHERE id = ?1", [id], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

pub fn get_profile(conn: &Connection, id: &str) -> GraphResult<Option<Profile>> {
    let profile = conn
        .query_row(
            "SELECT id, country, created_at FROM profiles WHERE id = ?1",
            [id],
            profile_from_row,
        )
        .optional()?;
    Ok(profile)
}

pub fn get_store(conn: &Connection, id: &str) -> GraphResult<Option<Store>> {
    let store = conn
        .query_row(
            "SELECT id, created_at FROM stores WHERE id = ?1",
            [id],
            |row| {
                let created_at: String = row.get(1)?;
                Ok(Store {
                    id: row.get(0)?,
                    created_at: parse_timestamp(1, &created_at)?,
                })
            },
        )
        .optional()?;
    Ok(store)
}

pub fn get_all_profiles(conn: &Connection) -> GraphResult<Vec<Profile>> {
    let mut stmt = conn.prepare("SELECT id, country, created_at FROM profiles ORDER BY id")?;

    let profiles = stmt
        .query_map([], profile_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(profiles)
}

pub fn get_all_purchases(conn: &Connection) -> GraphResult<Vec<Purchase>> {
    let mut stmt = conn.prepare(
        "SELECT purchase_id, profile_id, store_id, when_micros, amount, import_key, recorded_at
         FROM purchases
         ORDER BY id",
    )?;

    let purchases = stmt
        .query_map([], purchase_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(purchases)
}

/// All incoming purchase edges of a store, oldest first
pub fn get_purchases_for_store(conn: &Connection, store_id: &str) -> GraphResult<Vec<Purchase>> {
    let mut stmt = conn.prepare(
        "SELECT purchase_id, profile_id, store_id, when_micros, amount, import_key, recorded_at
         FROM purchases
         WHERE store_id = ?1
         ORDER BY when_micros, id",
    )?;

    let purchases = stmt
        .query_map([store_id], purchase_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(purchases)
}

pub fn verify_counts(conn: &Connection) -> GraphResult<GraphCounts> {
    let count = |table: &str| -> GraphResult<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", table);
        Ok(conn.query_row(&sql, [], |row| row.get(0))?)
    };

    Ok(GraphCounts {
        profiles: count("profiles")?,
        stores: count("stores")?,
        purchases: count("purchases")?,
    })
}

/// Get events for a specific entity, newest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> GraphResult<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp DESC, id DESC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: parse_timestamp(1, &timestamp_str)?,
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e))
                })?,
                actor: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}
