// 📥 CSV Import - load profiles, stores and purchases from a directory
//
// Expected files (each optional, headers required):
//   profiles.csv   id,country
//   stores.csv     id
//   purchases.csv  profile_id,store_id,when,amount
//
// Importing the same directory twice inserts nothing new: existing profile
// and store ids are counted as skipped, and purchases carry an import key
// derived from their file and record number.

use crate::db::{create_profile, create_purchase, create_store};
use crate::entities::{parse_when, Profile, Purchase, Store};
use crate::error::GraphError;
use anyhow::{anyhow, Context, Result};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

const ACTOR: &str = "csv_importer";

pub const PROFILES_FILE: &str = "profiles.csv";
pub const STORES_FILE: &str = "stores.csv";
pub const PURCHASES_FILE: &str = "purchases.csv";

#[derive(Debug, Deserialize)]
struct ProfileRow {
    id: String,
    country: String,
}

#[derive(Debug, Deserialize)]
struct StoreRow {
    id: String,
}

#[derive(Debug, Deserialize)]
struct PurchaseRow {
    profile_id: String,
    store_id: String,
    when: String,
    amount: f64,
}

/// Inserted / skipped counts per entity kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub profiles_inserted: usize,
    pub profiles_skipped: usize,
    pub stores_inserted: usize,
    pub stores_skipped: usize,
    pub purchases_inserted: usize,
    pub purchases_skipped: usize,
}

impl ImportSummary {
    pub fn inserted(&self) -> usize {
        self.profiles_inserted + self.stores_inserted + self.purchases_inserted
    }

    pub fn skipped(&self) -> usize {
        self.profiles_skipped + self.stores_skipped + self.purchases_skipped
    }
}

pub fn load_profiles_csv(csv_path: &Path) -> Result<Vec<Profile>> {
    let mut rdr = csv::Reader::from_path(csv_path)
        .with_context(|| format!("Failed to open {}", csv_path.display()))?;

    let mut profiles = Vec::new();
    for (idx, result) in rdr.deserialize().enumerate() {
        let row: ProfileRow =
            result.with_context(|| format!("Failed to deserialize profile record {}", idx + 1))?;
        profiles.push(
            Profile::new(row.id, row.country)
                .with_context(|| format!("Invalid profile record {}", idx + 1))?,
        );
    }

    Ok(profiles)
}

pub fn load_stores_csv(csv_path: &Path) -> Result<Vec<Store>> {
    let mut rdr = csv::Reader::from_path(csv_path)
        .with_context(|| format!("Failed to open {}", csv_path.display()))?;

    let mut stores = Vec::new();
    for (idx, result) in rdr.deserialize().enumerate() {
        let row: StoreRow =
            result.with_context(|| format!("Failed to deserialize store record {}", idx + 1))?;
        stores.push(Store::new(row.id).with_context(|| format!("Invalid store record {}", idx + 1))?);
    }

    Ok(stores)
}

/// Load purchases, tagging each with an import key for idempotent re-runs
pub fn load_purchases_csv(csv_path: &Path) -> Result<Vec<Purchase>> {
    let mut rdr = csv::Reader::from_path(csv_path)
        .with_context(|| format!("Failed to open {}", csv_path.display()))?;
    // Keyed on the resolved path so `data`, `./data` and `data/.` agree
    let source = fs::canonicalize(csv_path)
        .with_context(|| format!("Failed to resolve {}", csv_path.display()))?
        .display()
        .to_string();

    let mut purchases = Vec::new();
    for (idx, result) in rdr.deserialize().enumerate() {
        let record = idx as u64 + 1;
        let row: PurchaseRow =
            result.with_context(|| format!("Failed to deserialize purchase record {}", record))?;

        let when = parse_when(&row.when)
            .ok_or_else(|| anyhow!("Invalid timestamp {:?} in purchase record {}", row.when, record))?;

        let purchase = Purchase::new(row.profile_id, row.store_id, when, row.amount)
            .with_context(|| format!("Invalid purchase record {}", record))?
            .with_import_key(&source, record);
        purchases.push(purchase);
    }

    Ok(purchases)
}

/// Insert profiles, counting already-present ids as skipped
pub fn insert_profiles(conn: &Connection, profiles: &[Profile]) -> Result<(usize, usize)> {
    let mut inserted = 0;
    let mut skipped = 0;

    for profile in profiles {
        match create_profile(conn, profile, ACTOR) {
            Ok(()) => inserted += 1,
            Err(GraphError::DuplicateEntity { .. }) => skipped += 1,
            Err(e) => return Err(e.into()),
        }
    }

    Ok((inserted, skipped))
}

pub fn insert_stores(conn: &Connection, stores: &[Store]) -> Result<(usize, usize)> {
    let mut inserted = 0;
    let mut skipped = 0;

    for store in stores {
        match create_store(conn, store, ACTOR) {
            Ok(()) => inserted += 1,
            Err(GraphError::DuplicateEntity { .. }) => skipped += 1,
            Err(e) => return Err(e.into()),
        }
    }

    Ok((inserted, skipped))
}

/// Insert purchases; a missing endpoint aborts the import
pub fn insert_purchases(conn: &Connection, purchases: &[Purchase]) -> Result<(usize, usize)> {
    let mut inserted = 0;
    let mut skipped = 0;

    for purchase in purchases {
        let fresh = create_purchase(conn, purchase, ACTOR).with_context(|| {
            format!(
                "Failed to import purchase {} → {}",
                purchase.profile_id, purchase.store_id
            )
        })?;
        if fresh {
            inserted += 1;
        } else {
            skipped += 1;
        }
    }

    Ok((inserted, skipped))
}

/// Import every known CSV file found in `dir`, endpoints first
pub fn import_directory(conn: &Connection, dir: &Path) -> Result<ImportSummary> {
    if !dir.is_dir() {
        return Err(anyhow!("Import directory not found: {}", dir.display()));
    }

    let mut summary = ImportSummary::default();

    let profiles_path = dir.join(PROFILES_FILE);
    if profiles_path.exists() {
        let profiles = load_profiles_csv(&profiles_path)?;
        let (inserted, skipped) = insert_profiles(conn, &profiles)?;
        summary.profiles_inserted = inserted;
        summary.profiles_skipped = skipped;
    } else {
        warn!(path = %profiles_path.display(), "no profiles file, skipping");
    }

    let stores_path = dir.join(STORES_FILE);
    if stores_path.exists() {
        let stores = load_stores_csv(&stores_path)?;
        let (inserted, skipped) = insert_stores(conn, &stores)?;
        summary.stores_inserted = inserted;
        summary.stores_skipped = skipped;
    } else {
        warn!(path = %stores_path.display(), "no stores file, skipping");
    }

    let purchases_path = dir.join(PURCHASES_FILE);
    if purchases_path.exists() {
        let purchases = load_purchases_csv(&purchases_path)?;
        let (inserted, skipped) = insert_purchases(conn, &purchases)?;
        summary.purchases_inserted = inserted;
        summary.purchases_skipped = skipped;
    } else {
        warn!(path = %purchases_path.display(), "no purchases file, skipping");
    }

    info!(
        dir = %dir.display(),
        inserted = summary.inserted(),
        skipped = summary.skipped(),
        "import finished"
    );

    Ok(summary)
}
