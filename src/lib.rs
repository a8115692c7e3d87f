// Spend Graph - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod aggregator;
pub mod config;
pub mod db;
pub mod entities;
pub mod error;
pub mod import;
pub mod logging;
pub mod scenario;

// Re-export commonly used types
pub use aggregator::{
    run_spend_report, total_spent_above, total_spent_above_in_memory,
    ProfileSpend, SpendOrder, SpendQuery, SpendReport, TimeWindow,
};
pub use config::Config;
pub use db::{
    Event, GraphCounts,
    open_database, open_in_memory, setup_database,
    create_profile, create_store, create_purchase,
    record_profile, record_store, record_purchase,
    get_profile, get_store, get_all_profiles, get_all_purchases, get_purchases_for_store,
    verify_counts, insert_event, get_events_for_entity,
};
pub use entities::{parse_when, Profile, Purchase, Store};
pub use error::{EntityKind, GraphError, GraphResult};
pub use import::{import_directory, ImportSummary};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
