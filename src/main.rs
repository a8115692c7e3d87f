use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use spend_graph::aggregator::{run_spend_report, SpendOrder, SpendQuery, SpendReport, TimeWindow};
use spend_graph::db::{get_events_for_entity, open_database, open_in_memory, record_profile, record_purchase, record_store, verify_counts};
use spend_graph::logging::init_tracing;
use spend_graph::{import_directory, parse_when, scenario, Config};

#[derive(Parser, Debug)]
#[command(author, version, about = "Profiles, stores and windowed spend totals")]
struct Cli {
    /// Database file (overrides SPEND_GRAPH_DB)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the schema if it does not exist
    Init,
    /// Record a profile
    AddProfile { id: String, country: String },
    /// Record a store
    AddStore { id: String },
    /// Record a purchase (WHEN: RFC 3339 or YYYY-MM-DDTHH:MM[:SS], read as UTC)
    AddPurchase {
        profile_id: String,
        store_id: String,
        when: String,
        amount: f64,
    },
    /// Import profiles.csv, stores.csv and purchases.csv from a directory
    Import { dir: PathBuf },
    /// Profiles of COUNTRY that spent more than THRESHOLD at STORE in [FROM, TO)
    Query {
        #[arg(long)]
        store: String,
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        country: String,
        #[arg(long, allow_negative_numbers = true)]
        threshold: f64,
        /// unspecified | total | profile
        #[arg(long, default_value = "unspecified")]
        order: String,
        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Audit events for one entity (profile, store or purchase)
    Events { entity_type: String, entity_id: String },
    /// Run the reference scenario against an in-memory store
    Demo {
        #[arg(long)]
        json: bool,
    },
}

fn parse_instant(label: &str, value: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    parse_when(value).ok_or_else(|| anyhow!("Invalid {} timestamp: {:?}", label, value))
}

fn print_report(report: &SpendReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("📊 {}", report.summary());
    if report.is_empty() {
        println!("   (no profiles matched)");
    }
    for row in &report.results {
        println!(
            "   {:<20} {:<6} {:>12.2}",
            row.profile.id, row.profile.country, row.total_spent
        );
    }
    Ok(())
}

fn run_demo(json: bool) -> Result<()> {
    let conn = open_in_memory()?;
    scenario::seed_reference_scenario(&conn)?;
    let report = run_spend_report(&conn, &scenario::reference_query())?;
    print_report(&report, json)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    init_tracing(&config.log_filter);

    if let Some(db) = cli.db {
        config.database_path = db;
    }

    // The demo never touches the configured database
    if let Command::Demo { json } = cli.command {
        return run_demo(json);
    }

    let conn = open_database(&config.database_path)
        .with_context(|| format!("Failed to open {}", config.database_path.display()))?;

    match cli.command {
        Command::Init => {
            let counts = verify_counts(&conn)?;
            println!("✓ Database ready: {}", config.database_path.display());
            println!(
                "  {} profiles, {} stores, {} purchases",
                counts.profiles, counts.stores, counts.purchases
            );
        }
        Command::AddProfile { id, country } => {
            let profile = record_profile(&conn, &id, &country)?;
            println!("✓ Profile {} ({})", profile.id, profile.country);
        }
        Command::AddStore { id } => {
            let store = record_store(&conn, &id)?;
            println!("✓ Store {}", store.id);
        }
        Command::AddPurchase {
            profile_id,
            store_id,
            when,
            amount,
        } => {
            let when = parse_instant("purchase", &when)?;
            let purchase = record_purchase(&conn, &profile_id, &store_id, when, amount)?;
            println!(
                "✓ Purchase {}: {} → {} {:.2} at {}",
                purchase.purchase_id,
                purchase.profile_id,
                purchase.store_id,
                purchase.amount,
                purchase.when.to_rfc3339()
            );
        }
        Command::Import { dir } => {
            println!("📂 Importing from {}", dir.display());
            let summary = import_directory(&conn, &dir)?;
            println!(
                "✓ Profiles: {} inserted, {} skipped",
                summary.profiles_inserted, summary.profiles_skipped
            );
            println!(
                "✓ Stores: {} inserted, {} skipped",
                summary.stores_inserted, summary.stores_skipped
            );
            println!(
                "✓ Purchases: {} inserted, {} skipped",
                summary.purchases_inserted, summary.purchases_skipped
            );
        }
        Command::Query {
            store,
            from,
            to,
            country,
            threshold,
            order,
            json,
        } => {
            let order = SpendOrder::parse(&order)
                .ok_or_else(|| anyhow!("Unknown order {:?} (unspecified | total | profile)", order))?;
            let window = TimeWindow::new(parse_instant("from", &from)?, parse_instant("to", &to)?);
            let query = SpendQuery::new(store, window, country, threshold).ordered_by(order);

            let report = run_spend_report(&conn, &query)?;
            print_report(&report, json)?;
        }
        Command::Events {
            entity_type,
            entity_id,
        } => {
            let events = get_events_for_entity(&conn, &entity_type, &entity_id)?;
            if events.is_empty() {
                println!("(no events for {} {})", entity_type, entity_id);
            }
            for event in events {
                println!(
                    "{}  {:<18} {:<14} {}",
                    event.timestamp.to_rfc3339(),
                    event.event_type,
                    event.actor,
                    event.data
                );
            }
        }
        Command::Demo { json } => run_demo(json)?,
    }

    Ok(())
}
