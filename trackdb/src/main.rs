//! trackdb: command-line maintenance for the track-history store.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use clap::{Parser, Subcommand};
use comfy_table::{Cell, Table};
use tracing::info;
use tracing_subscriber::EnvFilter;

use trackdb::{DatabaseSingleton, Result, StoreError, TrackHistoryDatabase};
use trackdb_core::config;
use trackdb_core::{ConfigurationManager, ConfigurationProvider, DatabaseProvider, HistoryError};

#[derive(Parser)]
#[command(name = "trackdb", version, about = "Aircraft track-history store")]
struct Cli {
    /// Configuration file (default: ~/.trackdb/config.yaml)
    #[arg(long, global = true, env = "TRACKDB_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new, empty store
    Create {
        /// File path, or a SQLite URI with --connection-string
        location: String,

        /// Treat the location as a connection string
        #[arg(long)]
        connection_string: bool,
    },

    /// Show row counts for the configured store
    Stats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show an aircraft and its track histories
    Aircraft {
        /// ICAO 24-bit address (hex)
        icao: String,
    },

    /// Reduce histories not seen for N days to their first and last points
    TruncateExpired {
        #[arg(long, default_value = "7", value_parser = clap::value_parser!(i64).range(0..))]
        days: i64,
    },

    /// Delete histories not seen for N days
    DeleteExpired {
        #[arg(long, default_value = "30", value_parser = clap::value_parser!(i64).range(0..))]
        days: i64,
    },

    /// Show or change the database configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the current configuration
    Show,
    /// Use a database file
    SetFile { file_name: String },
    /// Use a SQLite connection string
    SetConnection { connection_string: String },
    /// Switch track recording on
    Enable,
    /// Switch track recording off
    Disable,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let manager = Arc::new(ConfigurationManager::from_file(
        cli.config.unwrap_or_else(config::config_file),
    ));

    let result = match cli.command {
        Commands::Create {
            location,
            connection_string,
        } => cmd_create(&location, connection_string),
        Commands::Stats { json } => with_database(&manager, |db| cmd_stats(db, json)),
        Commands::Aircraft { icao } => with_database(&manager, |db| cmd_aircraft(db, &icao)),
        Commands::TruncateExpired { days } => {
            with_database(&manager, |db| cmd_truncate_expired(db, days))
        }
        Commands::DeleteExpired { days } => {
            with_database(&manager, |db| cmd_delete_expired(db, days))
        }
        Commands::Config { action } => cmd_config(&manager, action),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Run `f` against the engine the configuration points at.
fn with_database(
    manager: &Arc<ConfigurationManager>,
    f: impl FnOnce(&TrackHistoryDatabase) -> Result<()>,
) -> Result<()> {
    let provider: Arc<dyn ConfigurationProvider> = manager.clone();
    let singleton = DatabaseSingleton::new(provider);
    singleton.initialise()?;
    let db = singleton
        .database()
        .ok_or_else(|| StoreError::invalid_state("database not initialised"))?;
    let result = f(db.as_ref());
    singleton.dispose();
    result
}

fn cmd_create(location: &str, connection_string: bool) -> Result<()> {
    let provider = if connection_string {
        DatabaseProvider::ConnectionString
    } else {
        DatabaseProvider::File
    };
    let db = TrackHistoryDatabase::create(provider, Some(location))?;
    println!("Created {} (schema v{})", db.backend(), db.stats()?.schema_version);
    Ok(())
}

fn cmd_stats(db: &TrackHistoryDatabase, json: bool) -> Result<()> {
    let stats = db.stats()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }
    println!();
    println!("Database: {}", db.backend());
    println!("  Schema version: {}", stats.schema_version);
    println!();
    println!("  Aircraft:        {}", stats.aircraft);
    println!("  Track histories: {}", stats.track_histories);
    println!("  States:          {}", stats.track_history_states);
    println!("  Aircraft types:  {}", stats.aircraft_types);
    println!("  Countries:       {}", stats.countries);
    println!("  Manufacturers:   {}", stats.manufacturers);
    println!("  Models:          {}", stats.models);
    println!("  Receivers:       {}", stats.receivers);
    println!();
    Ok(())
}

fn cmd_aircraft(db: &TrackHistoryDatabase, icao: &str) -> Result<()> {
    if !trackdb_core::is_valid_icao(icao) {
        return Err(HistoryError::OutOfRange {
            field: "icao",
            value: icao.to_string(),
        }
        .into());
    }
    let Some(aircraft) = db.aircraft().get_by_icao(icao)? else {
        println!("No aircraft {icao}");
        return Ok(());
    };

    println!();
    println!(
        "{}  {}",
        aircraft.icao24,
        aircraft.registration.as_deref().unwrap_or("-")
    );

    let histories = db.track_histories().get_by_aircraft_id(aircraft.id, None)?;
    if histories.is_empty() {
        println!("  No track histories");
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec!["ID", "Started", "States", "Last seen", "Receiver", "Preserved"]);
    for history in &histories {
        let states = db.track_history_states().get_by_track_history(history.id)?;
        let last_seen = states
            .last()
            .map(|s| s.timestamp.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".into());
        let receiver = match history.receiver_id {
            Some(id) => db
                .receivers()
                .get_by_id(id)?
                .map(|r| r.name)
                .unwrap_or_else(|| id.to_string()),
            None => "-".into(),
        };
        table.add_row(vec![
            Cell::new(history.id),
            Cell::new(history.start_time.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(states.len()),
            Cell::new(last_seen),
            Cell::new(receiver),
            Cell::new(if history.is_preserved { "yes" } else { "" }),
        ]);
    }
    println!("{table}");
    Ok(())
}

/// The instant `days` before now.
fn cutoff(days: i64) -> Result<DateTime<Utc>> {
    TimeDelta::try_days(days)
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .ok_or_else(|| {
            HistoryError::OutOfRange {
                field: "days",
                value: days.to_string(),
            }
            .into()
        })
}

fn cmd_truncate_expired(db: &TrackHistoryDatabase, days: i64) -> Result<()> {
    let cutoff = cutoff(days)?;
    let truncated = db.track_histories().truncate_expired(&cutoff)?;
    info!(truncated, days, "truncate complete");
    println!("Truncated {truncated} track histories last seen before {cutoff}");
    Ok(())
}

fn cmd_delete_expired(db: &TrackHistoryDatabase, days: i64) -> Result<()> {
    let cutoff = cutoff(days)?;
    let deleted = db.track_histories().delete_expired(&cutoff)?;
    if deleted > 0 {
        db.vacuum()?;
    }
    info!(deleted, days, "delete complete");
    println!("Deleted {deleted} track histories last seen before {cutoff}");
    Ok(())
}

fn cmd_config(manager: &ConfigurationManager, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            if let Some(path) = manager.path() {
                println!("# {}", path.display());
            }
            print!("{}", config::serialize_config(&manager.load()));
            return Ok(());
        }
        ConfigAction::SetFile { file_name } => manager.update(|c| {
            c.database.provider = DatabaseProvider::File;
            c.database.file_name = file_name;
        }),
        ConfigAction::SetConnection { connection_string } => manager.update(|c| {
            c.database.provider = DatabaseProvider::ConnectionString;
            c.database.connection_string = connection_string;
        }),
        ConfigAction::Enable => manager.update(|c| c.database.enabled = true),
        ConfigAction::Disable => manager.update(|c| c.database.enabled = false),
    }
    manager.save()?;
    Ok(())
}
