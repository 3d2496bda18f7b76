//! Table definitions, seeded enumerations, and the per-reference delete policy.
//!
//! Lookup tables carry a `name_key` column holding the Unicode lowercase form
//! of the name. Uniqueness and name lookups go through it, since `NOCASE`
//! only folds ASCII.
//!
//! Foreign keys are declared without `ON DELETE` actions. The repositories
//! apply [`FOREIGN_KEYS`] explicitly, and `PRAGMA foreign_keys=ON` rejects any
//! delete that leaves a dangling reference the table below does not cover.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use trackdb_core::HistoryError;

use crate::error::Result;

/// Version written to `database_versions` when a store is created.
pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS database_versions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    version INTEGER NOT NULL CHECK (version > 0)
);

CREATE TABLE IF NOT EXISTS countries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    name_key TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS manufacturers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    name_key TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS models (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    name_key TEXT NOT NULL UNIQUE,
    manufacturer_id INTEGER REFERENCES manufacturers(id)
);

CREATE TABLE IF NOT EXISTS receivers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    name_key TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS species (
    id INTEGER PRIMARY KEY,
    description TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS engine_types (
    id INTEGER PRIMARY KEY,
    description TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS engine_placements (
    id INTEGER PRIMARY KEY,
    description TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS wake_turbulence_categories (
    id INTEGER PRIMARY KEY,
    description TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS aircraft_types (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    icao_type_code TEXT NOT NULL,
    name_key TEXT NOT NULL UNIQUE,
    manufacturer_id INTEGER REFERENCES manufacturers(id),
    model_id INTEGER REFERENCES models(id),
    species_id INTEGER REFERENCES species(id),
    engine_type_id INTEGER REFERENCES engine_types(id),
    engine_placement_id INTEGER REFERENCES engine_placements(id),
    wake_turbulence_category_id INTEGER REFERENCES wake_turbulence_categories(id),
    engine_count INTEGER
);

CREATE TABLE IF NOT EXISTS aircraft (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    icao24 TEXT NOT NULL UNIQUE COLLATE NOCASE,
    registration TEXT,
    serial TEXT,
    year_built INTEGER,
    country_id INTEGER REFERENCES countries(id),
    model_id INTEGER REFERENCES models(id),
    aircraft_type_id INTEGER REFERENCES aircraft_types(id),
    created_utc INTEGER NOT NULL,
    updated_utc INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS track_histories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    aircraft_id INTEGER NOT NULL REFERENCES aircraft(id),
    receiver_id INTEGER REFERENCES receivers(id),
    start_time INTEGER NOT NULL,
    is_preserved INTEGER NOT NULL DEFAULT 0,
    created_utc INTEGER NOT NULL,
    updated_utc INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS track_history_states (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    track_history_id INTEGER NOT NULL REFERENCES track_histories(id),
    sequence_number INTEGER NOT NULL CHECK (sequence_number > 0),
    timestamp INTEGER NOT NULL,
    latitude REAL,
    longitude REAL,
    altitude_feet INTEGER,
    ground_speed_knots REAL,
    track_degrees REAL,
    vertical_rate_fpm INTEGER,
    squawk TEXT,
    callsign TEXT,
    is_on_ground INTEGER,
    UNIQUE (track_history_id, sequence_number)
);

CREATE INDEX IF NOT EXISTS idx_models_manufacturer ON models(manufacturer_id);
CREATE INDEX IF NOT EXISTS idx_aircraft_country ON aircraft(country_id);
CREATE INDEX IF NOT EXISTS idx_aircraft_model ON aircraft(model_id);
CREATE INDEX IF NOT EXISTS idx_aircraft_type ON aircraft(aircraft_type_id);
CREATE INDEX IF NOT EXISTS idx_track_histories_aircraft ON track_histories(aircraft_id);
CREATE INDEX IF NOT EXISTS idx_track_histories_receiver ON track_histories(receiver_id);
CREATE INDEX IF NOT EXISTS idx_track_histories_start ON track_histories(start_time);
CREATE INDEX IF NOT EXISTS idx_track_history_states_timestamp ON track_history_states(timestamp);
"#;

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Country,
    Manufacturer,
    Model,
    Receiver,
    Species,
    EngineType,
    EnginePlacement,
    WakeTurbulenceCategory,
    AircraftType,
    Aircraft,
    TrackHistory,
    TrackHistoryState,
}

impl Table {
    pub const fn name(self) -> &'static str {
        match self {
            Table::Country => "countries",
            Table::Manufacturer => "manufacturers",
            Table::Model => "models",
            Table::Receiver => "receivers",
            Table::Species => "species",
            Table::EngineType => "engine_types",
            Table::EnginePlacement => "engine_placements",
            Table::WakeTurbulenceCategory => "wake_turbulence_categories",
            Table::AircraftType => "aircraft_types",
            Table::Aircraft => "aircraft",
            Table::TrackHistory => "track_histories",
            Table::TrackHistoryState => "track_history_states",
        }
    }
}

// ---------------------------------------------------------------------------
// Delete policy
// ---------------------------------------------------------------------------

/// What happens to a referencing row when its parent is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDelete {
    /// Delete the child row along with the parent.
    Cascade,
    /// Keep the child row and set its reference to NULL.
    Nullify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignKey {
    pub child: Table,
    pub column: &'static str,
    pub parent: Table,
    pub on_delete: OnDelete,
}

const fn fk(child: Table, column: &'static str, parent: Table, on_delete: OnDelete) -> ForeignKey {
    ForeignKey {
        child,
        column,
        parent,
        on_delete,
    }
}

/// Every foreign key in the schema and its delete rule.
pub const FOREIGN_KEYS: &[ForeignKey] = &[
    fk(Table::Model, "manufacturer_id", Table::Manufacturer, OnDelete::Nullify),
    fk(Table::AircraftType, "manufacturer_id", Table::Manufacturer, OnDelete::Nullify),
    fk(Table::AircraftType, "model_id", Table::Model, OnDelete::Nullify),
    fk(Table::AircraftType, "species_id", Table::Species, OnDelete::Nullify),
    fk(Table::AircraftType, "engine_type_id", Table::EngineType, OnDelete::Nullify),
    fk(Table::AircraftType, "engine_placement_id", Table::EnginePlacement, OnDelete::Nullify),
    fk(
        Table::AircraftType,
        "wake_turbulence_category_id",
        Table::WakeTurbulenceCategory,
        OnDelete::Nullify,
    ),
    fk(Table::Aircraft, "country_id", Table::Country, OnDelete::Nullify),
    fk(Table::Aircraft, "model_id", Table::Model, OnDelete::Nullify),
    fk(Table::Aircraft, "aircraft_type_id", Table::AircraftType, OnDelete::Nullify),
    fk(Table::TrackHistory, "aircraft_id", Table::Aircraft, OnDelete::Cascade),
    fk(Table::TrackHistory, "receiver_id", Table::Receiver, OnDelete::Nullify),
    fk(Table::TrackHistoryState, "track_history_id", Table::TrackHistory, OnDelete::Cascade),
];

/// Foreign keys pointing at `parent` with the given rule.
pub fn references_to(parent: Table, on_delete: OnDelete) -> impl Iterator<Item = &'static ForeignKey> {
    FOREIGN_KEYS
        .iter()
        .filter(move |k| k.parent == parent && k.on_delete == on_delete)
}

/// Set every nullable reference to `parent` row `id` to NULL. Returns rows updated.
pub(crate) fn nullify_references(conn: &Connection, parent: Table, id: i64) -> Result<usize> {
    let mut updated = 0;
    for key in references_to(parent, OnDelete::Nullify) {
        let sql = format!(
            "UPDATE {table} SET {column} = NULL WHERE {column} = ?1",
            table = key.child.name(),
            column = key.column
        );
        updated += conn.execute(&sql, params![id])?;
    }
    Ok(updated)
}

fn is_referenced(table: Table) -> bool {
    FOREIGN_KEYS.iter().any(|k| k.parent == table)
}

/// Delete row `id` of `table` by the rules in [`FOREIGN_KEYS`]: owned rows go
/// first, depth first, then the remaining references are nulled. Returns
/// whether the row itself existed.
pub(crate) fn delete_row(conn: &Connection, table: Table, id: i64) -> Result<bool> {
    let mut cascaded = 0;
    for key in references_to(table, OnDelete::Cascade) {
        if is_referenced(key.child) {
            let sql = format!("SELECT id FROM {} WHERE {} = ?1", key.child.name(), key.column);
            let mut stmt = conn.prepare(&sql)?;
            let children = stmt
                .query_map(params![id], |r| r.get::<_, i64>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            for child in children {
                if delete_row(conn, key.child, child)? {
                    cascaded += 1;
                }
            }
        } else {
            let sql = format!("DELETE FROM {} WHERE {} = ?1", key.child.name(), key.column);
            cascaded += conn.execute(&sql, params![id])?;
        }
    }
    let nulled = nullify_references(conn, table, id)?;
    let sql = format!("DELETE FROM {} WHERE id = ?1", table.name());
    let deleted = conn.execute(&sql, params![id])? > 0;
    if deleted {
        debug!(table = table.name(), id, cascaded, nulled, "deleted row");
    }
    Ok(deleted)
}

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

pub const SPECIES: &[(i64, &str)] = &[
    (0, "None"),
    (1, "Land Plane"),
    (2, "Sea Plane"),
    (3, "Amphibian"),
    (4, "Helicopter"),
    (5, "Gyrocopter"),
    (6, "Tiltwing"),
    (7, "Ground Vehicle"),
    (8, "Tower"),
];

pub const ENGINE_TYPES: &[(i64, &str)] = &[
    (0, "None"),
    (1, "Piston"),
    (2, "Turbo"),
    (3, "Jet"),
    (4, "Electric"),
    (5, "Rocket"),
];

pub const ENGINE_PLACEMENTS: &[(i64, &str)] = &[
    (0, "Unknown"),
    (1, "Aft Mounted"),
    (2, "Wing Buried"),
    (3, "Fuselage Buried"),
    (4, "Nose Mounted"),
    (5, "Wing Mounted"),
];

pub const WAKE_TURBULENCE_CATEGORIES: &[(i64, &str)] = &[
    (0, "None"),
    (1, "Light"),
    (2, "Medium"),
    (3, "Heavy"),
    (4, "Super"),
];

/// Seed rows for each enumeration table.
pub const ENUMERATIONS: &[(Table, &[(i64, &str)])] = &[
    (Table::Species, SPECIES),
    (Table::EngineType, ENGINE_TYPES),
    (Table::EnginePlacement, ENGINE_PLACEMENTS),
    (Table::WakeTurbulenceCategory, WAKE_TURBULENCE_CATEGORIES),
];

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Timestamps are stored as nanoseconds since the Unix epoch, so a saved value
/// reads back unchanged. The representable range is 1677 to 2262.
pub(crate) fn to_nanos(t: &DateTime<Utc>) -> Result<i64> {
    t.timestamp_nanos_opt().ok_or_else(|| {
        HistoryError::OutOfRange {
            field: "timestamp",
            value: t.to_rfc3339(),
        }
        .into()
    })
}

/// Query bound for `t`, saturating outside the storable range.
pub(crate) fn bound_nanos(t: &DateTime<Utc>) -> i64 {
    match t.timestamp_nanos_opt() {
        Some(ns) => ns,
        None if t.timestamp() < 0 => i64::MIN,
        None => i64::MAX,
    }
}

pub(crate) fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ns: i64 = row.get(idx)?;
    Ok(DateTime::from_timestamp_nanos(ns))
}

// ---------------------------------------------------------------------------
// Initialisation
// ---------------------------------------------------------------------------

/// Create all tables, seed enumerations and write the version row.
///
/// Idempotent; the version row is only written once.
pub(crate) fn initialise(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;

    for (table, rows) in ENUMERATIONS {
        let sql = format!(
            "INSERT OR IGNORE INTO {} (id, description) VALUES (?1, ?2)",
            table.name()
        );
        let mut stmt = conn.prepare(&sql)?;
        for (id, description) in rows.iter() {
            stmt.execute(params![id, description])?;
        }
    }

    let versions: i64 =
        conn.query_row("SELECT COUNT(*) FROM database_versions", [], |r| r.get(0))?;
    if versions == 0 {
        conn.execute(
            "INSERT INTO database_versions (version) VALUES (?1)",
            params![SCHEMA_VERSION],
        )?;
    }
    Ok(())
}

/// True when the store holds no user tables at all.
pub(crate) fn is_empty(conn: &Connection) -> Result<bool> {
    let tables: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        [],
        |r| r.get(0),
    )?;
    Ok(tables == 0)
}

pub(crate) fn count_rows(conn: &Connection, table: Table) -> Result<i64> {
    let sql = format!("SELECT COUNT(*) FROM {}", table.name());
    Ok(conn.query_row(&sql, [], |r| r.get(0))?)
}

/// Highest recorded schema version, `None` if the version table is missing.
pub(crate) fn schema_version(conn: &Connection) -> Result<Option<i64>> {
    let has_table = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'database_versions'",
            [],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    if !has_table {
        return Ok(None);
    }
    let version = conn.query_row("SELECT MAX(version) FROM database_versions", [], |r| {
        r.get::<_, Option<i64>>(0)
    })?;
    Ok(version)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
