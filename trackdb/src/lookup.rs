//! Name-keyed lookup tables and read-only enumerations.
//!
//! Countries, manufacturers, models, receivers and aircraft types are matched
//! by name (the ICAO designator for types) without regard to case, through the
//! folded `name_key` column. Deleting one nulls every reference to it; deleting
//! an absent row is a no-op.

use std::marker::PhantomData;
use std::sync::Arc;

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::debug;

use trackdb_core::{
    AircraftType, Country, EnumerationRow, HistoryError, Manufacturer, Model, Receiver, UNSAVED_ID,
};

use crate::engine::TrackHistoryDatabase;
use crate::error::{Result, StoreError};
use crate::schema::{self, Table};

/// A lookup row identified by a case-insensitive unique name.
pub trait NamedEntity: Sized {
    const TABLE: Table;
    /// Selected columns, `id` and the name column first.
    const COLUMNS: &'static [&'static str];

    fn id(&self) -> i64;
    fn set_id(&mut self, id: i64);
    fn name(&self) -> &str;
    /// New unsaved row with only a name.
    fn named(name: &str) -> Self;
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;
    /// Values for `COLUMNS` after `id`, in order.
    fn values(&self) -> Vec<Value>;
}

impl NamedEntity for Country {
    const TABLE: Table = Table::Country;
    const COLUMNS: &'static [&'static str] = &["id", "name"];

    fn id(&self) -> i64 {
        self.id
    }
    fn set_id(&mut self, id: i64) {
        self.id = id;
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn named(name: &str) -> Self {
        Country {
            id: 0,
            name: name.to_string(),
        }
    }
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Country {
            id: row.get(0)?,
            name: row.get(1)?,
        })
    }
    fn values(&self) -> Vec<Value> {
        vec![Value::Text(self.name.clone())]
    }
}

impl NamedEntity for Manufacturer {
    const TABLE: Table = Table::Manufacturer;
    const COLUMNS: &'static [&'static str] = &["id", "name"];

    fn id(&self) -> i64 {
        self.id
    }
    fn set_id(&mut self, id: i64) {
        self.id = id;
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn named(name: &str) -> Self {
        Manufacturer {
            id: 0,
            name: name.to_string(),
        }
    }
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Manufacturer {
            id: row.get(0)?,
            name: row.get(1)?,
        })
    }
    fn values(&self) -> Vec<Value> {
        vec![Value::Text(self.name.clone())]
    }
}

impl NamedEntity for Receiver {
    const TABLE: Table = Table::Receiver;
    const COLUMNS: &'static [&'static str] = &["id", "name"];

    fn id(&self) -> i64 {
        self.id
    }
    fn set_id(&mut self, id: i64) {
        self.id = id;
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn named(name: &str) -> Self {
        Receiver {
            id: 0,
            name: name.to_string(),
        }
    }
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Receiver {
            id: row.get(0)?,
            name: row.get(1)?,
        })
    }
    fn values(&self) -> Vec<Value> {
        vec![Value::Text(self.name.clone())]
    }
}

impl NamedEntity for Model {
    const TABLE: Table = Table::Model;
    const COLUMNS: &'static [&'static str] = &["id", "name", "manufacturer_id"];

    fn id(&self) -> i64 {
        self.id
    }
    fn set_id(&mut self, id: i64) {
        self.id = id;
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn named(name: &str) -> Self {
        Model {
            id: 0,
            name: name.to_string(),
            manufacturer_id: None,
        }
    }
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Model {
            id: row.get(0)?,
            name: row.get(1)?,
            manufacturer_id: row.get(2)?,
        })
    }
    fn values(&self) -> Vec<Value> {
        vec![
            Value::Text(self.name.clone()),
            self.manufacturer_id.map_or(Value::Null, Value::Integer),
        ]
    }
}

impl NamedEntity for AircraftType {
    const TABLE: Table = Table::AircraftType;
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "icao_type_code",
        "manufacturer_id",
        "model_id",
        "species_id",
        "engine_type_id",
        "engine_placement_id",
        "wake_turbulence_category_id",
        "engine_count",
    ];

    fn id(&self) -> i64 {
        self.id
    }
    fn set_id(&mut self, id: i64) {
        self.id = id;
    }
    fn name(&self) -> &str {
        &self.icao_type_code
    }
    fn named(name: &str) -> Self {
        AircraftType {
            icao_type_code: name.to_string(),
            ..Default::default()
        }
    }
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(AircraftType {
            id: row.get(0)?,
            icao_type_code: row.get(1)?,
            manufacturer_id: row.get(2)?,
            model_id: row.get(3)?,
            species_id: row.get(4)?,
            engine_type_id: row.get(5)?,
            engine_placement_id: row.get(6)?,
            wake_turbulence_category_id: row.get(7)?,
            engine_count: row.get(8)?,
        })
    }
    fn values(&self) -> Vec<Value> {
        let id = |v: Option<i64>| v.map_or(Value::Null, Value::Integer);
        vec![
            Value::Text(self.icao_type_code.clone()),
            id(self.manufacturer_id),
            id(self.model_id),
            id(self.species_id),
            id(self.engine_type_id),
            id(self.engine_placement_id),
            id(self.wake_turbulence_category_id),
            self.engine_count.map_or(Value::Null, |n| Value::Integer(n.into())),
        ]
    }
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

/// Case-folded form of a name, stored in `name_key`.
pub(crate) fn name_key(name: &str) -> String {
    name.to_lowercase()
}

/// Stateless; every method takes `&Connection`.
pub struct NamedRepo<T>(PhantomData<T>);

impl<T: NamedEntity> NamedRepo<T> {
    fn select_sql(filter: &str) -> String {
        format!(
            "SELECT {} FROM {} {filter}",
            T::COLUMNS.join(", "),
            T::TABLE.name()
        )
    }

    pub fn get_by_id(conn: &Connection, id: i64) -> Result<Option<T>> {
        let row = conn
            .query_row(&Self::select_sql("WHERE id = ?1"), params![id], T::from_row)
            .optional()?;
        Ok(row)
    }

    /// Case-insensitive exact match. Blank names never match.
    pub fn get_by_name(conn: &Connection, name: &str) -> Result<Option<T>> {
        if name.trim().is_empty() {
            return Ok(None);
        }
        let row = conn
            .query_row(
                &Self::select_sql("WHERE name_key = ?1"),
                params![name_key(name)],
                T::from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_all(conn: &Connection) -> Result<Vec<T>> {
        let mut stmt = conn.prepare(&Self::select_sql("ORDER BY name_key"))?;
        let rows = stmt
            .query_map([], T::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Existing row whose name matches ignoring case, or a newly inserted one.
    pub fn get_or_create_by_name(conn: &Connection, name: &str) -> Result<T> {
        if name.trim().is_empty() {
            return Err(HistoryError::ArgumentNull("name").into());
        }
        if let Some(existing) = Self::get_by_name(conn, name)? {
            return Ok(existing);
        }
        let mut row = T::named(name);
        Self::insert(conn, &mut row)?;
        debug!(table = T::TABLE.name(), name, id = row.id(), "created lookup row");
        Ok(row)
    }

    /// Insert when unsaved, otherwise update the row with the same id.
    pub fn save(conn: &Connection, row: &mut T) -> Result<()> {
        if row.name().trim().is_empty() {
            return Err(HistoryError::ArgumentNull("name").into());
        }
        if row.id() == UNSAVED_ID {
            return Self::insert(conn, row);
        }

        let columns = Self::written_columns();
        let assignments: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{c} = ?{}", i + 1))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE id = ?{}",
            T::TABLE.name(),
            assignments.join(", "),
            columns.len() + 1
        );
        let mut values = Self::written_values(row);
        values.push(Value::Integer(row.id()));
        let updated = conn.execute(&sql, params_from_iter(values))?;
        if updated == 0 {
            return Err(StoreError::invalid_state(format!(
                "no {} row with id {}",
                T::TABLE.name(),
                row.id()
            )));
        }
        Ok(())
    }

    /// Every column an insert or update writes: the entity's own, then `name_key`.
    fn written_columns() -> Vec<&'static str> {
        let mut columns = T::COLUMNS[1..].to_vec();
        columns.push("name_key");
        columns
    }

    fn written_values(row: &T) -> Vec<Value> {
        let mut values = row.values();
        values.push(Value::Text(name_key(row.name())));
        values
    }

    fn insert(conn: &Connection, row: &mut T) -> Result<()> {
        let columns = Self::written_columns();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            T::TABLE.name(),
            columns.join(", "),
            placeholders.join(", ")
        );
        conn.execute(&sql, params_from_iter(Self::written_values(row)))?;
        row.set_id(conn.last_insert_rowid());
        Ok(())
    }

    /// Delete the row and null out every reference to it. Returns whether a
    /// row was deleted; absent ids are not an error.
    pub fn delete(conn: &Connection, id: i64) -> Result<bool> {
        schema::delete_row(conn, T::TABLE, id)
    }
}

/// Named-lookup operations against a live engine, one transaction each.
pub struct NamedLookup<'a, T> {
    db: &'a TrackHistoryDatabase,
    _entity: PhantomData<T>,
}

impl<'a, T: NamedEntity> NamedLookup<'a, T> {
    pub(crate) fn new(db: &'a TrackHistoryDatabase) -> Self {
        NamedLookup {
            db,
            _entity: PhantomData,
        }
    }

    pub fn get_by_id(&self, id: i64) -> Result<Option<T>> {
        self.db.read(|conn| NamedRepo::<T>::get_by_id(conn, id))
    }

    pub fn get_by_name(&self, name: &str) -> Result<Option<T>> {
        self.db.read(|conn| NamedRepo::<T>::get_by_name(conn, name))
    }

    pub fn get_all(&self) -> Result<Vec<T>> {
        self.db.read(NamedRepo::<T>::get_all)
    }

    pub fn get_or_create_by_name(&self, name: &str) -> Result<T> {
        self.db
            .transaction(|tx| NamedRepo::<T>::get_or_create_by_name(tx, name))
    }

    pub fn save(&self, row: &mut T) -> Result<()> {
        self.db.transaction(|tx| NamedRepo::<T>::save(tx, row))
    }

    pub fn delete(&self, id: i64) -> Result<bool> {
        self.db.transaction(|tx| NamedRepo::<T>::delete(tx, id))
    }
}

impl NamedLookup<'_, AircraftType> {
    /// Case-insensitive match on the ICAO type designator, e.g. `B744`.
    pub fn get_by_icao_type_code(&self, code: &str) -> Result<Option<AircraftType>> {
        self.get_by_name(code)
    }
}

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Read-only enumeration tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enumeration {
    Species,
    EngineType,
    EnginePlacement,
    WakeTurbulenceCategory,
}

impl Enumeration {
    pub const ALL: [Enumeration; 4] = [
        Enumeration::Species,
        Enumeration::EngineType,
        Enumeration::EnginePlacement,
        Enumeration::WakeTurbulenceCategory,
    ];

    pub fn table(self) -> Table {
        match self {
            Enumeration::Species => Table::Species,
            Enumeration::EngineType => Table::EngineType,
            Enumeration::EnginePlacement => Table::EnginePlacement,
            Enumeration::WakeTurbulenceCategory => Table::WakeTurbulenceCategory,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// In-memory copy of every enumeration, loaded when the store is opened.
#[derive(Debug, Default)]
pub struct Enumerations {
    rows: [Vec<EnumerationRow>; 4],
}

impl Enumerations {
    pub(crate) fn load(conn: &Connection) -> Result<Self> {
        let mut enums = Enumerations::default();
        for e in Enumeration::ALL {
            let mut stmt = conn.prepare(&format!(
                "SELECT id, description FROM {} ORDER BY id",
                e.table().name()
            ))?;
            enums.rows[e.index()] = stmt
                .query_map([], |r| {
                    Ok(EnumerationRow {
                        id: r.get(0)?,
                        description: r.get(1)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
        }
        Ok(enums)
    }

    pub fn get_by_id(&self, e: Enumeration, id: i64) -> Option<&EnumerationRow> {
        self.rows[e.index()].iter().find(|r| r.id == id)
    }

    pub fn get_all(&self, e: Enumeration) -> &[EnumerationRow] {
        &self.rows[e.index()]
    }
}

/// Enumeration reads against a live engine, served from its cache.
pub struct EnumerationLookup<'a> {
    db: &'a TrackHistoryDatabase,
    kind: Enumeration,
}

impl<'a> EnumerationLookup<'a> {
    pub(crate) fn new(db: &'a TrackHistoryDatabase, kind: Enumeration) -> Self {
        EnumerationLookup { db, kind }
    }

    pub fn get_by_id(&self, id: i64) -> Result<Option<EnumerationRow>> {
        let enums: Arc<Enumerations> = self.db.enumerations()?;
        Ok(enums.get_by_id(self.kind, id).cloned())
    }

    pub fn get_all(&self) -> Result<Vec<EnumerationRow>> {
        Ok(self.db.enumerations()?.get_all(self.kind).to_vec())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
