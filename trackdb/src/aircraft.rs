//! Aircraft repository: one row per ICAO 24-bit address.
//!
//! Deleting an aircraft removes every track history it owns, and their
//! states, in the same transaction.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

use trackdb_core::{normalize_icao, Aircraft, HistoryError, UNSAVED_ID};

use crate::engine::TrackHistoryDatabase;
use crate::error::{Result, StoreError};
use crate::schema::{self, time_column, to_nanos, Table};

const COLUMNS: &str = "id, icao24, registration, serial, year_built, country_id, model_id, \
                       aircraft_type_id, created_utc, updated_utc";

fn from_row(r: &Row<'_>) -> rusqlite::Result<Aircraft> {
    Ok(Aircraft {
        id: r.get(0)?,
        icao24: r.get(1)?,
        registration: r.get(2)?,
        serial: r.get(3)?,
        year_built: r.get(4)?,
        country_id: r.get(5)?,
        model_id: r.get(6)?,
        aircraft_type_id: r.get(7)?,
        created_utc: time_column(r, 8)?,
        updated_utc: time_column(r, 9)?,
    })
}

/// Stateless; every method takes `&Connection`.
pub struct AircraftRepo;

impl AircraftRepo {
    pub fn get_by_id(conn: &Connection, id: i64) -> Result<Option<Aircraft>> {
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM aircraft WHERE id = ?1"),
                params![id],
                from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Case-insensitive match on the ICAO address.
    pub fn get_by_icao(conn: &Connection, icao: &str) -> Result<Option<Aircraft>> {
        let icao = normalize_icao(icao);
        if icao.is_empty() {
            return Ok(None);
        }
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM aircraft WHERE icao24 = ?1"),
                params![icao],
                from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// All aircraft ordered by ICAO address.
    pub fn get_all(conn: &Connection) -> Result<Vec<Aircraft>> {
        let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM aircraft ORDER BY icao24"))?;
        let rows = stmt
            .query_map([], from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Insert when unsaved, otherwise update by id. Stamps `updated_utc`.
    pub fn save(conn: &Connection, aircraft: &mut Aircraft) -> Result<()> {
        aircraft.icao24 = normalize_icao(&aircraft.icao24);
        if aircraft.icao24.is_empty() {
            return Err(HistoryError::ArgumentNull("icao24").into());
        }
        aircraft.updated_utc = Utc::now();

        if aircraft.id == UNSAVED_ID {
            conn.execute(
                "INSERT INTO aircraft (icao24, registration, serial, year_built, country_id,
                                       model_id, aircraft_type_id, created_utc, updated_utc)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    aircraft.icao24,
                    aircraft.registration,
                    aircraft.serial,
                    aircraft.year_built,
                    aircraft.country_id,
                    aircraft.model_id,
                    aircraft.aircraft_type_id,
                    to_nanos(&aircraft.created_utc)?,
                    to_nanos(&aircraft.updated_utc)?,
                ],
            )?;
            aircraft.id = conn.last_insert_rowid();
            return Ok(());
        }

        let updated = conn.execute(
            "UPDATE aircraft SET icao24 = ?1, registration = ?2, serial = ?3, year_built = ?4,
                                 country_id = ?5, model_id = ?6, aircraft_type_id = ?7,
                                 updated_utc = ?8
             WHERE id = ?9",
            params![
                aircraft.icao24,
                aircraft.registration,
                aircraft.serial,
                aircraft.year_built,
                aircraft.country_id,
                aircraft.model_id,
                aircraft.aircraft_type_id,
                to_nanos(&aircraft.updated_utc)?,
                aircraft.id,
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::invalid_state(format!(
                "no aircraft row with id {}",
                aircraft.id
            )));
        }
        Ok(())
    }

    /// Delete the aircraft and everything it owns. Absent ids are a no-op.
    pub fn delete(conn: &Connection, id: i64) -> Result<bool> {
        schema::delete_row(conn, Table::Aircraft, id)
    }
}

/// Aircraft operations against a live engine, one transaction each.
pub struct AircraftStore<'a> {
    db: &'a TrackHistoryDatabase,
}

impl<'a> AircraftStore<'a> {
    pub(crate) fn new(db: &'a TrackHistoryDatabase) -> Self {
        AircraftStore { db }
    }

    pub fn get_by_id(&self, id: i64) -> Result<Option<Aircraft>> {
        self.db.read(|conn| AircraftRepo::get_by_id(conn, id))
    }

    pub fn get_by_icao(&self, icao: &str) -> Result<Option<Aircraft>> {
        self.db.read(|conn| AircraftRepo::get_by_icao(conn, icao))
    }

    pub fn get_all(&self) -> Result<Vec<Aircraft>> {
        self.db.read(AircraftRepo::get_all)
    }

    pub fn save(&self, aircraft: &mut Aircraft) -> Result<()> {
        self.db.transaction(|tx| AircraftRepo::save(tx, aircraft))
    }

    pub fn delete(&self, id: i64) -> Result<bool> {
        self.db.transaction(|tx| AircraftRepo::delete(tx, id))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{memory_db, ts};
    use trackdb_core::{TrackHistory, TrackHistoryState};

    #[test]
    fn test_save_and_get_by_icao_ignores_case() {
        let db = memory_db();
        let mut ac = Aircraft::new("4840d6");
        ac.registration = Some("PH-BFA".into());
        db.aircraft().save(&mut ac).unwrap();
        assert!(ac.id > 0);

        let found = db.aircraft().get_by_icao("4840D6").unwrap().unwrap();
        assert_eq!(found.id, ac.id);
        assert_eq!(found.registration.as_deref(), Some("PH-BFA"));
        assert_eq!(db.aircraft().get_by_icao("4840d6").unwrap().unwrap().id, ac.id);
        assert!(db.aircraft().get_by_icao("").unwrap().is_none());
    }

    #[test]
    fn test_save_updates_by_id() {
        let db = memory_db();
        let mut ac = Aircraft::new("40621D");
        db.aircraft().save(&mut ac).unwrap();

        ac.year_built = Some(1999);
        db.aircraft().save(&mut ac).unwrap();

        let all = db.aircraft().get_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].year_built, Some(1999));
    }

    #[test]
    fn test_duplicate_icao_differing_by_case_rejected() {
        let db = memory_db();
        db.aircraft().save(&mut Aircraft::new("ABC123")).unwrap();
        let mut dup = Aircraft::new("abc123");
        dup.icao24 = "abc123".into();
        assert!(matches!(
            db.aircraft().save(&mut dup),
            Err(StoreError::Storage(_))
        ));
    }

    #[test]
    fn test_delete_cascades_histories_and_states() {
        let db = memory_db();
        let mut ac = Aircraft::new("ADF7C8");
        db.aircraft().save(&mut ac).unwrap();
        let mut other = Aircraft::new("A00001");
        db.aircraft().save(&mut other).unwrap();

        for owner in [ac.id, ac.id, ac.id, other.id] {
            let mut history = TrackHistory::new(owner, ts(0));
            db.track_histories().save(&mut history).unwrap();
            let mut states: Vec<_> = (1..=4)
                .map(|seq| TrackHistoryState::new(history.id, seq, ts(seq.into())))
                .collect();
            db.track_history_states().save_many(&mut states).unwrap();
        }

        assert!(db.aircraft().delete(ac.id).unwrap());

        assert!(db.aircraft().get_by_id(ac.id).unwrap().is_none());
        assert!(db.track_histories().get_by_aircraft_id(ac.id, None).unwrap().is_empty());
        let stats = db.stats().unwrap();
        assert_eq!(stats.track_histories, 1);
        assert_eq!(stats.track_history_states, 4);

        // Second delete is a no-op
        assert!(!db.aircraft().delete(ac.id).unwrap());
    }

    #[test]
    fn test_delete_lookup_keeps_aircraft() {
        let db = memory_db();
        let germany = db.countries().get_or_create_by_name("Germany").unwrap();
        let mut ac = Aircraft::new("3C6444");
        ac.country_id = Some(germany.id);
        db.aircraft().save(&mut ac).unwrap();

        assert!(db.countries().delete(germany.id).unwrap());
        let reloaded = db.aircraft().get_by_id(ac.id).unwrap().unwrap();
        assert_eq!(reloaded.country_id, None);
        assert!(!db.countries().delete(germany.id).unwrap());
    }
}
