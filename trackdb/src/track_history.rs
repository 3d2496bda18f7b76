//! Track histories and their ordered states.
//!
//! Maintenance operations (truncate, expiry) live here too. A history marked
//! preserved is never truncated or expired.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, Transaction};
use tracing::debug;

use trackdb_core::{
    HistoryError, TrackHistory, TrackHistoryCriteria, TrackHistoryState, UNSAVED_ID,
};

use crate::engine::TrackHistoryDatabase;
use crate::error::{Result, StoreError};
use crate::schema::{self, bound_nanos, time_column, to_nanos, Table};

const HISTORY_COLUMNS: &str =
    "id, aircraft_id, receiver_id, start_time, is_preserved, created_utc, updated_utc";

const STATE_COLUMNS: &str = "id, track_history_id, sequence_number, timestamp, latitude, \
                             longitude, altitude_feet, ground_speed_knots, track_degrees, \
                             vertical_rate_fpm, squawk, callsign, is_on_ground";

/// Latest state timestamp of history `h`, or its start time when it has none.
const LAST_SEEN: &str = "COALESCE((SELECT MAX(s.timestamp) FROM track_history_states s \
                         WHERE s.track_history_id = h.id), h.start_time)";

fn history_from_row(r: &Row<'_>) -> rusqlite::Result<TrackHistory> {
    Ok(TrackHistory {
        id: r.get(0)?,
        aircraft_id: r.get(1)?,
        receiver_id: r.get(2)?,
        start_time: time_column(r, 3)?,
        is_preserved: r.get(4)?,
        created_utc: time_column(r, 5)?,
        updated_utc: time_column(r, 6)?,
    })
}

fn state_from_row(r: &Row<'_>) -> rusqlite::Result<TrackHistoryState> {
    Ok(TrackHistoryState {
        id: r.get(0)?,
        track_history_id: r.get(1)?,
        sequence_number: r.get(2)?,
        timestamp: time_column(r, 3)?,
        latitude: r.get(4)?,
        longitude: r.get(5)?,
        altitude_feet: r.get(6)?,
        ground_speed_knots: r.get(7)?,
        track_degrees: r.get(8)?,
        vertical_rate_fpm: r.get(9)?,
        squawk: r.get(10)?,
        callsign: r.get(11)?,
        is_on_ground: r.get(12)?,
    })
}

fn query_histories(conn: &Connection, sql: &str, args: Vec<Value>) -> Result<Vec<TrackHistory>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params_from_iter(args), history_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Track histories
// ---------------------------------------------------------------------------

pub struct TrackHistoryRepo;

impl TrackHistoryRepo {
    pub fn get_by_id(conn: &Connection, id: i64) -> Result<Option<TrackHistory>> {
        let row = conn
            .query_row(
                &format!("SELECT {HISTORY_COLUMNS} FROM track_histories WHERE id = ?1"),
                params![id],
                history_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Histories owned by an aircraft, oldest first, narrowed by `criteria`.
    pub fn get_by_aircraft_id(
        conn: &Connection,
        aircraft_id: i64,
        criteria: Option<&TrackHistoryCriteria>,
    ) -> Result<Vec<TrackHistory>> {
        let mut sql = format!("SELECT {HISTORY_COLUMNS} FROM track_histories WHERE aircraft_id = ?");
        let mut args = vec![Value::Integer(aircraft_id)];

        if let Some(c) = criteria {
            if let Some(from) = &c.from {
                sql.push_str(" AND start_time >= ?");
                args.push(Value::Integer(bound_nanos(from)));
            }
            if let Some(to) = &c.to {
                sql.push_str(" AND start_time <= ?");
                args.push(Value::Integer(bound_nanos(to)));
            }
            if let Some(preserved) = c.is_preserved {
                sql.push_str(" AND is_preserved = ?");
                args.push(Value::Integer(preserved.into()));
            }
            if let Some(receiver_id) = c.receiver_id {
                sql.push_str(" AND receiver_id = ?");
                args.push(Value::Integer(receiver_id));
            }
        }
        sql.push_str(" ORDER BY start_time, id");

        query_histories(conn, &sql, args)
    }

    /// Histories whose start time falls in `[from, to]`.
    pub fn get_by_date_range(
        conn: &Connection,
        from: &DateTime<Utc>,
        to: &DateTime<Utc>,
    ) -> Result<Vec<TrackHistory>> {
        query_histories(
            conn,
            &format!(
                "SELECT {HISTORY_COLUMNS} FROM track_histories
                 WHERE start_time >= ?1 AND start_time <= ?2
                 ORDER BY start_time, id"
            ),
            vec![Value::Integer(bound_nanos(from)), Value::Integer(bound_nanos(to))],
        )
    }

    pub fn save(conn: &Connection, history: &mut TrackHistory) -> Result<()> {
        if history.aircraft_id <= 0 {
            return Err(HistoryError::OutOfRange {
                field: "aircraft_id",
                value: history.aircraft_id.to_string(),
            }
            .into());
        }
        history.updated_utc = Utc::now();

        if history.id == UNSAVED_ID {
            conn.execute(
                "INSERT INTO track_histories (aircraft_id, receiver_id, start_time, is_preserved,
                                              created_utc, updated_utc)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    history.aircraft_id,
                    history.receiver_id,
                    to_nanos(&history.start_time)?,
                    history.is_preserved,
                    to_nanos(&history.created_utc)?,
                    to_nanos(&history.updated_utc)?,
                ],
            )?;
            history.id = conn.last_insert_rowid();
            return Ok(());
        }

        let updated = conn.execute(
            "UPDATE track_histories SET aircraft_id = ?1, receiver_id = ?2, start_time = ?3,
                                        is_preserved = ?4, updated_utc = ?5
             WHERE id = ?6",
            params![
                history.aircraft_id,
                history.receiver_id,
                to_nanos(&history.start_time)?,
                history.is_preserved,
                to_nanos(&history.updated_utc)?,
                history.id,
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::invalid_state(format!(
                "no track history row with id {}",
                history.id
            )));
        }
        Ok(())
    }

    /// Delete a history and all its states. Returns false if it did not exist.
    pub fn delete(conn: &Connection, id: i64) -> Result<bool> {
        schema::delete_row(conn, Table::TrackHistory, id)
    }

    fn expired_ids(conn: &Connection, cutoff: &DateTime<Utc>) -> Result<Vec<i64>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT h.id FROM track_histories h
             WHERE h.is_preserved = 0 AND {LAST_SEEN} < ?1
             ORDER BY h.id"
        ))?;
        let ids = stmt
            .query_map(params![bound_nanos(cutoff)], |r| r.get(0))?
            .collect::<std::result::Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    /// Delete every non-preserved history last seen before `cutoff`.
    /// Returns histories removed.
    pub fn delete_expired(conn: &Connection, cutoff: &DateTime<Utc>) -> Result<usize> {
        let mut deleted = 0;
        for id in Self::expired_ids(conn, cutoff)? {
            if Self::delete(conn, id)? {
                deleted += 1;
            }
        }
        debug!(deleted, cutoff = %cutoff, "deleted expired track histories");
        Ok(deleted)
    }

    /// Keep only the first and last state of a history. Returns states removed.
    ///
    /// Preserved or unknown histories, and histories with fewer than three
    /// states, are left as they are.
    pub fn truncate(conn: &Connection, id: i64) -> Result<usize> {
        let preserved: Option<bool> = conn
            .query_row(
                "SELECT is_preserved FROM track_histories WHERE id = ?1",
                params![id],
                |r| r.get(0),
            )
            .optional()?;
        match preserved {
            None | Some(true) => return Ok(0),
            Some(false) => {}
        }

        let removed = conn.execute(
            "DELETE FROM track_history_states
             WHERE track_history_id = ?1
               AND sequence_number > (SELECT MIN(sequence_number) FROM track_history_states
                                      WHERE track_history_id = ?1)
               AND sequence_number < (SELECT MAX(sequence_number) FROM track_history_states
                                      WHERE track_history_id = ?1)",
            params![id],
        )?;
        Ok(removed)
    }

    /// Truncate every non-preserved history last seen before `cutoff`.
    /// Returns histories that lost at least one state.
    pub fn truncate_expired(conn: &Connection, cutoff: &DateTime<Utc>) -> Result<usize> {
        let mut truncated = 0;
        let mut states = 0;
        for id in Self::expired_ids(conn, cutoff)? {
            let removed = Self::truncate(conn, id)?;
            if removed > 0 {
                truncated += 1;
                states += removed;
            }
        }
        debug!(truncated, states, cutoff = %cutoff, "truncated expired track histories");
        Ok(truncated)
    }
}

// ---------------------------------------------------------------------------
// Track history states
// ---------------------------------------------------------------------------

pub struct TrackHistoryStateRepo;

impl TrackHistoryStateRepo {
    pub fn get_by_id(conn: &Connection, id: i64) -> Result<Option<TrackHistoryState>> {
        let row = conn
            .query_row(
                &format!("SELECT {STATE_COLUMNS} FROM track_history_states WHERE id = ?1"),
                params![id],
                state_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// States of one history in ascending sequence order.
    pub fn get_by_track_history(
        conn: &Connection,
        track_history_id: i64,
    ) -> Result<Vec<TrackHistoryState>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {STATE_COLUMNS} FROM track_history_states
             WHERE track_history_id = ?1
             ORDER BY sequence_number ASC"
        ))?;
        let rows = stmt
            .query_map(params![track_history_id], state_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Insert when unsaved, otherwise update by id. Changing
    /// `track_history_id` and saving again moves the state.
    pub fn save(conn: &Connection, state: &mut TrackHistoryState) -> Result<()> {
        state.validate()?;

        if state.id == UNSAVED_ID {
            conn.execute(
                "INSERT INTO track_history_states
                     (track_history_id, sequence_number, timestamp, latitude, longitude,
                      altitude_feet, ground_speed_knots, track_degrees, vertical_rate_fpm,
                      squawk, callsign, is_on_ground)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    state.track_history_id,
                    state.sequence_number,
                    to_nanos(&state.timestamp)?,
                    state.latitude,
                    state.longitude,
                    state.altitude_feet,
                    state.ground_speed_knots,
                    state.track_degrees,
                    state.vertical_rate_fpm,
                    state.squawk,
                    state.callsign,
                    state.is_on_ground,
                ],
            )?;
            state.id = conn.last_insert_rowid();
            return Ok(());
        }

        let updated = conn.execute(
            "UPDATE track_history_states
             SET track_history_id = ?1, sequence_number = ?2, timestamp = ?3, latitude = ?4,
                 longitude = ?5, altitude_feet = ?6, ground_speed_knots = ?7,
                 track_degrees = ?8, vertical_rate_fpm = ?9, squawk = ?10, callsign = ?11,
                 is_on_ground = ?12
             WHERE id = ?13",
            params![
                state.track_history_id,
                state.sequence_number,
                to_nanos(&state.timestamp)?,
                state.latitude,
                state.longitude,
                state.altitude_feet,
                state.ground_speed_knots,
                state.track_degrees,
                state.vertical_rate_fpm,
                state.squawk,
                state.callsign,
                state.is_on_ground,
                state.id,
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::invalid_state(format!(
                "no track history state row with id {}",
                state.id
            )));
        }
        Ok(())
    }

    /// Save each state in order. Callers wrap this in one transaction.
    pub fn save_many(conn: &Connection, states: &mut [TrackHistoryState]) -> Result<()> {
        for state in states.iter_mut() {
            Self::save(conn, state)?;
        }
        Ok(())
    }

    pub fn delete(conn: &Connection, id: i64) -> Result<bool> {
        schema::delete_row(conn, Table::TrackHistoryState, id)
    }
}

// ---------------------------------------------------------------------------
// Engine handles
// ---------------------------------------------------------------------------

/// Track-history operations against a live engine.
pub struct TrackHistoryStore<'a> {
    db: &'a TrackHistoryDatabase,
}

impl<'a> TrackHistoryStore<'a> {
    pub(crate) fn new(db: &'a TrackHistoryDatabase) -> Self {
        TrackHistoryStore { db }
    }

    pub fn get_by_id(&self, id: i64) -> Result<Option<TrackHistory>> {
        self.db.read(|conn| TrackHistoryRepo::get_by_id(conn, id))
    }

    pub fn get_by_aircraft_id(
        &self,
        aircraft_id: i64,
        criteria: Option<&TrackHistoryCriteria>,
    ) -> Result<Vec<TrackHistory>> {
        self.db
            .read(|conn| TrackHistoryRepo::get_by_aircraft_id(conn, aircraft_id, criteria))
    }

    pub fn get_by_date_range(
        &self,
        from: &DateTime<Utc>,
        to: &DateTime<Utc>,
    ) -> Result<Vec<TrackHistory>> {
        self.db
            .read(|conn| TrackHistoryRepo::get_by_date_range(conn, from, to))
    }

    pub fn save(&self, history: &mut TrackHistory) -> Result<()> {
        self.db.transaction(|tx| TrackHistoryRepo::save(tx, history))
    }

    /// Delete a history and its states.
    ///
    /// Pass the open transaction when calling from inside
    /// [`TrackHistoryDatabase::transaction`]; the delete then joins it instead
    /// of starting its own.
    pub fn delete(&self, id: i64, tx: Option<&Transaction<'_>>) -> Result<bool> {
        match tx {
            Some(tx) => TrackHistoryRepo::delete(tx, id),
            None => self.db.transaction(|tx| TrackHistoryRepo::delete(tx, id)),
        }
    }

    pub fn delete_expired(&self, cutoff: &DateTime<Utc>) -> Result<usize> {
        self.db
            .transaction(|tx| TrackHistoryRepo::delete_expired(tx, cutoff))
    }

    pub fn truncate(&self, id: i64) -> Result<usize> {
        self.db.transaction(|tx| TrackHistoryRepo::truncate(tx, id))
    }

    pub fn truncate_expired(&self, cutoff: &DateTime<Utc>) -> Result<usize> {
        self.db
            .transaction(|tx| TrackHistoryRepo::truncate_expired(tx, cutoff))
    }
}

/// Track-history-state operations against a live engine.
pub struct TrackHistoryStateStore<'a> {
    db: &'a TrackHistoryDatabase,
}

impl<'a> TrackHistoryStateStore<'a> {
    pub(crate) fn new(db: &'a TrackHistoryDatabase) -> Self {
        TrackHistoryStateStore { db }
    }

    pub fn get_by_id(&self, id: i64) -> Result<Option<TrackHistoryState>> {
        self.db.read(|conn| TrackHistoryStateRepo::get_by_id(conn, id))
    }

    pub fn get_by_track_history(&self, track_history_id: i64) -> Result<Vec<TrackHistoryState>> {
        self.db
            .read(|conn| TrackHistoryStateRepo::get_by_track_history(conn, track_history_id))
    }

    pub fn save(&self, state: &mut TrackHistoryState) -> Result<()> {
        let id = state.id;
        let result = self
            .db
            .transaction(|tx| TrackHistoryStateRepo::save(tx, state));
        if result.is_err() {
            state.id = id;
        }
        result
    }

    /// Save all states in one transaction. On failure nothing is written and
    /// every id is restored to its value before the call.
    pub fn save_many(&self, states: &mut [TrackHistoryState]) -> Result<()> {
        let ids: Vec<i64> = states.iter().map(|s| s.id).collect();
        let result = self
            .db
            .transaction(|tx| TrackHistoryStateRepo::save_many(tx, states));
        if result.is_err() {
            for (state, id) in states.iter_mut().zip(ids) {
                state.id = id;
            }
        }
        result
    }

    pub fn delete(&self, id: i64) -> Result<bool> {
        self.db
            .transaction(|tx| TrackHistoryStateRepo::delete(tx, id))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
