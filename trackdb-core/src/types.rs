//! Shared types, error enum, and track-history entities for trackdb-core.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// All errors produced by trackdb-core.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("required argument missing: {0}")]
    ArgumentNull(&'static str),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: String },
    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, HistoryError>;

/// Identifier of a row that has not been saved yet.
pub const UNSAVED_ID: i64 = 0;

// ---------------------------------------------------------------------------
// ICAO address helpers
// ---------------------------------------------------------------------------

/// Normalize an ICAO 24-bit address string for storage: trimmed, uppercase.
pub fn normalize_icao(icao: &str) -> String {
    icao.trim().to_ascii_uppercase()
}

/// True when `icao` is exactly six hex digits.
pub fn is_valid_icao(icao: &str) -> bool {
    let icao = icao.trim();
    icao.len() == 6 && icao.bytes().all(|b| b.is_ascii_hexdigit())
}

// ---------------------------------------------------------------------------
// Lookup entities
// ---------------------------------------------------------------------------

/// Schema version row, written once when a store is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DatabaseVersion {
    pub id: i64,
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Country {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Manufacturer {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Model {
    pub id: i64,
    pub name: String,
    pub manufacturer_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Receiver {
    pub id: i64,
    pub name: String,
}

/// Row of a read-only enumeration table (species, engine type, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnumerationRow {
    pub id: i64,
    pub description: String,
}

/// ICAO aircraft type designator and its classification.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct AircraftType {
    pub id: i64,
    pub icao_type_code: String,
    pub manufacturer_id: Option<i64>,
    pub model_id: Option<i64>,
    pub species_id: Option<i64>,
    pub engine_type_id: Option<i64>,
    pub engine_placement_id: Option<i64>,
    pub wake_turbulence_category_id: Option<i64>,
    pub engine_count: Option<i32>,
}

// ---------------------------------------------------------------------------
// Aircraft and track history
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Aircraft {
    pub id: i64,
    pub icao24: String,
    pub registration: Option<String>,
    pub serial: Option<String>,
    pub year_built: Option<i32>,
    pub country_id: Option<i64>,
    pub model_id: Option<i64>,
    pub aircraft_type_id: Option<i64>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Aircraft {
    /// New unsaved aircraft with the given ICAO address.
    pub fn new(icao24: &str) -> Self {
        let now = Utc::now();
        Aircraft {
            id: UNSAVED_ID,
            icao24: normalize_icao(icao24),
            registration: None,
            serial: None,
            year_built: None,
            country_id: None,
            model_id: None,
            aircraft_type_id: None,
            created_utc: now,
            updated_utc: now,
        }
    }
}

/// One flight or session of an aircraft.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackHistory {
    pub id: i64,
    pub aircraft_id: i64,
    pub receiver_id: Option<i64>,
    pub start_time: DateTime<Utc>,
    pub is_preserved: bool,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl TrackHistory {
    pub fn new(aircraft_id: i64, start_time: DateTime<Utc>) -> Self {
        let now = Utc::now();
        TrackHistory {
            id: UNSAVED_ID,
            aircraft_id,
            receiver_id: None,
            start_time,
            is_preserved: false,
            created_utc: now,
            updated_utc: now,
        }
    }
}

/// A single ordered point within a track history.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct TrackHistoryState {
    pub id: i64,
    pub track_history_id: i64,
    pub sequence_number: i32,
    pub timestamp: DateTime<Utc>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude_feet: Option<i32>,
    pub ground_speed_knots: Option<f64>,
    pub track_degrees: Option<f64>,
    pub vertical_rate_fpm: Option<i32>,
    pub squawk: Option<String>,
    pub callsign: Option<String>,
    pub is_on_ground: Option<bool>,
}

impl TrackHistoryState {
    pub fn new(track_history_id: i64, sequence_number: i32, timestamp: DateTime<Utc>) -> Self {
        TrackHistoryState {
            track_history_id,
            sequence_number,
            timestamp,
            ..Default::default()
        }
    }

    /// Check the fields the store requires before a save.
    pub fn validate(&self) -> Result<()> {
        if self.track_history_id <= 0 {
            return Err(HistoryError::OutOfRange {
                field: "track_history_id",
                value: self.track_history_id.to_string(),
            });
        }
        if self.sequence_number <= 0 {
            return Err(HistoryError::OutOfRange {
                field: "sequence_number",
                value: self.sequence_number.to_string(),
            });
        }
        if self.timestamp == DateTime::<Utc>::default() {
            return Err(HistoryError::OutOfRange {
                field: "timestamp",
                value: self.timestamp.to_rfc3339(),
            });
        }
        Ok(())
    }
}

/// Optional filter applied to track-history queries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackHistoryCriteria {
    /// Earliest start time, inclusive.
    pub from: Option<DateTime<Utc>>,
    /// Latest start time, inclusive.
    pub to: Option<DateTime<Utc>>,
    pub is_preserved: Option<bool>,
    pub receiver_id: Option<i64>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
