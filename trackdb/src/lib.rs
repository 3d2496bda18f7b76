//! trackdb: aircraft track-history storage.
//!
//! [`TrackHistoryDatabase`] is the SQLite-backed engine. Per-entity handles
//! (`db.aircraft()`, `db.track_histories()`, ...) run each call in its own
//! transaction. [`DatabaseSingleton`] owns the live engine and swaps it when
//! the configuration changes.

pub mod aircraft;
pub mod engine;
pub mod error;
pub mod lookup;
pub mod schema;
pub mod singleton;
pub mod track_history;

pub use aircraft::{AircraftRepo, AircraftStore};
pub use engine::{Backend, DbStats, StorageLock, TrackHistoryDatabase};
pub use error::{Result, StoreError};
pub use lookup::{Enumeration, EnumerationLookup, Enumerations, NamedEntity, NamedLookup, NamedRepo};
pub use singleton::{ChangeListener, DatabaseSingleton};
pub use track_history::{
    TrackHistoryRepo, TrackHistoryStateRepo, TrackHistoryStateStore, TrackHistoryStore,
};

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use crate::engine::TrackHistoryDatabase;

    /// Fresh private in-memory store.
    pub fn memory_db() -> TrackHistoryDatabase {
        TrackHistoryDatabase::open_memory().unwrap()
    }

    /// `secs` seconds after a fixed, non-zero reference time.
    pub fn ts(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
    }
}
