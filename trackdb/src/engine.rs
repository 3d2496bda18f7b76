//! Storage engine: one SQLite store behind a coarse reentrant lock.
//!
//! The engine owns a single connection, opened lazily on first use. Every
//! operation takes the [`StorageLock`] first and then the connection, so a
//! collaborator replacing the store on disk can hold the lock and call
//! [`TrackHistoryDatabase::load`] without racing in-flight reads and writes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard, ReentrantMutex, ReentrantMutexGuard, RwLock};
use rusqlite::{Connection, OpenFlags, OptionalExtension, Transaction};
use serde::Serialize;
use tracing::{debug, info, warn};

use trackdb_core::{
    AircraftType, Country, DatabaseConfig, DatabaseProvider, DatabaseVersion, HistoryError,
    Manufacturer, Model, Receiver,
};

use crate::aircraft::AircraftStore;
use crate::error::{Result, StoreError};
use crate::lookup::{Enumeration, EnumerationLookup, Enumerations, NamedLookup};
use crate::schema::{self, Table, SCHEMA_VERSION};
use crate::track_history::{TrackHistoryStateStore, TrackHistoryStore};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// Where the store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// A database file, created on first use.
    File(PathBuf),
    /// A SQLite URI or `:memory:`, e.g. `file:tracks.db?mode=rwc`.
    ConnectionString(String),
}

impl Backend {
    /// Build a backend of the given kind. An empty location is rejected.
    pub fn new(provider: DatabaseProvider, location: &str) -> Result<Self> {
        let location = location.trim();
        if location.is_empty() {
            return Err(StoreError::invalid_state("database location is empty"));
        }
        Ok(match provider {
            DatabaseProvider::File => Backend::File(PathBuf::from(location)),
            DatabaseProvider::ConnectionString => Backend::ConnectionString(location.to_string()),
        })
    }

    /// Backend named by the database section of a configuration snapshot.
    pub fn from_config(config: &DatabaseConfig) -> Result<Self> {
        match config.provider {
            DatabaseProvider::File => Self::new(config.provider, &config.file_name),
            DatabaseProvider::ConnectionString => {
                Self::new(config.provider, &config.connection_string)
            }
        }
    }

    pub fn provider(&self) -> DatabaseProvider {
        match self {
            Backend::File(_) => DatabaseProvider::File,
            Backend::ConnectionString(_) => DatabaseProvider::ConnectionString,
        }
    }

    /// True when the store is addressed by a file name rather than a
    /// connection string.
    pub fn file_name_required(&self) -> bool {
        matches!(self, Backend::File(_))
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::File(path) => write!(f, "{}", path.display()),
            Backend::ConnectionString(cs) => f.write_str(cs),
        }
    }
}

// ---------------------------------------------------------------------------
// Lock
// ---------------------------------------------------------------------------

/// Coarse mutual-exclusion handle shared with bulk-reload collaborators.
///
/// Reentrant: a thread already holding it may call back into the engine.
#[derive(Clone, Default)]
pub struct StorageLock(Arc<ReentrantMutex<()>>);

impl StorageLock {
    pub fn acquire(&self) -> ReentrantMutexGuard<'_, ()> {
        self.0.lock()
    }
}

impl std::fmt::Debug for StorageLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StorageLock")
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct TrackHistoryDatabase {
    backend: Backend,
    lock: StorageLock,
    conn: Mutex<Option<Connection>>,
    enumerations: RwLock<Option<Arc<Enumerations>>>,
}

impl TrackHistoryDatabase {
    /// Engine for `backend`. No I/O happens until the first operation, which
    /// creates the schema if the store is empty.
    pub fn new(backend: Backend) -> Result<Self> {
        if backend.to_string().trim().is_empty() {
            return Err(StoreError::invalid_state("database location is empty"));
        }
        Ok(TrackHistoryDatabase {
            backend,
            lock: StorageLock::default(),
            conn: Mutex::new(None),
            enumerations: RwLock::new(None),
        })
    }

    /// Open (creating if needed) the store and verify its schema now.
    pub fn open(backend: Backend) -> Result<Self> {
        let db = Self::new(backend)?;
        db.read(|_| Ok(()))?;
        Ok(db)
    }

    /// Private in-memory store (for testing).
    pub fn open_memory() -> Result<Self> {
        Self::open(Backend::ConnectionString(":memory:".to_string()))
    }

    /// Create a brand new store at `location`.
    ///
    /// Fails with an argument error if `location` is `None`, and with an
    /// invalid-state error if it is empty or something already exists there.
    pub fn create(provider: DatabaseProvider, location: Option<&str>) -> Result<Self> {
        let location = location.ok_or(HistoryError::ArgumentNull("location"))?;
        let backend = Backend::new(provider, location)?;
        if let Backend::File(path) = &backend {
            if path.exists() {
                return Err(StoreError::invalid_state(format!(
                    "{} already exists",
                    path.display()
                )));
            }
        }

        let db = Self::new(backend)?;
        {
            let _guard = db.lock.acquire();
            let conn = db.open_raw()?;
            if !schema::is_empty(&conn)? {
                return Err(StoreError::invalid_state(format!(
                    "{} already holds a database",
                    db.backend
                )));
            }
            schema::initialise(&conn)?;
            *db.enumerations.write() = Some(Arc::new(Enumerations::load(&conn)?));
            *db.conn.lock() = Some(conn);
        }
        info!(location = %db.backend, version = SCHEMA_VERSION, "created track history database");
        Ok(db)
    }

    fn open_raw(&self) -> Result<Connection> {
        let conn = match &self.backend {
            Backend::File(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                let conn = Connection::open(path)?;
                conn.execute_batch("PRAGMA journal_mode=WAL;")?;
                conn
            }
            Backend::ConnectionString(cs) => Connection::open_with_flags(
                cs,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?,
        };
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    /// Open the connection, creating or verifying the schema, and refresh the
    /// enumeration cache. Caller holds the storage lock.
    fn connect(&self) -> Result<Connection> {
        let conn = self.open_raw()?;
        if schema::is_empty(&conn)? {
            schema::initialise(&conn)?;
            info!(location = %self.backend, "initialised empty store");
        }
        match schema::schema_version(&conn)? {
            Some(v) if v > 0 && v <= SCHEMA_VERSION => {}
            Some(v) => {
                return Err(StoreError::invalid_state(format!(
                    "store schema version {v} is not supported (expected {SCHEMA_VERSION})"
                )))
            }
            None => {
                return Err(StoreError::invalid_state(format!(
                    "{} is not a track history database",
                    self.backend
                )))
            }
        }
        *self.enumerations.write() = Some(Arc::new(Enumerations::load(&conn)?));
        debug!(location = %self.backend, "connected");
        Ok(conn)
    }

    /// The connection slot. Callers hold the storage lock, so a slot that is
    /// already locked was locked by this thread, from inside `transaction`.
    fn slot(&self) -> Result<MutexGuard<'_, Option<Connection>>> {
        self.conn.try_lock().ok_or_else(|| {
            StoreError::invalid_state(
                "engine called from inside its own transaction; pass the open transaction instead",
            )
        })
    }

    fn with_connection<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let _guard = self.lock.acquire();
        let mut slot = self.slot()?;
        let conn = match slot.take() {
            Some(conn) => conn,
            None => self.connect()?,
        };
        f(slot.insert(conn))
    }

    /// Run `f` against the connection outside any transaction.
    pub(crate) fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        self.with_connection(|conn| f(conn))
    }

    /// Run `f` in one transaction, committed when it returns `Ok`.
    ///
    /// Calls made from inside `f` must go through the supplied transaction
    /// (repositories take `&Connection`, and a `&Transaction` derefs to one).
    /// Handles that accept an optional transaction, such as
    /// [`TrackHistoryStore::delete`], join it when given `Some(tx)`; any other
    /// engine call from inside `f` fails with an invalid-state error.
    pub fn transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        self.with_connection(|conn| {
            let tx = conn.transaction()?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
    }

    /// Reopen the store and reload in-memory state from it, e.g. after the
    /// file has been replaced while holding [`lock`](Self::lock).
    pub fn load(&self) -> Result<()> {
        let _guard = self.lock.acquire();
        let mut slot = self.slot()?;
        slot.take();
        *slot = Some(self.connect()?);
        info!(location = %self.backend, "reloaded track history database");
        Ok(())
    }

    /// Drop the connection. The next operation reopens it.
    ///
    /// Inside a transaction this does nothing; the connection stays open.
    pub fn close(&self) {
        let _guard = self.lock.acquire();
        match self.slot() {
            Ok(mut slot) => {
                slot.take();
            }
            Err(e) => warn!(error = %e, "close skipped"),
        }
    }

    pub fn lock(&self) -> StorageLock {
        self.lock.clone()
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn file_name_required(&self) -> bool {
        self.backend.file_name_required()
    }

    pub fn file_name(&self) -> Option<&Path> {
        match &self.backend {
            Backend::File(path) => Some(path),
            Backend::ConnectionString(_) => None,
        }
    }

    pub fn connection_string(&self) -> Option<&str> {
        match &self.backend {
            Backend::File(_) => None,
            Backend::ConnectionString(cs) => Some(cs),
        }
    }

    /// Cached enumeration tables, loading them if the store is not open yet.
    pub fn enumerations(&self) -> Result<Arc<Enumerations>> {
        if let Some(enums) = self.enumerations.read().as_ref() {
            return Ok(Arc::clone(enums));
        }
        self.read(|_| Ok(()))?;
        self.enumerations
            .read()
            .clone()
            .ok_or_else(|| StoreError::invalid_state("enumerations not loaded"))
    }

    // -----------------------------------------------------------------------
    // Handles
    // -----------------------------------------------------------------------

    pub fn countries(&self) -> NamedLookup<'_, Country> {
        NamedLookup::new(self)
    }

    pub fn manufacturers(&self) -> NamedLookup<'_, Manufacturer> {
        NamedLookup::new(self)
    }

    pub fn models(&self) -> NamedLookup<'_, Model> {
        NamedLookup::new(self)
    }

    pub fn receivers(&self) -> NamedLookup<'_, Receiver> {
        NamedLookup::new(self)
    }

    pub fn aircraft_types(&self) -> NamedLookup<'_, AircraftType> {
        NamedLookup::new(self)
    }

    pub fn enumeration(&self, kind: Enumeration) -> EnumerationLookup<'_> {
        EnumerationLookup::new(self, kind)
    }

    pub fn aircraft(&self) -> AircraftStore<'_> {
        AircraftStore::new(self)
    }

    pub fn track_histories(&self) -> TrackHistoryStore<'_> {
        TrackHistoryStore::new(self)
    }

    pub fn track_history_states(&self) -> TrackHistoryStateStore<'_> {
        TrackHistoryStateStore::new(self)
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Latest row of the version table.
    pub fn database_version(&self) -> Result<Option<DatabaseVersion>> {
        self.read(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, version FROM database_versions ORDER BY version DESC, id DESC LIMIT 1",
                    [],
                    |r| {
                        Ok(DatabaseVersion {
                            id: r.get(0)?,
                            version: r.get(1)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    /// VACUUM to reclaim disk space.
    pub fn vacuum(&self) -> Result<()> {
        self.with_connection(|conn| Ok(conn.execute_batch("VACUUM;")?))
    }

    pub fn stats(&self) -> Result<DbStats> {
        self.read(|conn| {
            Ok(DbStats {
                schema_version: schema::schema_version(conn)?.unwrap_or(0),
                countries: schema::count_rows(conn, Table::Country)?,
                manufacturers: schema::count_rows(conn, Table::Manufacturer)?,
                models: schema::count_rows(conn, Table::Model)?,
                receivers: schema::count_rows(conn, Table::Receiver)?,
                aircraft_types: schema::count_rows(conn, Table::AircraftType)?,
                aircraft: schema::count_rows(conn, Table::Aircraft)?,
                track_histories: schema::count_rows(conn, Table::TrackHistory)?,
                track_history_states: schema::count_rows(conn, Table::TrackHistoryState)?,
            })
        })
    }
}

impl std::fmt::Debug for TrackHistoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackHistoryDatabase")
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize)]
pub struct DbStats {
    pub schema_version: i64,
    pub countries: i64,
    pub manufacturers: i64,
    pub models: i64,
    pub receivers: i64,
    pub aircraft_types: i64,
    pub aircraft: i64,
    pub track_histories: i64,
    pub track_history_states: i64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use trackdb_core::Aircraft;

    fn path_str(path: &Path) -> &str {
        path.to_str().unwrap()
    }

    #[test]
    fn test_create_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("X.db");

        let db = TrackHistoryDatabase::create(DatabaseProvider::File, Some(path_str(&path))).unwrap();
        assert_eq!(db.stats().unwrap().schema_version, SCHEMA_VERSION);
        let version = db.database_version().unwrap().unwrap();
        assert!(version.id > 0);
        assert_eq!(version.version, SCHEMA_VERSION);
        drop(db);

        let err = TrackHistoryDatabase::create(DatabaseProvider::File, Some(path_str(&path)))
            .unwrap_err();
        assert!(err.is_invalid_state());
    }

    #[test]
    fn test_create_rejects_missing_and_empty_location() {
        let err = TrackHistoryDatabase::create(DatabaseProvider::File, None).unwrap_err();
        assert!(err.is_argument_null());

        let err = TrackHistoryDatabase::create(DatabaseProvider::File, Some("")).unwrap_err();
        assert!(err.is_invalid_state());

        let err =
            TrackHistoryDatabase::create(DatabaseProvider::ConnectionString, Some("  ")).unwrap_err();
        assert!(err.is_invalid_state());
    }

    #[test]
    fn test_create_over_existing_connection_string_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uri.db");
        let uri = format!("file:{}?mode=rwc", path.display());

        let db = TrackHistoryDatabase::create(DatabaseProvider::ConnectionString, Some(&uri))
            .unwrap();
        assert!(!db.file_name_required());
        assert_eq!(db.connection_string(), Some(uri.as_str()));
        drop(db);

        let err = TrackHistoryDatabase::create(DatabaseProvider::ConnectionString, Some(&uri))
            .unwrap_err();
        assert!(err.is_invalid_state());
    }

    #[test]
    fn test_create_seeds_enumerations() {
        let db = TrackHistoryDatabase::create(DatabaseProvider::ConnectionString, Some(":memory:"))
            .unwrap();
        for kind in Enumeration::ALL {
            assert!(!db.enumeration(kind).get_all().unwrap().is_empty());
        }
        assert!(db.enumeration(Enumeration::Species).get_by_id(0).unwrap().is_some());
        assert!(db.enumeration(Enumeration::Species).get_by_id(999).unwrap().is_none());
    }

    #[test]
    fn test_new_is_lazy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("lazy.db");

        let db = TrackHistoryDatabase::new(Backend::File(path.clone())).unwrap();
        assert!(db.file_name_required());
        assert_eq!(db.file_name(), Some(path.as_path()));
        assert!(!path.exists());

        db.aircraft().save(&mut Aircraft::new("4840D6")).unwrap();
        assert!(path.exists());
        assert_eq!(db.stats().unwrap().aircraft, 1);
    }

    #[test]
    fn test_open_rejects_newer_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("future.db");
        TrackHistoryDatabase::create(DatabaseProvider::File, Some(path_str(&path))).unwrap();

        let raw = Connection::open(&path).unwrap();
        raw.execute("INSERT INTO database_versions (version) VALUES (?1)", [SCHEMA_VERSION + 1])
            .unwrap();
        drop(raw);

        let err = TrackHistoryDatabase::open(Backend::File(path)).unwrap_err();
        assert!(err.is_invalid_state());
    }

    #[test]
    fn test_open_rejects_foreign_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("other.db");
        let raw = Connection::open(&path).unwrap();
        raw.execute_batch("CREATE TABLE notes (body TEXT);").unwrap();
        drop(raw);

        let err = TrackHistoryDatabase::open(Backend::File(path)).unwrap_err();
        assert!(err.is_invalid_state());
    }

    #[test]
    fn test_load_sees_replaced_file() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("live.db");
        let staged = dir.path().join("staged.db");

        let db = TrackHistoryDatabase::create(DatabaseProvider::File, Some(path_str(&live))).unwrap();
        db.countries().get_or_create_by_name("France").unwrap();

        let other =
            TrackHistoryDatabase::create(DatabaseProvider::File, Some(path_str(&staged))).unwrap();
        other.countries().get_or_create_by_name("Spain").unwrap();
        other.countries().get_or_create_by_name("Italy").unwrap();
        drop(other);

        {
            let lock = db.lock();
            let _held = lock.acquire();
            db.close();
            for suffix in ["-wal", "-shm"] {
                let _ = std::fs::remove_file(format!("{}{suffix}", live.display()));
            }
            std::fs::copy(&staged, &live).unwrap();
            // Same thread may re-enter while holding the lock
            db.load().unwrap();
        }

        let names: Vec<_> = db
            .countries()
            .get_all()
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["Italy", "Spain"]);
    }

    #[test]
    fn test_lock_blocks_other_threads() {
        let db = Arc::new(TrackHistoryDatabase::open_memory().unwrap());
        let lock = db.lock();
        let guard = lock.acquire();

        let worker = {
            let db = Arc::clone(&db);
            std::thread::spawn(move || db.countries().get_or_create_by_name("Peru").unwrap().id)
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!worker.is_finished());

        drop(guard);
        assert!(worker.join().unwrap() > 0);
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = TrackHistoryDatabase::open_memory().unwrap();
        let result: Result<()> = db.transaction(|tx| {
            crate::lookup::NamedRepo::<Country>::get_or_create_by_name(tx, "Chile")?;
            Err(StoreError::invalid_state("abort"))
        });
        assert!(result.is_err());
        assert!(db.countries().get_by_name("Chile").unwrap().is_none());
    }

    #[test]
    fn test_reentry_inside_transaction_fails_fast() {
        let db = TrackHistoryDatabase::open_memory().unwrap();
        let mut ac = Aircraft::new("4CA2D6");
        db.aircraft().save(&mut ac).unwrap();

        db.transaction(|tx| {
            let err = db.countries().get_or_create_by_name("Ireland").unwrap_err();
            assert!(err.is_invalid_state());
            assert!(db.track_histories().delete(1, None).unwrap_err().is_invalid_state());
            assert!(db.load().unwrap_err().is_invalid_state());
            db.close();

            // The joined form still works
            assert!(!db.track_histories().delete(1, Some(tx))?);
            Ok(())
        })
        .unwrap();

        assert_eq!(db.aircraft().get_by_id(ac.id).unwrap().map(|a| a.id), Some(ac.id));
        assert!(db.countries().get_by_name("Ireland").unwrap().is_none());
    }

    #[test]
    fn test_backend_from_config() {
        let mut cfg = DatabaseConfig::default();
        cfg.file_name = "tracks.db".into();
        assert_eq!(
            Backend::from_config(&cfg).unwrap(),
            Backend::File(PathBuf::from("tracks.db"))
        );

        cfg.provider = DatabaseProvider::ConnectionString;
        cfg.connection_string = "file:tracks.db?mode=ro".into();
        let backend = Backend::from_config(&cfg).unwrap();
        assert!(!backend.file_name_required());
        assert_eq!(backend.provider(), DatabaseProvider::ConnectionString);

        cfg.connection_string.clear();
        assert!(Backend::from_config(&cfg).unwrap_err().is_invalid_state());
    }

    #[test]
    fn test_vacuum_after_maintenance() {
        let db = TrackHistoryDatabase::open_memory().unwrap();
        db.countries().get_or_create_by_name("Norway").unwrap();
        db.vacuum().unwrap();
        assert_eq!(db.stats().unwrap().countries, 1);
    }
}
