//! Process-wide owner of the live storage engine.
//!
//! The singleton builds an engine from the configuration, then listens for the
//! configuration-change signal. When the setting the engine is addressed by
//! changes (file name for file stores, connection string otherwise) it swaps in
//! a new engine, bracketed by `Changing` / `Changed` notifications. The
//! recording-enabled flag gets the same bracket on its own.
//!
//! ```text
//! Uninitialised ──initialise──▶ Initialised ──dispose──▶ Disposed
//!       ▲                            │
//!       └──── failed hot-swap ───────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{error, info, warn};

use trackdb_core::config::{ConfigurationListener, SubscriptionId};
use trackdb_core::{ConfigurationProvider, DatabaseConfig};

use crate::engine::{Backend, TrackHistoryDatabase};
use crate::error::Result;

/// Zero-argument notification fired around a relevant configuration change.
pub type ChangeListener = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug)]
enum State {
    Uninitialised,
    Initialised(Arc<TrackHistoryDatabase>),
    Disposed,
}

/// The configuration fields the singleton reacts to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Settings {
    file_name: String,
    connection_string: String,
    enabled: bool,
}

impl From<&DatabaseConfig> for Settings {
    fn from(config: &DatabaseConfig) -> Self {
        Settings {
            file_name: config.file_name.clone(),
            connection_string: config.connection_string.clone(),
            enabled: config.enabled,
        }
    }
}

pub struct DatabaseSingleton {
    provider: Arc<dyn ConfigurationProvider>,
    state: RwLock<State>,
    /// Serialises initialise, reconfiguration and dispose.
    reconfigure: Mutex<()>,
    settings: Mutex<Settings>,
    recording_enabled: AtomicBool,
    subscription: Mutex<Option<SubscriptionId>>,
    changing: Mutex<Vec<ChangeListener>>,
    changed: Mutex<Vec<ChangeListener>>,
}

impl DatabaseSingleton {
    pub fn new(provider: Arc<dyn ConfigurationProvider>) -> Arc<Self> {
        Arc::new(DatabaseSingleton {
            provider,
            state: RwLock::new(State::Uninitialised),
            reconfigure: Mutex::new(()),
            settings: Mutex::new(Settings::default()),
            recording_enabled: AtomicBool::new(false),
            subscription: Mutex::new(None),
            changing: Mutex::new(Vec::new()),
            changed: Mutex::new(Vec::new()),
        })
    }

    /// Build the engine from the current configuration and start listening
    /// for changes. Does nothing if already initialised or disposed.
    pub fn initialise(self: &Arc<Self>) -> Result<()> {
        let _serial = self.reconfigure.lock();
        if !matches!(*self.state.read(), State::Uninitialised) {
            return Ok(());
        }

        let config = self.provider.load();
        let db = TrackHistoryDatabase::new(Backend::from_config(&config.database)?)?;
        let settings = Settings::from(&config.database);
        self.recording_enabled
            .store(settings.enabled, Ordering::SeqCst);
        *self.settings.lock() = settings;

        let weak: Weak<Self> = Arc::downgrade(self);
        let listener: ConfigurationListener = Arc::new(move || {
            if let Some(singleton) = weak.upgrade() {
                singleton.on_configuration_changed();
            }
        });
        *self.subscription.lock() = Some(self.provider.subscribe(listener));

        info!(location = %db.backend(), "track history database initialised");
        *self.state.write() = State::Initialised(Arc::new(db));
        Ok(())
    }

    /// The live engine, or `None` before initialisation and after disposal.
    pub fn database(&self) -> Option<Arc<TrackHistoryDatabase>> {
        match &*self.state.read() {
            State::Initialised(db) => Some(Arc::clone(db)),
            State::Uninitialised | State::Disposed => None,
        }
    }

    pub fn is_initialised(&self) -> bool {
        matches!(*self.state.read(), State::Initialised(_))
    }

    pub fn is_disposed(&self) -> bool {
        matches!(*self.state.read(), State::Disposed)
    }

    /// Whether track recording is switched on in the configuration.
    pub fn recording_enabled(&self) -> bool {
        self.recording_enabled.load(Ordering::SeqCst)
    }

    /// Called before a relevant change; the old state is still observable.
    pub fn add_changing_listener(&self, listener: ChangeListener) {
        self.changing.lock().push(listener);
    }

    /// Called after a relevant change; the new state is observable.
    pub fn add_changed_listener(&self, listener: ChangeListener) {
        self.changed.lock().push(listener);
    }

    fn raise(listeners: &Mutex<Vec<ChangeListener>>) {
        let snapshot: Vec<ChangeListener> = listeners.lock().clone();
        for listener in snapshot {
            listener();
        }
    }

    /// Re-read the configuration and apply whatever changed.
    pub fn on_configuration_changed(&self) {
        let _serial = self.reconfigure.lock();
        let current = match &*self.state.read() {
            State::Initialised(db) => Arc::clone(db),
            State::Uninitialised | State::Disposed => return,
        };

        let config = self.provider.load();
        if config.database.provider != current.backend().provider() {
            warn!(
                active = current.backend().provider().as_str(),
                configured = config.database.provider.as_str(),
                "database provider change ignored until restart"
            );
        }

        let next = Settings::from(&config.database);
        let previous = self.settings.lock().clone();

        let location = if current.file_name_required() {
            (previous.file_name != next.file_name).then_some(&next.file_name)
        } else {
            (previous.connection_string != next.connection_string)
                .then_some(&next.connection_string)
        };

        if let Some(location) = location {
            Self::raise(&self.changing);
            match self.swap(&current, location) {
                Ok(()) => Self::raise(&self.changed),
                Err(e) => {
                    error!(error = %e, location = %location, "database hot-swap failed");
                    self.abandon();
                    return;
                }
            }
        }

        if previous.enabled != next.enabled {
            Self::raise(&self.changing);
            self.recording_enabled.store(next.enabled, Ordering::SeqCst);
            info!(enabled = next.enabled, "track recording toggled");
            Self::raise(&self.changed);
        }

        *self.settings.lock() = next;
    }

    /// Replace `current` with an engine of the same kind at `location`,
    /// holding the old engine's lock so no operation straddles the swap.
    fn swap(&self, current: &Arc<TrackHistoryDatabase>, location: &str) -> Result<()> {
        let lock = current.lock();
        let _held = lock.acquire();
        let backend = Backend::new(current.backend().provider(), location)?;
        let db = TrackHistoryDatabase::new(backend)?;
        info!(from = %current.backend(), to = %db.backend(), "swapping track history database");
        *self.state.write() = State::Initialised(Arc::new(db));
        current.close();
        Ok(())
    }

    /// A failed swap leaves no usable engine; callers must initialise again.
    fn abandon(&self) {
        if let Some(id) = self.subscription.lock().take() {
            self.provider.unsubscribe(id);
        }
        let previous = std::mem::replace(&mut *self.state.write(), State::Uninitialised);
        if let State::Initialised(db) = previous {
            db.close();
        }
    }

    /// Release the engine. Safe to call more than once.
    ///
    /// The engine is closed after the state guard is released: a thread that
    /// holds the engine lock may still be calling [`database`](Self::database).
    pub fn dispose(&self) {
        let _serial = self.reconfigure.lock();
        if let Some(id) = self.subscription.lock().take() {
            self.provider.unsubscribe(id);
        }
        let previous = {
            let mut state = self.state.write();
            if !matches!(*state, State::Initialised(_)) {
                return;
            }
            std::mem::replace(&mut *state, State::Disposed)
        };
        if let State::Initialised(db) = previous {
            db.close();
            info!("track history database disposed");
        }
    }
}

impl Drop for DatabaseSingleton {
    fn drop(&mut self) {
        if let Some(id) = self.subscription.get_mut().take() {
            self.provider.unsubscribe(id);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;
    use trackdb_core::{Configuration, ConfigurationManager, DatabaseProvider};

    type Log = Arc<Mutex<Vec<String>>>;

    fn manager(provider: DatabaseProvider, dir: &Path) -> Arc<ConfigurationManager> {
        let mut config = Configuration::default();
        config.database.provider = provider;
        config.database.file_name = dir.join("a.db").display().to_string();
        config.database.connection_string = format!("file:{}?mode=rwc", dir.join("c1.db").display());
        Arc::new(ConfigurationManager::in_memory(config))
    }

    fn describe(singleton: &DatabaseSingleton) -> String {
        match singleton.database() {
            Some(db) => match db.file_name() {
                Some(path) => path.file_name().unwrap().to_string_lossy().into_owned(),
                None => db.connection_string().unwrap().to_string(),
            },
            None => "none".to_string(),
        }
    }

    /// Record what the singleton reports as each event fires.
    fn watch(singleton: &Arc<DatabaseSingleton>) -> Log {
        let log: Log = Arc::default();
        for (tag, changed) in [("changing", false), ("changed", true)] {
            let weak = Arc::downgrade(singleton);
            let log = Arc::clone(&log);
            let listener: ChangeListener = Arc::new(move || {
                let s = weak.upgrade().unwrap();
                log.lock().push(format!(
                    "{tag}:{}:{}",
                    describe(&s),
                    s.recording_enabled()
                ));
            });
            if changed {
                singleton.add_changed_listener(listener);
            } else {
                singleton.add_changing_listener(listener);
            }
        }
        log
    }

    fn started(manager: &Arc<ConfigurationManager>) -> Arc<DatabaseSingleton> {
        let provider: Arc<dyn ConfigurationProvider> = manager.clone();
        let singleton = DatabaseSingleton::new(provider);
        singleton.initialise().unwrap();
        singleton
    }

    #[test]
    fn test_database_absent_until_initialised() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(DatabaseProvider::File, dir.path());
        let provider: Arc<dyn ConfigurationProvider> = manager.clone();
        let singleton = DatabaseSingleton::new(provider);
        assert!(singleton.database().is_none());

        singleton.initialise().unwrap();
        let first = singleton.database().unwrap();
        singleton.initialise().unwrap();
        assert!(Arc::ptr_eq(&first, &singleton.database().unwrap()));
        assert!(first.file_name_required());
    }

    #[test]
    fn test_file_name_change_swaps_file_engine() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(DatabaseProvider::File, dir.path());
        let singleton = started(&manager);
        let log = watch(&singleton);

        let b = dir.path().join("b.db").display().to_string();
        manager.update(|c| c.database.file_name = b);
        assert_eq!(
            *log.lock(),
            vec!["changing:a.db:false".to_string(), "changed:b.db:false".to_string()]
        );

        log.lock().clear();
        manager.update(|c| c.database.connection_string = "file:elsewhere.db".into());
        assert!(log.lock().is_empty());
        assert_eq!(describe(&singleton), "b.db");
    }

    #[test]
    fn test_connection_string_change_swaps_uri_engine() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(DatabaseProvider::ConnectionString, dir.path());
        let singleton = started(&manager);
        let log = watch(&singleton);
        let c1 = manager.load().database.connection_string;

        manager.update(|c| c.database.file_name = "ignored.db".into());
        assert!(log.lock().is_empty());

        let c2 = format!("file:{}?mode=rwc", dir.path().join("c2.db").display());
        manager.update(|c| c.database.connection_string = c2.clone());
        assert_eq!(
            *log.lock(),
            vec![format!("changing:{c1}:false"), format!("changed:{c2}:false")]
        );
    }

    #[test]
    fn test_swapped_engine_uses_new_store() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(DatabaseProvider::File, dir.path());
        let singleton = started(&manager);
        let old = singleton.database().unwrap();
        old.countries().get_or_create_by_name("Japan").unwrap();

        let b = dir.path().join("b.db").display().to_string();
        manager.update(|c| c.database.file_name = b);

        let new = singleton.database().unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert!(new.countries().get_by_name("Japan").unwrap().is_none());
    }

    #[test]
    fn test_recording_flag_bracketed() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(DatabaseProvider::File, dir.path());
        let singleton = started(&manager);
        let log = watch(&singleton);
        assert!(!singleton.recording_enabled());

        manager.update(|c| c.database.enabled = true);
        assert!(singleton.recording_enabled());
        assert_eq!(
            *log.lock(),
            vec!["changing:a.db:false".to_string(), "changed:a.db:true".to_string()]
        );

        // Nothing relevant changed
        log.lock().clear();
        manager.update(|_| {});
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_both_changes_fire_both_brackets() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(DatabaseProvider::File, dir.path());
        let singleton = started(&manager);
        let log = watch(&singleton);

        let b = dir.path().join("b.db").display().to_string();
        manager.update(|c| {
            c.database.file_name = b;
            c.database.enabled = true;
        });
        assert_eq!(
            *log.lock(),
            vec![
                "changing:a.db:false".to_string(),
                "changed:b.db:false".to_string(),
                "changing:b.db:false".to_string(),
                "changed:b.db:true".to_string(),
            ]
        );
    }

    #[test]
    fn test_failed_swap_requires_initialise() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(DatabaseProvider::File, dir.path());
        let singleton = started(&manager);
        let log = watch(&singleton);

        manager.update(|c| c.database.file_name = String::new());
        assert!(singleton.database().is_none());
        assert!(!singleton.is_initialised());
        assert_eq!(*log.lock(), vec!["changing:a.db:false".to_string()]);

        // No longer subscribed
        let b = dir.path().join("b.db").display().to_string();
        manager.update(|c| c.database.file_name = b);
        assert_eq!(log.lock().len(), 1);

        singleton.initialise().unwrap();
        assert_eq!(describe(&singleton), "b.db");
    }

    #[test]
    fn test_dispose_is_idempotent_and_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(DatabaseProvider::File, dir.path());
        let singleton = started(&manager);
        let log = watch(&singleton);

        singleton.dispose();
        singleton.dispose();
        assert!(singleton.is_disposed());
        assert!(singleton.database().is_none());

        manager.update(|c| c.database.enabled = true);
        assert!(log.lock().is_empty());

        singleton.initialise().unwrap();
        assert!(singleton.database().is_none());
    }

    #[test]
    fn test_dispose_while_lock_holder_reads_database() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(DatabaseProvider::File, dir.path());
        let singleton = started(&manager);
        let db = singleton.database().unwrap();

        let (held_tx, held_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();

        let holder = {
            let singleton = Arc::clone(&singleton);
            let db = Arc::clone(&db);
            let done = done_tx.clone();
            thread::spawn(move || {
                let lock = db.lock();
                let _held = lock.acquire();
                held_tx.send(()).unwrap();
                // Give dispose time to reach the engine lock
                thread::sleep(Duration::from_millis(200));
                let _ = singleton.database();
                done.send("holder").unwrap();
            })
        };
        held_rx.recv().unwrap();
        let disposer = {
            let singleton = Arc::clone(&singleton);
            thread::spawn(move || {
                singleton.dispose();
                done_tx.send("disposer").unwrap();
            })
        };

        let mut finished = Vec::new();
        for _ in 0..2 {
            finished.push(done_rx.recv_timeout(Duration::from_secs(5)).unwrap());
        }
        holder.join().unwrap();
        disposer.join().unwrap();

        finished.sort_unstable();
        assert_eq!(finished, vec!["disposer", "holder"]);
        assert!(singleton.is_disposed());
        assert!(singleton.database().is_none());
    }

    #[test]
    fn test_initialise_rejects_empty_location() {
        let mut config = Configuration::default();
        config.database.file_name = String::new();
        let provider: Arc<dyn ConfigurationProvider> =
            Arc::new(ConfigurationManager::in_memory(config));
        let singleton = DatabaseSingleton::new(provider);

        assert!(singleton.initialise().unwrap_err().is_invalid_state());
        assert!(singleton.database().is_none());
    }
}
