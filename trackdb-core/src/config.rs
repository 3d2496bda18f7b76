//! Configuration file management for trackdb.
//!
//! Reads/writes `~/.trackdb/config.yaml` with the track-history database
//! settings, and exposes the change signal the database singleton listens to.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::types::HistoryError;

/// Full configuration structure.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Configuration {
    pub database: DatabaseConfig,
}

/// Which kind of storage engine the singleton builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DatabaseProvider {
    /// Store addressed by a file path.
    #[default]
    File,
    /// Store addressed by a connection string.
    ConnectionString,
}

impl DatabaseProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseProvider::File => "file",
            DatabaseProvider::ConnectionString => "connection-string",
        }
    }

    pub fn parse(val: &str) -> Option<Self> {
        match val.to_ascii_lowercase().as_str() {
            "file" => Some(DatabaseProvider::File),
            "connection-string" | "connection_string" => Some(DatabaseProvider::ConnectionString),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub provider: DatabaseProvider,
    pub file_name: String,
    pub connection_string: String,
    /// Whether track history is being recorded.
    pub enabled: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            provider: DatabaseProvider::File,
            file_name: "data/trackhistory.db".into(),
            connection_string: String::new(),
            enabled: false,
        }
    }
}

/// Get the config directory path (`~/.trackdb/`).
pub fn config_dir() -> PathBuf {
    dirs_home().join(".trackdb")
}

/// Get the default config file path.
pub fn config_file() -> PathBuf {
    config_dir().join("config.yaml")
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load config from `path`.
///
/// Returns default config if the file doesn't exist or can't be read.
pub fn load_config(path: &Path) -> Configuration {
    if !path.exists() {
        return Configuration::default();
    }

    match std::fs::read_to_string(path) {
        Ok(text) => parse_config(&text),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "config unreadable, using defaults");
            Configuration::default()
        }
    }
}

/// Save config to `path`, creating the parent directory.
pub fn save_config(path: &Path, config: &Configuration) -> Result<(), HistoryError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| HistoryError::Config(e.to_string()))?;
    }
    std::fs::write(path, serialize_config(config))
        .map_err(|e| HistoryError::Config(e.to_string()))?;
    Ok(())
}

/// Parse simple YAML-like config text. Unknown keys are ignored.
pub fn parse_config(text: &str) -> Configuration {
    let mut config = Configuration::default();
    let mut current_section: Option<String> = None;

    for line in text.lines() {
        let stripped = line.trim();
        if stripped.is_empty() || stripped.starts_with('#') {
            continue;
        }

        let is_indented = line.starts_with("  ") || line.starts_with('\t');

        let Some((key, val)) = stripped.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let val = val.trim();

        if !is_indented {
            current_section = val.is_empty().then(|| key.to_string());
            continue;
        }

        if current_section.as_deref() != Some("database") {
            continue;
        }
        let db = &mut config.database;
        match key {
            "provider" => {
                if let Some(p) = parse_string_value(val).and_then(|v| DatabaseProvider::parse(&v)) {
                    db.provider = p;
                }
            }
            "file_name" => db.file_name = parse_string_value(val).unwrap_or_default(),
            "connection_string" => {
                db.connection_string = parse_string_value(val).unwrap_or_default()
            }
            "enabled" => {
                if let Some(v) = parse_bool_value(val) {
                    db.enabled = v;
                }
            }
            _ => {}
        }
    }

    config
}

fn parse_string_value(val: &str) -> Option<String> {
    if val == "null" || val == "~" || val.is_empty() {
        return None;
    }
    // Strip quotes
    if val.len() >= 2
        && ((val.starts_with('"') && val.ends_with('"'))
            || (val.starts_with('\'') && val.ends_with('\'')))
    {
        return Some(val[1..val.len() - 1].to_string());
    }
    Some(val.to_string())
}

fn parse_bool_value(val: &str) -> Option<bool> {
    match val.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" => Some(true),
        "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Serialize config to YAML-like text.
pub fn serialize_config(config: &Configuration) -> String {
    let db = &config.database;
    let lines = [
        "# trackdb configuration".to_string(),
        String::new(),
        "database:".into(),
        format!("  provider: \"{}\"", db.provider.as_str()),
        format!("  file_name: \"{}\"", db.file_name),
        format!("  connection_string: \"{}\"", db.connection_string),
        format!("  enabled: {}", db.enabled),
    ];
    lines.join("\n") + "\n"
}

// ---------------------------------------------------------------------------
// Change signal
// ---------------------------------------------------------------------------

/// Zero-argument callback fired when the configuration may have changed.
pub type ConfigurationListener = Arc<dyn Fn() + Send + Sync>;

/// Handle returned by [`ConfigurationProvider::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Source of configuration snapshots plus a change signal.
///
/// Listeners are not told what changed; they re-read the snapshot.
pub trait ConfigurationProvider: Send + Sync {
    fn load(&self) -> Configuration;
    fn subscribe(&self, listener: ConfigurationListener) -> SubscriptionId;
    fn unsubscribe(&self, id: SubscriptionId);
}

/// In-memory configuration snapshot, optionally backed by a file.
pub struct ConfigurationManager {
    path: Option<PathBuf>,
    current: RwLock<Configuration>,
    listeners: Mutex<BTreeMap<SubscriptionId, ConfigurationListener>>,
    next_id: Mutex<u64>,
}

impl ConfigurationManager {
    /// Manager with no backing file.
    pub fn in_memory(config: Configuration) -> Self {
        ConfigurationManager {
            path: None,
            current: RwLock::new(config),
            listeners: Mutex::new(BTreeMap::new()),
            next_id: Mutex::new(1),
        }
    }

    /// Manager backed by the file at `path` (defaults if absent).
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let config = load_config(&path);
        let mut manager = Self::in_memory(config);
        manager.path = Some(path);
        manager
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Apply `f` to the current snapshot, then fire the change signal.
    pub fn update(&self, f: impl FnOnce(&mut Configuration)) {
        {
            let mut current = self.current.write();
            f(&mut current);
        }
        self.raise_changed();
    }

    /// Re-read the backing file and fire the change signal.
    pub fn reload(&self) {
        if let Some(path) = &self.path {
            *self.current.write() = load_config(path);
        }
        self.raise_changed();
    }

    /// Persist the current snapshot to the backing file, if any.
    pub fn save(&self) -> Result<(), HistoryError> {
        match &self.path {
            Some(path) => save_config(path, &self.current.read()),
            None => Ok(()),
        }
    }

    fn raise_changed(&self) {
        // Snapshot so listeners may (un)subscribe while being called.
        let listeners: Vec<ConfigurationListener> =
            self.listeners.lock().values().cloned().collect();
        for listener in listeners {
            listener();
        }
    }
}

impl ConfigurationProvider for ConfigurationManager {
    fn load(&self) -> Configuration {
        self.current.read().clone()
    }

    fn subscribe(&self, listener: ConfigurationListener) -> SubscriptionId {
        let id = {
            let mut next = self.next_id.lock();
            let id = SubscriptionId(*next);
            *next += 1;
            id
        };
        self.listeners.lock().insert(id, listener);
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.listeners.lock().remove(&id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_default_config() {
        let config = Configuration::default();
        assert_eq!(config.database.provider, DatabaseProvider::File);
        assert_eq!(config.database.file_name, "data/trackhistory.db");
        assert!(config.database.connection_string.is_empty());
        assert!(!config.database.enabled);
    }

    #[test]
    fn test_parse_config() {
        let text = r#"
database:
  provider: "connection-string"
  file_name: "/tmp/history.db"
  connection_string: "file:/tmp/history.db?mode=rwc"
  enabled: true
"#;
        let config = parse_config(text);
        assert_eq!(config.database.provider, DatabaseProvider::ConnectionString);
        assert_eq!(config.database.file_name, "/tmp/history.db");
        assert_eq!(
            config.database.connection_string,
            "file:/tmp/history.db?mode=rwc"
        );
        assert!(config.database.enabled);
    }

    #[test]
    fn test_parse_config_null_values() {
        let text = r#"
database:
  file_name: null
  connection_string: ~
  enabled: maybe
"#;
        let config = parse_config(text);
        assert!(config.database.file_name.is_empty());
        assert!(config.database.connection_string.is_empty());
        assert!(!config.database.enabled);
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");
        let mut config = Configuration::default();
        config.database.file_name = "x.db".into();
        config.database.enabled = true;

        save_config(&path, &config).unwrap();
        assert_eq!(load_config(&path), config);
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.yaml"));
        assert_eq!(config, Configuration::default());
    }

    #[test]
    fn test_update_fires_listeners_with_new_snapshot() {
        let manager = Arc::new(ConfigurationManager::in_memory(Configuration::default()));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let m = Arc::clone(&manager);
        let s = Arc::clone(&seen);
        manager.subscribe(Arc::new(move || {
            s.lock().push(m.load().database.file_name);
        }));

        manager.update(|c| c.database.file_name = "b.db".into());
        assert_eq!(*seen.lock(), vec!["b.db".to_string()]);
    }

    #[test]
    fn test_unsubscribe_stops_notifications() {
        let manager = ConfigurationManager::in_memory(Configuration::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let id = manager.subscribe(Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        manager.update(|_| {});
        manager.unsubscribe(id);
        manager.update(|_| {});
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reload_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let manager = ConfigurationManager::from_file(&path);
        assert_eq!(manager.load(), Configuration::default());

        let mut config = Configuration::default();
        config.database.connection_string = "file:other.db".into();
        save_config(&path, &config).unwrap();

        manager.reload();
        assert_eq!(manager.load().database.connection_string, "file:other.db");
    }
}
