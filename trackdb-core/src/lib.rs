//! trackdb-core: entity types and configuration for the track-history store.
//!
//! No database access here, just the shared vocabulary. This crate is used by
//! `trackdb` (storage engine, singleton and CLI) and by collaborators that
//! only need the configuration signal or callsign lookups.

pub mod callsign;
pub mod config;
pub mod types;

// Re-export commonly used types at crate root
pub use config::{
    Configuration, ConfigurationManager, ConfigurationProvider, DatabaseConfig, DatabaseProvider,
};
pub use types::*;
