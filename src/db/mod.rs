//! Database module
//!
//! This module provides the persistence layer:
//! - The `Store` contract shared by both engines
//! - A relational engine on a pooled SQLite connection
//! - An ordered key-value engine on redb
//! - Versioned migrations and the settings service

pub mod kv;
pub mod manager;
pub mod migrations;
pub mod models;
pub mod scan;
pub mod schema;
pub mod settings;
pub mod sqlite_store;
pub mod store;


pub use kv::KvStore;
pub use manager::DatabaseManager;
pub use settings::SettingsService;
pub use sqlite_store::SqliteStore;
pub use store::{EngineKind, Store};

use crate::core::config::DatabaseConfig;
use crate::core::error::Result;
use std::sync::Arc;
use std::time::Duration;

/// Open the engine selected by `config`
pub fn open_store(config: &DatabaseConfig) -> Result<Arc<dyn Store>> {
    let store: Arc<dyn Store> = match config.engine {
        EngineKind::Sqlite => Arc::new(SqliteStore::open(
            &config.path,
            config.connection_pool_size,
            Duration::from_millis(config.busy_timeout),
        )?),
        EngineKind::Kv => Arc::new(KvStore::open(&config.path)?),
    };
    Ok(store)
}
