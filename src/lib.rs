//! Audiobook Store Library
//!
//! Persistence layer for an audiobook library manager: a storage contract
//! with relational (SQLite) and key-value (redb) engines, versioned
//! migrations, and encrypted settings.

pub mod core;
pub mod db;

// Re-export commonly used types
pub use crate::core::{Config, Result, SecretManager, StoreError};
pub use db::{open_store, EngineKind, SettingsService, Store};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
