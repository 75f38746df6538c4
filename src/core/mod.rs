//! Core module
//!
//! Cross-cutting pieces shared by both storage engines:
//! - Error handling and the crate result type
//! - Configuration management
//! - Structured logging system
//! - Secret codec for encrypted settings
//! - Identifier generation

pub mod config;
pub mod crypto;
pub mod error;
pub mod ids;
pub mod logging;

pub use config::Config;
pub use crypto::SecretManager;
pub use error::{Result, StoreError};
pub use logging::Logger;
