//! Ordered key-value engine (redb)

pub mod engine;
pub mod keys;
mod store;

pub use engine::{Batch, KvEngine, KvReader, Snapshot};
pub use store::KvStore;
