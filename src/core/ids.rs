//! Identifier generation
//!
//! Books, works, users, sessions and segments are keyed by 26-character
//! ULIDs. Ids minted by one process sort in creation order even within the
//! same millisecond.

use crate::core::error::{Result, StoreError};
use lazy_static::lazy_static;
use std::sync::{Mutex, PoisonError};
use ulid::{Generator, Ulid};

lazy_static! {
    static ref GENERATOR: Mutex<Generator> = Mutex::new(Generator::new());
}

/// Mint a new ULID string
pub fn new_ulid() -> Result<String> {
    // A panic while holding the lock cannot leave the generator half-updated.
    let mut generator = GENERATOR.lock().unwrap_or_else(PoisonError::into_inner);
    // Overflow only happens after 2^80 ids in one millisecond; fall back to a random id.
    let id = generator.generate().unwrap_or_else(|_| Ulid::new());
    Ok(id.to_string())
}

/// Mint an id for `entity` when `id` is empty, otherwise check the caller's id
///
/// Ids become key segments, so `:` and whitespace are rejected.
pub fn assign_id(entity: &str, id: &mut String) -> Result<()> {
    if id.is_empty() {
        *id = new_ulid()?;
        return Ok(());
    }
    if id.contains(':') || id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(StoreError::InvalidInput(format!(
            "{} id {:?} may not contain ':' or whitespace",
            entity, id
        )));
    }
    Ok(())
}

/// Whether `value` parses as a ULID
pub fn is_ulid(value: &str) -> bool {
    Ulid::from_string(value).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ulid_shape() {
        let id = new_ulid().unwrap();
        assert_eq!(id.len(), 26);
        assert!(is_ulid(&id));
        assert!(!is_ulid("not-a-ulid"));
    }

    #[test]
    fn test_assign_id() {
        let mut minted = String::new();
        assign_id("book", &mut minted).unwrap();
        assert!(is_ulid(&minted));

        let mut kept = "imported-7".to_string();
        assign_id("book", &mut kept).unwrap();
        assert_eq!(kept, "imported-7");

        for bad in ["legacy:42", "two words", "tab\tid"] {
            let err = assign_id("book", &mut bad.to_string()).unwrap_err();
            assert_eq!(err.error_type(), "InvalidInput");
        }
    }

    #[test]
    fn test_ulids_are_monotonic() {
        let ids: Vec<String> = (0..500).map(|_| new_ulid().unwrap()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        sorted.dedup();
        assert_eq!(sorted.len(), ids.len());
    }
}
