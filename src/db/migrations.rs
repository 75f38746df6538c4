//! Database migrations
//!
//! Forward-only steps run against any [`Store`]. The applied version lives in
//! the `db_version` preference and every completed step leaves a
//! `migration_<n>` record behind. Each step tolerates a previous partial run.

use crate::core::error::{Result, StoreError};
use crate::db::models::{Book, BookAuthor, BookNarrator, DatabaseVersion, MigrationRecord};
use crate::db::scan::split_names;
use crate::db::store::Store;
use chrono::Utc;
use tracing::{info, warn};

/// Preference key holding the applied version
pub const VERSION_KEY: &str = "db_version";

const HISTORY_PREFIX: &str = "migration_";

pub const ROLE_AUTHOR: &str = "author";
pub const ROLE_CO_AUTHOR: &str = "co-author";
pub const ROLE_NARRATOR: &str = "narrator";
pub const ROLE_CO_NARRATOR: &str = "co-narrator";

type MigrationFn = fn(&dyn Store) -> Result<()>;

/// A single versioned step
pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    up: MigrationFn,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Initial schema with authors, series, books, playlists",
        up: check_catalog,
    },
    Migration {
        version: 2,
        description: "Add import paths and operations",
        up: check_operations,
    },
    Migration {
        version: 3,
        description: "Add user preferences",
        up: check_preferences,
    },
    Migration {
        version: 4,
        description: "Add extended keyspace (users, sessions, segments, playback)",
        up: check_extended_keyspace,
    },
    Migration {
        version: 5,
        description: "Rename legacy library keys to import_path",
        up: rename_legacy_keys,
    },
    Migration {
        version: 6,
        description: "Split multi-author and multi-narrator fields",
        up: split_multi_person_fields,
    },
];

/// Highest version this build knows about
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

/// Applied version, `0` when nothing was ever recorded
pub fn current_version(store: &dyn Store) -> Result<u32> {
    let Some(preference) = store.get_user_preference(VERSION_KEY)? else {
        return Ok(0);
    };
    match preference.value.as_deref() {
        None | Some("") => Ok(0),
        Some(raw) => {
            let version: DatabaseVersion = serde_json::from_str(raw).map_err(|e| {
                StoreError::Encoding(format!("unreadable {} record: {}", VERSION_KEY, e))
            })?;
            Ok(version.version)
        }
    }
}

/// Apply every pending step in order; returns the version reached
pub fn run_migrations(store: &dyn Store) -> Result<u32> {
    let current = current_version(store)?;
    info!("Current database version: {}", current);

    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
    if pending.is_empty() {
        info!("Database is up to date (version {})", current);
        return Ok(current);
    }

    let mut reached = current;
    for migration in pending {
        info!(
            "Applying migration {}: {}",
            migration.version, migration.description
        );
        apply(store, migration).map_err(|e| match e {
            StoreError::Migration { .. } => e,
            other => StoreError::Migration {
                version: migration.version,
                message: other.to_string(),
            },
        })?;
        reached = migration.version;
        info!("Migration {} completed", migration.version);
    }

    info!("All migrations completed. Current version: {}", reached);
    Ok(reached)
}

fn apply(store: &dyn Store, migration: &Migration) -> Result<()> {
    (migration.up)(store)?;

    let record = MigrationRecord {
        version: migration.version,
        description: migration.description.to_string(),
        applied_at: Utc::now(),
    };
    store.set_user_preference(
        &format!("{}{}", HISTORY_PREFIX, migration.version),
        &serde_json::to_string(&record)?,
    )?;

    let version = DatabaseVersion {
        version: migration.version,
        updated_at: Utc::now(),
    };
    store.set_user_preference(VERSION_KEY, &serde_json::to_string(&version)?)
}

/// Recorded steps ordered by version
pub fn migration_history(store: &dyn Store) -> Result<Vec<MigrationRecord>> {
    let mut history = Vec::new();
    for preference in store.get_all_user_preferences()? {
        if !preference.key.starts_with(HISTORY_PREFIX) {
            continue;
        }
        let Some(raw) = preference.value.as_deref() else {
            continue;
        };
        match serde_json::from_str::<MigrationRecord>(raw) {
            Ok(record) => history.push(record),
            Err(e) => warn!("Skipping unreadable migration record {}: {}", preference.key, e),
        }
    }
    history.sort_by_key(|record| record.version);
    Ok(history)
}

// ---- Steps ----

fn check_catalog(store: &dyn Store) -> Result<()> {
    store.get_all_authors()?;
    store.get_all_series()?;
    store.count_books()?;
    Ok(())
}

fn check_operations(store: &dyn Store) -> Result<()> {
    store.get_all_import_paths()?;
    store.get_recent_operations(1)?;
    Ok(())
}

fn check_preferences(store: &dyn Store) -> Result<()> {
    store.get_all_user_preferences()?;
    Ok(())
}

fn check_extended_keyspace(store: &dyn Store) -> Result<()> {
    store.list_book_segments("")?;
    store.list_user_sessions("")?;
    Ok(())
}

fn rename_legacy_keys(store: &dyn Store) -> Result<()> {
    let moved = store.rename_legacy_import_path_keys()?;
    if moved > 0 {
        info!("Renamed {} legacy import path keys", moved);
    }
    Ok(())
}

/// Every book, soft-deleted ones included
fn every_book(store: &dyn Store) -> Result<Vec<Book>> {
    let mut books = store.get_all_books(0, 0)?;
    books.extend(store.list_soft_deleted_books(0, 0, None)?);
    Ok(books)
}

fn split_multi_person_fields(store: &dyn Store) -> Result<()> {
    let mut split_authors = 0;
    let mut split_narrators = 0;

    for book in every_book(store)? {
        if split_book_authors(store, &book)? {
            split_authors += 1;
        }
        if split_book_narrators(store, &book)? {
            split_narrators += 1;
        }
    }

    info!(
        "Split authors on {} books and narrators on {} books",
        split_authors, split_narrators
    );
    Ok(())
}

fn split_book_authors(store: &dyn Store, book: &Book) -> Result<bool> {
    let Some(author_id) = book.author_id else {
        return Ok(false);
    };
    let Some(author) = store.get_author_by_id(author_id)? else {
        return Ok(false);
    };
    let names = split_names(&author.name);
    if names.len() < 2 {
        return Ok(false);
    }

    let mut links = store.get_book_authors(&book.id)?;
    let original_len = links.len();
    let mut first_id = None;
    for (position, name) in names.iter().enumerate() {
        let person = match store.get_author_by_name(name)? {
            Some(existing) => existing,
            None => store.create_author(name)?,
        };
        first_id.get_or_insert(person.id);
        let role = if position == 0 { ROLE_AUTHOR } else { ROLE_CO_AUTHOR };
        if links
            .iter()
            .any(|l| l.author_id == person.id && l.role == role)
        {
            continue;
        }
        links.push(BookAuthor {
            book_id: book.id.clone(),
            author_id: person.id,
            role: role.to_string(),
            position: position as i64,
        });
    }
    if links.len() != original_len {
        store.set_book_authors(&book.id, &links)?;
    }

    if first_id.is_some() && first_id != book.author_id {
        let mut repointed = book.clone();
        repointed.author_id = first_id;
        store.update_book(&book.id, repointed)?;
    }
    Ok(true)
}

fn split_book_narrators(store: &dyn Store, book: &Book) -> Result<bool> {
    let Some(text) = book.narrator.as_deref() else {
        return Ok(false);
    };
    let names = split_names(text);
    if names.len() < 2 {
        return Ok(false);
    }

    let mut links = store.get_book_narrators(&book.id)?;
    let original_len = links.len();
    for (position, name) in names.iter().enumerate() {
        let person = match store.get_narrator_by_name(name)? {
            Some(existing) => existing,
            None => store.create_narrator(name)?,
        };
        let role = if position == 0 {
            ROLE_NARRATOR
        } else {
            ROLE_CO_NARRATOR
        };
        if links
            .iter()
            .any(|l| l.narrator_id == person.id && l.role == role)
        {
            continue;
        }
        links.push(BookNarrator {
            book_id: book.id.clone(),
            narrator_id: person.id,
            role: role.to_string(),
            position: position as i64,
        });
    }
    if links.len() != original_len {
        store.set_book_narrators(&book.id, &links)?;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::kv::KvStore;
    use crate::db::sqlite_store::SqliteStore;

    fn engines() -> Vec<Box<dyn Store>> {
        vec![
            Box::new(SqliteStore::open_in_memory().unwrap()),
            Box::new(KvStore::open_in_memory().unwrap()),
        ]
    }

    #[test]
    fn test_fresh_store_reaches_latest() {
        for store in engines() {
            let store = store.as_ref();
            assert_eq!(current_version(store).unwrap(), 0);
            assert_eq!(run_migrations(store).unwrap(), latest_version());
            assert_eq!(current_version(store).unwrap(), latest_version());

            let history = migration_history(store).unwrap();
            let versions: Vec<u32> = history.iter().map(|r| r.version).collect();
            assert_eq!(versions, vec![1, 2, 3, 4, 5, 6]);
        }
    }

    #[test]
    fn test_second_run_is_a_no_op() {
        for store in engines() {
            let store = store.as_ref();
            run_migrations(store).unwrap();
            let before = store.get_user_preference(VERSION_KEY).unwrap().unwrap();
            assert_eq!(run_migrations(store).unwrap(), latest_version());
            let after = store.get_user_preference(VERSION_KEY).unwrap().unwrap();
            assert_eq!(before.value, after.value);
        }
    }

    #[test]
    fn test_only_pending_steps_run() {
        for store in engines() {
            let store = store.as_ref();
            let version = DatabaseVersion {
                version: 4,
                updated_at: Utc::now(),
            };
            store
                .set_user_preference(VERSION_KEY, &serde_json::to_string(&version).unwrap())
                .unwrap();
            run_migrations(store).unwrap();
            let versions: Vec<u32> = migration_history(store)
                .unwrap()
                .iter()
                .map(|r| r.version)
                .collect();
            assert_eq!(versions, vec![5, 6]);
        }
    }

    #[test]
    fn test_unreadable_version_is_an_error() {
        for store in engines() {
            let store = store.as_ref();
            store.set_user_preference(VERSION_KEY, "{not json").unwrap();
            let err = run_migrations(store).unwrap_err();
            assert_eq!(err.error_type(), "EncodingError");
        }
    }

    #[test]
    fn test_unreadable_history_is_skipped() {
        for store in engines() {
            let store = store.as_ref();
            run_migrations(store).unwrap();
            store.set_user_preference("migration_99", "garbage").unwrap();
            assert_eq!(migration_history(store).unwrap().len(), 6);
        }
    }

    #[test]
    fn test_split_authors_and_narrators() {
        for store in engines() {
            let store = store.as_ref();
            let joined = store.create_author("Terry Pratchett & Neil Gaiman").unwrap();
            let gaiman = store.create_author("Neil Gaiman").unwrap();
            let mut book = Book::new("Good Omens", "/good-omens.m4b");
            book.author_id = Some(joined.id);
            book.narrator = Some("Martin Jarvis &  Mark Heap".to_string());
            let book = store.create_book(book).unwrap();
            store.soft_delete_book(&book.id).unwrap();

            run_migrations(store).unwrap();

            let pratchett = store.get_author_by_name("Terry Pratchett").unwrap().unwrap();
            let links = store.get_book_authors(&book.id).unwrap();
            assert_eq!(links.len(), 2);
            assert_eq!(links[0].author_id, pratchett.id);
            assert_eq!(links[0].role, ROLE_AUTHOR);
            assert_eq!(links[0].position, 0);
            assert_eq!(links[1].author_id, gaiman.id);
            assert_eq!(links[1].role, ROLE_CO_AUTHOR);
            assert_eq!(links[1].position, 1);

            let stored = store.get_book_by_id(&book.id).unwrap().unwrap();
            assert_eq!(stored.author_id, Some(pratchett.id));
            assert!(stored.marked_for_deletion);

            let narrators = store.get_book_narrators(&book.id).unwrap();
            assert_eq!(narrators.len(), 2);
            assert_eq!(narrators[1].role, ROLE_CO_NARRATOR);
            let heap = store.get_narrator_by_name("Mark Heap").unwrap().unwrap();
            assert_eq!(narrators[1].narrator_id, heap.id);
        }
    }

    #[test]
    fn test_split_step_is_idempotent() {
        for store in engines() {
            let store = store.as_ref();
            let joined = store.create_author("A & B").unwrap();
            let mut book = Book::new("Shared", "/shared.mp3");
            book.author_id = Some(joined.id);
            book.narrator = Some("C & D".into());
            let book = store.create_book(book).unwrap();

            split_multi_person_fields(store).unwrap();
            split_multi_person_fields(store).unwrap();

            assert_eq!(store.get_book_authors(&book.id).unwrap().len(), 2);
            assert_eq!(store.get_book_narrators(&book.id).unwrap().len(), 2);
            assert_eq!(store.get_all_narrators().unwrap().len(), 2);
        }
    }

    #[test]
    fn test_single_names_untouched() {
        for store in engines() {
            let store = store.as_ref();
            let author = store.create_author("Solo").unwrap();
            let mut book = Book::new("Alone", "/alone.mp3");
            book.author_id = Some(author.id);
            book.narrator = Some("One Voice".into());
            let book = store.create_book(book).unwrap();

            split_multi_person_fields(store).unwrap();

            assert!(store.get_book_authors(&book.id).unwrap().is_empty());
            assert!(store.get_book_narrators(&book.id).unwrap().is_empty());
        }
    }
}
