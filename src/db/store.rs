//! Storage contract shared by every engine
//!
//! Single-entity lookups return `Ok(None)` when nothing matches. Unique-key
//! collisions and mutations of missing entities return
//! [`StoreError::ConstraintViolation`]. Listings that take `limit` treat `0`
//! as "no limit".

use crate::core::error::{Result, StoreError};
use crate::db::models::*;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Physical engine backing a [`Store`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Embedded ordered key-value engine (redb)
    #[serde(alias = "redb", alias = "pebble")]
    Kv,
    /// Relational engine (SQLite)
    #[serde(alias = "sqlite3")]
    Sqlite,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Kv => "kv",
            EngineKind::Sqlite => "sqlite",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "kv" | "redb" | "pebble" => Ok(EngineKind::Kv),
            "sqlite" | "sqlite3" => Ok(EngineKind::Sqlite),
            other => Err(StoreError::InvalidInput(format!(
                "unsupported engine: {} (supported: kv, sqlite)",
                other
            ))),
        }
    }
}

/// The persistence contract
///
/// Both engines implement every method with the same observable behavior.
/// Listing orders that callers may rely on are documented per method.
pub trait Store: Send + Sync {
    fn engine(&self) -> EngineKind;

    // ---- Authors ----

    /// All authors ordered by name
    fn get_all_authors(&self) -> Result<Vec<Author>>;
    fn get_author_by_id(&self, id: i64) -> Result<Option<Author>>;
    /// Case-insensitive exact match
    fn get_author_by_name(&self, name: &str) -> Result<Option<Author>>;
    fn create_author(&self, name: &str) -> Result<Author>;

    // ---- Narrators ----

    fn get_all_narrators(&self) -> Result<Vec<Narrator>>;
    fn get_narrator_by_id(&self, id: i64) -> Result<Option<Narrator>>;
    fn get_narrator_by_name(&self, name: &str) -> Result<Option<Narrator>>;
    fn create_narrator(&self, name: &str) -> Result<Narrator>;

    // ---- Series ----

    /// All series ordered by name
    fn get_all_series(&self) -> Result<Vec<Series>>;
    fn get_series_by_id(&self, id: i64) -> Result<Option<Series>>;
    fn get_series_by_name(&self, name: &str, author_id: Option<i64>) -> Result<Option<Series>>;
    fn create_series(&self, name: &str, author_id: Option<i64>) -> Result<Series>;

    // ---- Works ----

    fn get_all_works(&self) -> Result<Vec<Work>>;
    fn get_work_by_id(&self, id: &str) -> Result<Option<Work>>;
    /// Mints a ULID when `work.id` is empty
    fn create_work(&self, work: Work) -> Result<Work>;
    fn update_work(&self, id: &str, work: Work) -> Result<Work>;
    fn delete_work(&self, id: &str) -> Result<()>;
    fn get_books_by_work_id(&self, work_id: &str) -> Result<Vec<Book>>;

    // ---- Books ----

    /// Non-deleted books ordered by title
    fn get_all_books(&self, limit: usize, offset: usize) -> Result<Vec<Book>>;
    /// Returns the book even when soft-deleted
    fn get_book_by_id(&self, id: &str) -> Result<Option<Book>>;
    fn get_book_by_file_path(&self, path: &str) -> Result<Option<Book>>;
    fn get_book_by_file_hash(&self, hash: &str) -> Result<Option<Book>>;
    fn get_book_by_original_hash(&self, hash: &str) -> Result<Option<Book>>;
    fn get_book_by_organized_hash(&self, hash: &str) -> Result<Option<Book>>;
    /// Ordered by series sequence (missing last), then title
    fn get_books_by_series_id(&self, series_id: i64) -> Result<Vec<Book>>;
    /// Ordered by title
    fn get_books_by_author_id(&self, author_id: i64) -> Result<Vec<Book>>;
    /// Mints a ULID when `book.id` is empty and stamps both timestamps
    fn create_book(&self, book: Book) -> Result<Book>;
    /// Replaces the stored record; `created_at` is preserved
    fn update_book(&self, id: &str, book: Book) -> Result<Book>;
    /// Hard delete: record, indexes, links and metadata provenance. Missing ids are a no-op.
    fn delete_book(&self, id: &str) -> Result<()>;
    /// Case-insensitive title substring match over non-deleted books
    fn search_books(&self, query: &str, limit: usize, offset: usize) -> Result<Vec<Book>>;
    fn count_books(&self) -> Result<usize>;
    /// Groups of two or more live books sharing a dedup hash, each sorted by path
    fn get_duplicate_books(&self) -> Result<Vec<Vec<Book>>>;
    /// Primary version first, then title
    fn get_books_by_version_group(&self, group_id: &str) -> Result<Vec<Book>>;
    /// Most recently marked first, unmarked timestamps last
    fn list_soft_deleted_books(
        &self,
        limit: usize,
        offset: usize,
        older_than: Option<DateTime<Utc>>,
    ) -> Result<Vec<Book>>;
    fn get_dashboard_stats(&self) -> Result<DashboardStats>;

    /// Mark a book deleted without removing it
    fn soft_delete_book(&self, id: &str) -> Result<Book> {
        let mut book = self
            .get_book_by_id(id)?
            .ok_or_else(|| StoreError::missing("book", id))?;
        book.marked_for_deletion = true;
        book.marked_for_deletion_at = Some(Utc::now());
        self.update_book(id, book)
    }

    fn restore_book(&self, id: &str) -> Result<Book> {
        let mut book = self
            .get_book_by_id(id)?
            .ok_or_else(|| StoreError::missing("book", id))?;
        book.marked_for_deletion = false;
        book.marked_for_deletion_at = None;
        self.update_book(id, book)
    }

    // ---- Book links ----

    /// Ordered by position
    fn get_book_authors(&self, book_id: &str) -> Result<Vec<BookAuthor>>;
    /// Replaces every author link of the book
    fn set_book_authors(&self, book_id: &str, authors: &[BookAuthor]) -> Result<()>;
    fn get_book_narrators(&self, book_id: &str) -> Result<Vec<BookNarrator>>;
    fn set_book_narrators(&self, book_id: &str, narrators: &[BookNarrator]) -> Result<()>;

    // ---- Import paths ----

    /// Ordered by name
    fn get_all_import_paths(&self) -> Result<Vec<ImportPath>>;
    fn get_import_path_by_id(&self, id: i64) -> Result<Option<ImportPath>>;
    fn get_import_path_by_path(&self, path: &str) -> Result<Option<ImportPath>>;
    fn create_import_path(&self, path: &str, name: &str) -> Result<ImportPath>;
    fn update_import_path(&self, id: i64, import_path: &ImportPath) -> Result<()>;
    fn delete_import_path(&self, id: i64) -> Result<()>;
    /// Move legacy `library:*` keys to `import_path:*`; returns keys moved
    fn rename_legacy_import_path_keys(&self) -> Result<usize>;

    // ---- Operations ----

    fn create_operation(&self, id: &str, op_type: &str, folder_path: Option<&str>)
        -> Result<Operation>;
    fn get_operation_by_id(&self, id: &str) -> Result<Option<Operation>>;
    /// Newest first
    fn get_recent_operations(&self, limit: usize) -> Result<Vec<Operation>>;
    /// Stamps `started_at` on the first `running` and `completed_at` on the first terminal status
    fn update_operation_status(
        &self,
        id: &str,
        status: OperationStatus,
        progress: i64,
        total: i64,
        message: &str,
    ) -> Result<()>;
    fn update_operation_error(&self, id: &str, error_message: &str) -> Result<()>;
    fn add_operation_log(
        &self,
        operation_id: &str,
        level: &str,
        message: &str,
        details: Option<&str>,
    ) -> Result<()>;
    /// Oldest first
    fn get_operation_logs(&self, operation_id: &str) -> Result<Vec<OperationLog>>;

    // ---- Metadata provenance ----

    fn get_metadata_field_states(&self, book_id: &str) -> Result<Vec<MetadataFieldState>>;
    fn upsert_metadata_field_state(&self, state: &MetadataFieldState) -> Result<()>;
    fn delete_metadata_field_state(&self, book_id: &str, field: &str) -> Result<()>;

    // ---- Preferences ----

    fn get_user_preference(&self, key: &str) -> Result<Option<UserPreference>>;
    fn set_user_preference(&self, key: &str, value: &str) -> Result<()>;
    fn get_all_user_preferences(&self) -> Result<Vec<UserPreference>>;
    fn set_user_preference_for_user(&self, user_id: &str, key: &str, value: &str) -> Result<()>;
    fn get_user_preference_for_user(
        &self,
        user_id: &str,
        key: &str,
    ) -> Result<Option<UserPreferenceKV>>;
    fn get_all_preferences_for_user(&self, user_id: &str) -> Result<Vec<UserPreferenceKV>>;

    // ---- Settings ----

    fn get_setting(&self, key: &str) -> Result<Option<Setting>>;
    /// Insert or replace by key; the value is stored as given
    fn put_setting(&self, setting: &Setting) -> Result<()>;
    /// Ordered by key
    fn get_all_settings(&self) -> Result<Vec<Setting>>;
    fn delete_setting(&self, key: &str) -> Result<()>;

    // ---- Playlists ----

    fn create_playlist(&self, name: &str, series_id: Option<i64>, file_path: &str)
        -> Result<Playlist>;
    fn get_playlist_by_id(&self, id: i64) -> Result<Option<Playlist>>;
    fn get_playlist_by_series_id(&self, series_id: i64) -> Result<Option<Playlist>>;
    fn add_playlist_item(&self, playlist_id: i64, book_id: &str, position: i64)
        -> Result<PlaylistItem>;
    /// Ordered by position
    fn get_playlist_items(&self, playlist_id: i64) -> Result<Vec<PlaylistItem>>;

    // ---- Users and sessions ----

    fn create_user(
        &self,
        username: &str,
        email: &str,
        password_hash_algo: &str,
        password_hash: &str,
        roles: &[String],
        status: &str,
    ) -> Result<User>;
    fn get_user_by_id(&self, id: &str) -> Result<Option<User>>;
    fn get_user_by_username(&self, username: &str) -> Result<Option<User>>;
    fn get_user_by_email(&self, email: &str) -> Result<Option<User>>;
    fn update_user(&self, user: &User) -> Result<()>;
    fn count_users(&self) -> Result<usize>;
    fn create_session(
        &self,
        user_id: &str,
        ip: &str,
        user_agent: &str,
        ttl: Duration,
    ) -> Result<Session>;
    fn get_session(&self, id: &str) -> Result<Option<Session>>;
    fn revoke_session(&self, id: &str) -> Result<()>;
    fn list_user_sessions(&self, user_id: &str) -> Result<Vec<Session>>;
    /// Remove revoked or expired sessions; returns how many were removed
    fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize>;

    // ---- Segments ----

    fn create_book_segment(&self, book_id: &str, segment: BookSegment) -> Result<BookSegment>;
    fn list_book_segments(&self, book_id: &str) -> Result<Vec<BookSegment>>;
    /// Atomically add `segment`, deactivate `supersede_ids` and rebuild the duration map
    fn merge_book_segments(
        &self,
        book_id: &str,
        segment: BookSegment,
        supersede_ids: &[String],
    ) -> Result<BookSegment>;
    fn get_duration_map(&self, book_id: &str) -> Result<Option<DurationMap>>;

    // ---- Playback ----

    fn add_playback_event(&self, event: &PlaybackEvent) -> Result<()>;
    /// Newest first
    fn list_playback_events(
        &self,
        user_id: &str,
        book_id: &str,
        limit: usize,
    ) -> Result<Vec<PlaybackEvent>>;
    fn update_playback_progress(&self, progress: &PlaybackProgress) -> Result<()>;
    fn get_playback_progress(&self, user_id: &str, book_id: &str)
        -> Result<Option<PlaybackProgress>>;
    fn increment_book_play_stats(&self, book_id: &str, seconds: i64) -> Result<()>;
    /// Zero counters when nothing was recorded
    fn get_book_stats(&self, book_id: &str) -> Result<BookStats>;
    fn increment_user_listen_stats(&self, user_id: &str, seconds: i64) -> Result<()>;
    fn get_user_stats(&self, user_id: &str) -> Result<UserStats>;

    // ---- Do-not-import ----

    fn is_hash_blocked(&self, hash: &str) -> Result<bool>;
    /// Insert or replace
    fn add_blocked_hash(&self, hash: &str, reason: &str) -> Result<()>;
    fn remove_blocked_hash(&self, hash: &str) -> Result<()>;
    fn get_all_blocked_hashes(&self) -> Result<Vec<DoNotImport>>;
    fn get_blocked_hash_by_hash(&self, hash: &str) -> Result<Option<DoNotImport>>;

    // ---- Maintenance ----

    /// Remove every record and reset id counters
    fn reset(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_kind_parse() {
        assert_eq!("kv".parse::<EngineKind>().unwrap(), EngineKind::Kv);
        assert_eq!("Pebble".parse::<EngineKind>().unwrap(), EngineKind::Kv);
        assert_eq!("sqlite3".parse::<EngineKind>().unwrap(), EngineKind::Sqlite);
        assert!("postgres".parse::<EngineKind>().is_err());
    }

    #[test]
    fn test_engine_kind_serde() {
        let kind: EngineKind = serde_json::from_str("\"sqlite\"").unwrap();
        assert_eq!(kind, EngineKind::Sqlite);
        assert_eq!(serde_json::to_string(&EngineKind::Kv).unwrap(), "\"kv\"");
    }
}
