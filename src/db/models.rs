//! Database models
//!
//! Data structures persisted by both engines. The key-value engine stores
//! them as JSON, the relational engine maps them onto columns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Author record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: i64,
    pub name: String,
}

/// Narrator record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Narrator {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Series record; the name is unique per author, including "no author"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Series {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub author_id: Option<i64>,
}

/// Logical title grouping several physical books
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Work {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub author_id: Option<i64>,
    #[serde(default)]
    pub series_id: Option<i64>,
    #[serde(default)]
    pub alt_titles: Vec<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Book record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub author_id: Option<i64>,
    #[serde(default)]
    pub series_id: Option<i64>,
    #[serde(default)]
    pub series_sequence: Option<i64>,
    pub file_path: String,
    #[serde(default)]
    pub original_filename: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    /// Seconds
    #[serde(default)]
    pub duration: Option<i64>,
    #[serde(default)]
    pub work_id: Option<String>,

    // Bibliographic
    #[serde(default)]
    pub narrator: Option<String>,
    #[serde(default)]
    pub edition: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub publisher: Option<String>,
    #[serde(default)]
    pub print_year: Option<i64>,
    #[serde(default)]
    pub audiobook_release_year: Option<i64>,
    #[serde(default)]
    pub isbn10: Option<String>,
    #[serde(default)]
    pub isbn13: Option<String>,

    // File and media
    #[serde(default)]
    pub file_hash: Option<String>,
    #[serde(default)]
    pub file_size: Option<i64>,
    #[serde(default)]
    pub bitrate_kbps: Option<i64>,
    #[serde(default)]
    pub codec: Option<String>,
    #[serde(default)]
    pub sample_rate_hz: Option<i64>,
    #[serde(default)]
    pub channels: Option<i64>,
    #[serde(default)]
    pub bit_depth: Option<i64>,
    #[serde(default)]
    pub quality: Option<String>,

    // Version clustering
    #[serde(default)]
    pub is_primary_version: bool,
    #[serde(default)]
    pub version_group_id: Option<String>,
    #[serde(default)]
    pub version_notes: Option<String>,

    // Content hashes before and after organization
    #[serde(default)]
    pub original_file_hash: Option<String>,
    #[serde(default)]
    pub organized_file_hash: Option<String>,

    #[serde(default)]
    pub library_state: Option<String>,
    #[serde(default)]
    pub quantity: Option<i64>,

    // Soft delete
    #[serde(default)]
    pub marked_for_deletion: bool,
    #[serde(default)]
    pub marked_for_deletion_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Book {
    /// A primary-version book with only the required fields set
    pub fn new(title: impl Into<String>, file_path: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            file_path: file_path.into(),
            is_primary_version: true,
            ..Default::default()
        }
    }

    /// Hash used for duplicate grouping: organized hash first, then file hash
    pub fn dedup_hash(&self) -> Option<&str> {
        self.organized_file_hash
            .as_deref()
            .filter(|h| !h.is_empty())
            .or_else(|| self.file_hash.as_deref().filter(|h| !h.is_empty()))
    }

    pub fn is_deleted(&self) -> bool {
        self.marked_for_deletion
    }
}

/// Role-tagged link between a book and an author
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookAuthor {
    pub book_id: String,
    pub author_id: i64,
    pub role: String,
    pub position: i64,
}

/// Role-tagged link between a book and a narrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookNarrator {
    pub book_id: String,
    pub narrator_id: i64,
    pub role: String,
    pub position: i64,
}

/// Managed import folder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportPath {
    pub id: i64,
    pub path: String,
    pub name: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_scan: Option<DateTime<Utc>>,
    #[serde(default)]
    pub book_count: i64,
}

/// Lifecycle of a long-running operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Running => "running",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Completed | OperationStatus::Failed)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OperationStatus::Pending),
            "running" => Ok(OperationStatus::Running),
            "completed" => Ok(OperationStatus::Completed),
            "failed" => Ok(OperationStatus::Failed),
            other => Err(format!("unknown operation status: {}", other)),
        }
    }
}

/// Long-running operation (scan, organize, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    #[serde(rename = "type")]
    pub op_type: String,
    pub status: OperationStatus,
    pub progress: i64,
    pub total: i64,
    pub message: String,
    #[serde(default)]
    pub folder_path: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl Operation {
    pub fn new(id: &str, op_type: &str, folder_path: Option<&str>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            op_type: op_type.to_string(),
            status: OperationStatus::Pending,
            progress: 0,
            total: 0,
            message: String::new(),
            folder_path: folder_path.map(str::to_string),
            created_at: now,
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    /// Record progress; start and completion times are set once and kept
    pub fn apply_status(
        &mut self,
        status: OperationStatus,
        progress: i64,
        total: i64,
        message: &str,
        now: DateTime<Utc>,
    ) {
        self.status = status;
        self.progress = progress;
        self.total = total;
        self.message = message.to_string();
        if status == OperationStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if status.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(now);
        }
    }

    pub fn fail(&mut self, error_message: &str, now: DateTime<Utc>) {
        self.status = OperationStatus::Failed;
        self.error_message = Some(error_message.to_string());
        if self.completed_at.is_none() {
            self.completed_at = Some(now);
        }
    }
}

/// Append-only log line of an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationLog {
    pub id: i64,
    pub operation_id: String,
    pub level: String,
    pub message: String,
    #[serde(default)]
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Global preference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPreference {
    pub id: i64,
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Per-user preference keyed by (user, key)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPreferenceKV {
    pub user_id: String,
    pub key: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

/// Provenance of one metadata field of one book
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataFieldState {
    pub book_id: String,
    pub field: String,
    #[serde(default)]
    pub fetched_value: Option<String>,
    #[serde(default)]
    pub override_value: Option<String>,
    /// Automated extraction must leave `override_value` alone while set
    #[serde(default)]
    pub override_locked: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Playlist {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub series_id: Option<i64>,
    pub file_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistItem {
    pub id: i64,
    pub playlist_id: i64,
    pub book_id: String,
    pub position: i64,
}

/// Account record (key-value engine only)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    pub password_hash_algo: String,
    pub password_hash: String,
    #[serde(default)]
    pub roles: Vec<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default = "default_version")]
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ip: String,
    pub user_agent: String,
    #[serde(default)]
    pub revoked: bool,
    #[serde(default = "default_version")]
    pub version: i64,
}

impl Session {
    /// Revoked or past its expiry at `now`
    pub fn is_dead(&self, now: DateTime<Utc>) -> bool {
        self.revoked || self.expires_at <= now
    }
}

/// One physical file contributing to an audiobook
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookSegment {
    pub id: String,
    pub book_id: String,
    pub file_path: String,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub size_bytes: i64,
    #[serde(default)]
    pub duration_sec: i64,
    #[serde(default)]
    pub track_number: Option<i64>,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub superseded_by: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Entry of a per-book duration map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationEntry {
    pub id: String,
    pub duration: i64,
    pub active: bool,
    pub offset_start: i64,
}

/// Denormalized playback layout of a book's active segments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationMap {
    pub segments: Vec<DurationEntry>,
    pub total_duration: i64,
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackEvent {
    pub user_id: String,
    pub book_id: String,
    #[serde(default)]
    pub segment_id: Option<String>,
    pub position_sec: i64,
    pub event_type: String,
    #[serde(default)]
    pub play_speed: Option<f64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackProgress {
    pub user_id: String,
    pub book_id: String,
    #[serde(default)]
    pub segment_id: Option<String>,
    pub position_sec: i64,
    #[serde(default)]
    pub percent_complete: f64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookStats {
    pub book_id: String,
    pub play_count: i64,
    pub listen_seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStats {
    pub user_id: String,
    pub listen_seconds: i64,
}

/// Content hash that the import pipeline must skip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoNotImport {
    pub hash: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Stored configuration value; `value` is ciphertext when `is_secret`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Setting {
    pub key: String,
    pub value: String,
    #[serde(rename = "type")]
    pub value_type: String,
    pub is_secret: bool,
}

/// Aggregates over non-deleted books
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardStats {
    pub total_books: i64,
    pub total_duration: i64,
    pub total_size: i64,
    pub state_distribution: HashMap<String, i64>,
    pub format_distribution: HashMap<String, i64>,
}

/// History entry written after each applied migration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub version: u32,
    pub description: String,
    pub applied_at: DateTime<Utc>,
}

/// Currently applied migration version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseVersion {
    pub version: u32,
    pub updated_at: DateTime<Utc>,
}

fn default_version() -> i64 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_hash_prefers_organized() {
        let mut book = Book::new("Dune", "/a/dune.m4b");
        assert_eq!(book.dedup_hash(), None);

        book.file_hash = Some("f1".to_string());
        assert_eq!(book.dedup_hash(), Some("f1"));

        book.organized_file_hash = Some("o1".to_string());
        assert_eq!(book.dedup_hash(), Some("o1"));

        book.organized_file_hash = Some(String::new());
        assert_eq!(book.dedup_hash(), Some("f1"));
    }

    #[test]
    fn test_operation_status_roundtrip() {
        for status in [
            OperationStatus::Pending,
            OperationStatus::Running,
            OperationStatus::Completed,
            OperationStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<OperationStatus>().unwrap(), status);
        }
        assert!("paused".parse::<OperationStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&OperationStatus::Running).unwrap(),
            "\"running\""
        );
    }

    #[test]
    fn test_operation_timestamps_set_once() {
        let start = Utc::now();
        let mut op = Operation::new("op1", "scan", None, start);
        op.apply_status(OperationStatus::Running, 1, 10, "scanning", start);
        let later = start + chrono::Duration::seconds(5);
        op.apply_status(OperationStatus::Running, 5, 10, "scanning", later);
        assert_eq!(op.started_at, Some(start));
        assert!(op.completed_at.is_none());

        op.apply_status(OperationStatus::Completed, 10, 10, "done", later);
        assert_eq!(op.completed_at, Some(later));

        let mut failed = Operation::new("op2", "scan", Some("/lib"), start);
        failed.fail("disk gone", later);
        assert_eq!(failed.status, OperationStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("disk gone"));
        assert_eq!(failed.completed_at, Some(later));
    }

    #[test]
    fn test_book_decodes_sparse_json() {
        let book: Book =
            serde_json::from_str(r#"{"id":"01H","title":"T","file_path":"/x.mp3"}"#).unwrap();
        assert!(!book.marked_for_deletion);
        assert!(book.author_id.is_none());
    }
}
