//! Key layout
//!
//! Primary records live at `<family>:<id>`. Secondary indexes share the
//! family prefix and carry a literal marker (`book:path:<path>`), so a scan
//! over `<family>:` must drop index keys with [`is_primary`]. Composite
//! sub-records use fully qualified keys (`metadata_state:<book>:<field>`).

use chrono::{DateTime, Utc};

pub const AUTHOR: &str = "author:";
pub const NARRATOR: &str = "narrator:";
pub const SERIES: &str = "series:";
pub const WORK: &str = "work:";
pub const BOOK: &str = "book:";
pub const IMPORT_PATH: &str = "import_path:";
pub const LEGACY_IMPORT_PATH: &str = "library:";
pub const OPERATION: &str = "operation:";
pub const PREFERENCE: &str = "preference:";
pub const USER_PREFERENCE: &str = "pref:";
pub const SETTING: &str = "setting:";
pub const PLAYLIST: &str = "playlist:";
pub const USER: &str = "u:";
pub const SESSION: &str = "sess:";
pub const BLOCKED_HASH: &str = "blocked:hash:";

/// Counters handing out integer ids, each stored as the next id in decimal
pub const COUNTERS: &[&str] = &[
    "author",
    "series",
    "book",
    "import_path",
    "operationlog",
    "playlist",
    "playlistitem",
    "preference",
    "narrator",
];

pub const LEGACY_COUNTER: &str = "counter:library";

/// A key directly under `prefix` with no further `:` segment
pub fn is_primary(key: &str, prefix: &str) -> bool {
    key.strip_prefix(prefix)
        .map(|rest| !rest.is_empty() && !rest.contains(':'))
        .unwrap_or(false)
}

pub fn counter(name: &str) -> String {
    format!("counter:{}", name)
}

/// Zero-padded nanosecond timestamp so lexicographic order follows time
pub fn time_component(at: DateTime<Utc>) -> String {
    let nanos = at
        .timestamp_nanos_opt()
        .unwrap_or_else(|| at.timestamp_micros().saturating_mul(1000));
    format!("{:020}", nanos.max(0))
}

// ---- Authors, narrators, series, works ----
//
// Name keys fold ASCII case only, matching SQLite's NOCASE collation.

pub fn author(id: i64) -> String {
    format!("author:{}", id)
}

pub fn author_name(name: &str) -> String {
    format!("author:name:{}", name.to_ascii_lowercase())
}

pub fn narrator(id: i64) -> String {
    format!("narrator:{}", id)
}

pub fn narrator_name(name: &str) -> String {
    format!("narrator:name:{}", name.to_ascii_lowercase())
}

pub fn series(id: i64) -> String {
    format!("series:{}", id)
}

pub fn series_name(name: &str, author_id: Option<i64>) -> String {
    format!("series:name:{}:{}", name.to_ascii_lowercase(), author_id.unwrap_or(0))
}

pub fn work(id: &str) -> String {
    format!("work:{}", id)
}

// ---- Books ----

pub fn book(id: &str) -> String {
    format!("book:{}", id)
}

pub fn book_path(path: &str) -> String {
    format!("book:path:{}", path)
}

pub fn book_series_prefix(series_id: i64) -> String {
    format!("book:series:{}:", series_id)
}

pub fn book_series(series_id: i64, book_id: &str) -> String {
    format!("book:series:{}:{}", series_id, book_id)
}

pub fn book_author_prefix(author_id: i64) -> String {
    format!("book:author:{}:", author_id)
}

pub fn book_author(author_id: i64, book_id: &str) -> String {
    format!("book:author:{}:{}", author_id, book_id)
}

pub fn book_work_prefix(work_id: &str) -> String {
    format!("book:work:{}:", work_id)
}

pub fn book_work(work_id: &str, book_id: &str) -> String {
    format!("book:work:{}:{}", work_id, book_id)
}

/// Hash index families: plain file hash, pre-organize hash, post-organize hash
pub const HASH_KINDS: [&str; 3] = ["hash", "original_hash", "organized_hash"];

pub fn book_hash_prefix(kind: &str, hash: &str) -> String {
    format!("book:{}:{}:", kind, hash)
}

pub fn book_hash(kind: &str, hash: &str, book_id: &str) -> String {
    format!("book:{}:{}:{}", kind, hash, book_id)
}

pub fn book_version_group_prefix(group_id: &str) -> String {
    format!("book:version_group:{}:", group_id)
}

pub fn book_version_group(group_id: &str, book_id: &str) -> String {
    format!("book:version_group:{}:{}", group_id, book_id)
}

pub fn book_authors(book_id: &str) -> String {
    format!("book_authors:{}", book_id)
}

pub fn book_narrators(book_id: &str) -> String {
    format!("book_narrators:{}", book_id)
}

pub fn metadata_state_prefix(book_id: &str) -> String {
    format!("metadata_state:{}:", book_id)
}

pub fn metadata_state(book_id: &str, field: &str) -> String {
    format!("metadata_state:{}:{}", book_id, field)
}

// ---- Import paths ----

pub fn import_path(id: i64) -> String {
    format!("import_path:{}", id)
}

pub fn import_path_path(path: &str) -> String {
    format!("import_path:path:{}", path)
}

/// Current-family name for a legacy `library:*` key, if it is one
pub fn renamed_legacy_key(key: &str) -> Option<String> {
    if let Some(rest) = key.strip_prefix("library:path:") {
        return Some(format!("import_path:path:{}", rest));
    }
    key.strip_prefix(LEGACY_IMPORT_PATH)
        .map(|rest| format!("{}{}", IMPORT_PATH, rest))
}

// ---- Operations ----

pub fn operation(id: &str) -> String {
    format!("operation:{}", id)
}

pub fn operation_log_prefix(operation_id: &str) -> String {
    format!("operationlog:{}:", operation_id)
}

pub fn operation_log(operation_id: &str, at: DateTime<Utc>, seq: i64) -> String {
    format!(
        "operationlog:{}:{}:{:020}",
        operation_id,
        time_component(at),
        seq
    )
}

// ---- Preferences and settings ----

pub fn preference(key: &str) -> String {
    format!("preference:{}", key)
}

pub fn user_preference_prefix(user_id: &str) -> String {
    format!("pref:{}:", user_id)
}

pub fn user_preference(user_id: &str, key: &str) -> String {
    format!("pref:{}:{}", user_id, key)
}

pub fn setting(key: &str) -> String {
    format!("setting:{}", key)
}

// ---- Playlists ----

pub fn playlist(id: i64) -> String {
    format!("playlist:{}", id)
}

pub fn playlist_series(series_id: i64) -> String {
    format!("playlist:series:{}", series_id)
}

pub fn playlist_item_prefix(playlist_id: i64) -> String {
    format!("playlistitem:{}:", playlist_id)
}

pub fn playlist_item(playlist_id: i64, item_id: i64) -> String {
    format!("playlistitem:{}:{}", playlist_id, item_id)
}

// ---- Users and sessions ----

pub fn user(id: &str) -> String {
    format!("u:{}", id)
}

pub fn user_username(username: &str) -> String {
    format!("idx:user:username:{}", username.to_lowercase())
}

pub fn user_email(email: &str) -> String {
    format!("idx:user:email:{}", email.to_lowercase())
}

pub fn session(id: &str) -> String {
    format!("sess:{}", id)
}

pub fn user_session_prefix(user_id: &str) -> String {
    format!("idx:sess:user:{}:", user_id)
}

pub fn user_session(user_id: &str, session_id: &str) -> String {
    format!("idx:sess:user:{}:{}", user_id, session_id)
}

// ---- Segments ----

pub fn segment(id: &str) -> String {
    format!("bf:{}", id)
}

pub fn book_segment_prefix(book_id: &str) -> String {
    format!("bfs:{}:", book_id)
}

pub fn book_segment(book_id: &str, segment_id: &str) -> String {
    format!("bfs:{}:{}", book_id, segment_id)
}

pub fn duration_map(book_id: &str) -> String {
    format!("b:duration_map:{}", book_id)
}

// ---- Playback ----

pub fn playback_event_prefix(user_id: &str, book_id: &str) -> String {
    format!("playe:{}:{}:", user_id, book_id)
}

pub fn playback_event(user_id: &str, book_id: &str, at: DateTime<Utc>, id: &str) -> String {
    format!("playe:{}:{}:{}:{}", user_id, book_id, time_component(at), id)
}

pub fn playback_progress(user_id: &str, book_id: &str) -> String {
    format!("playp:{}:{}", user_id, book_id)
}

pub fn book_stats(book_id: &str) -> String {
    format!("stats:book:{}", book_id)
}

pub fn user_stats(user_id: &str) -> String {
    format!("stats:user:{}", user_id)
}

// ---- Blocklist ----

pub fn blocked_hash(hash: &str) -> String {
    format!("blocked:hash:{}", hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_is_primary() {
        assert!(is_primary("book:01HX", BOOK));
        assert!(!is_primary("book:path:/a/b.m4b", BOOK));
        assert!(!is_primary("book:", BOOK));
        assert!(!is_primary("author:1", BOOK));
    }

    #[test]
    fn test_legacy_rename() {
        assert_eq!(
            renamed_legacy_key("library:path:/audio").as_deref(),
            Some("import_path:path:/audio")
        );
        assert_eq!(renamed_legacy_key("library:3").as_deref(), Some("import_path:3"));
        assert_eq!(renamed_legacy_key("import_path:3"), None);
    }

    #[test]
    fn test_time_component_sorts_chronologically() {
        let early = Utc.with_ymd_and_hms(2001, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let (a, b) = (time_component(early), time_component(late));
        assert_eq!(a.len(), 20);
        assert!(a < b);
    }

    #[test]
    fn test_case_insensitive_indexes() {
        assert_eq!(author_name("Le Guin"), author_name("le guin"));
        assert_eq!(series_name("Earthsea", None), "series:name:earthsea:0");
        assert_eq!(user_email("A@Example.com"), "idx:user:email:a@example.com");
    }
}
