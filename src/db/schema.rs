//! Relational schema
//!
//! Tables are created with `IF NOT EXISTS` and evolve additively: columns
//! introduced after a table first shipped are added by inspecting
//! `pragma_table_info`, never by dropping or rebuilding anything.

use crate::core::error::Result;
use rusqlite::Connection;
use tracing::info;

/// Base tables
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS authors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE COLLATE NOCASE
);

CREATE TABLE IF NOT EXISTS narrators (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE COLLATE NOCASE,
    created_at DATETIME NOT NULL
);

CREATE TABLE IF NOT EXISTS series (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    author_id INTEGER,
    FOREIGN KEY (author_id) REFERENCES authors(id)
);

CREATE TABLE IF NOT EXISTS works (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    author_id INTEGER,
    series_id INTEGER,
    alt_titles TEXT,
    created_at DATETIME,
    updated_at DATETIME
);

CREATE TABLE IF NOT EXISTS books (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    author_id INTEGER,
    series_id INTEGER,
    series_sequence INTEGER,
    file_path TEXT NOT NULL UNIQUE,
    original_filename TEXT,
    format TEXT,
    duration INTEGER,
    print_year INTEGER,
    audiobook_release_year INTEGER,
    file_hash TEXT,
    file_size INTEGER,
    FOREIGN KEY (author_id) REFERENCES authors(id),
    FOREIGN KEY (series_id) REFERENCES series(id)
);

CREATE TABLE IF NOT EXISTS book_authors (
    book_id TEXT NOT NULL,
    author_id INTEGER NOT NULL,
    role TEXT NOT NULL DEFAULT 'author',
    position INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (book_id, author_id, role),
    FOREIGN KEY (book_id) REFERENCES books(id) ON DELETE CASCADE,
    FOREIGN KEY (author_id) REFERENCES authors(id)
);

CREATE TABLE IF NOT EXISTS book_narrators (
    book_id TEXT NOT NULL,
    narrator_id INTEGER NOT NULL,
    role TEXT NOT NULL DEFAULT 'narrator',
    position INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (book_id, narrator_id, role),
    FOREIGN KEY (book_id) REFERENCES books(id) ON DELETE CASCADE,
    FOREIGN KEY (narrator_id) REFERENCES narrators(id)
);

CREATE TABLE IF NOT EXISTS playlists (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    series_id INTEGER,
    file_path TEXT NOT NULL,
    FOREIGN KEY (series_id) REFERENCES series(id)
);

CREATE TABLE IF NOT EXISTS playlist_items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    playlist_id INTEGER NOT NULL,
    book_id TEXT NOT NULL,
    position INTEGER NOT NULL,
    FOREIGN KEY (playlist_id) REFERENCES playlists(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS import_paths (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    enabled BOOLEAN NOT NULL DEFAULT 1,
    created_at DATETIME NOT NULL,
    last_scan DATETIME,
    book_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS operations (
    id TEXT PRIMARY KEY,
    type TEXT NOT NULL,
    status TEXT NOT NULL,
    progress INTEGER NOT NULL DEFAULT 0,
    total INTEGER NOT NULL DEFAULT 0,
    message TEXT NOT NULL DEFAULT '',
    folder_path TEXT,
    created_at DATETIME NOT NULL,
    started_at DATETIME,
    completed_at DATETIME,
    error_message TEXT
);

CREATE TABLE IF NOT EXISTS operation_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation_id TEXT NOT NULL,
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    details TEXT,
    created_at DATETIME NOT NULL,
    FOREIGN KEY (operation_id) REFERENCES operations(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS user_preferences (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL UNIQUE,
    value TEXT,
    updated_at DATETIME NOT NULL
);

CREATE TABLE IF NOT EXISTS user_preferences_kv (
    user_id TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    updated_at DATETIME NOT NULL,
    PRIMARY KEY (user_id, key)
);

CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    type TEXT NOT NULL DEFAULT 'string',
    is_secret BOOLEAN NOT NULL DEFAULT 0,
    updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS metadata_states (
    book_id TEXT NOT NULL,
    field TEXT NOT NULL,
    fetched_value TEXT,
    override_value TEXT,
    override_locked BOOLEAN NOT NULL DEFAULT 0,
    updated_at DATETIME NOT NULL,
    PRIMARY KEY (book_id, field)
);

CREATE TABLE IF NOT EXISTS book_segments (
    id TEXT PRIMARY KEY,
    book_id TEXT NOT NULL,
    file_path TEXT NOT NULL,
    format TEXT,
    size_bytes INTEGER NOT NULL DEFAULT 0,
    duration_sec INTEGER NOT NULL DEFAULT 0,
    track_number INTEGER,
    active BOOLEAN NOT NULL DEFAULT 1,
    superseded_by TEXT,
    created_at DATETIME,
    updated_at DATETIME
);

CREATE TABLE IF NOT EXISTS book_duration_maps (
    book_id TEXT PRIMARY KEY,
    data TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS playback_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    book_id TEXT NOT NULL,
    segment_id TEXT,
    position_sec INTEGER NOT NULL,
    event_type TEXT NOT NULL,
    play_speed REAL,
    created_at DATETIME NOT NULL
);

CREATE TABLE IF NOT EXISTS playback_progress (
    user_id TEXT NOT NULL,
    book_id TEXT NOT NULL,
    segment_id TEXT,
    position_sec INTEGER NOT NULL,
    percent_complete REAL NOT NULL DEFAULT 0,
    updated_at DATETIME NOT NULL,
    PRIMARY KEY (user_id, book_id)
);

CREATE TABLE IF NOT EXISTS book_stats (
    book_id TEXT PRIMARY KEY,
    play_count INTEGER NOT NULL DEFAULT 0,
    listen_seconds INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS user_stats (
    user_id TEXT PRIMARY KEY,
    listen_seconds INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS do_not_import (
    hash TEXT PRIMARY KEY,
    reason TEXT NOT NULL,
    created_at DATETIME NOT NULL
);
"#;

/// Indexes; applied after column evolution since some cover added columns
const INDEXES: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_series_name_author
    ON series(name COLLATE NOCASE, IFNULL(author_id, 0));
CREATE INDEX IF NOT EXISTS idx_series_author ON series(author_id);
CREATE INDEX IF NOT EXISTS idx_works_title ON works(title);
CREATE INDEX IF NOT EXISTS idx_books_title ON books(title);
CREATE INDEX IF NOT EXISTS idx_books_author ON books(author_id);
CREATE INDEX IF NOT EXISTS idx_books_series ON books(series_id);
CREATE INDEX IF NOT EXISTS idx_books_work ON books(work_id);
CREATE INDEX IF NOT EXISTS idx_books_file_hash ON books(file_hash);
CREATE INDEX IF NOT EXISTS idx_books_original_hash ON books(original_file_hash);
CREATE INDEX IF NOT EXISTS idx_books_organized_hash ON books(organized_file_hash);
CREATE INDEX IF NOT EXISTS idx_books_version_group ON books(version_group_id);
CREATE INDEX IF NOT EXISTS idx_books_marked ON books(marked_for_deletion);
CREATE INDEX IF NOT EXISTS idx_playlist_items_playlist ON playlist_items(playlist_id);
CREATE INDEX IF NOT EXISTS idx_operations_created_at ON operations(created_at);
CREATE INDEX IF NOT EXISTS idx_operation_logs_operation ON operation_logs(operation_id);
CREATE INDEX IF NOT EXISTS idx_metadata_states_book ON metadata_states(book_id);
CREATE INDEX IF NOT EXISTS idx_book_segments_book ON book_segments(book_id);
CREATE INDEX IF NOT EXISTS idx_playback_events_user_book
    ON playback_events(user_id, book_id, created_at);
"#;

/// Book columns introduced after the first release
const EXTENDED_BOOK_COLUMNS: &[(&str, &str)] = &[
    ("work_id", "TEXT"),
    ("narrator", "TEXT"),
    ("edition", "TEXT"),
    ("language", "TEXT"),
    ("publisher", "TEXT"),
    ("isbn10", "TEXT"),
    ("isbn13", "TEXT"),
    ("bitrate_kbps", "INTEGER"),
    ("codec", "TEXT"),
    ("sample_rate_hz", "INTEGER"),
    ("channels", "INTEGER"),
    ("bit_depth", "INTEGER"),
    ("quality", "TEXT"),
    ("is_primary_version", "BOOLEAN DEFAULT 1"),
    ("version_group_id", "TEXT"),
    ("version_notes", "TEXT"),
    ("original_file_hash", "TEXT"),
    ("organized_file_hash", "TEXT"),
    ("library_state", "TEXT DEFAULT 'imported'"),
    ("quantity", "INTEGER DEFAULT 1"),
    ("marked_for_deletion", "BOOLEAN DEFAULT 0"),
    ("marked_for_deletion_at", "DATETIME"),
    ("created_at", "DATETIME"),
    ("updated_at", "DATETIME"),
];

/// Tables cleared by a reset, children before parents
pub const RESET_ORDER: &[&str] = &[
    "book_authors",
    "book_narrators",
    "playlist_items",
    "playlists",
    "operation_logs",
    "operations",
    "metadata_states",
    "book_segments",
    "book_duration_maps",
    "playback_events",
    "playback_progress",
    "book_stats",
    "user_stats",
    "books",
    "works",
    "series",
    "authors",
    "narrators",
    "import_paths",
    "user_preferences",
    "user_preferences_kv",
    "settings",
    "do_not_import",
];

/// Create missing tables, add missing columns, then create missing indexes
pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    let added = ensure_columns(conn, "books", EXTENDED_BOOK_COLUMNS)?;
    if added > 0 {
        info!(added, "Added missing columns to books table");
    }
    conn.execute_batch(INDEXES)?;
    Ok(())
}

/// Add each `(name, declaration)` column that `table` lacks; returns how many were added
pub fn ensure_columns(conn: &Connection, table: &str, columns: &[(&str, &str)]) -> Result<usize> {
    let existing = column_names(conn, table)?;
    let mut added = 0;
    for (name, declaration) in columns {
        if existing.iter().any(|c| c.eq_ignore_ascii_case(name)) {
            continue;
        }
        info!("Adding missing column '{}' to {} table", name, table);
        conn.execute(
            &format!("ALTER TABLE {} ADD COLUMN {} {}", table, name, declaration),
            [],
        )?;
        added += 1;
    }
    Ok(added)
}

pub fn column_names(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let names = stmt
        .query_map([table], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        initialize(&conn).unwrap();

        let columns = column_names(&conn, "books").unwrap();
        for (name, _) in EXTENDED_BOOK_COLUMNS {
            assert!(columns.iter().any(|c| c == name), "missing column {}", name);
        }
    }

    #[test]
    fn test_legacy_books_table_is_extended() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE books (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                author_id INTEGER,
                series_id INTEGER,
                series_sequence INTEGER,
                file_path TEXT NOT NULL UNIQUE,
                original_filename TEXT,
                format TEXT,
                duration INTEGER,
                print_year INTEGER,
                audiobook_release_year INTEGER,
                file_hash TEXT,
                file_size INTEGER
            );
            INSERT INTO books (id, title, file_path) VALUES ('b1', 'Old', '/old.mp3');",
        )
        .unwrap();

        initialize(&conn).unwrap();

        let (state, primary): (String, bool) = conn
            .query_row(
                "SELECT library_state, is_primary_version FROM books WHERE id = 'b1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(state, "imported");
        assert!(primary);
    }

    #[test]
    fn test_ensure_columns_reports_additions() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY)").unwrap();
        assert_eq!(ensure_columns(&conn, "t", &[("extra", "TEXT")]).unwrap(), 1);
        assert_eq!(ensure_columns(&conn, "t", &[("extra", "TEXT")]).unwrap(), 0);
    }
}
