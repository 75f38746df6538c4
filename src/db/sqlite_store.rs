//! Relational engine
//!
//! Maps the storage contract onto SQLite tables. Uniqueness and referential
//! integrity come from native constraints, which SQLite reports as
//! constraint failures and [`StoreError`] turns into `ConstraintViolation`.
//! Account and session management is not available in this mode.

use crate::core::error::{Result, StoreError};
use crate::core::ids::assign_id;
use crate::db::manager::DatabaseManager;
use crate::db::models::*;
use crate::db::scan;
use crate::db::schema;
use crate::db::store::{EngineKind, Store};
use chrono::{DateTime, Duration, Utc};
use lazy_static::lazy_static;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Params, Row, ToSql};
use std::path::Path;

const UNSUPPORTED: &str = "relational mode";

/// Every persisted book column, in select order
const BOOK_FIELDS: &[&str] = &[
    "id",
    "title",
    "author_id",
    "series_id",
    "series_sequence",
    "file_path",
    "original_filename",
    "format",
    "duration",
    "work_id",
    "narrator",
    "edition",
    "language",
    "publisher",
    "print_year",
    "audiobook_release_year",
    "isbn10",
    "isbn13",
    "file_hash",
    "file_size",
    "bitrate_kbps",
    "codec",
    "sample_rate_hz",
    "channels",
    "bit_depth",
    "quality",
    "is_primary_version",
    "version_group_id",
    "version_notes",
    "original_file_hash",
    "organized_file_hash",
    "library_state",
    "quantity",
    "marked_for_deletion",
    "marked_for_deletion_at",
    "created_at",
    "updated_at",
];

const LIVE: &str = "COALESCE(marked_for_deletion, 0) = 0";

lazy_static! {
    static ref BOOK_SELECT: String = format!("SELECT {} FROM books", BOOK_FIELDS.join(", "));
    static ref BOOK_INSERT: String = format!(
        "INSERT INTO books ({}) VALUES ({})",
        BOOK_FIELDS.join(", "),
        BOOK_FIELDS
            .iter()
            .map(|f| format!(":{}", f))
            .collect::<Vec<_>>()
            .join(", ")
    );
    static ref BOOK_UPDATE: String = format!(
        "UPDATE books SET {} WHERE id = :id",
        BOOK_FIELDS
            .iter()
            .filter(|f| **f != "id")
            .map(|f| format!("{} = :{}", f, f))
            .collect::<Vec<_>>()
            .join(", ")
    );
}

/// SQLite-backed [`Store`]
pub struct SqliteStore {
    db: DatabaseManager,
}

impl SqliteStore {
    /// Open (or create) a database file and bring its schema up to date
    pub fn open(path: &Path, pool_size: u32, busy_timeout: std::time::Duration) -> Result<Self> {
        Self::with_manager(DatabaseManager::new(path, pool_size, busy_timeout)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_manager(DatabaseManager::new_in_memory()?)
    }

    pub fn with_manager(db: DatabaseManager) -> Result<Self> {
        db.with_conn(schema::initialize)?;
        Ok(Self { db })
    }

    pub fn manager(&self) -> &DatabaseManager {
        &self.db
    }

    /// Consistent copy of the database file
    pub fn backup(&self, path: &Path) -> Result<()> {
        self.db.backup(path)
    }
}

fn limit_param(limit: usize) -> i64 {
    if limit == 0 {
        -1
    } else {
        limit as i64
    }
}

fn json_column<T: serde::de::DeserializeOwned>(idx: usize, text: &str) -> rusqlite::Result<T> {
    serde_json::from_str(text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn book_from_row(row: &Row<'_>) -> rusqlite::Result<Book> {
    Ok(Book {
        id: row.get("id")?,
        title: row.get("title")?,
        author_id: row.get("author_id")?,
        series_id: row.get("series_id")?,
        series_sequence: row.get("series_sequence")?,
        file_path: row.get("file_path")?,
        original_filename: row.get("original_filename")?,
        format: row.get("format")?,
        duration: row.get("duration")?,
        work_id: row.get("work_id")?,
        narrator: row.get("narrator")?,
        edition: row.get("edition")?,
        language: row.get("language")?,
        publisher: row.get("publisher")?,
        print_year: row.get("print_year")?,
        audiobook_release_year: row.get("audiobook_release_year")?,
        isbn10: row.get("isbn10")?,
        isbn13: row.get("isbn13")?,
        file_hash: row.get("file_hash")?,
        file_size: row.get("file_size")?,
        bitrate_kbps: row.get("bitrate_kbps")?,
        codec: row.get("codec")?,
        sample_rate_hz: row.get("sample_rate_hz")?,
        channels: row.get("channels")?,
        bit_depth: row.get("bit_depth")?,
        quality: row.get("quality")?,
        is_primary_version: row
            .get::<_, Option<bool>>("is_primary_version")?
            .unwrap_or(true),
        version_group_id: row.get("version_group_id")?,
        version_notes: row.get("version_notes")?,
        original_file_hash: row.get("original_file_hash")?,
        organized_file_hash: row.get("organized_file_hash")?,
        library_state: row.get("library_state")?,
        quantity: row.get("quantity")?,
        marked_for_deletion: row
            .get::<_, Option<bool>>("marked_for_deletion")?
            .unwrap_or(false),
        marked_for_deletion_at: row.get("marked_for_deletion_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn book_params(book: &Book) -> Vec<(&'static str, &dyn ToSql)> {
    vec![
        (":id", &book.id),
        (":title", &book.title),
        (":author_id", &book.author_id),
        (":series_id", &book.series_id),
        (":series_sequence", &book.series_sequence),
        (":file_path", &book.file_path),
        (":original_filename", &book.original_filename),
        (":format", &book.format),
        (":duration", &book.duration),
        (":work_id", &book.work_id),
        (":narrator", &book.narrator),
        (":edition", &book.edition),
        (":language", &book.language),
        (":publisher", &book.publisher),
        (":print_year", &book.print_year),
        (":audiobook_release_year", &book.audiobook_release_year),
        (":isbn10", &book.isbn10),
        (":isbn13", &book.isbn13),
        (":file_hash", &book.file_hash),
        (":file_size", &book.file_size),
        (":bitrate_kbps", &book.bitrate_kbps),
        (":codec", &book.codec),
        (":sample_rate_hz", &book.sample_rate_hz),
        (":channels", &book.channels),
        (":bit_depth", &book.bit_depth),
        (":quality", &book.quality),
        (":is_primary_version", &book.is_primary_version),
        (":version_group_id", &book.version_group_id),
        (":version_notes", &book.version_notes),
        (":original_file_hash", &book.original_file_hash),
        (":organized_file_hash", &book.organized_file_hash),
        (":library_state", &book.library_state),
        (":quantity", &book.quantity),
        (":marked_for_deletion", &book.marked_for_deletion),
        (":marked_for_deletion_at", &book.marked_for_deletion_at),
        (":created_at", &book.created_at),
        (":updated_at", &book.updated_at),
    ]
}

fn query_books<P: Params>(conn: &Connection, clause: &str, params: P) -> Result<Vec<Book>> {
    let sql = format!("{} {}", BOOK_SELECT.as_str(), clause);
    let mut stmt = conn.prepare(&sql)?;
    let books = stmt
        .query_map(params, book_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(books)
}

fn query_book<P: Params>(conn: &Connection, clause: &str, params: P) -> Result<Option<Book>> {
    let sql = format!("{} {}", BOOK_SELECT.as_str(), clause);
    Ok(conn.query_row(&sql, params, book_from_row).optional()?)
}

fn author_from_row(row: &Row<'_>) -> rusqlite::Result<Author> {
    Ok(Author {
        id: row.get("id")?,
        name: row.get("name")?,
    })
}

fn narrator_from_row(row: &Row<'_>) -> rusqlite::Result<Narrator> {
    Ok(Narrator {
        id: row.get("id")?,
        name: row.get("name")?,
        created_at: row.get("created_at")?,
    })
}

fn series_from_row(row: &Row<'_>) -> rusqlite::Result<Series> {
    Ok(Series {
        id: row.get("id")?,
        name: row.get("name")?,
        author_id: row.get("author_id")?,
    })
}

fn work_from_row(row: &Row<'_>) -> rusqlite::Result<Work> {
    let alt_titles: Option<String> = row.get("alt_titles")?;
    Ok(Work {
        id: row.get("id")?,
        title: row.get("title")?,
        author_id: row.get("author_id")?,
        series_id: row.get("series_id")?,
        alt_titles: match alt_titles.as_deref() {
            Some(text) if !text.is_empty() => json_column(4, text)?,
            _ => Vec::new(),
        },
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn import_path_from_row(row: &Row<'_>) -> rusqlite::Result<ImportPath> {
    Ok(ImportPath {
        id: row.get("id")?,
        path: row.get("path")?,
        name: row.get("name")?,
        enabled: row.get("enabled")?,
        created_at: row.get("created_at")?,
        last_scan: row.get("last_scan")?,
        book_count: row.get("book_count")?,
    })
}

fn operation_from_row(row: &Row<'_>) -> rusqlite::Result<Operation> {
    let status: String = row.get("status")?;
    Ok(Operation {
        id: row.get("id")?,
        op_type: row.get("type")?,
        status: status.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(2, Type::Text, e.into())
        })?,
        progress: row.get("progress")?,
        total: row.get("total")?,
        message: row.get("message")?,
        folder_path: row.get("folder_path")?,
        created_at: row.get("created_at")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
        error_message: row.get("error_message")?,
    })
}

fn segment_from_row(row: &Row<'_>) -> rusqlite::Result<BookSegment> {
    Ok(BookSegment {
        id: row.get("id")?,
        book_id: row.get("book_id")?,
        file_path: row.get("file_path")?,
        format: row.get("format")?,
        size_bytes: row.get("size_bytes")?,
        duration_sec: row.get("duration_sec")?,
        track_number: row.get("track_number")?,
        active: row.get("active")?,
        superseded_by: row.get("superseded_by")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn setting_from_row(row: &Row<'_>) -> rusqlite::Result<Setting> {
    Ok(Setting {
        key: row.get("key")?,
        value: row.get("value")?,
        value_type: row.get("type")?,
        is_secret: row.get("is_secret")?,
    })
}

fn blocked_from_row(row: &Row<'_>) -> rusqlite::Result<DoNotImport> {
    Ok(DoNotImport {
        hash: row.get("hash")?,
        reason: row.get("reason")?,
        created_at: row.get("created_at")?,
    })
}

fn collect<T, P, F>(conn: &Connection, sql: &str, params: P, map: F) -> Result<Vec<T>>
where
    P: Params,
    F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
{
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, map)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn insert_segment(conn: &Connection, segment: &BookSegment) -> Result<()> {
    conn.execute(
        "INSERT INTO book_segments (id, book_id, file_path, format, size_bytes, duration_sec, \
         track_number, active, superseded_by, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            segment.id,
            segment.book_id,
            segment.file_path,
            segment.format,
            segment.size_bytes,
            segment.duration_sec,
            segment.track_number,
            segment.active,
            segment.superseded_by,
            segment.created_at,
            segment.updated_at,
        ],
    )?;
    Ok(())
}

fn list_segments(conn: &Connection, book_id: &str) -> Result<Vec<BookSegment>> {
    collect(
        conn,
        "SELECT * FROM book_segments WHERE book_id = ?1 ORDER BY id",
        [book_id],
        segment_from_row,
    )
}

fn store_duration_map(conn: &Connection, book_id: &str) -> Result<()> {
    let map = scan::build_duration_map(&list_segments(conn, book_id)?);
    conn.execute(
        "INSERT INTO book_duration_maps (book_id, data) VALUES (?1, ?2) \
         ON CONFLICT(book_id) DO UPDATE SET data = excluded.data",
        params![book_id, serde_json::to_string(&map)?],
    )?;
    Ok(())
}

/// Stamp a fresh segment: id, owner, active flag and timestamps
pub(crate) fn prepare_segment(book_id: &str, mut segment: BookSegment) -> Result<BookSegment> {
    assign_id("segment", &mut segment.id)?;
    let now = Utc::now();
    segment.book_id = book_id.to_string();
    segment.active = true;
    segment.superseded_by = None;
    segment.created_at = Some(now);
    segment.updated_at = Some(now);
    Ok(segment)
}

impl SqliteStore {
    fn update_operation<F>(&self, id: &str, apply: F) -> Result<()>
    where
        F: FnOnce(&mut Operation),
    {
        self.db.transaction(|tx| {
            let mut op = tx
                .query_row(
                    "SELECT * FROM operations WHERE id = ?1",
                    [id],
                    operation_from_row,
                )
                .optional()?
                .ok_or_else(|| StoreError::missing("operation", id))?;
            apply(&mut op);
            tx.execute(
                "UPDATE operations SET status = ?1, progress = ?2, total = ?3, message = ?4, \
                 started_at = ?5, completed_at = ?6, error_message = ?7 WHERE id = ?8",
                params![
                    op.status.as_str(),
                    op.progress,
                    op.total,
                    op.message,
                    op.started_at,
                    op.completed_at,
                    op.error_message,
                    id,
                ],
            )?;
            Ok(())
        })
    }
}

impl Store for SqliteStore {
    fn engine(&self) -> EngineKind {
        EngineKind::Sqlite
    }

    // ---- Authors ----

    fn get_all_authors(&self) -> Result<Vec<Author>> {
        self.db.with_conn(|conn| {
            collect(
                conn,
                "SELECT id, name FROM authors ORDER BY name COLLATE BINARY, id",
                [],
                author_from_row,
            )
        })
    }

    fn get_author_by_id(&self, id: i64) -> Result<Option<Author>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row("SELECT id, name FROM authors WHERE id = ?1", [id], author_from_row)
                .optional()?)
        })
    }

    fn get_author_by_name(&self, name: &str) -> Result<Option<Author>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, name FROM authors WHERE name = ?1",
                    [name],
                    author_from_row,
                )
                .optional()?)
        })
    }

    fn create_author(&self, name: &str) -> Result<Author> {
        self.db.with_conn(|conn| {
            conn.execute("INSERT INTO authors (name) VALUES (?1)", [name])?;
            Ok(Author {
                id: conn.last_insert_rowid(),
                name: name.to_string(),
            })
        })
    }

    // ---- Narrators ----

    fn get_all_narrators(&self) -> Result<Vec<Narrator>> {
        self.db.with_conn(|conn| {
            collect(
                conn,
                "SELECT id, name, created_at FROM narrators ORDER BY name COLLATE BINARY, id",
                [],
                narrator_from_row,
            )
        })
    }

    fn get_narrator_by_id(&self, id: i64) -> Result<Option<Narrator>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, name, created_at FROM narrators WHERE id = ?1",
                    [id],
                    narrator_from_row,
                )
                .optional()?)
        })
    }

    fn get_narrator_by_name(&self, name: &str) -> Result<Option<Narrator>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, name, created_at FROM narrators WHERE name = ?1",
                    [name],
                    narrator_from_row,
                )
                .optional()?)
        })
    }

    fn create_narrator(&self, name: &str) -> Result<Narrator> {
        let created_at = Utc::now();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO narrators (name, created_at) VALUES (?1, ?2)",
                params![name, created_at],
            )?;
            Ok(Narrator {
                id: conn.last_insert_rowid(),
                name: name.to_string(),
                created_at,
            })
        })
    }

    // ---- Series ----

    fn get_all_series(&self) -> Result<Vec<Series>> {
        self.db.with_conn(|conn| {
            collect(
                conn,
                "SELECT id, name, author_id FROM series ORDER BY name, id",
                [],
                series_from_row,
            )
        })
    }

    fn get_series_by_id(&self, id: i64) -> Result<Option<Series>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, name, author_id FROM series WHERE id = ?1",
                    [id],
                    series_from_row,
                )
                .optional()?)
        })
    }

    fn get_series_by_name(&self, name: &str, author_id: Option<i64>) -> Result<Option<Series>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, name, author_id FROM series \
                     WHERE name = ?1 COLLATE NOCASE AND IFNULL(author_id, 0) = IFNULL(?2, 0)",
                    params![name, author_id],
                    series_from_row,
                )
                .optional()?)
        })
    }

    fn create_series(&self, name: &str, author_id: Option<i64>) -> Result<Series> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO series (name, author_id) VALUES (?1, ?2)",
                params![name, author_id],
            )?;
            Ok(Series {
                id: conn.last_insert_rowid(),
                name: name.to_string(),
                author_id,
            })
        })
    }

    // ---- Works ----

    fn get_all_works(&self) -> Result<Vec<Work>> {
        self.db.with_conn(|conn| {
            collect(conn, "SELECT * FROM works ORDER BY title, id", [], work_from_row)
        })
    }

    fn get_work_by_id(&self, id: &str) -> Result<Option<Work>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row("SELECT * FROM works WHERE id = ?1", [id], work_from_row)
                .optional()?)
        })
    }

    fn create_work(&self, mut work: Work) -> Result<Work> {
        assign_id("work", &mut work.id)?;
        let now = Utc::now();
        work.created_at = Some(now);
        work.updated_at = Some(now);
        let alt_titles = serde_json::to_string(&work.alt_titles)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO works (id, title, author_id, series_id, alt_titles, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    work.id,
                    work.title,
                    work.author_id,
                    work.series_id,
                    alt_titles,
                    work.created_at,
                    work.updated_at,
                ],
            )?;
            Ok(())
        })?;
        Ok(work)
    }

    fn update_work(&self, id: &str, mut work: Work) -> Result<Work> {
        let existing = self
            .get_work_by_id(id)?
            .ok_or_else(|| StoreError::missing("work", id))?;
        work.id = id.to_string();
        work.created_at = existing.created_at;
        work.updated_at = Some(Utc::now());
        let alt_titles = serde_json::to_string(&work.alt_titles)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE works SET title = ?1, author_id = ?2, series_id = ?3, alt_titles = ?4, \
                 updated_at = ?5 WHERE id = ?6",
                params![
                    work.title,
                    work.author_id,
                    work.series_id,
                    alt_titles,
                    work.updated_at,
                    id,
                ],
            )?;
            Ok(())
        })?;
        Ok(work)
    }

    fn delete_work(&self, id: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM works WHERE id = ?1", [id])?;
            Ok(())
        })
    }

    fn get_books_by_work_id(&self, work_id: &str) -> Result<Vec<Book>> {
        self.db.with_conn(|conn| {
            query_books(
                conn,
                &format!("WHERE work_id = ?1 AND {} ORDER BY title, id", LIVE),
                [work_id],
            )
        })
    }

    // ---- Books ----

    fn get_all_books(&self, limit: usize, offset: usize) -> Result<Vec<Book>> {
        self.db.with_conn(|conn| {
            query_books(
                conn,
                &format!("WHERE {} ORDER BY title, id LIMIT ?1 OFFSET ?2", LIVE),
                params![limit_param(limit), offset as i64],
            )
        })
    }

    fn get_book_by_id(&self, id: &str) -> Result<Option<Book>> {
        self.db.with_conn(|conn| query_book(conn, "WHERE id = ?1", [id]))
    }

    fn get_book_by_file_path(&self, path: &str) -> Result<Option<Book>> {
        self.db
            .with_conn(|conn| query_book(conn, "WHERE file_path = ?1", [path]))
    }

    fn get_book_by_file_hash(&self, hash: &str) -> Result<Option<Book>> {
        self.db.with_conn(|conn| {
            query_book(conn, "WHERE file_hash = ?1 ORDER BY id LIMIT 1", [hash])
        })
    }

    fn get_book_by_original_hash(&self, hash: &str) -> Result<Option<Book>> {
        self.db.with_conn(|conn| {
            query_book(conn, "WHERE original_file_hash = ?1 ORDER BY id LIMIT 1", [hash])
        })
    }

    fn get_book_by_organized_hash(&self, hash: &str) -> Result<Option<Book>> {
        self.db.with_conn(|conn| {
            query_book(conn, "WHERE organized_file_hash = ?1 ORDER BY id LIMIT 1", [hash])
        })
    }

    fn get_books_by_series_id(&self, series_id: i64) -> Result<Vec<Book>> {
        self.db.with_conn(|conn| {
            query_books(
                conn,
                &format!(
                    "WHERE series_id = ?1 AND {} \
                     ORDER BY series_sequence IS NULL, series_sequence, title",
                    LIVE
                ),
                [series_id],
            )
        })
    }

    fn get_books_by_author_id(&self, author_id: i64) -> Result<Vec<Book>> {
        self.db.with_conn(|conn| {
            query_books(
                conn,
                &format!("WHERE author_id = ?1 AND {} ORDER BY title, id", LIVE),
                [author_id],
            )
        })
    }

    fn create_book(&self, mut book: Book) -> Result<Book> {
        assign_id("book", &mut book.id)?;
        let now = Utc::now();
        book.created_at = Some(now);
        book.updated_at = Some(now);
        self.db.with_conn(|conn| {
            conn.execute(BOOK_INSERT.as_str(), book_params(&book).as_slice())?;
            Ok(())
        })?;
        Ok(book)
    }

    fn update_book(&self, id: &str, mut book: Book) -> Result<Book> {
        self.db.transaction(|tx| {
            let created_at: Option<Option<DateTime<Utc>>> = tx
                .query_row("SELECT created_at FROM books WHERE id = ?1", [id], |row| {
                    row.get(0)
                })
                .optional()?;
            let created_at = created_at.ok_or_else(|| StoreError::missing("book", id))?;

            book.id = id.to_string();
            book.created_at = created_at;
            book.updated_at = Some(Utc::now());
            tx.execute(BOOK_UPDATE.as_str(), book_params(&book).as_slice())?;
            Ok(())
        })?;
        Ok(book)
    }

    fn delete_book(&self, id: &str) -> Result<()> {
        self.db.transaction(|tx| {
            tx.execute("DELETE FROM metadata_states WHERE book_id = ?1", [id])?;
            tx.execute("DELETE FROM book_authors WHERE book_id = ?1", [id])?;
            tx.execute("DELETE FROM book_narrators WHERE book_id = ?1", [id])?;
            tx.execute("DELETE FROM books WHERE id = ?1", [id])?;
            Ok(())
        })
    }

    fn search_books(&self, query: &str, limit: usize, offset: usize) -> Result<Vec<Book>> {
        self.db.with_conn(|conn| {
            query_books(
                conn,
                &format!(
                    "WHERE instr(lower(title), lower(?1)) > 0 AND {} \
                     ORDER BY title, id LIMIT ?2 OFFSET ?3",
                    LIVE
                ),
                params![query, limit_param(limit), offset as i64],
            )
        })
    }

    fn count_books(&self) -> Result<usize> {
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM books WHERE {}", LIVE),
                [],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
    }

    fn get_duplicate_books(&self) -> Result<Vec<Vec<Book>>> {
        let candidates = self.db.with_conn(|conn| {
            query_books(
                conn,
                &format!(
                    "WHERE COALESCE(organized_file_hash, file_hash) IS NOT NULL AND {}",
                    LIVE
                ),
                [],
            )
        })?;
        Ok(scan::group_duplicates(candidates))
    }

    fn get_books_by_version_group(&self, group_id: &str) -> Result<Vec<Book>> {
        let mut books = self.db.with_conn(|conn| {
            query_books(
                conn,
                &format!("WHERE version_group_id = ?1 AND {}", LIVE),
                [group_id],
            )
        })?;
        scan::sort_version_group(&mut books);
        Ok(books)
    }

    fn list_soft_deleted_books(
        &self,
        limit: usize,
        offset: usize,
        older_than: Option<DateTime<Utc>>,
    ) -> Result<Vec<Book>> {
        let mut books = self.db.with_conn(|conn| {
            query_books(conn, "WHERE COALESCE(marked_for_deletion, 0) = 1", [])
        })?;
        if let Some(cutoff) = older_than {
            books.retain(|b| matches!(b.marked_for_deletion_at, Some(at) if at <= cutoff));
        }
        scan::sort_soft_deleted(&mut books);
        Ok(scan::paginate(books, limit, offset))
    }

    fn get_dashboard_stats(&self) -> Result<DashboardStats> {
        let books = self
            .db
            .with_conn(|conn| query_books(conn, &format!("WHERE {}", LIVE), []))?;
        Ok(scan::dashboard_stats(&books))
    }

    // ---- Book links ----

    fn get_book_authors(&self, book_id: &str) -> Result<Vec<BookAuthor>> {
        self.db.with_conn(|conn| {
            collect(
                conn,
                "SELECT book_id, author_id, role, position FROM book_authors \
                 WHERE book_id = ?1 ORDER BY position, author_id",
                [book_id],
                |row| {
                    Ok(BookAuthor {
                        book_id: row.get(0)?,
                        author_id: row.get(1)?,
                        role: row.get(2)?,
                        position: row.get(3)?,
                    })
                },
            )
        })
    }

    fn set_book_authors(&self, book_id: &str, authors: &[BookAuthor]) -> Result<()> {
        self.db.transaction(|tx| {
            tx.execute("DELETE FROM book_authors WHERE book_id = ?1", [book_id])?;
            for link in authors {
                tx.execute(
                    "INSERT INTO book_authors (book_id, author_id, role, position) \
                     VALUES (?1, ?2, ?3, ?4)",
                    params![book_id, link.author_id, link.role, link.position],
                )?;
            }
            Ok(())
        })
    }

    fn get_book_narrators(&self, book_id: &str) -> Result<Vec<BookNarrator>> {
        self.db.with_conn(|conn| {
            collect(
                conn,
                "SELECT book_id, narrator_id, role, position FROM book_narrators \
                 WHERE book_id = ?1 ORDER BY position, narrator_id",
                [book_id],
                |row| {
                    Ok(BookNarrator {
                        book_id: row.get(0)?,
                        narrator_id: row.get(1)?,
                        role: row.get(2)?,
                        position: row.get(3)?,
                    })
                },
            )
        })
    }

    fn set_book_narrators(&self, book_id: &str, narrators: &[BookNarrator]) -> Result<()> {
        self.db.transaction(|tx| {
            tx.execute("DELETE FROM book_narrators WHERE book_id = ?1", [book_id])?;
            for link in narrators {
                tx.execute(
                    "INSERT INTO book_narrators (book_id, narrator_id, role, position) \
                     VALUES (?1, ?2, ?3, ?4)",
                    params![book_id, link.narrator_id, link.role, link.position],
                )?;
            }
            Ok(())
        })
    }

    // ---- Import paths ----

    fn get_all_import_paths(&self) -> Result<Vec<ImportPath>> {
        self.db.with_conn(|conn| {
            collect(
                conn,
                "SELECT * FROM import_paths ORDER BY name, id",
                [],
                import_path_from_row,
            )
        })
    }

    fn get_import_path_by_id(&self, id: i64) -> Result<Option<ImportPath>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM import_paths WHERE id = ?1",
                    [id],
                    import_path_from_row,
                )
                .optional()?)
        })
    }

    fn get_import_path_by_path(&self, path: &str) -> Result<Option<ImportPath>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM import_paths WHERE path = ?1",
                    [path],
                    import_path_from_row,
                )
                .optional()?)
        })
    }

    fn create_import_path(&self, path: &str, name: &str) -> Result<ImportPath> {
        let created_at = Utc::now();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO import_paths (path, name, enabled, created_at, book_count) \
                 VALUES (?1, ?2, 1, ?3, 0)",
                params![path, name, created_at],
            )?;
            Ok(ImportPath {
                id: conn.last_insert_rowid(),
                path: path.to_string(),
                name: name.to_string(),
                enabled: true,
                created_at,
                last_scan: None,
                book_count: 0,
            })
        })
    }

    fn update_import_path(&self, id: i64, import_path: &ImportPath) -> Result<()> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE import_paths SET path = ?1, name = ?2, enabled = ?3, last_scan = ?4, \
                 book_count = ?5 WHERE id = ?6",
                params![
                    import_path.path,
                    import_path.name,
                    import_path.enabled,
                    import_path.last_scan,
                    import_path.book_count,
                    id,
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::missing("import path", id));
            }
            Ok(())
        })
    }

    fn delete_import_path(&self, id: i64) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM import_paths WHERE id = ?1", [id])?;
            Ok(())
        })
    }

    fn rename_legacy_import_path_keys(&self) -> Result<usize> {
        // Tables never used the legacy family name
        Ok(0)
    }

    // ---- Operations ----

    fn create_operation(
        &self,
        id: &str,
        op_type: &str,
        folder_path: Option<&str>,
    ) -> Result<Operation> {
        let op = Operation::new(id, op_type, folder_path, Utc::now());
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO operations (id, type, status, progress, total, message, folder_path, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    op.id,
                    op.op_type,
                    op.status.as_str(),
                    op.progress,
                    op.total,
                    op.message,
                    op.folder_path,
                    op.created_at,
                ],
            )?;
            Ok(())
        })?;
        Ok(op)
    }

    fn get_operation_by_id(&self, id: &str) -> Result<Option<Operation>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM operations WHERE id = ?1",
                    [id],
                    operation_from_row,
                )
                .optional()?)
        })
    }

    fn get_recent_operations(&self, limit: usize) -> Result<Vec<Operation>> {
        self.db.with_conn(|conn| {
            collect(
                conn,
                "SELECT * FROM operations ORDER BY created_at DESC, id DESC LIMIT ?1",
                [limit_param(limit)],
                operation_from_row,
            )
        })
    }

    fn update_operation_status(
        &self,
        id: &str,
        status: OperationStatus,
        progress: i64,
        total: i64,
        message: &str,
    ) -> Result<()> {
        let now = Utc::now();
        self.update_operation(id, |op| op.apply_status(status, progress, total, message, now))
    }

    fn update_operation_error(&self, id: &str, error_message: &str) -> Result<()> {
        let now = Utc::now();
        self.update_operation(id, |op| op.fail(error_message, now))
    }

    fn add_operation_log(
        &self,
        operation_id: &str,
        level: &str,
        message: &str,
        details: Option<&str>,
    ) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO operation_logs (operation_id, level, message, details, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![operation_id, level, message, details, Utc::now()],
            )?;
            Ok(())
        })
    }

    fn get_operation_logs(&self, operation_id: &str) -> Result<Vec<OperationLog>> {
        self.db.with_conn(|conn| {
            collect(
                conn,
                "SELECT id, operation_id, level, message, details, created_at \
                 FROM operation_logs WHERE operation_id = ?1 ORDER BY created_at, id",
                [operation_id],
                |row| {
                    Ok(OperationLog {
                        id: row.get(0)?,
                        operation_id: row.get(1)?,
                        level: row.get(2)?,
                        message: row.get(3)?,
                        details: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                },
            )
        })
    }

    // ---- Metadata provenance ----

    fn get_metadata_field_states(&self, book_id: &str) -> Result<Vec<MetadataFieldState>> {
        self.db.with_conn(|conn| {
            collect(
                conn,
                "SELECT book_id, field, fetched_value, override_value, override_locked, updated_at \
                 FROM metadata_states WHERE book_id = ?1 ORDER BY field",
                [book_id],
                |row| {
                    Ok(MetadataFieldState {
                        book_id: row.get(0)?,
                        field: row.get(1)?,
                        fetched_value: row.get(2)?,
                        override_value: row.get(3)?,
                        override_locked: row.get(4)?,
                        updated_at: row.get(5)?,
                    })
                },
            )
        })
    }

    fn upsert_metadata_field_state(&self, state: &MetadataFieldState) -> Result<()> {
        if state.book_id.is_empty() || state.field.is_empty() {
            return Err(StoreError::InvalidInput(
                "metadata state requires book_id and field".to_string(),
            ));
        }
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO metadata_states (book_id, field, fetched_value, override_value, override_locked, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(book_id, field) DO UPDATE SET \
                 fetched_value = excluded.fetched_value, override_value = excluded.override_value, \
                 override_locked = excluded.override_locked, updated_at = excluded.updated_at",
                params![
                    state.book_id,
                    state.field,
                    state.fetched_value,
                    state.override_value,
                    state.override_locked,
                    state.updated_at,
                ],
            )?;
            Ok(())
        })
    }

    fn delete_metadata_field_state(&self, book_id: &str, field: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM metadata_states WHERE book_id = ?1 AND field = ?2",
                [book_id, field],
            )?;
            Ok(())
        })
    }

    // ---- Preferences ----

    fn get_user_preference(&self, key: &str) -> Result<Option<UserPreference>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, key, value, updated_at FROM user_preferences WHERE key = ?1",
                    [key],
                    |row| {
                        Ok(UserPreference {
                            id: row.get(0)?,
                            key: row.get(1)?,
                            value: row.get(2)?,
                            updated_at: row.get(3)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    fn set_user_preference(&self, key: &str, value: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO user_preferences (key, value, updated_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, Utc::now()],
            )?;
            Ok(())
        })
    }

    fn get_all_user_preferences(&self) -> Result<Vec<UserPreference>> {
        self.db.with_conn(|conn| {
            collect(
                conn,
                "SELECT id, key, value, updated_at FROM user_preferences ORDER BY key",
                [],
                |row| {
                    Ok(UserPreference {
                        id: row.get(0)?,
                        key: row.get(1)?,
                        value: row.get(2)?,
                        updated_at: row.get(3)?,
                    })
                },
            )
        })
    }

    fn set_user_preference_for_user(&self, user_id: &str, key: &str, value: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO user_preferences_kv (user_id, key, value, updated_at) VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(user_id, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![user_id, key, value, Utc::now()],
            )?;
            Ok(())
        })
    }

    fn get_user_preference_for_user(
        &self,
        user_id: &str,
        key: &str,
    ) -> Result<Option<UserPreferenceKV>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT user_id, key, value, updated_at FROM user_preferences_kv \
                     WHERE user_id = ?1 AND key = ?2",
                    [user_id, key],
                    |row| {
                        Ok(UserPreferenceKV {
                            user_id: row.get(0)?,
                            key: row.get(1)?,
                            value: row.get(2)?,
                            updated_at: row.get(3)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    fn get_all_preferences_for_user(&self, user_id: &str) -> Result<Vec<UserPreferenceKV>> {
        self.db.with_conn(|conn| {
            collect(
                conn,
                "SELECT user_id, key, value, updated_at FROM user_preferences_kv \
                 WHERE user_id = ?1 ORDER BY key",
                [user_id],
                |row| {
                    Ok(UserPreferenceKV {
                        user_id: row.get(0)?,
                        key: row.get(1)?,
                        value: row.get(2)?,
                        updated_at: row.get(3)?,
                    })
                },
            )
        })
    }

    // ---- Settings ----

    fn get_setting(&self, key: &str) -> Result<Option<Setting>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT key, value, type, is_secret FROM settings WHERE key = ?1",
                    [key],
                    setting_from_row,
                )
                .optional()?)
        })
    }

    fn put_setting(&self, setting: &Setting) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO settings (key, value, type, is_secret, updated_at) VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, type = excluded.type, \
                 is_secret = excluded.is_secret, updated_at = excluded.updated_at",
                params![
                    setting.key,
                    setting.value,
                    setting.value_type,
                    setting.is_secret,
                    Utc::now(),
                ],
            )?;
            Ok(())
        })
    }

    fn get_all_settings(&self) -> Result<Vec<Setting>> {
        self.db.with_conn(|conn| {
            collect(
                conn,
                "SELECT key, value, type, is_secret FROM settings ORDER BY key",
                [],
                setting_from_row,
            )
        })
    }

    fn delete_setting(&self, key: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM settings WHERE key = ?1", [key])?;
            Ok(())
        })
    }

    // ---- Playlists ----

    fn create_playlist(
        &self,
        name: &str,
        series_id: Option<i64>,
        file_path: &str,
    ) -> Result<Playlist> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO playlists (name, series_id, file_path) VALUES (?1, ?2, ?3)",
                params![name, series_id, file_path],
            )?;
            Ok(Playlist {
                id: conn.last_insert_rowid(),
                name: name.to_string(),
                series_id,
                file_path: file_path.to_string(),
            })
        })
    }

    fn get_playlist_by_id(&self, id: i64) -> Result<Option<Playlist>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, name, series_id, file_path FROM playlists WHERE id = ?1",
                    [id],
                    |row| {
                        Ok(Playlist {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            series_id: row.get(2)?,
                            file_path: row.get(3)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    fn get_playlist_by_series_id(&self, series_id: i64) -> Result<Option<Playlist>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, name, series_id, file_path FROM playlists \
                     WHERE series_id = ?1 ORDER BY id DESC LIMIT 1",
                    [series_id],
                    |row| {
                        Ok(Playlist {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            series_id: row.get(2)?,
                            file_path: row.get(3)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    fn add_playlist_item(
        &self,
        playlist_id: i64,
        book_id: &str,
        position: i64,
    ) -> Result<PlaylistItem> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO playlist_items (playlist_id, book_id, position) VALUES (?1, ?2, ?3)",
                params![playlist_id, book_id, position],
            )?;
            Ok(PlaylistItem {
                id: conn.last_insert_rowid(),
                playlist_id,
                book_id: book_id.to_string(),
                position,
            })
        })
    }

    fn get_playlist_items(&self, playlist_id: i64) -> Result<Vec<PlaylistItem>> {
        self.db.with_conn(|conn| {
            collect(
                conn,
                "SELECT id, playlist_id, book_id, position FROM playlist_items \
                 WHERE playlist_id = ?1 ORDER BY position, id",
                [playlist_id],
                |row| {
                    Ok(PlaylistItem {
                        id: row.get(0)?,
                        playlist_id: row.get(1)?,
                        book_id: row.get(2)?,
                        position: row.get(3)?,
                    })
                },
            )
        })
    }

    // ---- Users and sessions ----

    fn create_user(
        &self,
        _username: &str,
        _email: &str,
        _password_hash_algo: &str,
        _password_hash: &str,
        _roles: &[String],
        _status: &str,
    ) -> Result<User> {
        Err(StoreError::Unsupported(UNSUPPORTED.to_string()))
    }

    fn get_user_by_id(&self, _id: &str) -> Result<Option<User>> {
        Err(StoreError::Unsupported(UNSUPPORTED.to_string()))
    }

    fn get_user_by_username(&self, _username: &str) -> Result<Option<User>> {
        Err(StoreError::Unsupported(UNSUPPORTED.to_string()))
    }

    fn get_user_by_email(&self, _email: &str) -> Result<Option<User>> {
        Err(StoreError::Unsupported(UNSUPPORTED.to_string()))
    }

    fn update_user(&self, _user: &User) -> Result<()> {
        Err(StoreError::Unsupported(UNSUPPORTED.to_string()))
    }

    fn count_users(&self) -> Result<usize> {
        Err(StoreError::Unsupported(UNSUPPORTED.to_string()))
    }

    fn create_session(
        &self,
        _user_id: &str,
        _ip: &str,
        _user_agent: &str,
        _ttl: Duration,
    ) -> Result<Session> {
        Err(StoreError::Unsupported(UNSUPPORTED.to_string()))
    }

    fn get_session(&self, _id: &str) -> Result<Option<Session>> {
        Err(StoreError::Unsupported(UNSUPPORTED.to_string()))
    }

    fn revoke_session(&self, _id: &str) -> Result<()> {
        Err(StoreError::Unsupported(UNSUPPORTED.to_string()))
    }

    fn list_user_sessions(&self, _user_id: &str) -> Result<Vec<Session>> {
        // No user can own a session here, so the listing is simply empty
        Ok(Vec::new())
    }

    fn delete_expired_sessions(&self, _now: DateTime<Utc>) -> Result<usize> {
        Err(StoreError::Unsupported(UNSUPPORTED.to_string()))
    }

    // ---- Segments ----

    fn create_book_segment(&self, book_id: &str, segment: BookSegment) -> Result<BookSegment> {
        let segment = prepare_segment(book_id, segment)?;
        self.db.transaction(|tx| {
            insert_segment(tx, &segment)?;
            store_duration_map(tx, book_id)
        })?;
        Ok(segment)
    }

    fn list_book_segments(&self, book_id: &str) -> Result<Vec<BookSegment>> {
        self.db.with_conn(|conn| list_segments(conn, book_id))
    }

    fn merge_book_segments(
        &self,
        book_id: &str,
        segment: BookSegment,
        supersede_ids: &[String],
    ) -> Result<BookSegment> {
        let segment = prepare_segment(book_id, segment)?;
        self.db.transaction(|tx| {
            insert_segment(tx, &segment)?;
            for old_id in supersede_ids {
                tx.execute(
                    "UPDATE book_segments SET active = 0, superseded_by = ?1, updated_at = ?2 \
                     WHERE id = ?3 AND book_id = ?4",
                    params![segment.id, segment.updated_at, old_id, book_id],
                )?;
            }
            store_duration_map(tx, book_id)
        })?;
        Ok(segment)
    }

    fn get_duration_map(&self, book_id: &str) -> Result<Option<DurationMap>> {
        let data: Option<String> = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT data FROM book_duration_maps WHERE book_id = ?1",
                    [book_id],
                    |row| row.get(0),
                )
                .optional()?)
        })?;
        data.map(|text| serde_json::from_str(&text).map_err(StoreError::from))
            .transpose()
    }

    // ---- Playback ----

    fn add_playback_event(&self, event: &PlaybackEvent) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO playback_events (user_id, book_id, segment_id, position_sec, event_type, play_speed, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    event.user_id,
                    event.book_id,
                    event.segment_id,
                    event.position_sec,
                    event.event_type,
                    event.play_speed,
                    event.created_at,
                ],
            )?;
            Ok(())
        })
    }

    fn list_playback_events(
        &self,
        user_id: &str,
        book_id: &str,
        limit: usize,
    ) -> Result<Vec<PlaybackEvent>> {
        self.db.with_conn(|conn| {
            collect(
                conn,
                "SELECT user_id, book_id, segment_id, position_sec, event_type, play_speed, created_at \
                 FROM playback_events WHERE user_id = ?1 AND book_id = ?2 \
                 ORDER BY created_at DESC, id DESC LIMIT ?3",
                params![user_id, book_id, limit_param(limit)],
                |row| {
                    Ok(PlaybackEvent {
                        user_id: row.get(0)?,
                        book_id: row.get(1)?,
                        segment_id: row.get(2)?,
                        position_sec: row.get(3)?,
                        event_type: row.get(4)?,
                        play_speed: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                },
            )
        })
    }

    fn update_playback_progress(&self, progress: &PlaybackProgress) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO playback_progress (user_id, book_id, segment_id, position_sec, percent_complete, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(user_id, book_id) DO UPDATE SET segment_id = excluded.segment_id, \
                 position_sec = excluded.position_sec, percent_complete = excluded.percent_complete, \
                 updated_at = excluded.updated_at",
                params![
                    progress.user_id,
                    progress.book_id,
                    progress.segment_id,
                    progress.position_sec,
                    progress.percent_complete,
                    progress.updated_at,
                ],
            )?;
            Ok(())
        })
    }

    fn get_playback_progress(
        &self,
        user_id: &str,
        book_id: &str,
    ) -> Result<Option<PlaybackProgress>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT user_id, book_id, segment_id, position_sec, percent_complete, updated_at \
                     FROM playback_progress WHERE user_id = ?1 AND book_id = ?2",
                    [user_id, book_id],
                    |row| {
                        Ok(PlaybackProgress {
                            user_id: row.get(0)?,
                            book_id: row.get(1)?,
                            segment_id: row.get(2)?,
                            position_sec: row.get(3)?,
                            percent_complete: row.get(4)?,
                            updated_at: row.get(5)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    fn increment_book_play_stats(&self, book_id: &str, seconds: i64) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO book_stats (book_id, play_count, listen_seconds) VALUES (?1, 1, ?2) \
                 ON CONFLICT(book_id) DO UPDATE SET play_count = play_count + 1, \
                 listen_seconds = listen_seconds + excluded.listen_seconds",
                params![book_id, seconds],
            )?;
            Ok(())
        })
    }

    fn get_book_stats(&self, book_id: &str) -> Result<BookStats> {
        let counters: Option<(i64, i64)> = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT play_count, listen_seconds FROM book_stats WHERE book_id = ?1",
                    [book_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?)
        })?;
        let (play_count, listen_seconds) = counters.unwrap_or((0, 0));
        Ok(BookStats {
            book_id: book_id.to_string(),
            play_count,
            listen_seconds,
        })
    }

    fn increment_user_listen_stats(&self, user_id: &str, seconds: i64) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO user_stats (user_id, listen_seconds) VALUES (?1, ?2) \
                 ON CONFLICT(user_id) DO UPDATE SET listen_seconds = listen_seconds + excluded.listen_seconds",
                params![user_id, seconds],
            )?;
            Ok(())
        })
    }

    fn get_user_stats(&self, user_id: &str) -> Result<UserStats> {
        let seconds: Option<i64> = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT listen_seconds FROM user_stats WHERE user_id = ?1",
                    [user_id],
                    |row| row.get(0),
                )
                .optional()?)
        })?;
        Ok(UserStats {
            user_id: user_id.to_string(),
            listen_seconds: seconds.unwrap_or(0),
        })
    }

    // ---- Do-not-import ----

    fn is_hash_blocked(&self, hash: &str) -> Result<bool> {
        Ok(self.get_blocked_hash_by_hash(hash)?.is_some())
    }

    fn add_blocked_hash(&self, hash: &str, reason: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO do_not_import (hash, reason, created_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(hash) DO UPDATE SET reason = excluded.reason, created_at = excluded.created_at",
                params![hash, reason, Utc::now()],
            )?;
            Ok(())
        })
    }

    fn remove_blocked_hash(&self, hash: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM do_not_import WHERE hash = ?1", [hash])?;
            Ok(())
        })
    }

    fn get_all_blocked_hashes(&self) -> Result<Vec<DoNotImport>> {
        self.db.with_conn(|conn| {
            collect(
                conn,
                "SELECT hash, reason, created_at FROM do_not_import ORDER BY hash",
                [],
                blocked_from_row,
            )
        })
    }

    fn get_blocked_hash_by_hash(&self, hash: &str) -> Result<Option<DoNotImport>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT hash, reason, created_at FROM do_not_import WHERE hash = ?1",
                    [hash],
                    blocked_from_row,
                )
                .optional()?)
        })
    }

    // ---- Maintenance ----

    fn reset(&self) -> Result<()> {
        self.db.transaction(|tx| {
            for table in schema::RESET_ORDER {
                tx.execute(&format!("DELETE FROM {}", table), [])?;
            }
            let has_sequence: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE name = 'sqlite_sequence')",
                [],
                |row| row.get(0),
            )?;
            if has_sequence {
                tx.execute("DELETE FROM sqlite_sequence", [])?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_unsupported_account_ops() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store
            .create_user("alice", "a@example.com", "bcrypt", "hash", &[], "active")
            .unwrap_err();
        assert!(err.is_unsupported());
        assert!(err.to_string().contains("relational mode"));
        assert!(store.get_session("s1").unwrap_err().is_unsupported());
        assert!(store.count_users().unwrap_err().is_unsupported());
        assert!(store
            .delete_expired_sessions(Utc::now())
            .unwrap_err()
            .is_unsupported());
        assert!(store.list_user_sessions("u1").unwrap().is_empty());
    }

    #[test]
    fn test_foreign_keys_are_enforced() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut book = Book::new("Orphan", "/orphan.m4b");
        book.author_id = Some(999);
        let err = store.create_book(book).unwrap_err();
        assert!(err.is_constraint_violation());
    }

    #[test]
    fn test_reopen_keeps_data_and_backup() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("library.db");
        {
            let store = SqliteStore::open(&path, 2, std::time::Duration::from_secs(5)).unwrap();
            store.create_author("Ursula K. Le Guin").unwrap();
            store.backup(&temp_dir.path().join("copy.db")).unwrap();
        }
        let store = SqliteStore::open(&path, 2, std::time::Duration::from_secs(5)).unwrap();
        assert!(store.get_author_by_name("ursula k. le guin").unwrap().is_some());

        let copy = SqliteStore::open(
            &temp_dir.path().join("copy.db"),
            1,
            std::time::Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(copy.get_all_authors().unwrap().len(), 1);
    }

    #[test]
    fn test_reset_restarts_ids() {
        let store = SqliteStore::open_in_memory().unwrap();
        let first = store.create_author("A").unwrap();
        store.create_author("B").unwrap();
        store.reset().unwrap();
        assert!(store.get_all_authors().unwrap().is_empty());
        let again = store.create_author("C").unwrap();
        assert_eq!(again.id, first.id);
    }
}
