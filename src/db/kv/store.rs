//! Key-value engine
//!
//! Records are JSON values under the key layout in [`keys`]. There are no
//! native constraints, so every uniqueness and reference check happens
//! inside the same write batch as the mutation it guards.

use super::engine::{Batch, KvEngine, KvReader};
use super::keys;
use crate::core::error::{Result, StoreError};
use crate::core::ids::{assign_id, new_ulid};
use crate::db::models::*;
use crate::db::scan;
use crate::db::sqlite_store::prepare_segment;
use crate::db::store::{EngineKind, Store};
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use std::path::Path;

/// redb-backed [`Store`]
pub struct KvStore {
    engine: KvEngine,
}

impl KvStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::with_engine(KvEngine::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_engine(KvEngine::in_memory()?)
    }

    /// Wrap an engine, renaming legacy keys before seeding missing counters
    pub fn with_engine(engine: KvEngine) -> Result<Self> {
        let store = Self { engine };
        store.rename_legacy_import_path_keys()?;
        store.engine.write(|batch| {
            for name in keys::COUNTERS {
                let key = keys::counter(name);
                if !batch.exists(&key)? {
                    batch.put_str(&key, "1")?;
                }
            }
            Ok(())
        })?;
        Ok(store)
    }

    pub fn engine_handle(&self) -> &KvEngine {
        &self.engine
    }
}

/// Hand out the next id of a counter
fn next_id(batch: &mut Batch, name: &str) -> Result<i64> {
    let key = keys::counter(name);
    let current = match batch.get_string(&key)? {
        Some(text) => parse_id(&key, &text)?,
        None => 1,
    };
    batch.put_str(&key, &(current + 1).to_string())?;
    Ok(current)
}

fn parse_id(key: &str, text: &str) -> Result<i64> {
    text.trim()
        .parse()
        .map_err(|_| StoreError::Encoding(format!("invalid id under {}: {:?}", key, text)))
}

/// Follow an index key to the record stored at `<prefix><id>`
fn get_via_index<R, T>(reader: &R, index_key: &str, prefix: &str) -> Result<Option<T>>
where
    R: KvReader,
    T: DeserializeOwned,
{
    match reader.get_string(index_key)? {
        Some(id) => reader.get_json(&format!("{}{}", prefix, id)),
        None => Ok(None),
    }
}

/// Primary ids stored as values under an index prefix
fn index_targets<R: KvReader>(reader: &R, prefix: &str) -> Result<Vec<String>> {
    reader
        .scan_raw(prefix)?
        .into_iter()
        .map(|(key, raw)| {
            String::from_utf8(raw).map_err(|e| StoreError::Encoding(format!("{}: {}", key, e)))
        })
        .collect()
}

/// Every primary record of a family
fn all_primary<R, T>(reader: &R, prefix: &str) -> Result<Vec<T>>
where
    R: KvReader,
    T: DeserializeOwned,
{
    Ok(reader
        .scan_json(prefix, |key| keys::is_primary(key, prefix))?
        .into_iter()
        .map(|(_, value)| value)
        .collect())
}

fn all_values<R, T>(reader: &R, prefix: &str) -> Result<Vec<T>>
where
    R: KvReader,
    T: DeserializeOwned,
{
    Ok(reader
        .scan_json(prefix, |_| true)?
        .into_iter()
        .map(|(_, value)| value)
        .collect())
}

/// Resolve book ids, skipping dangling and undecodable entries
fn load_books<R: KvReader>(reader: &R, ids: Vec<String>) -> Result<Vec<Book>> {
    let mut books = Vec::with_capacity(ids.len());
    for id in ids {
        match reader.get_json::<Book>(&keys::book(&id)) {
            Ok(Some(book)) => books.push(book),
            Ok(None) | Err(StoreError::Encoding(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(books)
}

fn live(books: Vec<Book>) -> Vec<Book> {
    books.into_iter().filter(|b| !b.is_deleted()).collect()
}

fn book_index_keys(book: &Book) -> Vec<String> {
    let mut index = vec![keys::book_path(&book.file_path)];
    if let Some(series_id) = book.series_id {
        index.push(keys::book_series(series_id, &book.id));
    }
    if let Some(author_id) = book.author_id {
        index.push(keys::book_author(author_id, &book.id));
    }
    if let Some(work_id) = &book.work_id {
        index.push(keys::book_work(work_id, &book.id));
    }
    let hashes = [
        &book.file_hash,
        &book.original_file_hash,
        &book.organized_file_hash,
    ];
    for (kind, hash) in keys::HASH_KINDS.iter().zip(hashes) {
        if let Some(hash) = hash.as_deref().filter(|h| !h.is_empty()) {
            index.push(keys::book_hash(kind, hash, &book.id));
        }
    }
    if let Some(group_id) = &book.version_group_id {
        index.push(keys::book_version_group(group_id, &book.id));
    }
    index
}

fn put_book(batch: &mut Batch, book: &Book) -> Result<()> {
    batch.put_json(&keys::book(&book.id), book)?;
    for key in book_index_keys(book) {
        batch.put_str(&key, &book.id)?;
    }
    Ok(())
}

/// Rewrite a book, touching only the index entries whose keys changed
fn replace_book(batch: &mut Batch, old: &Book, new: &Book) -> Result<()> {
    let old_index = book_index_keys(old);
    let new_index = book_index_keys(new);
    for key in old_index.iter().filter(|k| !new_index.contains(k)) {
        batch.delete(key)?;
    }
    for key in new_index.iter().filter(|k| !old_index.contains(k)) {
        batch.put_str(key, &new.id)?;
    }
    batch.put_json(&keys::book(&new.id), new)
}

fn remove_book(batch: &mut Batch, book: &Book) -> Result<()> {
    batch.delete(&keys::book(&book.id))?;
    for key in book_index_keys(book) {
        batch.delete(&key)?;
    }
    Ok(())
}

fn check_book_refs(batch: &Batch, book: &Book) -> Result<()> {
    if let Some(author_id) = book.author_id {
        if !batch.exists(&keys::author(author_id))? {
            return Err(StoreError::missing("author", author_id));
        }
    }
    if let Some(series_id) = book.series_id {
        if !batch.exists(&keys::series(series_id))? {
            return Err(StoreError::missing("series", series_id));
        }
    }
    Ok(())
}

fn first_book_by_hash<R: KvReader>(reader: &R, kind: &str, hash: &str) -> Result<Option<Book>> {
    let ids = index_targets(reader, &keys::book_hash_prefix(kind, hash))?;
    match ids.into_iter().next() {
        Some(id) => reader.get_json(&keys::book(&id)),
        None => Ok(None),
    }
}

fn segments_of<R: KvReader>(reader: &R, book_id: &str) -> Result<Vec<BookSegment>> {
    let mut segments = Vec::new();
    for id in index_targets(reader, &keys::book_segment_prefix(book_id))? {
        if let Some(segment) = reader.get_json::<BookSegment>(&keys::segment(&id))? {
            segments.push(segment);
        }
    }
    Ok(segments)
}

/// Segments are append-only; an id is written once
fn put_segment(batch: &mut Batch, segment: &BookSegment) -> Result<()> {
    let key = keys::segment(&segment.id);
    if batch.exists(&key)? {
        return Err(StoreError::ConstraintViolation(format!(
            "segment already exists: {}",
            segment.id
        )));
    }
    batch.put_json(&key, segment)?;
    batch.put_str(
        &keys::book_segment(&segment.book_id, &segment.id),
        &segment.id,
    )
}

fn store_duration_map(batch: &mut Batch, book_id: &str) -> Result<()> {
    let map = scan::build_duration_map(&segments_of(&*batch, book_id)?);
    batch.put_json(&keys::duration_map(book_id), &map)
}

impl Store for KvStore {
    fn engine(&self) -> EngineKind {
        EngineKind::Kv
    }

    // ---- Authors ----

    fn get_all_authors(&self) -> Result<Vec<Author>> {
        let mut authors: Vec<Author> = all_primary(&self.engine.snapshot()?, keys::AUTHOR)?;
        authors.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(authors)
    }

    fn get_author_by_id(&self, id: i64) -> Result<Option<Author>> {
        self.engine.snapshot()?.get_json(&keys::author(id))
    }

    fn get_author_by_name(&self, name: &str) -> Result<Option<Author>> {
        get_via_index(&self.engine.snapshot()?, &keys::author_name(name), keys::AUTHOR)
    }

    fn create_author(&self, name: &str) -> Result<Author> {
        self.engine.write(|batch| {
            let index = keys::author_name(name);
            if batch.exists(&index)? {
                return Err(StoreError::ConstraintViolation(format!(
                    "author already exists: {}",
                    name
                )));
            }
            let author = Author {
                id: next_id(batch, "author")?,
                name: name.to_string(),
            };
            batch.put_json(&keys::author(author.id), &author)?;
            batch.put_str(&index, &author.id.to_string())?;
            Ok(author)
        })
    }

    // ---- Narrators ----

    fn get_all_narrators(&self) -> Result<Vec<Narrator>> {
        let mut narrators: Vec<Narrator> =
            all_primary(&self.engine.snapshot()?, keys::NARRATOR)?;
        narrators.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(narrators)
    }

    fn get_narrator_by_id(&self, id: i64) -> Result<Option<Narrator>> {
        self.engine.snapshot()?.get_json(&keys::narrator(id))
    }

    fn get_narrator_by_name(&self, name: &str) -> Result<Option<Narrator>> {
        get_via_index(
            &self.engine.snapshot()?,
            &keys::narrator_name(name),
            keys::NARRATOR,
        )
    }

    fn create_narrator(&self, name: &str) -> Result<Narrator> {
        self.engine.write(|batch| {
            let index = keys::narrator_name(name);
            if batch.exists(&index)? {
                return Err(StoreError::ConstraintViolation(format!(
                    "narrator already exists: {}",
                    name
                )));
            }
            let narrator = Narrator {
                id: next_id(batch, "narrator")?,
                name: name.to_string(),
                created_at: Utc::now(),
            };
            batch.put_json(&keys::narrator(narrator.id), &narrator)?;
            batch.put_str(&index, &narrator.id.to_string())?;
            Ok(narrator)
        })
    }

    // ---- Series ----

    fn get_all_series(&self) -> Result<Vec<Series>> {
        let mut series: Vec<Series> = all_primary(&self.engine.snapshot()?, keys::SERIES)?;
        series.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(series)
    }

    fn get_series_by_id(&self, id: i64) -> Result<Option<Series>> {
        self.engine.snapshot()?.get_json(&keys::series(id))
    }

    fn get_series_by_name(&self, name: &str, author_id: Option<i64>) -> Result<Option<Series>> {
        get_via_index(
            &self.engine.snapshot()?,
            &keys::series_name(name, author_id),
            keys::SERIES,
        )
    }

    fn create_series(&self, name: &str, author_id: Option<i64>) -> Result<Series> {
        self.engine.write(|batch| {
            let index = keys::series_name(name, author_id);
            if batch.exists(&index)? {
                return Err(StoreError::ConstraintViolation(format!(
                    "series already exists: {}",
                    name
                )));
            }
            if let Some(author_id) = author_id {
                if !batch.exists(&keys::author(author_id))? {
                    return Err(StoreError::missing("author", author_id));
                }
            }
            let series = Series {
                id: next_id(batch, "series")?,
                name: name.to_string(),
                author_id,
            };
            batch.put_json(&keys::series(series.id), &series)?;
            batch.put_str(&index, &series.id.to_string())?;
            Ok(series)
        })
    }

    // ---- Works ----

    fn get_all_works(&self) -> Result<Vec<Work>> {
        let mut works: Vec<Work> = all_primary(&self.engine.snapshot()?, keys::WORK)?;
        works.sort_by(|a, b| a.title.cmp(&b.title).then_with(|| a.id.cmp(&b.id)));
        Ok(works)
    }

    fn get_work_by_id(&self, id: &str) -> Result<Option<Work>> {
        self.engine.snapshot()?.get_json(&keys::work(id))
    }

    fn create_work(&self, mut work: Work) -> Result<Work> {
        assign_id("work", &mut work.id)?;
        let now = Utc::now();
        work.created_at = Some(now);
        work.updated_at = Some(now);
        self.engine.write(|batch| {
            let key = keys::work(&work.id);
            if batch.exists(&key)? {
                return Err(StoreError::ConstraintViolation(format!(
                    "work already exists: {}",
                    work.id
                )));
            }
            batch.put_json(&key, &work)
        })?;
        Ok(work)
    }

    fn update_work(&self, id: &str, mut work: Work) -> Result<Work> {
        self.engine.write(|batch| {
            let key = keys::work(id);
            let existing: Work = batch
                .get_json(&key)?
                .ok_or_else(|| StoreError::missing("work", id))?;
            work.id = id.to_string();
            work.created_at = existing.created_at;
            work.updated_at = Some(Utc::now());
            batch.put_json(&key, &work)
        })?;
        Ok(work)
    }

    fn delete_work(&self, id: &str) -> Result<()> {
        self.engine.write(|batch| {
            batch.delete(&keys::work(id))?;
            Ok(())
        })
    }

    fn get_books_by_work_id(&self, work_id: &str) -> Result<Vec<Book>> {
        let snapshot = self.engine.snapshot()?;
        let ids = index_targets(&snapshot, &keys::book_work_prefix(work_id))?;
        let mut books = live(load_books(&snapshot, ids)?);
        scan::sort_by_title(&mut books);
        Ok(books)
    }

    // ---- Books ----

    fn get_all_books(&self, limit: usize, offset: usize) -> Result<Vec<Book>> {
        let mut books = live(all_primary(&self.engine.snapshot()?, keys::BOOK)?);
        scan::sort_by_title(&mut books);
        Ok(scan::paginate(books, limit, offset))
    }

    fn get_book_by_id(&self, id: &str) -> Result<Option<Book>> {
        self.engine.snapshot()?.get_json(&keys::book(id))
    }

    fn get_book_by_file_path(&self, path: &str) -> Result<Option<Book>> {
        get_via_index(&self.engine.snapshot()?, &keys::book_path(path), keys::BOOK)
    }

    fn get_book_by_file_hash(&self, hash: &str) -> Result<Option<Book>> {
        first_book_by_hash(&self.engine.snapshot()?, keys::HASH_KINDS[0], hash)
    }

    fn get_book_by_original_hash(&self, hash: &str) -> Result<Option<Book>> {
        first_book_by_hash(&self.engine.snapshot()?, keys::HASH_KINDS[1], hash)
    }

    fn get_book_by_organized_hash(&self, hash: &str) -> Result<Option<Book>> {
        first_book_by_hash(&self.engine.snapshot()?, keys::HASH_KINDS[2], hash)
    }

    fn get_books_by_series_id(&self, series_id: i64) -> Result<Vec<Book>> {
        let snapshot = self.engine.snapshot()?;
        let ids = index_targets(&snapshot, &keys::book_series_prefix(series_id))?;
        let mut books = live(load_books(&snapshot, ids)?);
        scan::sort_series_books(&mut books);
        Ok(books)
    }

    fn get_books_by_author_id(&self, author_id: i64) -> Result<Vec<Book>> {
        let snapshot = self.engine.snapshot()?;
        let ids = index_targets(&snapshot, &keys::book_author_prefix(author_id))?;
        let mut books = live(load_books(&snapshot, ids)?);
        scan::sort_by_title(&mut books);
        Ok(books)
    }

    fn create_book(&self, mut book: Book) -> Result<Book> {
        assign_id("book", &mut book.id)?;
        let now = Utc::now();
        book.created_at = Some(now);
        book.updated_at = Some(now);
        self.engine.write(|batch| {
            if batch.exists(&keys::book(&book.id))? {
                return Err(StoreError::ConstraintViolation(format!(
                    "book already exists: {}",
                    book.id
                )));
            }
            if batch.exists(&keys::book_path(&book.file_path))? {
                return Err(StoreError::ConstraintViolation(format!(
                    "file path already in use: {}",
                    book.file_path
                )));
            }
            check_book_refs(batch, &book)?;
            put_book(batch, &book)
        })?;
        Ok(book)
    }

    fn update_book(&self, id: &str, mut book: Book) -> Result<Book> {
        self.engine.write(|batch| {
            let existing: Book = batch
                .get_json(&keys::book(id))?
                .ok_or_else(|| StoreError::missing("book", id))?;
            if book.file_path != existing.file_path
                && batch.exists(&keys::book_path(&book.file_path))?
            {
                return Err(StoreError::ConstraintViolation(format!(
                    "file path already in use: {}",
                    book.file_path
                )));
            }
            book.id = id.to_string();
            book.created_at = existing.created_at;
            book.updated_at = Some(Utc::now());
            check_book_refs(batch, &book)?;
            replace_book(batch, &existing, &book)
        })?;
        Ok(book)
    }

    fn delete_book(&self, id: &str) -> Result<()> {
        self.engine.write(|batch| {
            let Some(existing) = batch.get_json::<Book>(&keys::book(id))? else {
                return Ok(());
            };
            remove_book(batch, &existing)?;
            batch.delete(&keys::book_authors(id))?;
            batch.delete(&keys::book_narrators(id))?;
            batch.delete_prefix(&keys::metadata_state_prefix(id))?;
            Ok(())
        })
    }

    fn search_books(&self, query: &str, limit: usize, offset: usize) -> Result<Vec<Book>> {
        let mut books: Vec<Book> = live(all_primary(&self.engine.snapshot()?, keys::BOOK)?)
            .into_iter()
            .filter(|book| scan::title_matches(book, query))
            .collect();
        scan::sort_by_title(&mut books);
        Ok(scan::paginate(books, limit, offset))
    }

    fn count_books(&self) -> Result<usize> {
        let books = live(all_primary(&self.engine.snapshot()?, keys::BOOK)?);
        Ok(books.len())
    }

    fn get_duplicate_books(&self) -> Result<Vec<Vec<Book>>> {
        let books: Vec<Book> = all_primary(&self.engine.snapshot()?, keys::BOOK)?;
        Ok(scan::group_duplicates(books))
    }

    fn get_books_by_version_group(&self, group_id: &str) -> Result<Vec<Book>> {
        let snapshot = self.engine.snapshot()?;
        let ids = index_targets(&snapshot, &keys::book_version_group_prefix(group_id))?;
        let mut books = live(load_books(&snapshot, ids)?);
        scan::sort_version_group(&mut books);
        Ok(books)
    }

    fn list_soft_deleted_books(
        &self,
        limit: usize,
        offset: usize,
        older_than: Option<DateTime<Utc>>,
    ) -> Result<Vec<Book>> {
        let books: Vec<Book> = all_primary(&self.engine.snapshot()?, keys::BOOK)?;
        let mut deleted: Vec<Book> = books
            .into_iter()
            .filter(Book::is_deleted)
            .filter(|book| match older_than {
                Some(cutoff) => matches!(book.marked_for_deletion_at, Some(at) if at <= cutoff),
                None => true,
            })
            .collect();
        scan::sort_soft_deleted(&mut deleted);
        Ok(scan::paginate(deleted, limit, offset))
    }

    fn get_dashboard_stats(&self) -> Result<DashboardStats> {
        let books: Vec<Book> = all_primary(&self.engine.snapshot()?, keys::BOOK)?;
        Ok(scan::dashboard_stats(&books))
    }

    // ---- Book links ----

    fn get_book_authors(&self, book_id: &str) -> Result<Vec<BookAuthor>> {
        let mut links: Vec<BookAuthor> = self
            .engine
            .snapshot()?
            .get_json(&keys::book_authors(book_id))?
            .unwrap_or_default();
        links.sort_by(|a, b| {
            a.position
                .cmp(&b.position)
                .then_with(|| a.author_id.cmp(&b.author_id))
        });
        Ok(links)
    }

    fn set_book_authors(&self, book_id: &str, authors: &[BookAuthor]) -> Result<()> {
        self.engine.write(|batch| {
            if !batch.exists(&keys::book(book_id))? {
                return Err(StoreError::missing("book", book_id));
            }
            let mut links: Vec<BookAuthor> = Vec::with_capacity(authors.len());
            for link in authors {
                if !batch.exists(&keys::author(link.author_id))? {
                    return Err(StoreError::missing("author", link.author_id));
                }
                if links
                    .iter()
                    .any(|l| l.author_id == link.author_id && l.role == link.role)
                {
                    return Err(StoreError::ConstraintViolation(format!(
                        "duplicate author link {} ({}) for book {}",
                        link.author_id, link.role, book_id
                    )));
                }
                links.push(BookAuthor {
                    book_id: book_id.to_string(),
                    ..link.clone()
                });
            }
            batch.put_json(&keys::book_authors(book_id), &links)
        })
    }

    fn get_book_narrators(&self, book_id: &str) -> Result<Vec<BookNarrator>> {
        let mut links: Vec<BookNarrator> = self
            .engine
            .snapshot()?
            .get_json(&keys::book_narrators(book_id))?
            .unwrap_or_default();
        links.sort_by(|a, b| {
            a.position
                .cmp(&b.position)
                .then_with(|| a.narrator_id.cmp(&b.narrator_id))
        });
        Ok(links)
    }

    fn set_book_narrators(&self, book_id: &str, narrators: &[BookNarrator]) -> Result<()> {
        self.engine.write(|batch| {
            if !batch.exists(&keys::book(book_id))? {
                return Err(StoreError::missing("book", book_id));
            }
            let mut links: Vec<BookNarrator> = Vec::with_capacity(narrators.len());
            for link in narrators {
                if !batch.exists(&keys::narrator(link.narrator_id))? {
                    return Err(StoreError::missing("narrator", link.narrator_id));
                }
                if links
                    .iter()
                    .any(|l| l.narrator_id == link.narrator_id && l.role == link.role)
                {
                    return Err(StoreError::ConstraintViolation(format!(
                        "duplicate narrator link {} ({}) for book {}",
                        link.narrator_id, link.role, book_id
                    )));
                }
                links.push(BookNarrator {
                    book_id: book_id.to_string(),
                    ..link.clone()
                });
            }
            batch.put_json(&keys::book_narrators(book_id), &links)
        })
    }

    // ---- Import paths ----

    fn get_all_import_paths(&self) -> Result<Vec<ImportPath>> {
        let mut paths: Vec<ImportPath> =
            all_primary(&self.engine.snapshot()?, keys::IMPORT_PATH)?;
        paths.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(paths)
    }

    fn get_import_path_by_id(&self, id: i64) -> Result<Option<ImportPath>> {
        self.engine.snapshot()?.get_json(&keys::import_path(id))
    }

    fn get_import_path_by_path(&self, path: &str) -> Result<Option<ImportPath>> {
        get_via_index(
            &self.engine.snapshot()?,
            &keys::import_path_path(path),
            keys::IMPORT_PATH,
        )
    }

    fn create_import_path(&self, path: &str, name: &str) -> Result<ImportPath> {
        self.engine.write(|batch| {
            let index = keys::import_path_path(path);
            if batch.exists(&index)? {
                return Err(StoreError::ConstraintViolation(format!(
                    "import path already exists: {}",
                    path
                )));
            }
            let import_path = ImportPath {
                id: next_id(batch, "import_path")?,
                path: path.to_string(),
                name: name.to_string(),
                enabled: true,
                created_at: Utc::now(),
                last_scan: None,
                book_count: 0,
            };
            batch.put_json(&keys::import_path(import_path.id), &import_path)?;
            batch.put_str(&index, &import_path.id.to_string())?;
            Ok(import_path)
        })
    }

    fn update_import_path(&self, id: i64, import_path: &ImportPath) -> Result<()> {
        self.engine.write(|batch| {
            let key = keys::import_path(id);
            let existing: ImportPath = batch
                .get_json(&key)?
                .ok_or_else(|| StoreError::missing("import path", id))?;
            if import_path.path != existing.path {
                let index = keys::import_path_path(&import_path.path);
                if batch.exists(&index)? {
                    return Err(StoreError::ConstraintViolation(format!(
                        "import path already exists: {}",
                        import_path.path
                    )));
                }
                batch.delete(&keys::import_path_path(&existing.path))?;
                batch.put_str(&index, &id.to_string())?;
            }
            let updated = ImportPath {
                id,
                created_at: existing.created_at,
                ..import_path.clone()
            };
            batch.put_json(&key, &updated)
        })
    }

    fn delete_import_path(&self, id: i64) -> Result<()> {
        self.engine.write(|batch| {
            let key = keys::import_path(id);
            if let Some(existing) = batch.get_json::<ImportPath>(&key)? {
                batch.delete(&keys::import_path_path(&existing.path))?;
                batch.delete(&key)?;
            }
            Ok(())
        })
    }

    fn rename_legacy_import_path_keys(&self) -> Result<usize> {
        self.engine.write(|batch| {
            let mut moved = 0;
            for (old_key, value) in batch.scan_raw(keys::LEGACY_IMPORT_PATH)? {
                let Some(new_key) = keys::renamed_legacy_key(&old_key) else {
                    continue;
                };
                batch.put_raw(&new_key, &value)?;
                batch.delete(&old_key)?;
                moved += 1;
            }

            if let Some(value) = batch.get_raw(keys::LEGACY_COUNTER)? {
                let current = keys::counter("import_path");
                if !batch.exists(&current)? {
                    batch.put_raw(&current, &value)?;
                }
                batch.delete(keys::LEGACY_COUNTER)?;
            }
            Ok(moved)
        })
    }

    // ---- Operations ----

    fn create_operation(
        &self,
        id: &str,
        op_type: &str,
        folder_path: Option<&str>,
    ) -> Result<Operation> {
        let op = Operation::new(id, op_type, folder_path, Utc::now());
        self.engine.write(|batch| {
            let key = keys::operation(id);
            if batch.exists(&key)? {
                return Err(StoreError::ConstraintViolation(format!(
                    "operation already exists: {}",
                    id
                )));
            }
            batch.put_json(&key, &op)
        })?;
        Ok(op)
    }

    fn get_operation_by_id(&self, id: &str) -> Result<Option<Operation>> {
        self.engine.snapshot()?.get_json(&keys::operation(id))
    }

    fn get_recent_operations(&self, limit: usize) -> Result<Vec<Operation>> {
        let mut ops: Vec<Operation> = all_primary(&self.engine.snapshot()?, keys::OPERATION)?;
        ops.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(scan::paginate(ops, limit, 0))
    }

    fn update_operation_status(
        &self,
        id: &str,
        status: OperationStatus,
        progress: i64,
        total: i64,
        message: &str,
    ) -> Result<()> {
        self.engine.write(|batch| {
            let key = keys::operation(id);
            let mut op: Operation = batch
                .get_json(&key)?
                .ok_or_else(|| StoreError::missing("operation", id))?;
            op.apply_status(status, progress, total, message, Utc::now());
            batch.put_json(&key, &op)
        })
    }

    fn update_operation_error(&self, id: &str, error_message: &str) -> Result<()> {
        self.engine.write(|batch| {
            let key = keys::operation(id);
            let mut op: Operation = batch
                .get_json(&key)?
                .ok_or_else(|| StoreError::missing("operation", id))?;
            op.fail(error_message, Utc::now());
            batch.put_json(&key, &op)
        })
    }

    fn add_operation_log(
        &self,
        operation_id: &str,
        level: &str,
        message: &str,
        details: Option<&str>,
    ) -> Result<()> {
        self.engine.write(|batch| {
            if !batch.exists(&keys::operation(operation_id))? {
                return Err(StoreError::missing("operation", operation_id));
            }
            let log = OperationLog {
                id: next_id(batch, "operationlog")?,
                operation_id: operation_id.to_string(),
                level: level.to_string(),
                message: message.to_string(),
                details: details.map(str::to_string),
                created_at: Utc::now(),
            };
            batch.put_json(
                &keys::operation_log(operation_id, log.created_at, log.id),
                &log,
            )
        })
    }

    fn get_operation_logs(&self, operation_id: &str) -> Result<Vec<OperationLog>> {
        all_values(
            &self.engine.snapshot()?,
            &keys::operation_log_prefix(operation_id),
        )
    }

    // ---- Metadata provenance ----

    fn get_metadata_field_states(&self, book_id: &str) -> Result<Vec<MetadataFieldState>> {
        let mut states: Vec<MetadataFieldState> = all_values(
            &self.engine.snapshot()?,
            &keys::metadata_state_prefix(book_id),
        )?;
        states.sort_by(|a, b| a.field.cmp(&b.field));
        Ok(states)
    }

    fn upsert_metadata_field_state(&self, state: &MetadataFieldState) -> Result<()> {
        if state.book_id.is_empty() || state.field.is_empty() {
            return Err(StoreError::InvalidInput(
                "metadata state requires book_id and field".to_string(),
            ));
        }
        self.engine.write(|batch| {
            batch.put_json(&keys::metadata_state(&state.book_id, &state.field), state)
        })
    }

    fn delete_metadata_field_state(&self, book_id: &str, field: &str) -> Result<()> {
        self.engine.write(|batch| {
            batch.delete(&keys::metadata_state(book_id, field))?;
            Ok(())
        })
    }

    // ---- Preferences ----

    fn get_user_preference(&self, key: &str) -> Result<Option<UserPreference>> {
        self.engine.snapshot()?.get_json(&keys::preference(key))
    }

    fn set_user_preference(&self, key: &str, value: &str) -> Result<()> {
        self.engine.write(|batch| {
            let record_key = keys::preference(key);
            let id = match batch.get_json::<UserPreference>(&record_key)? {
                Some(existing) => existing.id,
                None => next_id(batch, "preference")?,
            };
            let preference = UserPreference {
                id,
                key: key.to_string(),
                value: Some(value.to_string()),
                updated_at: Utc::now(),
            };
            batch.put_json(&record_key, &preference)
        })
    }

    fn get_all_user_preferences(&self) -> Result<Vec<UserPreference>> {
        all_values(&self.engine.snapshot()?, keys::PREFERENCE)
    }

    fn set_user_preference_for_user(&self, user_id: &str, key: &str, value: &str) -> Result<()> {
        let preference = UserPreferenceKV {
            user_id: user_id.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            updated_at: Utc::now(),
        };
        self.engine.write(|batch| {
            batch.put_json(&keys::user_preference(user_id, key), &preference)
        })
    }

    fn get_user_preference_for_user(
        &self,
        user_id: &str,
        key: &str,
    ) -> Result<Option<UserPreferenceKV>> {
        self.engine
            .snapshot()?
            .get_json(&keys::user_preference(user_id, key))
    }

    fn get_all_preferences_for_user(&self, user_id: &str) -> Result<Vec<UserPreferenceKV>> {
        all_values(
            &self.engine.snapshot()?,
            &keys::user_preference_prefix(user_id),
        )
    }

    // ---- Settings ----

    fn get_setting(&self, key: &str) -> Result<Option<Setting>> {
        self.engine.snapshot()?.get_json(&keys::setting(key))
    }

    fn put_setting(&self, setting: &Setting) -> Result<()> {
        self.engine
            .write(|batch| batch.put_json(&keys::setting(&setting.key), setting))
    }

    fn get_all_settings(&self) -> Result<Vec<Setting>> {
        all_values(&self.engine.snapshot()?, keys::SETTING)
    }

    fn delete_setting(&self, key: &str) -> Result<()> {
        self.engine.write(|batch| {
            batch.delete(&keys::setting(key))?;
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
        self.engine.write(|batch| {
            if let Some(series_id) = series_id {
                if !batch.exists(&keys::series(series_id))? {
                    return Err(StoreError::missing("series", series_id));
                }
            }
            let playlist = Playlist {
                id: next_id(batch, "playlist")?,
                name: name.to_string(),
                series_id,
                file_path: file_path.to_string(),
            };
            batch.put_json(&keys::playlist(playlist.id), &playlist)?;
            if let Some(series_id) = series_id {
                batch.put_str(&keys::playlist_series(series_id), &playlist.id.to_string())?;
            }
            Ok(playlist)
        })
    }

    fn get_playlist_by_id(&self, id: i64) -> Result<Option<Playlist>> {
        self.engine.snapshot()?.get_json(&keys::playlist(id))
    }

    fn get_playlist_by_series_id(&self, series_id: i64) -> Result<Option<Playlist>> {
        get_via_index(
            &self.engine.snapshot()?,
            &keys::playlist_series(series_id),
            keys::PLAYLIST,
        )
    }

    fn add_playlist_item(
        &self,
        playlist_id: i64,
        book_id: &str,
        position: i64,
    ) -> Result<PlaylistItem> {
        self.engine.write(|batch| {
            if !batch.exists(&keys::playlist(playlist_id))? {
                return Err(StoreError::missing("playlist", playlist_id));
            }
            let item = PlaylistItem {
                id: next_id(batch, "playlistitem")?,
                playlist_id,
                book_id: book_id.to_string(),
                position,
            };
            batch.put_json(&keys::playlist_item(playlist_id, item.id), &item)?;
            Ok(item)
        })
    }

    fn get_playlist_items(&self, playlist_id: i64) -> Result<Vec<PlaylistItem>> {
        let mut items: Vec<PlaylistItem> = all_values(
            &self.engine.snapshot()?,
            &keys::playlist_item_prefix(playlist_id),
        )?;
        items.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.id.cmp(&b.id)));
        Ok(items)
    }

    // ---- Users and sessions ----

    fn create_user(
        &self,
        username: &str,
        email: &str,
        password_hash_algo: &str,
        password_hash: &str,
        roles: &[String],
        status: &str,
    ) -> Result<User> {
        let now = Utc::now();
        let user = User {
            id: new_ulid()?,
            username: username.to_string(),
            email: email.to_string(),
            password_hash_algo: password_hash_algo.to_string(),
            password_hash: password_hash.to_string(),
            roles: roles.to_vec(),
            status: status.to_string(),
            created_at: now,
            updated_at: now,
            version: 1,
        };
        self.engine.write(|batch| {
            let username_index = keys::user_username(username);
            let email_index = keys::user_email(email);
            if batch.exists(&username_index)? {
                return Err(StoreError::ConstraintViolation(format!(
                    "username already exists: {}",
                    username
                )));
            }
            if batch.exists(&email_index)? {
                return Err(StoreError::ConstraintViolation(format!(
                    "email already exists: {}",
                    email
                )));
            }
            batch.put_json(&keys::user(&user.id), &user)?;
            batch.put_str(&username_index, &user.id)?;
            batch.put_str(&email_index, &user.id)
        })?;
        Ok(user)
    }

    fn get_user_by_id(&self, id: &str) -> Result<Option<User>> {
        self.engine.snapshot()?.get_json(&keys::user(id))
    }

    fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        get_via_index(
            &self.engine.snapshot()?,
            &keys::user_username(username),
            keys::USER,
        )
    }

    fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        get_via_index(&self.engine.snapshot()?, &keys::user_email(email), keys::USER)
    }

    fn update_user(&self, user: &User) -> Result<()> {
        self.engine.write(|batch| {
            let key = keys::user(&user.id);
            let existing: User = batch
                .get_json(&key)?
                .ok_or_else(|| StoreError::missing("user", &user.id))?;

            let reindex = [
                (
                    keys::user_username(&existing.username),
                    keys::user_username(&user.username),
                    "username",
                ),
                (
                    keys::user_email(&existing.email),
                    keys::user_email(&user.email),
                    "email",
                ),
            ];
            for (old_index, new_index, what) in &reindex {
                if old_index == new_index {
                    continue;
                }
                if batch.exists(new_index)? {
                    return Err(StoreError::ConstraintViolation(format!(
                        "{} already exists",
                        what
                    )));
                }
                batch.delete(old_index)?;
                batch.put_str(new_index, &user.id)?;
            }

            let updated = User {
                created_at: existing.created_at,
                updated_at: Utc::now(),
                version: existing.version + 1,
                ..user.clone()
            };
            batch.put_json(&key, &updated)
        })
    }

    fn count_users(&self) -> Result<usize> {
        let keys_found = self.engine.snapshot()?.scan_keys(keys::USER)?;
        Ok(keys_found
            .iter()
            .filter(|key| keys::is_primary(key, keys::USER))
            .count())
    }

    fn create_session(
        &self,
        user_id: &str,
        ip: &str,
        user_agent: &str,
        ttl: Duration,
    ) -> Result<Session> {
        let now = Utc::now();
        let session = Session {
            id: new_ulid()?,
            user_id: user_id.to_string(),
            created_at: now,
            expires_at: now + ttl,
            ip: ip.to_string(),
            user_agent: user_agent.to_string(),
            revoked: false,
            version: 1,
        };
        self.engine.write(|batch| {
            batch.put_json(&keys::session(&session.id), &session)?;
            batch.put_str(&keys::user_session(user_id, &session.id), &session.id)
        })?;
        Ok(session)
    }

    fn get_session(&self, id: &str) -> Result<Option<Session>> {
        self.engine.snapshot()?.get_json(&keys::session(id))
    }

    fn revoke_session(&self, id: &str) -> Result<()> {
        self.engine.write(|batch| {
            let key = keys::session(id);
            if let Some(mut session) = batch.get_json::<Session>(&key)? {
                session.revoked = true;
                session.version += 1;
                batch.put_json(&key, &session)?;
            }
            Ok(())
        })
    }

    fn list_user_sessions(&self, user_id: &str) -> Result<Vec<Session>> {
        let snapshot = self.engine.snapshot()?;
        let mut sessions = Vec::new();
        for id in index_targets(&snapshot, &keys::user_session_prefix(user_id))? {
            if let Ok(Some(session)) = snapshot.get_json::<Session>(&keys::session(&id)) {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize> {
        self.engine.write(|batch| {
            let sessions: Vec<(String, Session)> =
                batch.scan_json(keys::SESSION, |key| keys::is_primary(key, keys::SESSION))?;
            let mut removed = 0;
            for (key, session) in sessions {
                if !session.is_dead(now) {
                    continue;
                }
                batch.delete(&key)?;
                batch.delete(&keys::user_session(&session.user_id, &session.id))?;
                removed += 1;
            }
            Ok(removed)
        })
    }

    // ---- Segments ----

    fn create_book_segment(&self, book_id: &str, segment: BookSegment) -> Result<BookSegment> {
        let segment = prepare_segment(book_id, segment)?;
        self.engine.write(|batch| {
            put_segment(batch, &segment)?;
            store_duration_map(batch, book_id)
        })?;
        Ok(segment)
    }

    fn list_book_segments(&self, book_id: &str) -> Result<Vec<BookSegment>> {
        segments_of(&self.engine.snapshot()?, book_id)
    }

    fn merge_book_segments(
        &self,
        book_id: &str,
        segment: BookSegment,
        supersede_ids: &[String],
    ) -> Result<BookSegment> {
        let segment = prepare_segment(book_id, segment)?;
        self.engine.write(|batch| {
            put_segment(batch, &segment)?;
            for old_id in supersede_ids {
                let key = keys::segment(old_id);
                let Some(mut old) = batch.get_json::<BookSegment>(&key)? else {
                    continue;
                };
                if old.book_id != book_id {
                    continue;
                }
                old.active = false;
                old.superseded_by = Some(segment.id.clone());
                old.updated_at = segment.updated_at;
                batch.put_json(&key, &old)?;
            }
            store_duration_map(batch, book_id)
        })?;
        Ok(segment)
    }

    fn get_duration_map(&self, book_id: &str) -> Result<Option<DurationMap>> {
        self.engine.snapshot()?.get_json(&keys::duration_map(book_id))
    }

    // ---- Playback ----

    fn add_playback_event(&self, event: &PlaybackEvent) -> Result<()> {
        let key = keys::playback_event(
            &event.user_id,
            &event.book_id,
            event.created_at,
            &new_ulid()?,
        );
        self.engine.write(|batch| batch.put_json(&key, event))
    }

    fn list_playback_events(
        &self,
        user_id: &str,
        book_id: &str,
        limit: usize,
    ) -> Result<Vec<PlaybackEvent>> {
        let mut events: Vec<PlaybackEvent> = all_values(
            &self.engine.snapshot()?,
            &keys::playback_event_prefix(user_id, book_id),
        )?;
        events.reverse();
        Ok(scan::paginate(events, limit, 0))
    }

    fn update_playback_progress(&self, progress: &PlaybackProgress) -> Result<()> {
        self.engine.write(|batch| {
            batch.put_json(
                &keys::playback_progress(&progress.user_id, &progress.book_id),
                progress,
            )
        })
    }

    fn get_playback_progress(
        &self,
        user_id: &str,
        book_id: &str,
    ) -> Result<Option<PlaybackProgress>> {
        self.engine
            .snapshot()?
            .get_json(&keys::playback_progress(user_id, book_id))
    }

    fn increment_book_play_stats(&self, book_id: &str, seconds: i64) -> Result<()> {
        self.engine.write(|batch| {
            let key = keys::book_stats(book_id);
            let mut stats = batch.get_json::<BookStats>(&key)?.unwrap_or(BookStats {
                book_id: book_id.to_string(),
                play_count: 0,
                listen_seconds: 0,
            });
            stats.play_count += 1;
            stats.listen_seconds += seconds;
            batch.put_json(&key, &stats)
        })
    }

    fn get_book_stats(&self, book_id: &str) -> Result<BookStats> {
        Ok(self
            .engine
            .snapshot()?
            .get_json(&keys::book_stats(book_id))?
            .unwrap_or(BookStats {
                book_id: book_id.to_string(),
                play_count: 0,
                listen_seconds: 0,
            }))
    }

    fn increment_user_listen_stats(&self, user_id: &str, seconds: i64) -> Result<()> {
        self.engine.write(|batch| {
            let key = keys::user_stats(user_id);
            let mut stats = batch.get_json::<UserStats>(&key)?.unwrap_or(UserStats {
                user_id: user_id.to_string(),
                listen_seconds: 0,
            });
            stats.listen_seconds += seconds;
            batch.put_json(&key, &stats)
        })
    }

    fn get_user_stats(&self, user_id: &str) -> Result<UserStats> {
        Ok(self
            .engine
            .snapshot()?
            .get_json(&keys::user_stats(user_id))?
            .unwrap_or(UserStats {
                user_id: user_id.to_string(),
                listen_seconds: 0,
            }))
    }

    // ---- Do-not-import ----

    fn is_hash_blocked(&self, hash: &str) -> Result<bool> {
        self.engine.snapshot()?.exists(&keys::blocked_hash(hash))
    }

    fn add_blocked_hash(&self, hash: &str, reason: &str) -> Result<()> {
        let entry = DoNotImport {
            hash: hash.to_string(),
            reason: reason.to_string(),
            created_at: Utc::now(),
        };
        self.engine
            .write(|batch| batch.put_json(&keys::blocked_hash(hash), &entry))
    }

    fn remove_blocked_hash(&self, hash: &str) -> Result<()> {
        self.engine.write(|batch| {
            batch.delete(&keys::blocked_hash(hash))?;
            Ok(())
        })
    }

    fn get_all_blocked_hashes(&self) -> Result<Vec<DoNotImport>> {
        all_values(&self.engine.snapshot()?, keys::BLOCKED_HASH)
    }

    fn get_blocked_hash_by_hash(&self, hash: &str) -> Result<Option<DoNotImport>> {
        self.engine.snapshot()?.get_json(&keys::blocked_hash(hash))
    }

    // ---- Maintenance ----

    fn reset(&self) -> Result<()> {
        self.engine.write(|batch| {
            batch.delete_prefix("")?;
            for name in keys::COUNTERS {
                batch.put_str(&keys::counter(name), "1")?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seeded_legacy_engine() -> KvEngine {
        let engine = KvEngine::in_memory().unwrap();
        let legacy = serde_json::json!({
            "id": 1,
            "path": "/audio",
            "name": "Audio",
            "enabled": true,
            "created_at": "2024-01-01T00:00:00Z",
            "last_scan": null,
            "book_count": 0
        });
        engine
            .write(|batch| {
                batch.put_json("library:1", &legacy)?;
                batch.put_str("library:path:/audio", "1")?;
                batch.put_str("counter:library", "2")
            })
            .unwrap();
        engine
    }

    #[test]
    fn test_open_renames_legacy_keys() {
        let store = KvStore::with_engine(seeded_legacy_engine()).unwrap();
        let snapshot = store.engine_handle().snapshot().unwrap();
        assert!(snapshot.scan_keys("library:").unwrap().is_empty());
        assert!(!snapshot.exists("counter:library").unwrap());
        assert_eq!(
            snapshot.get_string("counter:import_path").unwrap().as_deref(),
            Some("2")
        );

        let path = store.get_import_path_by_path("/audio").unwrap().unwrap();
        assert_eq!(path.id, 1);
        let next = store.create_import_path("/more", "More").unwrap();
        assert_eq!(next.id, 2);

        let before = store.engine_handle().snapshot().unwrap().scan_raw("").unwrap();
        assert_eq!(store.rename_legacy_import_path_keys().unwrap(), 0);
        let after = store.engine_handle().snapshot().unwrap();
        assert_eq!(after.scan_raw("").unwrap(), before);
        assert_eq!(
            after.get_string("counter:import_path").unwrap().as_deref(),
            Some("3")
        );
    }

    #[test]
    fn test_legacy_counter_does_not_clobber_current() {
        let engine = seeded_legacy_engine();
        engine
            .write(|batch| batch.put_str("counter:import_path", "9"))
            .unwrap();
        let store = KvStore::with_engine(engine).unwrap();
        let snapshot = store.engine_handle().snapshot().unwrap();
        assert_eq!(
            snapshot.get_string("counter:import_path").unwrap().as_deref(),
            Some("9")
        );
        assert!(!snapshot.exists("counter:library").unwrap());
    }

    #[test]
    fn test_counters_seeded_and_reset() {
        let store = KvStore::open_in_memory().unwrap();
        assert_eq!(store.create_author("First").unwrap().id, 1);
        assert_eq!(store.create_author("Second").unwrap().id, 2);
        store.reset().unwrap();
        assert!(store.get_all_authors().unwrap().is_empty());
        assert_eq!(store.create_author("Again").unwrap().id, 1);
    }

    #[test]
    fn test_index_keys_are_not_records() {
        let store = KvStore::open_in_memory().unwrap();
        let author = store.create_author("Iain M. Banks").unwrap();
        let series = store.create_series("Culture", Some(author.id)).unwrap();
        let mut book = Book::new("Excession", "/culture/excession.m4b");
        book.author_id = Some(author.id);
        book.series_id = Some(series.id);
        book.file_hash = Some("abc".into());
        store.create_book(book).unwrap();

        assert_eq!(store.get_all_authors().unwrap().len(), 1);
        assert_eq!(store.get_all_series().unwrap().len(), 1);
        assert_eq!(store.count_books().unwrap(), 1);
    }

    #[test]
    fn test_update_moves_indexes() {
        let store = KvStore::open_in_memory().unwrap();
        let author = store.create_author("A").unwrap();
        let mut book = store
            .create_book(Book::new("Title", "/old/path.mp3"))
            .unwrap();
        book.file_path = "/new/path.mp3".into();
        book.author_id = Some(author.id);
        store.update_book(&book.id.clone(), book).unwrap();

        assert!(store.get_book_by_file_path("/old/path.mp3").unwrap().is_none());
        assert!(store.get_book_by_file_path("/new/path.mp3").unwrap().is_some());
        assert_eq!(store.get_books_by_author_id(author.id).unwrap().len(), 1);
        let snapshot = store.engine_handle().snapshot().unwrap();
        assert!(snapshot.scan_keys("book:path:").unwrap().len() == 1);
    }

    #[test]
    fn test_update_user_reindexes() {
        let store = KvStore::open_in_memory().unwrap();
        let mut user = store
            .create_user("Alice", "alice@example.com", "argon2id", "h", &["admin".to_string()], "active")
            .unwrap();
        store
            .create_user("bob", "bob@example.com", "argon2id", "h", &[], "active")
            .unwrap();

        user.username = "alice2".into();
        store.update_user(&user).unwrap();
        assert!(store.get_user_by_username("alice").unwrap().is_none());
        let stored = store.get_user_by_username("ALICE2").unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.roles, vec!["admin".to_string()]);

        user.email = "BOB@example.com".into();
        let err = store.update_user(&user).unwrap_err();
        assert!(err.is_constraint_violation());
    }

    #[test]
    fn test_sessions_expire_and_revoke() {
        let store = KvStore::open_in_memory().unwrap();
        let user = store
            .create_user("carol", "carol@example.com", "argon2id", "h", &[], "active")
            .unwrap();
        let live = store
            .create_session(&user.id, "127.0.0.1", "test", Duration::hours(1))
            .unwrap();
        let expired = store
            .create_session(&user.id, "127.0.0.1", "test", Duration::seconds(-1))
            .unwrap();
        let revoked = store
            .create_session(&user.id, "127.0.0.1", "test", Duration::hours(1))
            .unwrap();
        store.revoke_session(&revoked.id).unwrap();
        store.revoke_session("missing").unwrap();

        assert_eq!(store.list_user_sessions(&user.id).unwrap().len(), 3);
        assert_eq!(store.delete_expired_sessions(Utc::now()).unwrap(), 2);
        let remaining = store.list_user_sessions(&user.id).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, live.id);
        assert!(store.get_session(&expired.id).unwrap().is_none());
        assert_eq!(store.count_users().unwrap(), 1);
    }

    #[test]
    fn test_reopen_from_disk() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("library.redb");
        {
            let store = KvStore::open(&path).unwrap();
            store.create_author("Persisted").unwrap();
        }
        let store = KvStore::open(&path).unwrap();
        assert!(store.get_author_by_name("persisted").unwrap().is_some());
        assert_eq!(store.create_author("Next").unwrap().id, 2);
    }

    #[test]
    fn test_undecodable_records_skipped_in_listings() {
        let store = KvStore::open_in_memory().unwrap();
        store.create_author("Good").unwrap();
        store
            .engine_handle()
            .write(|batch| batch.put_str("author:99", "{broken"))
            .unwrap();
        assert_eq!(store.get_all_authors().unwrap().len(), 1);
        let err = store.get_author_by_id(99).unwrap_err();
        assert_eq!(err.error_type(), "EncodingError");
    }
}
