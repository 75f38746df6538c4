//! Engine-independent scan helpers
//!
//! Both engines funnel their full-scan queries through these functions so
//! grouping and ordering come out identical regardless of the backend.

use crate::db::models::{Book, BookSegment, DashboardStats, DurationEntry, DurationMap};
use lazy_static::lazy_static;
use regex::Regex;
use std::cmp::Ordering;
use std::collections::HashMap;

lazy_static! {
    static ref NAME_SEPARATOR: Regex = Regex::new(r"\s*&\s*").unwrap();
}

/// Current layout version of [`DurationMap`]
pub const DURATION_MAP_VERSION: i64 = 1;

/// Apply `offset`/`limit` to an already ordered list; `limit == 0` keeps everything
pub fn paginate<T>(items: Vec<T>, limit: usize, offset: usize) -> Vec<T> {
    let iter = items.into_iter().skip(offset);
    if limit == 0 {
        iter.collect()
    } else {
        iter.take(limit).collect()
    }
}

/// Live books that share a dedup hash, in groups of two or more
///
/// Groups are ordered largest first, then by their first file path. Members
/// are sorted by file path.
pub fn group_duplicates<I>(books: I) -> Vec<Vec<Book>>
where
    I: IntoIterator<Item = Book>,
{
    let mut by_hash: HashMap<String, Vec<Book>> = HashMap::new();
    for book in books {
        if book.is_deleted() {
            continue;
        }
        let Some(hash) = book.dedup_hash().map(str::to_string) else {
            continue;
        };
        by_hash.entry(hash).or_default().push(book);
    }

    let mut groups: Vec<Vec<Book>> = by_hash
        .into_values()
        .filter(|group| group.len() > 1)
        .map(|mut group| {
            group.sort_by(|a, b| a.file_path.cmp(&b.file_path));
            group
        })
        .collect();

    groups.sort_by(|a, b| {
        b.len()
            .cmp(&a.len())
            .then_with(|| a[0].file_path.cmp(&b[0].file_path))
    });
    groups
}

/// Totals and distributions over live books
///
/// A missing library state counts as `imported`, a missing codec as `unknown`.
pub fn dashboard_stats<'a, I>(books: I) -> DashboardStats
where
    I: IntoIterator<Item = &'a Book>,
{
    let mut stats = DashboardStats::default();
    for book in books.into_iter().filter(|b| !b.is_deleted()) {
        stats.total_books += 1;
        stats.total_duration += book.duration.unwrap_or(0);
        stats.total_size += book.file_size.unwrap_or(0);
        let state = book.library_state.as_deref().unwrap_or("imported");
        *stats.state_distribution.entry(state.to_string()).or_insert(0) += 1;
        let codec = book.codec.as_deref().unwrap_or("unknown");
        *stats.format_distribution.entry(codec.to_string()).or_insert(0) += 1;
    }
    stats
}

/// Primary version first, then title
pub fn sort_version_group(books: &mut [Book]) {
    books.sort_by(|a, b| {
        b.is_primary_version
            .cmp(&a.is_primary_version)
            .then_with(|| a.title.cmp(&b.title))
    });
}

/// Most recently marked first, missing timestamps last, then title
pub fn sort_soft_deleted(books: &mut [Book]) {
    books.sort_by(|a, b| {
        match (a.marked_for_deletion_at, b.marked_for_deletion_at) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
        .then_with(|| a.title.cmp(&b.title))
    });
}

/// Series sequence ascending with unsequenced books last, then title
pub fn sort_series_books(books: &mut [Book]) {
    books.sort_by(|a, b| {
        cmp_some_first(a.series_sequence, b.series_sequence).then_with(|| a.title.cmp(&b.title))
    });
}

pub fn sort_by_title(books: &mut [Book]) {
    books.sort_by(|a, b| a.title.cmp(&b.title).then_with(|| a.id.cmp(&b.id)));
}

/// ASCII case-insensitive substring match on the title, like SQLite `lower()`
pub fn title_matches(book: &Book, query: &str) -> bool {
    book.title
        .to_ascii_lowercase()
        .contains(&query.to_ascii_lowercase())
}

/// Order segments for playback: track number first when present, then path
pub fn playback_order(segments: &mut [BookSegment]) {
    segments.sort_by(|a, b| {
        cmp_some_first(a.track_number, b.track_number).then_with(|| a.file_path.cmp(&b.file_path))
    });
}

/// Build the duration map from a book's segments
///
/// Only active segments appear. Each entry starts where the previous one ended.
pub fn build_duration_map(segments: &[BookSegment]) -> DurationMap {
    let mut active: Vec<BookSegment> = segments.iter().filter(|s| s.active).cloned().collect();
    playback_order(&mut active);

    let mut total = 0i64;
    let mut entries = Vec::with_capacity(active.len());
    for segment in &active {
        entries.push(DurationEntry {
            id: segment.id.clone(),
            duration: segment.duration_sec,
            active: true,
            offset_start: total,
        });
        total += segment.duration_sec;
    }

    DurationMap {
        segments: entries,
        total_duration: total,
        version: DURATION_MAP_VERSION,
    }
}

/// Split a joined name field such as `"Alice & Bob"`
///
/// Names are trimmed and empty pieces dropped.
pub fn split_names(value: &str) -> Vec<String> {
    NAME_SEPARATOR
        .split(value)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

fn cmp_some_first(a: Option<i64>, b: Option<i64>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use proptest::prelude::*;

    fn book(id: &str, title: &str, path: &str) -> Book {
        let mut book = Book::new(title, path);
        book.id = id.to_string();
        book
    }

    fn segment(id: &str, path: &str, track: Option<i64>, duration: i64, active: bool) -> BookSegment {
        BookSegment {
            id: id.to_string(),
            book_id: "b1".to_string(),
            file_path: path.to_string(),
            track_number: track,
            duration_sec: duration,
            active,
            ..Default::default()
        }
    }

    #[test]
    fn test_paginate() {
        let items: Vec<i32> = (0..10).collect();
        assert_eq!(paginate(items.clone(), 3, 2), vec![2, 3, 4]);
        assert_eq!(paginate(items.clone(), 0, 8), vec![8, 9]);
        assert!(paginate(items, 5, 20).is_empty());
    }

    #[test]
    fn test_group_duplicates() {
        let mut b1 = book("1", "A", "/z/a.m4b");
        b1.organized_file_hash = Some("h".into());
        let mut b2 = book("2", "A copy", "/a/a.m4b");
        b2.file_hash = Some("h".into());
        let mut b3 = book("3", "Unique", "/u.m4b");
        b3.file_hash = Some("u".into());
        let mut b4 = book("4", "Deleted", "/d.m4b");
        b4.file_hash = Some("h".into());
        b4.marked_for_deletion = true;
        let b5 = book("5", "No hash", "/n.m4b");

        let groups = group_duplicates(vec![b1, b2, b3, b4, b5]);
        assert_eq!(groups.len(), 1);
        let ids: Vec<&str> = groups[0].iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "1"]);
    }

    #[test]
    fn test_sort_version_group() {
        let mut a = book("1", "B title", "/1");
        a.is_primary_version = false;
        let mut b = book("2", "Z title", "/2");
        b.is_primary_version = true;
        let mut c = book("3", "A title", "/3");
        c.is_primary_version = false;
        let mut books = vec![a, b, c];
        sort_version_group(&mut books);
        let ids: Vec<&str> = books.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "3", "1"]);
    }

    #[test]
    fn test_sort_soft_deleted() {
        let now = Utc::now();
        let mut old = book("old", "A", "/1");
        old.marked_for_deletion_at = Some(now - Duration::days(3));
        let mut recent = book("recent", "B", "/2");
        recent.marked_for_deletion_at = Some(now);
        let unmarked = book("unmarked", "C", "/3");
        let mut books = vec![unmarked, old, recent];
        sort_soft_deleted(&mut books);
        let ids: Vec<&str> = books.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["recent", "old", "unmarked"]);
    }

    #[test]
    fn test_series_order() {
        let mut a = book("a", "Zeta", "/a");
        a.series_sequence = Some(2);
        let mut b = book("b", "Alpha", "/b");
        b.series_sequence = Some(1);
        let c = book("c", "Beta", "/c");
        let mut books = vec![c, a, b];
        sort_series_books(&mut books);
        let ids: Vec<&str> = books.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_duration_map_orders_tracks_first() {
        let segments = vec![
            segment("s3", "/b.mp3", None, 50, true),
            segment("s2", "/z.mp3", Some(2), 200, true),
            segment("s1", "/y.mp3", Some(1), 300, true),
            segment("s0", "/a.mp3", None, 10, true),
            segment("old", "/old.mp3", Some(0), 999, false),
        ];
        let map = build_duration_map(&segments);
        let ids: Vec<&str> = map.segments.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2", "s0", "s3"]);
        let offsets: Vec<i64> = map.segments.iter().map(|e| e.offset_start).collect();
        assert_eq!(offsets, vec![0, 300, 500, 510]);
        assert_eq!(map.total_duration, 560);
        assert_eq!(map.version, DURATION_MAP_VERSION);
    }

    #[test]
    fn test_split_names() {
        assert_eq!(
            split_names("Alice Smith & Bob Jones"),
            vec!["Alice Smith".to_string(), "Bob Jones".to_string()]
        );
        assert_eq!(split_names("A&B &  C"), vec!["A", "B", "C"]);
        assert_eq!(split_names("Solo Author"), vec!["Solo Author"]);
        assert_eq!(split_names(" & Lone & "), vec!["Lone"]);
        assert!(split_names("").is_empty());
    }

    #[test]
    fn test_dashboard_stats() {
        let mut a = book("a", "A", "/a");
        a.duration = Some(100);
        a.file_size = Some(1000);
        a.codec = Some("aac".into());
        let mut b = book("b", "B", "/b");
        b.duration = Some(50);
        b.library_state = Some("organized".into());
        let mut gone = book("c", "C", "/c");
        gone.duration = Some(999);
        gone.marked_for_deletion = true;

        let stats = dashboard_stats(&[a, b, gone]);
        assert_eq!(stats.total_books, 2);
        assert_eq!(stats.total_duration, 150);
        assert_eq!(stats.total_size, 1000);
        assert_eq!(stats.state_distribution["imported"], 1);
        assert_eq!(stats.state_distribution["organized"], 1);
        assert_eq!(stats.format_distribution["aac"], 1);
        assert_eq!(stats.format_distribution["unknown"], 1);
    }

    #[test]
    fn test_title_matches() {
        let b = book("1", "The Hobbit", "/h");
        assert!(title_matches(&b, "hobb"));
        assert!(title_matches(&b, "THE"));
        assert!(!title_matches(&b, "rings"));

        let accented = book("2", "Élan Vital", "/e");
        assert!(title_matches(&accented, "ÉLAN"));
        assert!(!title_matches(&accented, "élan"));
    }

    proptest! {
        #[test]
        fn prop_duration_offsets_are_cumulative(durations in prop::collection::vec(0i64..10_000, 0..20)) {
            let segments: Vec<BookSegment> = durations
                .iter()
                .enumerate()
                .map(|(i, d)| segment(&format!("s{}", i), &format!("/{:03}.mp3", i), Some(i as i64), *d, true))
                .collect();
            let map = build_duration_map(&segments);
            prop_assert_eq!(map.total_duration, durations.iter().sum::<i64>());
            let mut running = 0;
            for entry in &map.segments {
                prop_assert_eq!(entry.offset_start, running);
                running += entry.duration;
            }
        }
    }
}
