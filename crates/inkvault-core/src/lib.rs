//! Core domain model, name canonicalization and chapter diffing for inkvault.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "inkvault-core";

/// Canonical form used as the lookup and storage key for every series and
/// chapter name: only ASCII letters, digits and whitespace survive, and
/// whitespace runs collapse to a single space.
pub fn normalize_name(input: &str) -> String {
    input
        .chars()
        // RE2 `\s` as used for existing catalog keys; not `char::is_whitespace`.
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '\t' | '\n' | '\r' | '\x0c'))
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// A series as discovered on the source catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Series {
    pub name: String,
    pub link: String,
}

impl Series {
    pub fn new(raw_name: &str, link: impl Into<String>) -> Self {
        Self {
            name: normalize_name(raw_name),
            link: link.into(),
        }
    }

    /// Key used for series lookups and processing leases.
    pub fn key(&self) -> String {
        normalize_name(&self.name)
    }
}

/// A chapter listed under a series on the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    pub name: String,
    pub link: String,
}

impl Chapter {
    pub fn new(raw_name: &str, link: impl Into<String>) -> Self {
        Self {
            name: normalize_name(raw_name),
            link: link.into(),
        }
    }
}

/// Location of a single page wrapper inside a chapter, 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRef {
    pub page_no: u32,
    pub link: String,
}

/// Result of running one page through the image pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPage {
    pub page_no: u32,
    pub source_url: String,
    pub hosted_url: String,
}

/// Descriptive metadata scraped once, when a series is first seen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesDetails {
    pub cover_image_url: String,
    pub alt_name: String,
    pub year_of_release: String,
    pub status: String,
    pub author: String,
    pub artist: String,
    pub description: String,
    pub genres: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSeries {
    pub name: String,
    pub link: String,
    pub hosted_cover_url: String,
    pub details: SeriesDetails,
}

/// Persisted series row, as much of it as the pipeline needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesRecord {
    pub id: i64,
    pub name: String,
    pub link: String,
}

/// Aggregate written in a single store operation: one chapter row plus every
/// page row that belongs to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewChapter {
    pub series_id: i64,
    pub name: String,
    pub link: String,
    pub chapter_no: i32,
    pub total_pages: i32,
    pub ingested_at: DateTime<Utc>,
    pub pages: Vec<StoredPage>,
}

/// Advisory marker saying a series is being processed by some run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingLease {
    pub id: i64,
    pub series_key: String,
    pub created_at: DateTime<Utc>,
}

/// Derive the chapter number by stripping the series name from the front of
/// the chapter name and parsing what is left.
pub fn chapter_number(series_name: &str, chapter_name: &str) -> Result<i32> {
    let series = normalize_name(series_name);
    let chapter = normalize_name(chapter_name);
    let rest = chapter.strip_prefix(series.as_str()).unwrap_or(&chapter);
    rest.trim()
        .parse::<i32>()
        .map_err(|_| IngestError::SequenceNumber {
            chapter: chapter_name.trim().to_string(),
        })
}

/// Chapters not yet ingested for a series, in discovery order. Each side is
/// trimmed independently; this is not the full canonicalization used for
/// storage keys.
pub fn diff_new_chapters(discovered: Vec<Chapter>, existing: &[String]) -> Vec<Chapter> {
    let existing: HashSet<&str> = existing.iter().map(|n| n.trim()).collect();
    discovered
        .into_iter()
        .filter(|chapter| !existing.contains(chapter.name.trim()))
        .collect()
}

/// Error taxonomy shared by every pipeline stage.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("discovery failed: {0}")]
    Discovery(String),
    #[error("site unavailable: {url}")]
    SiteUnavailable { url: String },
    #[error("{what} not found on {url}")]
    NotFound { url: String, what: String },
    #[error("download failed for {url}: {message}")]
    Download { url: String, message: String },
    #[error("unsupported image format for {url}: only png and jpg are accepted")]
    UnsupportedFormat { url: String },
    #[error("image decode failed for {url}: {message}")]
    Decode { url: String, message: String },
    #[error("image encode failed: {0}")]
    Encode(String),
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("cannot derive chapter number from {chapter:?}")]
    SequenceNumber { chapter: String },
    #[error("page task aborted: {0}")]
    Task(String),
}

impl IngestError {
    pub fn discovery(message: impl fmt::Display) -> Self {
        Self::Discovery(message.to_string())
    }

    pub fn persistence(message: impl fmt::Display) -> Self {
        Self::Persistence(message.to_string())
    }

    pub fn not_found(url: impl Into<String>, what: impl Into<String>) -> Self {
        Self::NotFound {
            url: url.into(),
            what: what.into(),
        }
    }

    pub fn download(url: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Download {
            url: url.into(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_punctuation_and_collapses_whitespace() {
        assert_eq!(normalize_name("Junjou Drop"), "Junjou Drop");
        assert_eq!(normalize_name("#000000 - Ultra Black 3"), "000000 Ultra Black 3");
        assert_eq!(normalize_name("Kapon_(>_<)!"), "Kapon");
        assert_eq!(normalize_name("1/2 Love!"), "12 Love");
        assert_eq!(normalize_name("8.1 - Yamada Yuusuke Gekijou"), "81 Yamada Yuusuke Gekijou");
        assert_eq!(normalize_name("+C Sword and Cornett"), "C Sword and Cornett");
        assert_eq!(normalize_name("  Tabs\tand\n\nnewlines  "), "Tabs and newlines");
    }

    #[test]
    fn normalize_is_idempotent() {
        for input in ["#000000 - Ultra Black 3", "Kapon_(>_<)!", "  a  b ", "Ébène 7", ""] {
            let once = normalize_name(input);
            assert_eq!(normalize_name(&once), once, "input {input:?}");
        }
    }

    fn raw_chapters(names: &[&str]) -> Vec<Chapter> {
        names
            .iter()
            .map(|name| Chapter {
                name: name.to_string(),
                link: format!("http://x/{}", name.trim()),
            })
            .collect()
    }

    fn names(chapters: &[Chapter]) -> Vec<&str> {
        chapters.iter().map(|c| c.name.as_str()).collect()
    }

    #[test]
    fn diff_keeps_discovery_order() {
        let fresh = diff_new_chapters(
            raw_chapters(&["A", "B", "C", "D", "F", "G"]),
            &["B".to_string(), "C".to_string(), "E".to_string()],
        );
        assert_eq!(names(&fresh), vec!["A", "D", "F", "G"]);
    }

    #[test]
    fn diff_compares_trimmed_names_only() {
        let fresh = diff_new_chapters(
            raw_chapters(&[" Naruto 1 ", "Naruto 2", "Naruto 3!"]),
            &["Naruto 1".to_string(), " Naruto 3 ".to_string()],
        );
        assert_eq!(names(&fresh), vec!["Naruto 2", "Naruto 3!"]);
    }

    #[test]
    fn diff_with_empty_catalog_keeps_everything() {
        let fresh = diff_new_chapters(raw_chapters(&["Bleach 1", "Bleach 2"]), &[]);
        assert_eq!(names(&fresh), vec!["Bleach 1", "Bleach 2"]);
    }

    #[test]
    fn diff_keeps_duplicates_from_discovery() {
        let discovered = vec![
            Chapter::new("Bleach 1", "http://x/bleach/1"),
            Chapter::new("Bleach 2", "http://x/bleach/2"),
            Chapter::new("Bleach 2", "http://x/bleach/2-alt"),
        ];
        let fresh = diff_new_chapters(discovered, &["Bleach 1".to_string()]);
        let links: Vec<_> = fresh.iter().map(|c| c.link.as_str()).collect();
        assert_eq!(links, vec!["http://x/bleach/2", "http://x/bleach/2-alt"]);
    }

    #[test]
    fn chapter_number_strips_series_prefix() {
        assert_eq!(chapter_number("Naruto", "Naruto 42").unwrap(), 42);
        assert_eq!(chapter_number("#000000 - Ultra Black", "#000000 - Ultra Black 3").unwrap(), 3);
        assert_eq!(chapter_number("One Piece", "One Piece 1000").unwrap(), 1000);
    }

    #[test]
    fn chapter_number_rejects_non_numeric_suffix() {
        let err = chapter_number("Naruto", "Naruto Special").unwrap_err();
        assert!(matches!(err, IngestError::SequenceNumber { .. }));
        assert!(chapter_number("Naruto", "Naruto 4 5").is_err());
    }

    #[test]
    fn series_key_is_canonical() {
        let series = Series::new("  Kapon_(>_<)! ", "http://x/kapon");
        assert_eq!(series.name, "Kapon");
        assert_eq!(series.key(), "Kapon");
    }
}
