//! Represents a media record owned by a user.

use super::file_object::ProviderType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{fmt, str::FromStr};
use thiserror::Error;
use uuid::Uuid;

/// Coarse classification of uploaded content, used in storage keys.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
    Audio,
    Document,
    Other,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Video => "video",
            MediaType::Audio => "audio",
            MediaType::Document => "document",
            MediaType::Other => "other",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown media type `{0}`")]
pub struct UnknownMediaType(pub String);

impl FromStr for MediaType {
    type Err = UnknownMediaType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "image" => Ok(MediaType::Image),
            "video" => Ok(MediaType::Video),
            "audio" => Ok(MediaType::Audio),
            "document" => Ok(MediaType::Document),
            "other" => Ok(MediaType::Other),
            _ => Err(UnknownMediaType(s.to_string())),
        }
    }
}

/// A persisted media record.
///
/// Created only after the backend confirmed the upload, never updated, and
/// removed only after the backend object is gone.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct Media {
    pub id: Uuid,

    /// Owner; every lookup is scoped by it.
    pub user_id: String,

    /// Original file name as supplied by the client.
    pub file_name: String,

    /// Storage key inside the provider.
    pub file_path: String,

    pub file_size: i64,

    pub media_type: MediaType,

    pub content_type: String,

    /// Backend that holds the bytes. Deletes always go to this provider.
    pub provider: ProviderType,

    pub public_url: String,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

/// Pagination envelope returned with list queries.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Pagination {
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
    pub total_pages: u64,
}

impl Pagination {
    pub const DEFAULT_PAGE_SIZE: u32 = 10;
    pub const MAX_PAGE_SIZE: u32 = 100;

    /// Normalize caller-supplied values: page defaults to 1, page size to 10,
    /// and page size is capped at 100.
    pub fn normalize(page: Option<u32>, page_size: Option<u32>) -> (u32, u32) {
        let page = page.filter(|p| *p > 0).unwrap_or(1);
        let page_size = page_size
            .filter(|s| *s > 0)
            .unwrap_or(Self::DEFAULT_PAGE_SIZE)
            .min(Self::MAX_PAGE_SIZE);
        (page, page_size)
    }

    pub fn new(page: u32, page_size: u32, total: u64) -> Self {
        let total_pages = if total == 0 {
            0
        } else {
            total.div_ceil(page_size as u64)
        };
        Self {
            page,
            page_size,
            total,
            total_pages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_type_parses_known_words_only() {
        assert_eq!(" Video ".parse::<MediaType>(), Ok(MediaType::Video));
        let err = "movie".parse::<MediaType>().unwrap_err();
        assert_eq!(err.to_string(), "unknown media type `movie`");
    }

    #[test]
    fn pagination_defaults_and_caps() {
        assert_eq!(Pagination::normalize(None, None), (1, 10));
        assert_eq!(Pagination::normalize(Some(0), Some(0)), (1, 10));
        assert_eq!(Pagination::normalize(Some(3), Some(500)), (3, 100));
    }

    #[test]
    fn pagination_counts_pages() {
        assert_eq!(Pagination::new(1, 10, 0).total_pages, 0);
        assert_eq!(Pagination::new(1, 10, 10).total_pages, 1);
        assert_eq!(Pagination::new(1, 10, 11).total_pages, 2);
    }
}
