//! Source adapter contract + file, scrape, and API adapter implementations.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use fcn_core::{CandidateRecord, OpportunityStatus};
use fcn_storage::FetchError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod csv_export;
mod html_listing;
mod json_feed;
pub mod testing;

pub use csv_export::CsvExportAdapter;
pub use html_listing::{parse_listing_html, HtmlListingAdapter, ListingLocation};
pub use json_feed::{parse_feed_json, JsonFeedAdapter};

pub const CRATE_NAME: &str = "fcn-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    File,
    Scrape,
    Api,
}

/// Failure of a whole `collect` call. Per-record problems never surface here.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("source not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// One external source of opportunity listings.
///
/// `collect` yields a finite, ordered batch for one invocation. A malformed record is dropped
/// with a warning; only source-wide failures return `Err`.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn kind(&self) -> SourceKind;

    async fn collect(&self) -> Result<Vec<CandidateRecord>, AdapterError>;
}

pub(crate) fn text_or_none(value: impl AsRef<str>) -> Option<String> {
    let trimmed = value.as_ref().trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Parse a listing date in any of the layouts federal sources emit.
pub fn parse_listing_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    for layout in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"] {
        if let Ok(dt) = DateTime::parse_from_str(value, layout) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for layout in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, layout) {
            return Some(dt.and_utc());
        }
    }
    for layout in ["%Y-%m-%d", "%m/%d/%Y", "%b %d, %Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(value, layout) {
            return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
        }
    }
    None
}

/// Strip currency symbols and separators; `None` when nothing numeric remains.
pub fn parse_budget(value: &str) -> Option<f64> {
    let cleaned: String = value
        .chars()
        .filter(|c| !matches!(c, '$' | ',') && !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

pub(crate) fn status_from_text(value: &str) -> OpportunityStatus {
    let lower = value.to_ascii_lowercase();
    if lower.contains("award") {
        OpportunityStatus::Awarded
    } else if lower.contains("closed") || lower.contains("inactive") || lower.contains("cancel") {
        OpportunityStatus::Closed
    } else {
        OpportunityStatus::New
    }
}
