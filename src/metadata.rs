// Dataset page discovery
//
// Fetches the open-data page that publishes the schedule archive, reads the "Last Updated Date"
// row and the first `gtfs.zip` link. A second, JSON metadata endpoint is queried for audit
// timestamps only; it never influences whether a run proceeds.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use reqwest::{Client, Url};
use scraper::{Html, Selector};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{IngestError, Result};
use crate::store::{SiteMetadataLogEntry, Store};

/// Publish date format used on the page, e.g. "19 September 2025".
pub const VERSION_DATE_FORMAT: &str = "%d %B %Y";
pub const VERSION_LABEL: &str = "Last Updated Date";
pub const ARCHIVE_LINK_PATTERN: &str = "gtfs.zip";

const USER_AGENT: &str = "GTFS-Schedule-Sync/0.1 (open data ingestion)";

/// What a successful page fetch yields.
#[derive(Debug, Clone)]
pub struct SourcePage {
    pub version: NaiveDate,
    pub download_url: String,
    /// Raw page markup; the transport-type resolver parses it again.
    pub html: String,
}

/// Audit timestamps from the metadata endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteTimestamps {
    pub site_last_updated: NaiveDateTime,
    pub metadata_modified: NaiveDateTime,
}

#[derive(Debug, Deserialize)]
struct MetadataEnvelope {
    result: MetadataResult,
}

#[derive(Debug, Deserialize)]
struct MetadataResult {
    last_updated_date: String,
    metadata_modified: String,
}

pub struct MetadataFetcher {
    client: Client,
    page_url: String,
    metadata_url: String,
}

impl MetadataFetcher {
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| IngestError::MetadataFetch(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            page_url: config.gtfs_url.clone(),
            metadata_url: config.metadata_url.clone(),
        })
    }

    pub async fn fetch_source_page(&self) -> Result<SourcePage> {
        info!(url = %self.page_url, "Fetching dataset page");

        let response = self
            .client
            .get(&self.page_url)
            .header(
                reqwest::header::ACCEPT,
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            )
            .header(reqwest::header::ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            .send()
            .await
            .map_err(|e| IngestError::MetadataFetch(format!("Request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(IngestError::MetadataFetch(format!(
                "Dataset page returned status {}",
                response.status()
            )));
        }

        let html = response
            .text()
            .await
            .map_err(|e| IngestError::MetadataFetch(format!("Failed to read page body: {e}")))?;

        let (version, download_url) = parse_source_page(&html, &self.page_url)?;
        info!(version = %version, download_url = %download_url, "Discovered dataset version");

        Ok(SourcePage {
            version,
            download_url,
            html,
        })
    }

    pub async fn fetch_site_timestamps(&self) -> Result<SiteTimestamps> {
        debug!(url = %self.metadata_url, "Fetching site metadata");

        let response = self
            .client
            .get(&self.metadata_url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| IngestError::MetadataFetch(format!("Metadata request failed: {e}")))?;

        let envelope: MetadataEnvelope = response
            .json()
            .await
            .map_err(|e| IngestError::MetadataFetch(format!("Malformed metadata response: {e}")))?;

        Ok(SiteTimestamps {
            site_last_updated: parse_timestamp(&envelope.result.last_updated_date)?,
            metadata_modified: parse_timestamp(&envelope.result.metadata_modified)?,
        })
    }
}

/// Extract `(version, download_url)` from the page markup.
pub fn parse_source_page(html: &str, page_url: &str) -> Result<(NaiveDate, String)> {
    let document = Html::parse_document(html);

    let raw_date = find_version_text(&document).ok_or_else(|| {
        IngestError::MetadataFetch(format!("No '{VERSION_LABEL}' field on the page"))
    })?;
    let version = parse_version_date(&raw_date)?;

    let href = find_archive_link(&document).ok_or_else(|| {
        IngestError::MetadataFetch(format!("No link matching '{ARCHIVE_LINK_PATTERN}' on the page"))
    })?;

    Ok((version, resolve_link(page_url, &href)))
}

pub fn parse_version_date(raw: &str) -> Result<NaiveDate> {
    let normalized = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    NaiveDate::parse_from_str(&normalized, VERSION_DATE_FORMAT).map_err(|e| {
        IngestError::MetadataFetch(format!("Unexpected version date '{normalized}': {e}"))
    })
}

/// Text of the first `<td>` following the `<th>` labelled "Last Updated Date".
fn find_version_text(document: &Html) -> Option<String> {
    let cells = Selector::parse("th, td").ok()?;
    let mut label_seen = false;

    for cell in document.select(&cells) {
        let text = cell.text().collect::<String>();
        let text = text.trim();

        match cell.value().name() {
            "th" if text == VERSION_LABEL => label_seen = true,
            "td" if label_seen => return Some(text.to_string()),
            _ => {}
        }
    }
    None
}

/// First archive link in document order; later matches are ignored.
fn find_archive_link(document: &Html) -> Option<String> {
    let anchors = Selector::parse("a[href]").ok()?;
    document
        .select(&anchors)
        .filter_map(|a| a.value().attr("href"))
        .find(|href| href.contains(ARCHIVE_LINK_PATTERN))
        .map(str::to_string)
}

fn resolve_link(page_url: &str, href: &str) -> String {
    Url::parse(page_url)
        .and_then(|base| base.join(href))
        .map(String::from)
        .unwrap_or_else(|_| href.to_string())
}

/// ISO-8601 with or without offset, or a bare date.
pub fn parse_timestamp(raw: &str) -> Result<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.naive_utc());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(dt);
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| IngestError::MetadataFetch(format!("Unrecognised timestamp '{raw}'")))
}

/// Record the upstream timestamps for auditing. Never fails the caller.
pub async fn log_site_metadata(
    store: &Store,
    gtfs_version: NaiveDate,
    site_last_updated: NaiveDateTime,
    metadata_modified: NaiveDateTime,
) {
    let entry = SiteMetadataLogEntry {
        gtfs_last_updated: gtfs_version,
        site_last_updated,
        metadata_modified,
    };

    match store.upsert_site_metadata(&entry).await {
        Ok(()) => debug!(?entry, "Logged site metadata"),
        Err(e) => warn!(error = %e, "Could not log site metadata"),
    }
}
