// Runtime configuration
//
// Everything is read from the environment (optionally seeded from a `.env` file). Lookups go
// through a closure so the parsing can be exercised without touching the process environment.

use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDate;
use serde::Serialize;

use crate::error::{IngestError, Result};
use crate::transport_types::LabelRule;

pub const DEFAULT_GTFS_URL: &str = "https://opendata.transport.vic.gov.au/dataset/gtfs-schedule";
pub const DEFAULT_METADATA_URL: &str =
    "https://opendata.transport.vic.gov.au/api/3/action/package_show?id=gtfs-schedule";
pub const DEFAULT_TRANSPORT_FILTER: &str = "Tram";
pub const DEFAULT_KEEP_FILES: &str = "routes.txt,trips.txt,shapes.txt";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://gtfs.db?mode=rwc";
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_SERVER_HOST: &str = "0.0.0.0";
pub const DEFAULT_SERVER_PORT: u16 = 8080;
pub const DEFAULT_OLD_VERSION_DATE: &str = "2000-01-01";
pub const DEFAULT_LABEL_RULES: &str = "metro bus=>Metro Bus";
pub const DEFAULT_TEXT_COLUMNS: &str = "route_short_name";

/// Test and backfill switches. All of them must be off in production.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Flags {
    /// Reuse an archive already present in the staging area instead of downloading.
    pub skip_download: bool,
    /// Pass the version gate unconditionally.
    pub ignore_version_check: bool,
    /// Replace the discovered version with `old_version_date`.
    pub force_old_version: bool,
    pub old_version_date: Option<NaiveDate>,
    /// Skip the stale-data reaper.
    pub retain_outdated_data: bool,
    /// Leave the staging area on disk after the run.
    pub keep_staging_files: bool,
}

impl Flags {
    /// Names of every test-only flag that is currently enabled.
    pub fn production_violations(&self) -> Vec<&'static str> {
        let checks = [
            ("SKIP_DOWNLOAD", self.skip_download),
            ("IGNORE_VERSION_CHECK", self.ignore_version_check),
            ("FORCE_OLD_VERSION", self.force_old_version),
            ("RETAIN_OUTDATED_DATA", self.retain_outdated_data),
            ("KEEP_STAGING_FILES", self.keep_staging_files),
        ];

        checks
            .into_iter()
            .filter(|(_, enabled)| *enabled)
            .map(|(name, _)| name)
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub gtfs_url: String,
    pub metadata_url: String,
    pub transport_filter: Vec<String>,
    pub keep_files: Vec<String>,
    pub database_url: String,
    pub database_max_connections: u32,
    pub staging_dir: PathBuf,
    pub mirror_dir: Option<PathBuf>,
    pub request_timeout: Duration,
    pub download_timeout: Duration,
    pub server_host: String,
    pub server_port: u16,
    pub label_rules: Vec<LabelRule>,
    pub text_columns: Vec<String>,
    pub flags: Flags,
}

impl Config {
    /// Load configuration from the environment and defaults
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let flag = |key: &str| lookup(key).map(|v| parse_bool(&v)).unwrap_or(false);

        let old_version_date = match lookup("OLD_VERSION_DATE") {
            Some(raw) => Some(parse_iso_date("OLD_VERSION_DATE", &raw)?),
            None => Some(parse_iso_date("OLD_VERSION_DATE", DEFAULT_OLD_VERSION_DATE)?),
        };

        let config = Config {
            gtfs_url: string("GTFS_URL", DEFAULT_GTFS_URL),
            metadata_url: string("GTFS_METADATA_URL", DEFAULT_METADATA_URL),
            transport_filter: split_list(&string("TRANSPORT_FILTER", DEFAULT_TRANSPORT_FILTER)),
            keep_files: split_list(&string("KEEP_FILES", DEFAULT_KEEP_FILES)),
            database_url: string("DATABASE_URL", DEFAULT_DATABASE_URL),
            database_max_connections: parse_or(
                lookup("DATABASE_MAX_CONNECTIONS"),
                DEFAULT_DATABASE_MAX_CONNECTIONS,
            ),
            staging_dir: lookup("STAGING_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(default_staging_dir),
            mirror_dir: lookup("MIRROR_DIR").map(PathBuf::from),
            request_timeout: Duration::from_secs(parse_or(
                lookup("REQUEST_TIMEOUT_SECS"),
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )),
            download_timeout: Duration::from_secs(parse_or(
                lookup("DOWNLOAD_TIMEOUT_SECS"),
                DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            )),
            server_host: string("SERVER_HOST", DEFAULT_SERVER_HOST),
            server_port: parse_or(lookup("SERVER_PORT"), DEFAULT_SERVER_PORT),
            label_rules: LabelRule::parse_list(&string("LABEL_RULES", DEFAULT_LABEL_RULES))?,
            text_columns: split_list(&string("TEXT_COLUMNS", DEFAULT_TEXT_COLUMNS)),
            flags: Flags {
                skip_download: flag("SKIP_DOWNLOAD"),
                ignore_version_check: flag("IGNORE_VERSION_CHECK"),
                force_old_version: flag("FORCE_OLD_VERSION"),
                old_version_date,
                retain_outdated_data: flag("RETAIN_OUTDATED_DATA"),
                keep_staging_files: flag("KEEP_STAGING_FILES"),
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.gtfs_url.is_empty() {
            return Err(IngestError::Config("GTFS_URL cannot be empty".into()));
        }
        if self.transport_filter.is_empty() {
            return Err(IngestError::Config(
                "TRANSPORT_FILTER needs at least one keyword".into(),
            ));
        }
        if self.keep_files.is_empty() {
            return Err(IngestError::Config(
                "KEEP_FILES needs at least one file name".into(),
            ));
        }
        if self.database_max_connections == 0 {
            return Err(IngestError::Config(
                "DATABASE_MAX_CONNECTIONS must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// File-type names (`routes`, `trips`, ...) of the retained file allow-list.
    pub fn keep_file_basenames(&self) -> Vec<String> {
        self.keep_files
            .iter()
            .map(|name| file_stem(name).to_string())
            .collect()
    }

    /// Path the outer archive is downloaded to.
    pub fn archive_path(&self) -> PathBuf {
        self.staging_dir.join("gtfs.zip")
    }

    /// Directory the per-mode inner files are extracted into.
    pub fn extracted_dir(&self) -> PathBuf {
        self.staging_dir.join("extracted")
    }
}

pub(crate) fn file_stem(name: &str) -> &str {
    name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(name)
}

fn default_staging_dir() -> PathBuf {
    let mut path = dirs::cache_dir().unwrap_or_else(std::env::temp_dir);
    path.push("gtfs_schedule_sync");
    path
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_or<T: std::str::FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn parse_iso_date(key: &str, raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|e| IngestError::Config(format!("{key} must be YYYY-MM-DD ({e})")))
}
