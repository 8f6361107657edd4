// Ingestion pipeline
//
// One sequential run: fetch the page, gate on version, resolve modes, download and extract the
// archive, load staged files, reap stale records, clean the staging area.
//
// Runs against the same store must not overlap: the gate reads and then writes the version
// marker without any locking. The HTTP trigger serializes its own calls.

use std::path::Path;
use std::time::Instant;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::archive;
use crate::config::Config;
use crate::error::{IngestError, Result};
use crate::loader::{self, LoadContext};
use crate::metadata::{self, MetadataFetcher, SourcePage};
use crate::mirror::{self, ArtifactMirror};
use crate::reaper;
use crate::store::Store;
use crate::transport_types::{self, TransportTypeMap};
use crate::version;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    Idle,
    FetchingMetadata,
    NoUpdateNeeded,
    VersionCommitted,
    Extracting,
    Loading,
    Reaping,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub updated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<NaiveDate>,
    pub elapsed_seconds: f64,
    pub modes: TransportTypeMap,
    pub files_loaded: usize,
    pub files_failed: usize,
    pub records_inserted: usize,
    pub records_reaped: u64,
}

impl RunOutcome {
    fn no_update(version: NaiveDate, started: Instant) -> Self {
        RunOutcome {
            updated: false,
            version: Some(version),
            elapsed_seconds: started.elapsed().as_secs_f64(),
            modes: TransportTypeMap::default(),
            files_loaded: 0,
            files_failed: 0,
            records_inserted: 0,
            records_reaped: 0,
        }
    }
}

pub struct Pipeline {
    config: Config,
    store: Store,
    mirror: Box<dyn ArtifactMirror>,
}

impl Pipeline {
    pub fn new(config: Config, store: Store) -> Self {
        let mirror = mirror::from_config(config.mirror_dir.as_ref());
        Self {
            config,
            store,
            mirror,
        }
    }

    pub fn with_mirror(mut self, mirror: Box<dyn ArtifactMirror>) -> Self {
        self.mirror = mirror;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    fn enter(&self, stage: Stage) {
        info!(stage = ?stage, "Pipeline stage");
    }

    pub async fn run(&self) -> Result<RunOutcome> {
        info!("======= Starting GTFS update run =======");
        self.enter(Stage::Idle);

        let result = self.run_stages().await;

        if !self.config.flags.keep_staging_files {
            self.cleanup_staging();
        } else {
            warn!(path = %self.config.staging_dir.display(), "[TEST] Keeping staging files");
        }

        match &result {
            Ok(outcome) if outcome.updated => {
                self.enter(Stage::Done);
                info!(
                    seconds = outcome.elapsed_seconds,
                    records = outcome.records_inserted,
                    "GTFS update finished"
                );
            }
            Ok(_) => {}
            Err(e) => {
                self.enter(Stage::Failed);
                error!(error = %e, "GTFS update failed");
            }
        }
        result
    }

    async fn run_stages(&self) -> Result<RunOutcome> {
        let started = Instant::now();
        let flags = &self.config.flags;

        self.store.ping().await?;

        self.enter(Stage::FetchingMetadata);
        let fetcher = MetadataFetcher::new(&self.config)?;
        let page = fetcher.fetch_source_page().await?;

        if let Err(e) = self.mirror.mirror_text("gtfs.html", &page.html) {
            warn!(error = %e, "Could not mirror dataset page");
        }

        self.record_site_metadata(&fetcher, &page).await;

        let version = match (flags.force_old_version, flags.old_version_date) {
            (true, Some(old)) => {
                warn!(discovered = %page.version, forced = %old, "[TEST] Using forced old version");
                old
            }
            _ => page.version,
        };

        if !version::check_and_commit(&self.store, version, flags.ignore_version_check).await? {
            self.enter(Stage::NoUpdateNeeded);
            return Ok(RunOutcome::no_update(version, started));
        }
        self.enter(Stage::VersionCommitted);

        let modes = transport_types::parse_transport_types(
            &page.html,
            &self.config.transport_filter,
            &self.config.label_rules,
        );
        if modes.is_empty() {
            warn!(filter = ?self.config.transport_filter, "No transport modes matched the filter");
        }

        self.enter(Stage::Extracting);
        self.stage_archive(&page.download_url, &modes).await?;

        self.enter(Stage::Loading);
        let ctx = LoadContext {
            version,
            modes: modes.clone(),
            file_types: self.config.keep_file_basenames(),
            text_columns: self.config.text_columns.clone(),
        };
        let load = loader::load_staged(&self.store, &self.config.extracted_dir(), &ctx).await?;

        self.enter(Stage::Reaping);
        let reaped = reaper::reap(
            &self.store,
            version,
            &modes,
            &ctx.file_types,
            flags.retain_outdated_data,
        )
        .await?;

        Ok(RunOutcome {
            updated: true,
            version: Some(version),
            elapsed_seconds: started.elapsed().as_secs_f64(),
            modes,
            files_loaded: load.files_loaded(),
            files_failed: load.files_failed(),
            records_inserted: load.records_inserted(),
            records_reaped: reaped.records_deleted(),
        })
    }

    /// Audit-only; any failure here is logged and swallowed.
    async fn record_site_metadata(&self, fetcher: &MetadataFetcher, page: &SourcePage) {
        match fetcher.fetch_site_timestamps().await {
            Ok(ts) => {
                metadata::log_site_metadata(
                    &self.store,
                    page.version,
                    ts.site_last_updated,
                    ts.metadata_modified,
                )
                .await
            }
            Err(e) => warn!(error = %e, "Site metadata unavailable, continuing"),
        }
    }

    async fn stage_archive(&self, download_url: &str, modes: &TransportTypeMap) -> Result<()> {
        let archive_path = self.config.archive_path();

        if self.config.flags.skip_download {
            warn!(path = %archive_path.display(), "[TEST] Skipping download, reusing archive");
            if !archive_path.is_file() {
                return Err(IngestError::Download(format!(
                    "SKIP_DOWNLOAD set but no archive at {}",
                    archive_path.display()
                )));
            }
        } else {
            archive::download_archive(download_url, &archive_path, self.config.download_timeout)
                .await?;
        }

        let destination = self.config.extracted_dir();
        let modes = modes.clone();
        let keep_files = self.config.keep_files.clone();

        tokio::task::spawn_blocking(move || {
            archive::extract_selected(&archive_path, &destination, &modes, &keep_files)
        })
        .await
        .map_err(|e| IngestError::Io(std::io::Error::other(format!("Extraction task failed: {e}"))))??;

        Ok(())
    }

    fn cleanup_staging(&self) {
        let archive_path = self.config.archive_path();
        if !(self.config.flags.skip_download && archive_path.is_file()) {
            remove_path(&archive_path);
        }
        remove_path(&self.config.extracted_dir());
    }
}

fn remove_path(path: &Path) {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else if path.is_file() {
        std::fs::remove_file(path)
    } else {
        return;
    };

    match result {
        Ok(()) => info!(path = %path.display(), "Deleted staging path"),
        Err(e) => warn!(path = %path.display(), error = %e, "Could not delete staging path"),
    }
}
