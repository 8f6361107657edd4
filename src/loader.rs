// Staged-file loader.
//
// Every `<staging>/<mode-id>/<file>.txt` becomes one bulk insert into `<mode_name>_<file_type>`.
// A file that cannot be mapped or written is logged and skipped; the rest still load.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::{Map, Number, Value};
use tracing::{error, info, warn};

use crate::error::{IngestError, Result};
use crate::store::Store;
use crate::transport_types::TransportTypeMap;

/// Extension of the tabular files inside the dataset.
pub const TABULAR_EXTENSION: &str = "txt";

/// Field added to every record.
pub const VERSION_FIELD: &str = "version";

/// Cell values read as "no value".
const NULL_SENTINELS: &[&str] = &["", "NA", "N/A", "NaN", "nan", "NULL", "null"];

/// Inputs shared by every file of one load.
#[derive(Debug, Clone)]
pub struct LoadContext {
    pub version: NaiveDate,
    pub modes: TransportTypeMap,
    /// Recognised file types, e.g. `routes`, `trips`.
    pub file_types: Vec<String>,
    /// Columns always stored as text, whatever the cells look like.
    pub text_columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileLoadReport {
    pub file: String,
    pub collection: Option<String>,
    pub inserted: usize,
    pub failed: usize,
    pub error: Option<String>,
}

impl FileLoadReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadSummary {
    pub files: Vec<FileLoadReport>,
}

impl LoadSummary {
    pub fn files_loaded(&self) -> usize {
        self.files.iter().filter(|f| f.succeeded()).count()
    }

    pub fn files_failed(&self) -> usize {
        self.files.len() - self.files_loaded()
    }

    pub fn records_inserted(&self) -> usize {
        self.files.iter().map(|f| f.inserted).sum()
    }
}

/// `<mode name lower-cased, spaces as underscores>_<file type>`.
pub fn collection_name(mode_name: &str, file_type: &str) -> String {
    format!("{}_{}", mode_name.trim().to_lowercase().replace(' ', "_"), file_type)
}

/// Work out `(file_type, mode_name)` from `<mode-id>/<file_type>.txt`.
pub fn resolve_destination(path: &Path, ctx: &LoadContext) -> Result<(String, String)> {
    let unresolved = |reason: String| IngestError::UnresolvedType {
        path: path.display().to_string(),
        reason,
    };

    let file_type = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| unresolved("file name is not valid UTF-8".into()))?;
    if !ctx.file_types.iter().any(|t| t == file_type) {
        return Err(unresolved(format!("unrecognised file type '{file_type}'")));
    }

    let mode_id = path
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|s| s.to_str())
        .ok_or_else(|| unresolved("no mode directory".into()))?;
    let mode_name = ctx
        .modes
        .get(mode_id)
        .ok_or_else(|| unresolved(format!("mode id '{mode_id}' is not selected")))?;

    Ok((file_type.to_string(), mode_name.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Integer,
    Float,
    Text,
}

fn is_null(cell: &str) -> bool {
    NULL_SENTINELS.contains(&cell.trim())
}

fn infer_column<'a>(cells: impl Iterator<Item = &'a str>) -> ColumnKind {
    let mut kind = ColumnKind::Integer;
    for cell in cells.map(str::trim).filter(|c| !NULL_SENTINELS.contains(c)) {
        if kind == ColumnKind::Integer && cell.parse::<i64>().is_ok() {
            continue;
        }
        match cell.parse::<f64>() {
            Ok(f) if f.is_finite() => kind = ColumnKind::Float,
            _ => return ColumnKind::Text,
        }
    }
    kind
}

fn cell_value(cell: &str, kind: ColumnKind) -> Value {
    if is_null(cell) {
        return Value::Null;
    }
    let trimmed = cell.trim();
    match kind {
        ColumnKind::Integer => trimmed
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(cell.to_string())),
        ColumnKind::Float => trimmed
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(cell.to_string())),
        ColumnKind::Text => Value::String(cell.to_string()),
    }
}

/// Parse a staged CSV into JSON records tagged with `version`.
///
/// Column types are inferred over the whole file, so one stray non-numeric cell keeps the
/// column as text. Missing values become `null`.
pub fn parse_records(path: &Path, text_columns: &[String], version: NaiveDate) -> Result<Vec<Value>> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
        .collect();

    let rows = reader
        .records()
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let kinds: Vec<ColumnKind> = headers
        .iter()
        .enumerate()
        .map(|(i, header)| {
            if text_columns.iter().any(|c| c == header) {
                ColumnKind::Text
            } else {
                infer_column(rows.iter().map(|r| r.get(i).unwrap_or("")))
            }
        })
        .collect();

    let version = Value::String(version.to_string());
    let records = rows
        .iter()
        .map(|row| {
            let mut record = Map::with_capacity(headers.len() + 1);
            for (i, header) in headers.iter().enumerate() {
                let value = row
                    .get(i)
                    .map(|cell| cell_value(cell, kinds[i]))
                    .unwrap_or(Value::Null);
                record.insert(header.clone(), value);
            }
            record.insert(VERSION_FIELD.to_string(), version.clone());
            Value::Object(record)
        })
        .collect();

    Ok(records)
}

/// All tabular files below `root`, sorted for a stable load order.
pub fn staged_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    if !root.exists() {
        return Ok(found);
    }

    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().and_then(|e| e.to_str()) == Some(TABULAR_EXTENSION) {
                found.push(path);
            }
        }
    }

    found.sort();
    Ok(found)
}

async fn load_file(store: &Store, path: &Path, ctx: &LoadContext) -> Result<FileLoadReport> {
    let (file_type, mode_name) = resolve_destination(path, ctx)?;
    let collection = collection_name(&mode_name, &file_type);

    let owned_path = path.to_path_buf();
    let text_columns = ctx.text_columns.clone();
    let version = ctx.version;
    let records = tokio::task::spawn_blocking(move || {
        parse_records(&owned_path, &text_columns, version)
    })
    .await
    .map_err(|e| IngestError::Io(std::io::Error::other(format!("Parser task failed: {e}"))))??;

    info!(collection = %collection, records = records.len(), "Inserting records");
    let started = std::time::Instant::now();
    let total = records.len();
    let result = match store.insert_documents(&collection, version, &records).await {
        Ok(result) => result,
        Err(IngestError::Store(e)) => {
            return Err(IngestError::BulkWrite {
                collection,
                inserted: 0,
                failed: total,
                total,
                reason: e.to_string(),
            });
        }
        Err(e) => return Err(e),
    };

    if result.failed > 0 {
        return Err(IngestError::BulkWrite {
            collection,
            inserted: result.inserted,
            failed: result.failed,
            total,
            reason: "rows rejected".into(),
        });
    }

    info!(
        collection = %collection,
        inserted = result.inserted,
        seconds = started.elapsed().as_secs(),
        "Loaded file"
    );

    Ok(FileLoadReport {
        file: path.display().to_string(),
        collection: Some(collection),
        inserted: result.inserted,
        failed: 0,
        error: None,
    })
}

/// Load every staged file. Per-file failures are recorded in the summary. A failed batch is
/// followed by a connectivity check, and only a lost store aborts the load.
pub async fn load_staged(store: &Store, root: &Path, ctx: &LoadContext) -> Result<LoadSummary> {
    let mut summary = LoadSummary::default();

    for path in staged_files(root)? {
        match load_file(store, &path, ctx).await {
            Ok(report) => {
                if let Err(e) = fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "Could not delete loaded file");
                }
                summary.files.push(report);
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                error!(path = %path.display(), error = %e, "File load failed, continuing");
                let (collection, inserted, failed) = match &e {
                    IngestError::BulkWrite {
                        collection,
                        inserted,
                        failed,
                        ..
                    } => (Some(collection.clone()), *inserted, *failed),
                    _ => (None, 0, 0),
                };
                summary.files.push(FileLoadReport {
                    file: path.display().to_string(),
                    collection,
                    inserted,
                    failed,
                    error: Some(e.to_string()),
                });

                if matches!(e, IngestError::BulkWrite { .. }) {
                    store.ping().await?;
                }
            }
        }
    }

    info!(
        loaded = summary.files_loaded(),
        failed = summary.files_failed(),
        records = summary.records_inserted(),
        "Load finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 9, 19).unwrap()
    }

    fn context() -> LoadContext {
        LoadContext {
            version: version(),
            modes: [("3", "Metropolitan Tram")].into_iter().collect(),
            file_types: vec!["routes".into(), "trips".into(), "shapes".into()],
            text_columns: vec!["route_short_name".into()],
        }
    }

    fn write(dir: &Path, rel: &str, body: &str) -> PathBuf {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_collection_name() {
        assert_eq!(collection_name("Metropolitan Tram", "routes"), "metropolitan_tram_routes");
        assert_eq!(collection_name("Metro Bus", "shapes"), "metro_bus_shapes");
    }

    #[test]
    fn test_resolve_destination() {
        let ctx = context();
        let (file_type, mode) = resolve_destination(Path::new("/s/3/routes.txt"), &ctx).unwrap();
        assert_eq!((file_type.as_str(), mode.as_str()), ("routes", "Metropolitan Tram"));

        let err = resolve_destination(Path::new("/s/9/routes.txt"), &ctx).unwrap_err();
        assert!(matches!(err, IngestError::UnresolvedType { .. }));

        let err = resolve_destination(Path::new("/s/3/stops.txt"), &ctx).unwrap_err();
        assert!(matches!(err, IngestError::UnresolvedType { .. }));
    }

    #[test]
    fn test_parse_records_types_and_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "3/routes.txt",
            "route_id,route_short_name,route_type,route_color,sort\n\
             3-1,1,0,,1.5\n\
             3-96,96,0,FF0000,NaN\n",
        );

        let records = parse_records(&path, &["route_short_name".into()], version()).unwrap();
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first["route_id"], Value::String("3-1".into()));
        assert_eq!(first["route_short_name"], Value::String("1".into()));
        assert_eq!(first["route_type"], Value::from(0));
        assert_eq!(first["route_color"], Value::Null);
        assert_eq!(first["sort"], Value::from(1.5));
        assert_eq!(first["version"], Value::String("2025-09-19".into()));

        let second = &records[1];
        assert_eq!(second["route_short_name"], Value::String("96".into()));
        assert_eq!(second["route_color"], Value::String("FF0000".into()));
        assert_eq!(second["sort"], Value::Null);
    }

    #[test]
    fn test_mixed_column_stays_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "3/trips.txt", "trip_id,block\nt1,12\nt2,12a\n");

        let records = parse_records(&path, &[], version()).unwrap();
        assert_eq!(records[0]["block"], Value::String("12".into()));
        assert_eq!(records[1]["block"], Value::String("12a".into()));
    }

    #[test]
    fn test_staged_files_only_tabular() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "3/routes.txt", "a\n1\n");
        write(dir.path(), "3/notes.md", "x");
        write(dir.path(), "2/trips.txt", "a\n1\n");

        let files = staged_files(dir.path()).unwrap();
        assert_eq!(files, vec![dir.path().join("2/trips.txt"), dir.path().join("3/routes.txt")]);
    }

    #[tokio::test]
    async fn test_load_tolerates_unresolved_files() {
        let store = Store::in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let routes = write(dir.path(), "3/routes.txt", "route_id,route_short_name\n3-1,1\n3-2,2\n");
        let orphan = write(dir.path(), "7/routes.txt", "route_id\nx\n");

        let summary = load_staged(&store, dir.path(), &context()).await.unwrap();
        assert_eq!(summary.files_loaded(), 1);
        assert_eq!(summary.files_failed(), 1);
        assert_eq!(summary.records_inserted(), 2);

        assert!(!routes.exists());
        assert!(orphan.exists());

        let docs = store.find_documents("metropolitan_tram_routes", None).await.unwrap();
        assert_eq!(docs.len(), 2);
        assert!(docs.iter().all(|d| d["version"] == "2025-09-19"));
        assert!(docs.iter().all(|d| d["route_short_name"].is_string()));
    }

    #[tokio::test]
    async fn test_failed_batch_does_not_block_siblings() {
        let store = Store::in_memory().await.unwrap();
        sqlx::query("CREATE TABLE metropolitan_tram_routes (legacy TEXT)")
            .execute(&store.pool)
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let routes = write(dir.path(), "3/routes.txt", "route_id,route_short_name\n3-1,1\n3-2,2\n");
        write(dir.path(), "3/trips.txt", "route_id,trip_id\n3-1,t1\n");

        let summary = load_staged(&store, dir.path(), &context()).await.unwrap();
        assert_eq!(summary.files_loaded(), 1);
        assert_eq!(summary.files_failed(), 1);
        assert_eq!(summary.records_inserted(), 1);

        let failed = summary.files.iter().find(|f| !f.succeeded()).unwrap();
        assert_eq!(failed.collection.as_deref(), Some("metropolitan_tram_routes"));
        assert_eq!(failed.failed, 2);
        assert!(routes.exists());

        assert_eq!(store.count_documents("metropolitan_tram_trips").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reload_of_same_version_replaces_rows() {
        let store = Store::in_memory().await.unwrap();
        let body = "route_id,route_short_name\n3-1,1\n3-2,2\n";

        for _ in 0..2 {
            let dir = tempfile::tempdir().unwrap();
            write(dir.path(), "3/routes.txt", body);
            let summary = load_staged(&store, dir.path(), &context()).await.unwrap();
            assert_eq!(summary.records_inserted(), 2);
        }

        assert_eq!(store.count_documents("metropolitan_tram_routes").await.unwrap(), 2);
    }
}
