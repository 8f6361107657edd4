// Destination store
//
// SQLite behind sqlx. Each destination collection is a table of JSON documents with an indexed
// copy of the document's `version`. Two bookkeeping tables sit beside them: `misc` holds the
// version marker and `site_metadata` is the audit log of upstream timestamps.

use std::str::FromStr;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use crate::error::{IngestError, Result};

/// Fixed id of the version marker row in `misc`.
pub const VERSION_MARKER_ID: &str = "gtfs_version";

const MISC_TABLE: &str = "misc";
const SITE_METADATA_TABLE: &str = "site_metadata";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// One row of the upstream timestamp audit trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteMetadataLogEntry {
    pub gtfs_last_updated: NaiveDate,
    pub site_last_updated: NaiveDateTime,
    pub metadata_modified: NaiveDateTime,
}

/// Row-level result of one bulk insert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkInsertResult {
    pub inserted: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct Store {
    pub(crate) pool: SqlitePool,
}

impl Store {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| IngestError::Connectivity(format!("Invalid database URL: {e}")))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(|e| IngestError::Connectivity(e.to_string()))?;

        let store = Store { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database, one connection so every query sees the same data.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let store = Store { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS misc (
                id TEXT PRIMARY KEY,
                version TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS site_metadata (
                gtfs_last_updated TEXT NOT NULL,
                site_last_updated TEXT NOT NULL,
                metadata_modified TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                PRIMARY KEY (gtfs_last_updated, site_last_updated, metadata_modified)
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Connectivity check run before any pipeline stage.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| IngestError::Connectivity(e.to_string()))
    }

    /// Close every pooled connection; later queries fail.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ------------------------------------------------------------------------
    // Version marker
    // ------------------------------------------------------------------------

    pub async fn get_version(&self) -> Result<Option<NaiveDate>> {
        let row = sqlx::query("SELECT version FROM misc WHERE id = ?")
            .bind(VERSION_MARKER_ID)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let raw: String = row.try_get("version")?;
        match NaiveDate::parse_from_str(&raw, "%Y-%m-%d") {
            Ok(date) => Ok(Some(date)),
            Err(e) => {
                warn!(stored = %raw, error = %e, "Unreadable version marker, treating as absent");
                Ok(None)
            }
        }
    }

    pub async fn set_version(&self, version: NaiveDate) -> Result<()> {
        sqlx::query(
            "INSERT INTO misc (id, version) VALUES (?, ?)
             ON CONFLICT(id) DO UPDATE SET version = excluded.version",
        )
        .bind(VERSION_MARKER_ID)
        .bind(version.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Site metadata audit log
    // ------------------------------------------------------------------------

    /// Upsert keyed on all three timestamps; only `last_seen` changes on a repeat.
    pub async fn upsert_site_metadata(&self, entry: &SiteMetadataLogEntry) -> Result<()> {
        let now = chrono::Utc::now().naive_utc();

        sqlx::query(
            "INSERT INTO site_metadata
                (gtfs_last_updated, site_last_updated, metadata_modified, last_seen)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(gtfs_last_updated, site_last_updated, metadata_modified)
             DO UPDATE SET last_seen = excluded.last_seen",
        )
        .bind(entry.gtfs_last_updated.to_string())
        .bind(entry.site_last_updated.format(TIMESTAMP_FORMAT).to_string())
        .bind(entry.metadata_modified.format(TIMESTAMP_FORMAT).to_string())
        .bind(now.format(TIMESTAMP_FORMAT).to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn count_site_metadata(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM site_metadata")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    // ------------------------------------------------------------------------
    // Destination collections
    // ------------------------------------------------------------------------

    pub async fn ensure_collection(&self, collection: &str) -> Result<()> {
        let table = quote_ident(collection);
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                version TEXT NOT NULL,
                document TEXT NOT NULL
            )"
        ))
        .execute(&self.pool)
        .await?;

        let index = quote_ident(&format!("{collection}_version_idx"));
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {index} ON {table} (version)"
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Replace the documents of `version` in `collection` within one transaction. Rows already
    /// stored for that version are deleted first, so loading the same file twice leaves one
    /// copy. A rejected row is counted and skipped; the rest of the batch still goes in.
    pub async fn insert_documents(
        &self,
        collection: &str,
        version: NaiveDate,
        documents: &[Value],
    ) -> Result<BulkInsertResult> {
        self.ensure_collection(collection).await?;

        let sql = format!(
            "INSERT INTO {} (version, document) VALUES (?, ?)",
            quote_ident(collection)
        );
        let version = version.to_string();
        let mut result = BulkInsertResult::default();

        let mut tx = self.pool.begin().await?;
        let replaced = sqlx::query(&format!(
            "DELETE FROM {} WHERE version = ?",
            quote_ident(collection)
        ))
        .bind(&version)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if replaced > 0 {
            debug!(collection, replaced, version = %version, "Replacing documents of same version");
        }

        for document in documents {
            let body = serde_json::to_string(document)?;
            match sqlx::query(&sql)
                .bind(&version)
                .bind(body)
                .execute(&mut *tx)
                .await
            {
                Ok(_) => result.inserted += 1,
                Err(e) => {
                    if result.failed == 0 {
                        warn!(collection, error = %e, "Record rejected");
                    }
                    result.failed += 1;
                }
            }
        }
        tx.commit().await?;

        Ok(result)
    }

    /// Every destination collection currently in the store.
    pub async fn list_collections(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name NOT IN (?, ?)
             ORDER BY name",
        )
        .bind(MISC_TABLE)
        .bind(SITE_METADATA_TABLE)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("name").map_err(IngestError::from))
            .collect()
    }

    /// Delete every document whose version is strictly older than `cutoff`.
    pub async fn delete_older_than(&self, collection: &str, cutoff: NaiveDate) -> Result<u64> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE version < ?",
            quote_ident(collection)
        ))
        .bind(cutoff.to_string())
        .execute(&self.pool)
        .await?;

        debug!(collection, deleted = result.rows_affected(), "Deleted outdated records");
        Ok(result.rows_affected())
    }

    pub async fn count_documents(&self, collection: &str) -> Result<i64> {
        let row = sqlx::query(&format!(
            "SELECT COUNT(*) AS n FROM {}",
            quote_ident(collection)
        ))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("n")?)
    }

    /// Documents of one collection, optionally restricted to `field == value`.
    pub async fn find_documents(
        &self,
        collection: &str,
        filter: Option<(&str, &str)>,
    ) -> Result<Vec<Value>> {
        let table = quote_ident(collection);
        let rows = match filter {
            Some((field, value)) => {
                sqlx::query(&format!(
                    "SELECT document FROM {table}
                     WHERE CAST(json_extract(document, ?) AS TEXT) = ? ORDER BY id"
                ))
                .bind(json_path(field))
                .bind(value)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!("SELECT document FROM {table} ORDER BY id"))
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter()
            .map(|row| -> Result<Value> {
                let body: String = row.try_get("document")?;
                Ok(serde_json::from_str(&body)?)
            })
            .collect()
    }

    /// Distinct values of `field` among documents where `filter_field == filter_value`.
    pub async fn distinct_values(
        &self,
        collection: &str,
        field: &str,
        filter_field: &str,
        filter_value: &str,
    ) -> Result<Vec<String>> {
        let rows = sqlx::query(&format!(
            "SELECT DISTINCT CAST(json_extract(document, ?) AS TEXT) AS value FROM {}
             WHERE CAST(json_extract(document, ?) AS TEXT) = ? AND json_extract(document, ?) IS NOT NULL
             ORDER BY value",
            quote_ident(collection)
        ))
        .bind(json_path(field))
        .bind(json_path(filter_field))
        .bind(filter_value)
        .bind(json_path(field))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("value").map_err(IngestError::from))
            .collect()
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn json_path(field: &str) -> String {
    format!("$.\"{}\"", field.replace('"', ""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn test_version_marker_roundtrip() {
        let store = Store::in_memory().await.unwrap();
        assert_eq!(store.get_version().await.unwrap(), None);

        store.set_version(date(2025, 9, 19)).await.unwrap();
        store.set_version(date(2025, 10, 1)).await.unwrap();
        assert_eq!(store.get_version().await.unwrap(), Some(date(2025, 10, 1)));
    }

    #[tokio::test]
    async fn test_site_metadata_upsert_is_keyed_on_triple() {
        let store = Store::in_memory().await.unwrap();
        let entry = SiteMetadataLogEntry {
            gtfs_last_updated: date(2025, 9, 19),
            site_last_updated: date(2025, 9, 19).and_hms_opt(1, 2, 3).unwrap(),
            metadata_modified: date(2025, 9, 20).and_hms_opt(4, 5, 6).unwrap(),
        };

        store.upsert_site_metadata(&entry).await.unwrap();
        store.upsert_site_metadata(&entry).await.unwrap();
        assert_eq!(store.count_site_metadata().await.unwrap(), 1);

        let changed = SiteMetadataLogEntry {
            metadata_modified: date(2025, 9, 21).and_hms_opt(0, 0, 0).unwrap(),
            ..entry
        };
        store.upsert_site_metadata(&changed).await.unwrap();
        assert_eq!(store.count_site_metadata().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_collections_exclude_bookkeeping_tables() {
        let store = Store::in_memory().await.unwrap();
        store
            .insert_documents("metropolitan_tram_routes", date(2025, 9, 19), &[json!({"a": 1})])
            .await
            .unwrap();

        assert_eq!(
            store.list_collections().await.unwrap(),
            vec!["metropolitan_tram_routes".to_string()]
        );
    }

    #[tokio::test]
    async fn test_delete_older_than_is_strict() {
        let store = Store::in_memory().await.unwrap();
        let c = "metropolitan_tram_trips";
        store.insert_documents(c, date(2025, 1, 1), &[json!({"v": 1})]).await.unwrap();
        store.insert_documents(c, date(2025, 9, 19), &[json!({"v": 2})]).await.unwrap();

        let deleted = store.delete_older_than(c, date(2025, 9, 19)).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.count_documents(c).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_find_and_distinct() {
        let store = Store::in_memory().await.unwrap();
        let c = "metropolitan_tram_trips";
        store
            .insert_documents(
                c,
                date(2025, 9, 19),
                &[
                    json!({"route_id": "3-1", "shape_id": "s1"}),
                    json!({"route_id": "3-1", "shape_id": "s2"}),
                    json!({"route_id": "3-1", "shape_id": "s1"}),
                    json!({"route_id": "3-2", "shape_id": "s3"}),
                ],
            )
            .await
            .unwrap();

        let found = store.find_documents(c, Some(("route_id", "3-1"))).await.unwrap();
        assert_eq!(found.len(), 3);
        assert_eq!(
            store.distinct_values(c, "shape_id", "route_id", "3-1").await.unwrap(),
            vec!["s1".to_string(), "s2".to_string()]
        );
    }

    #[tokio::test]
    async fn test_insert_replaces_same_version_only() {
        let store = Store::in_memory().await.unwrap();
        let c = "metropolitan_tram_routes";
        store.insert_documents(c, date(2025, 1, 1), &[json!({"v": 0})]).await.unwrap();

        let batch = [json!({"v": 1}), json!({"v": 2})];
        store.insert_documents(c, date(2025, 9, 19), &batch).await.unwrap();
        let again = store.insert_documents(c, date(2025, 9, 19), &batch).await.unwrap();

        assert_eq!(again.inserted, 2);
        assert_eq!(store.count_documents(c).await.unwrap(), 3);
        assert_eq!(store.delete_older_than(c, date(2025, 9, 19)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_closed_store_fails_ping() {
        let store = Store::in_memory().await.unwrap();
        store.close().await;
        assert!(matches!(store.ping().await, Err(IngestError::Connectivity(_))));
    }

    #[test]
    fn test_quote_ident_escapes() {
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }
}
