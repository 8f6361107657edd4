// Stale-data reaper.
//
// Only collections of a currently selected mode whose name contains a currently retained file
// type are touched. Collections for modes or files dropped from the configuration keep whatever
// they had.

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::loader::collection_name;
use crate::store::Store;
use crate::transport_types::TransportTypeMap;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReapSummary {
    pub skipped: bool,
    pub collections: Vec<(String, u64)>,
}

impl ReapSummary {
    pub fn records_deleted(&self) -> u64 {
        self.collections.iter().map(|(_, n)| n).sum()
    }
}

/// Collections the reaper is allowed to touch.
pub fn retained_collections(
    all: &[String],
    modes: &TransportTypeMap,
    file_types: &[String],
) -> Vec<String> {
    let prefixes: Vec<String> = modes.names().map(|m| collection_name(m, "")).collect();

    all.iter()
        .filter(|name| file_types.iter().any(|t| name.contains(t.as_str())))
        .filter(|name| prefixes.iter().any(|p| name.starts_with(p.as_str())))
        .cloned()
        .collect()
}

/// Delete every record older than `cutoff` from the retained collections. A collection that
/// cannot be reaped is logged and skipped.
pub async fn reap(
    store: &Store,
    cutoff: NaiveDate,
    modes: &TransportTypeMap,
    file_types: &[String],
    retain_outdated_data: bool,
) -> Result<ReapSummary> {
    if retain_outdated_data {
        warn!("[TEST] Keeping outdated data");
        return Ok(ReapSummary {
            skipped: true,
            collections: Vec::new(),
        });
    }

    let all = store.list_collections().await?;
    let targets = retained_collections(&all, modes, file_types);
    let mut summary = ReapSummary::default();

    for collection in targets {
        let deleted = match store.delete_older_than(&collection, cutoff).await {
            Ok(deleted) => deleted,
            Err(e) => {
                error!(collection = %collection, error = %e, "Could not reap collection, continuing");
                store.ping().await?;
                continue;
            }
        };
        if deleted > 0 {
            info!(collection = %collection, deleted, "Deleted outdated records");
        } else {
            info!(collection = %collection, "No outdated records");
        }
        summary.collections.push((collection, deleted));
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn types(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn trams() -> TransportTypeMap {
        [("3", "Metropolitan Tram")].into_iter().collect()
    }

    #[test]
    fn test_retained_collections_filter() {
        let all = types(&[
            "metropolitan_tram_routes",
            "metropolitan_tram_stops",
            "metropolitan_tram_trips",
            "metro_bus_trips",
        ]);
        assert_eq!(
            retained_collections(&all, &trams(), &types(&["routes", "trips"])),
            types(&["metropolitan_tram_routes", "metropolitan_tram_trips"])
        );

        let both: TransportTypeMap =
            [("3", "Metropolitan Tram"), ("4", "Metro Bus")].into_iter().collect();
        assert_eq!(
            retained_collections(&all, &both, &types(&["trips"])),
            types(&["metropolitan_tram_trips", "metro_bus_trips"])
        );
    }

    #[tokio::test]
    async fn test_reap_only_retained_and_older() {
        let store = Store::in_memory().await.unwrap();
        let (v1, v2) = (date(2025, 1, 1), date(2025, 9, 19));

        for c in ["metropolitan_tram_routes", "metropolitan_tram_stops"] {
            store.insert_documents(c, v1, &[json!({"a": 1}), json!({"a": 2})]).await.unwrap();
        }
        store
            .insert_documents("metropolitan_tram_routes", v2, &[json!({"a": 3})])
            .await
            .unwrap();

        let summary = reap(&store, v2, &trams(), &types(&["routes"]), false).await.unwrap();
        assert_eq!(summary.records_deleted(), 2);

        let left = store.find_documents("metropolitan_tram_routes", None).await.unwrap();
        assert_eq!(left, vec![json!({"a": 3})]);
        assert_eq!(store.count_documents("metropolitan_tram_stops").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unreapable_collection_is_skipped() {
        let store = Store::in_memory().await.unwrap();
        sqlx::query("CREATE TABLE metropolitan_tram_routes (legacy TEXT)")
            .execute(&store.pool)
            .await
            .unwrap();
        store
            .insert_documents("metropolitan_tram_trips", date(2025, 1, 1), &[json!({})])
            .await
            .unwrap();

        let summary = reap(&store, date(2025, 9, 19), &trams(), &types(&["routes", "trips"]), false)
            .await
            .unwrap();
        assert_eq!(summary.collections, vec![("metropolitan_tram_trips".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_retain_flag_skips() {
        let store = Store::in_memory().await.unwrap();
        store
            .insert_documents("metropolitan_tram_routes", date(2020, 1, 1), &[json!({})])
            .await
            .unwrap();

        let summary = reap(&store, date(2025, 1, 1), &trams(), &types(&["routes"]), true).await.unwrap();
        assert!(summary.skipped);
        assert_eq!(store.count_documents("metropolitan_tram_routes").await.unwrap(), 1);
    }
}
