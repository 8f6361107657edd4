// Archive download and nested extraction
//
// The published archive is a zip of zips: `<mode-id>/<anything>.zip` at the outer level, each
// holding flat GTFS text files. Extraction is the same selective walk applied twice, once to
// the outer archive on disk and once to each selected inner archive in memory.

use std::fs::{self, File};
use std::io::{Cursor, Read, Seek};
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use zip::ZipArchive;

use crate::error::{IngestError, Result};
use crate::transport_types::TransportTypeMap;

pub const INNER_ARCHIVE_SUFFIX: &str = ".zip";

const MAX_PREALLOCATION: u64 = 64 << 20;

/// Stream the archive at `url` to `destination` chunk by chunk.
pub async fn download_archive(url: &str, destination: &Path, timeout: Duration) -> Result<u64> {
    info!(url, path = %destination.display(), "Downloading dataset archive");

    let client = Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| IngestError::Download(format!("Failed to create HTTP client: {e}")))?;

    let mut response = client
        .get(url)
        .send()
        .await
        .map_err(|e| IngestError::Download(format!("Request failed: {e}")))?;

    if !response.status().is_success() {
        return Err(IngestError::Download(format!(
            "Download failed with status: {}",
            response.status()
        )));
    }

    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(destination).await?;
    let mut written: u64 = 0;

    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| IngestError::Download(format!("Transfer interrupted: {e}")))?
    {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    info!(kb = written / 1024, "Downloaded archive");
    Ok(written)
}

/// Read every entry whose name satisfies `select` and hand `(name, bytes)` to `visit`.
/// Returns how many entries were visited.
pub fn visit_entries<R, P, V>(reader: R, select: P, mut visit: V) -> Result<usize>
where
    R: Read + Seek,
    P: Fn(&str) -> bool,
    V: FnMut(&str, Vec<u8>) -> Result<()>,
{
    let mut archive = ZipArchive::new(reader)?;
    let mut visited = 0;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        if entry.is_dir() {
            continue;
        }

        let name = entry.name().to_string();
        if !select(&name) {
            continue;
        }

        // The header size is untrusted; cap the up-front reservation.
        let reserve = entry.size().min(MAX_PREALLOCATION) as usize;
        let mut bytes = Vec::with_capacity(reserve);
        entry.read_to_end(&mut bytes)?;
        drop(entry);

        visit(&name, bytes)?;
        visited += 1;
    }

    Ok(visited)
}

/// Top-level path segment of an outer entry, i.e. its mode id.
pub fn mode_id_of(entry_name: &str) -> &str {
    entry_name.split('/').next().unwrap_or(entry_name)
}

/// Extract the allow-listed inner files of every selected mode into
/// `destination/<mode-id>/<filename>`. Returns the staged paths.
pub fn extract_selected(
    archive_path: &Path,
    destination: &Path,
    modes: &TransportTypeMap,
    keep_files: &[String],
) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(destination)?;
    let outer = File::open(archive_path)?;
    let mut staged = Vec::new();

    let select_outer = |name: &str| {
        modes.contains(mode_id_of(name)) && name.ends_with(INNER_ARCHIVE_SUFFIX)
    };

    visit_entries(outer, select_outer, |outer_name, inner_bytes| {
        let mode_id = mode_id_of(outer_name);
        let mode_dir = destination.join(mode_id);
        fs::create_dir_all(&mode_dir)?;

        let select_inner = |name: &str| keep_files.iter().any(|keep| keep == name);

        visit_entries(Cursor::new(inner_bytes), select_inner, |file_name, data| {
            let out_path = mode_dir.join(file_name);
            fs::write(&out_path, data)?;
            debug!(file = file_name, from = outer_name, path = %out_path.display(), "Staged file");
            staged.push(out_path);
            Ok(())
        })?;
        Ok(())
    })?;

    info!(files = staged.len(), modes = modes.len(), "Extraction finished");
    Ok(staged)
}


#[cfg(test)]
mod tests {
    use super::test_archives::zip_bytes;
    use super::*;

    fn inner(tag: &str) -> Vec<u8> {
        let routes = format!("route_id,route_short_name\n{tag}-1,1\n");
        let trips = format!("route_id,trip_id\n{tag}-1,t1\n");
        zip_bytes(&[
            ("routes.txt", routes.as_bytes()),
            ("trips.txt", trips.as_bytes()),
            ("stops.txt", b"stop_id\ns1\n"),
        ])
    }

    fn outer() -> Vec<u8> {
        let (one, two, three) = (inner("1"), inner("2"), inner("3"));
        zip_bytes(&[
            ("1/google_transit.zip", &one),
            ("2/google_transit.zip", &two),
            ("2/readme.txt", b"not an archive"),
            ("3/google_transit.zip", &three),
        ])
    }

    #[test]
    fn test_mode_id_of() {
        assert_eq!(mode_id_of("2/google_transit.zip"), "2");
        assert_eq!(mode_id_of("readme.txt"), "readme.txt");
    }

    #[test]
    fn test_visit_entries_filters() {
        let bytes = outer();
        let mut names = Vec::new();
        let visited = visit_entries(
            Cursor::new(bytes),
            |name| name.ends_with(".zip"),
            |name, _| {
                names.push(name.to_string());
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(visited, 3);
        assert_eq!(names[0], "1/google_transit.zip");
    }

    #[test]
    fn test_extraction_scoped_to_modes_and_keep_list() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("gtfs.zip");
        std::fs::write(&archive_path, outer()).unwrap();
        let staging = dir.path().join("extracted");

        let modes: TransportTypeMap = [("2", "Tram")].into_iter().collect();
        let keep = vec!["routes.txt".to_string(), "trips.txt".to_string()];

        let staged = extract_selected(&archive_path, &staging, &modes, &keep).unwrap();
        assert_eq!(staged.len(), 2);

        assert!(staging.join("2/routes.txt").is_file());
        assert!(staging.join("2/trips.txt").is_file());
        assert!(!staging.join("2/stops.txt").exists());
        assert!(!staging.join("2/readme.txt").exists());
        assert!(!staging.join("1").exists());
        assert!(!staging.join("3").exists());

        let routes = std::fs::read_to_string(staging.join("2/routes.txt")).unwrap();
        assert!(routes.contains("2-1"));
    }

    #[test]
    fn test_extraction_is_rerunnable() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("gtfs.zip");
        std::fs::write(&archive_path, outer()).unwrap();
        let staging = dir.path().join("extracted");
        let modes: TransportTypeMap = [("3", "Metropolitan Tram")].into_iter().collect();
        let keep = vec!["routes.txt".to_string()];

        extract_selected(&archive_path, &staging, &modes, &keep).unwrap();
        let again = extract_selected(&archive_path, &staging, &modes, &keep).unwrap();
        assert_eq!(again, vec![staging.join("3/routes.txt")]);
    }

    #[test]
    fn test_oversized_header_does_not_drive_allocation() {
        let mut bytes = zip_bytes(&[("routes.txt", b"route_id\n3-1\n")]);

        // Claim an uncompressed size of ~2 GiB in the central directory.
        let central = bytes
            .windows(4)
            .position(|w| w == [0x50, 0x4b, 0x01, 0x02])
            .unwrap();
        bytes[central + 24..central + 28].copy_from_slice(&0x7fff_fff0u32.to_le_bytes());

        let mut seen = Vec::new();
        visit_entries(Cursor::new(bytes), |_| true, |_, data| {
            seen = data;
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, b"route_id\n3-1\n");
    }

    #[test]
    fn test_corrupt_archive_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("gtfs.zip");
        std::fs::write(&archive_path, b"definitely not a zip").unwrap();
        let modes: TransportTypeMap = [("3", "Tram")].into_iter().collect();

        let err = extract_selected(&archive_path, &dir.path().join("x"), &modes, &[]).unwrap_err();
        assert!(matches!(err, IngestError::Archive(_)));
    }
}
