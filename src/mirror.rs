// Mirroring of fetched artifacts (currently the dataset page) to external storage.

use std::path::PathBuf;

use tracing::info;

use crate::error::Result;

pub trait ArtifactMirror: Send + Sync {
    fn mirror_text(&self, name: &str, body: &str) -> Result<()>;
}

/// Used when no mirror target is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnlyMirror;

impl ArtifactMirror for LogOnlyMirror {
    fn mirror_text(&self, name: &str, body: &str) -> Result<()> {
        info!(artifact = name, bytes = body.len(), "No mirror configured, not uploading");
        Ok(())
    }
}

/// Writes artifacts into a local directory, e.g. a mounted bucket.
#[derive(Debug, Clone)]
pub struct DirectoryMirror {
    root: PathBuf,
}

impl DirectoryMirror {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirectoryMirror { root: root.into() }
    }
}

impl ArtifactMirror for DirectoryMirror {
    fn mirror_text(&self, name: &str, body: &str) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        let path = self.root.join(name);
        std::fs::write(&path, body)?;
        info!(artifact = name, path = %path.display(), "Mirrored artifact");
        Ok(())
    }
}

pub fn from_config(mirror_dir: Option<&PathBuf>) -> Box<dyn ArtifactMirror> {
    match mirror_dir {
        Some(dir) => Box::new(DirectoryMirror::new(dir.clone())),
        None => Box::new(LogOnlyMirror),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_mirror_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = DirectoryMirror::new(dir.path().join("bucket"));
        mirror.mirror_text("gtfs.html", "<html></html>").unwrap();

        let written = std::fs::read_to_string(dir.path().join("bucket/gtfs.html")).unwrap();
        assert_eq!(written, "<html></html>");
    }
}
