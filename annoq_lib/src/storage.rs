use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use annoq_data::StorageEntry;

use crate::error::{Error, Result};

/// Durable storage backend holding corpus sources, configs and produced
/// exports, addressed by logical corpus paths (`<corpus>/source`,
/// `<corpus>/export`, …).
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// True when the backend lives on the same host as the annotation tool,
    /// in which case no corpus transfer is needed and annotation results are
    /// already in place once the process finishes.
    fn local(&self) -> bool {
        false
    }

    /// Recursive listing of `dir`, directories included.
    async fn list_contents(&self, dir: &str) -> Result<Vec<StorageEntry>>;

    async fn download_dir(&self, dir: &str, dest: &Path) -> Result<()>;

    async fn upload_dir(&self, dir: &str, src: &Path) -> Result<()>;

    async fn remove_dir(&self, dir: &str) -> Result<()>;

    async fn get_file_contents(&self, path: &str) -> Result<String>;
}

/// Storage backend rooted at a directory on the coordinator host.
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, dir: &str) -> PathBuf {
        self.root.join(dir)
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    fn local(&self) -> bool {
        true
    }

    async fn list_contents(&self, dir: &str) -> Result<Vec<StorageEntry>> {
        let base = self.resolve(dir);
        if !base.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        walk(&base, &base, &mut entries)
            .map_err(|e| Error::Storage(format!("failed to list contents of '{}': {}", dir, e)))?;
        Ok(entries)
    }

    async fn download_dir(&self, dir: &str, dest: &Path) -> Result<()> {
        copy_dir(&self.resolve(dir), dest)
            .map_err(|e| Error::Storage(format!("failed to download '{}': {}", dir, e)))
    }

    async fn upload_dir(&self, dir: &str, src: &Path) -> Result<()> {
        copy_dir(src, &self.resolve(dir))
            .map_err(|e| Error::Storage(format!("failed to upload to '{}': {}", dir, e)))
    }

    async fn remove_dir(&self, dir: &str) -> Result<()> {
        match fs::remove_dir_all(self.resolve(dir)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!("failed to remove '{}': {}", dir, e))),
        }
    }

    async fn get_file_contents(&self, path: &str) -> Result<String> {
        fs::read_to_string(self.resolve(path))
            .map_err(|e| Error::Storage(format!("failed to read '{}': {}", path, e)))
    }
}

fn walk(base: &Path, dir: &Path, entries: &mut Vec<StorageEntry>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = entry.metadata()?;
        let relative = path
            .strip_prefix(base)
            .unwrap_or(&path)
            .to_string_lossy()
            .into_owned();
        let last_modified = metadata
            .modified()
            .ok()
            .map(|time| DateTime::<Utc>::from(time));
        entries.push(StorageEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            kind: if metadata.is_dir() { "dir" } else { "file" }.to_string(),
            last_modified,
            size: metadata.len(),
            path: relative,
        });
        if metadata.is_dir() {
            walk(base, &path, entries)?;
        }
    }
    Ok(())
}

fn copy_dir(src: &Path, dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.metadata()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    use tempfile::tempdir;

    use crate::testing::RUNTIME;

    #[test]
    fn test_list_contents_relative_paths() {
        let dir = tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        fs::create_dir_all(dir.path().join("demo/source")).unwrap();
        fs::write(dir.path().join("demo/source/a.txt"), "text").unwrap();
        fs::write(dir.path().join("demo/config.yaml"), "id: demo").unwrap();

        let mut entries = RUNTIME.block_on(storage.list_contents("demo")).unwrap();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(vec!["config.yaml", "source", "source/a.txt"], paths);
        assert!(entries[1].is_dir());
    }

    #[test]
    fn test_list_contents_missing_dir_is_empty() {
        let dir = tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        let entries = RUNTIME.block_on(storage.list_contents("nope")).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_download_upload_round_trip() {
        let dir = tempdir().unwrap();
        let storage = LocalStorage::new(dir.path().join("root"));
        let staging = dir.path().join("staging");
        fs::create_dir_all(dir.path().join("root/demo/source")).unwrap();
        fs::write(dir.path().join("root/demo/source/a.txt"), "text").unwrap();

        RUNTIME
            .block_on(storage.download_dir("demo", &staging))
            .unwrap();
        assert_eq!(
            "text",
            fs::read_to_string(staging.join("source/a.txt")).unwrap()
        );

        fs::write(staging.join("new.xml"), "<x/>").unwrap();
        RUNTIME
            .block_on(storage.upload_dir("demo-out", &staging))
            .unwrap();
        assert_eq!(
            "<x/>",
            fs::read_to_string(dir.path().join("root/demo-out/new.xml")).unwrap()
        );
    }
}
