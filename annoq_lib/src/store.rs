use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::{debug, warn};

use annoq_data::JobRecord;

use crate::error::{Error, Result};

/// Persistence for job records: a fast in-process cache in front of one
/// backup file per corpus id in the queue directory. Every save writes both,
/// so a restart can rebuild the cache from disk and a warm cache never has
/// to touch the filesystem on reads.
pub struct JobStore {
    queue_dir: PathBuf,
    cache: RwLock<HashMap<String, JobRecord>>,
}

impl JobStore {
    pub fn new(queue_dir: &Path) -> Result<Self> {
        fs::create_dir_all(queue_dir)?;
        Ok(Self {
            queue_dir: queue_dir.to_path_buf(),
            cache: RwLock::new(HashMap::new()),
        })
    }

    fn backup_file(&self, corpus_id: &str) -> PathBuf {
        self.queue_dir.join(corpus_id)
    }

    /// Fetch the record for a corpus, rehydrating from the backup file when
    /// the cache is cold. Returns `None` when no record exists anywhere.
    pub fn get(&self, corpus_id: &str) -> Result<Option<JobRecord>> {
        if let Some(job) = self.cache.read().unwrap().get(corpus_id) {
            return Ok(Some(job.clone()));
        }
        let path = self.backup_file(corpus_id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let job: JobRecord = serde_json::from_str(&raw)?;
        debug!(corpus_id = %corpus_id, "rehydrated job from backup file");
        self.cache
            .write()
            .unwrap()
            .insert(corpus_id.to_string(), job.clone());
        Ok(Some(job))
    }

    /// Idempotent full overwrite of the record, in cache and on disk.
    pub fn save(&self, job: &JobRecord) -> Result<()> {
        let dump = serde_json::to_string(job)?;
        self.cache
            .write()
            .unwrap()
            .insert(job.corpus_id.clone(), job.clone());
        fs::write(self.backup_file(&job.corpus_id), dump)?;
        Ok(())
    }

    /// Delete the record from cache and disk. Refuses while the job has a
    /// running remote process unless `force` is set.
    pub fn remove(&self, corpus_id: &str, force: bool) -> Result<()> {
        if let Some(job) = self.get(corpus_id)? {
            if job.status.is_running() && !force {
                return Err(Error::Job(format!(
                    "job for '{}' cannot be removed due to a running remote process",
                    corpus_id
                )));
            }
        }
        self.cache.write().unwrap().remove(corpus_id);
        match fs::remove_file(self.backup_file(corpus_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Load every record from the backup files, oldest first, refreshing the
    /// cache. Files that do not parse as records (including files from other
    /// tools in the same directory) are skipped.
    pub fn load_all(&self) -> Result<Vec<JobRecord>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.queue_dir)? {
            let entry = entry?;
            if !entry.metadata()?.is_file() {
                continue;
            }
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            files.push((modified, entry.path()));
        }
        files.sort_by_key(|(modified, _)| *modified);

        let mut jobs = Vec::new();
        for (_, path) in files {
            let raw = fs::read_to_string(&path)?;
            match serde_json::from_str::<JobRecord>(&raw) {
                Ok(job) => {
                    self.cache
                        .write()
                        .unwrap()
                        .insert(job.corpus_id.clone(), job.clone());
                    jobs.push(job);
                }
                Err(e) => warn!(file = %path.display(), error = %e, "skipping unreadable job file"),
            }
        }
        Ok(jobs)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use annoq_data::{JobOptions, Status};
    use tempfile::tempdir;

    fn record(corpus_id: &str, status: Status) -> JobRecord {
        let mut job = JobRecord::new(corpus_id);
        job.status = status;
        job.exports.push("xml:pretty".to_string());
        job.pid = Some(4242);
        job
    }

    #[test]
    fn test_round_trip() {
        let dir = tempdir().unwrap();
        let store = JobStore::new(dir.path()).unwrap();
        let job = record("demo-1", Status::Waiting);
        store.save(&job).unwrap();
        let loaded = store.get("demo-1").unwrap().unwrap();
        assert_eq!(job, loaded);
    }

    #[test]
    fn test_round_trip_survives_cold_cache() {
        let dir = tempdir().unwrap();
        {
            let store = JobStore::new(dir.path()).unwrap();
            store.save(&record("demo-1", Status::Annotating)).unwrap();
        }
        let store = JobStore::new(dir.path()).unwrap();
        let loaded = store.get("demo-1").unwrap().unwrap();
        assert_eq!(Status::Annotating, loaded.status);
        assert_eq!(Some(4242), loaded.pid);
    }

    #[test]
    fn test_round_trip_with_overrides() {
        let dir = tempdir().unwrap();
        let store = JobStore::new(dir.path()).unwrap();
        store.save(&record("demo-1", Status::Waiting)).unwrap();
        let mut loaded = store.get("demo-1").unwrap().unwrap();
        loaded.apply(JobOptions {
            user_id: Some("alice".to_string()),
            exports: Some(vec!["csv".to_string()]),
            ..Default::default()
        });
        assert_eq!(Some("alice".to_string()), loaded.user_id);
        assert_eq!(vec!["csv".to_string()], loaded.exports);
        // Fields without overrides keep their persisted values.
        assert_eq!(Some(4242), loaded.pid);
    }

    #[test]
    fn test_status_stored_by_symbolic_name() {
        let dir = tempdir().unwrap();
        let store = JobStore::new(dir.path()).unwrap();
        store.save(&record("demo-1", Status::SyncingCorpus)).unwrap();
        let raw = fs::read_to_string(dir.path().join("demo-1")).unwrap();
        assert!(raw.contains("\"status\":\"syncing_corpus\""));
    }

    #[test]
    fn test_load_tolerates_unknown_fields() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("old-corpus"),
            r#"{"corpus_id":"old-corpus","status":"error","legacy_flag":true,"old_field":null}"#,
        )
        .unwrap();
        let store = JobStore::new(dir.path()).unwrap();
        let loaded = store.get("old-corpus").unwrap().unwrap();
        assert_eq!(Status::Error, loaded.status);
    }

    #[test]
    fn test_remove_running_requires_force() {
        let dir = tempdir().unwrap();
        let store = JobStore::new(dir.path()).unwrap();
        store.save(&record("demo-1", Status::Installing)).unwrap();
        assert!(store.remove("demo-1", false).is_err());
        store.remove("demo-1", true).unwrap();
        assert!(store.get("demo-1").unwrap().is_none());
    }

    #[test]
    fn test_load_all_skips_foreign_files() {
        let dir = tempdir().unwrap();
        let store = JobStore::new(dir.path()).unwrap();
        store.save(&record("demo-1", Status::Waiting)).unwrap();
        fs::write(dir.path().join(".priorities"), "[\"demo-1\"]").unwrap();
        fs::write(dir.path().join("broken"), "not json").unwrap();
        let jobs = store.load_all().unwrap();
        assert_eq!(1, jobs.len());
        assert_eq!("demo-1", jobs[0].corpus_id);
    }
}
