use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use annoq_data::JobRecord;

use crate::error::{Error, Result};

/// Name of the queue-order file inside the queue directory. The leading dot
/// keeps it out of the job store's backup-file namespace.
const PRIORITIES_FILE: &str = ".priorities";

/// Ordered queue of corpus ids awaiting or undergoing processing. The order
/// is persisted next to the job backup files so restarts keep priorities.
pub struct JobQueue {
    queue_dir: PathBuf,
    order: Mutex<Vec<String>>,
}

impl JobQueue {
    pub fn new(queue_dir: &Path) -> Result<Self> {
        fs::create_dir_all(queue_dir)?;
        let path = queue_dir.join(PRIORITIES_FILE);
        let order = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            queue_dir: queue_dir.to_path_buf(),
            order: Mutex::new(order),
        })
    }

    fn persist(&self, order: &[String]) -> Result<()> {
        let path = self.queue_dir.join(PRIORITIES_FILE);
        fs::write(path, serde_json::to_string(order)?)?;
        Ok(())
    }

    /// Queue a job, moving it to the back if it was already queued. Refuses
    /// while an earlier job for the same corpus is still active.
    pub fn add(&self, job: &JobRecord) -> Result<()> {
        let mut order = self.order.lock().unwrap();
        if order.iter().any(|id| id == &job.corpus_id) && job.status.is_active() {
            return Err(Error::Job(format!(
                "there is an unfinished job for '{}'",
                job.corpus_id
            )));
        }
        order.retain(|id| id != &job.corpus_id);
        order.push(job.corpus_id.clone());
        debug!(corpus_id = %job.corpus_id, position = order.len(), "queued job");
        self.persist(&order)
    }

    /// Queue a corpus id without repositioning it, used when restoring
    /// active jobs found on disk at startup.
    pub fn enqueue_if_absent(&self, corpus_id: &str) -> Result<()> {
        let mut order = self.order.lock().unwrap();
        if !order.iter().any(|id| id == corpus_id) {
            order.push(corpus_id.to_string());
            self.persist(&order)?;
        }
        Ok(())
    }

    pub fn remove(&self, corpus_id: &str) -> Result<()> {
        let mut order = self.order.lock().unwrap();
        let before = order.len();
        order.retain(|id| id != corpus_id);
        if order.len() != before {
            self.persist(&order)?;
        }
        Ok(())
    }

    pub fn contains(&self, corpus_id: &str) -> bool {
        self.order.lock().unwrap().iter().any(|id| id == corpus_id)
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use annoq_data::Status;
    use tempfile::tempdir;

    fn job(corpus_id: &str, status: Status) -> JobRecord {
        let mut job = JobRecord::new(corpus_id);
        job.status = status;
        job
    }

    #[test]
    fn test_add_repositions_finished_job() {
        let dir = tempdir().unwrap();
        let queue = JobQueue::new(dir.path()).unwrap();
        queue.add(&job("a", Status::DoneSyncing)).unwrap();
        queue.add(&job("b", Status::None)).unwrap();
        queue.add(&job("a", Status::DoneSyncing)).unwrap();
        assert_eq!(vec!["b".to_string(), "a".to_string()], queue.snapshot());
    }

    #[test]
    fn test_add_refuses_active_duplicate() {
        let dir = tempdir().unwrap();
        let queue = JobQueue::new(dir.path()).unwrap();
        queue.add(&job("a", Status::Waiting)).unwrap();
        assert!(queue.add(&job("a", Status::Annotating)).is_err());
    }

    #[test]
    fn test_order_survives_restart() {
        let dir = tempdir().unwrap();
        {
            let queue = JobQueue::new(dir.path()).unwrap();
            queue.add(&job("a", Status::None)).unwrap();
            queue.add(&job("b", Status::None)).unwrap();
        }
        let queue = JobQueue::new(dir.path()).unwrap();
        assert_eq!(vec!["a".to_string(), "b".to_string()], queue.snapshot());
        queue.remove("a").unwrap();
        assert!(!queue.contains("a"));
        assert!(queue.contains("b"));
    }
}
