//! Shared test doubles: a scripted remote executor and an in-memory storage
//! backend, plus the runtime/log setup used by the async tests.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, Once};

use async_trait::async_trait;
use lazy_static::lazy_static;
use tokio::runtime::Runtime;

use annoq_data::StorageEntry;

use crate::error::Result;
use crate::executor::{CommandOutput, RemoteCommand, RemoteExecutor};
use crate::settings::Settings;
use crate::storage::StorageBackend;

lazy_static! {
    pub(crate) static ref RUNTIME: Runtime = Runtime::new().unwrap();
}
static INIT: Once = Once::new();

pub(crate) fn setup() {
    INIT.call_once(|| {
        tracing_subscriber::fmt::init();
    });
}

pub(crate) fn test_settings(dir: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.queue_dir = dir.join("queue");
    settings.tmp_dir = dir.join("tmp");
    settings.storage_dir = dir.join("storage");
    settings.remote_host = "annotation.test".to_string();
    settings.remote_user = "worker".to_string();
    settings
}

type Responder = Box<dyn Fn(&RemoteCommand) -> io::Result<CommandOutput> + Send + Sync>;

/// Remote executor whose responses are scripted by the test. Every call is
/// recorded so tests can assert on what would have run.
pub(crate) struct MockExecutor {
    responder: Responder,
    pub calls: Mutex<Vec<RemoteCommand>>,
    pub pushes: Mutex<Vec<(PathBuf, String)>>,
    pub pulls: Mutex<Vec<(String, PathBuf)>>,
}

impl MockExecutor {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&RemoteCommand) -> io::Result<CommandOutput> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
            pushes: Mutex::new(Vec::new()),
            pulls: Mutex::new(Vec::new()),
        }
    }

    /// Executor that answers every command with a clean empty success.
    pub fn silent() -> Self {
        Self::new(|_| Ok(CommandOutput::ok("")))
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl RemoteExecutor for MockExecutor {
    async fn run(&self, command: &RemoteCommand) -> io::Result<CommandOutput> {
        self.calls.lock().unwrap().push(command.clone());
        (self.responder)(command)
    }

    async fn push(
        &self,
        local: &Path,
        remote_dir: &str,
        _delete: bool,
    ) -> io::Result<CommandOutput> {
        self.pushes
            .lock()
            .unwrap()
            .push((local.to_path_buf(), remote_dir.to_string()));
        Ok(CommandOutput::ok(""))
    }

    async fn pull(
        &self,
        remote_dir: &str,
        local: &Path,
        _filters: &[String],
    ) -> io::Result<CommandOutput> {
        self.pulls
            .lock()
            .unwrap()
            .push((remote_dir.to_string(), local.to_path_buf()));
        Ok(CommandOutput::ok(""))
    }
}

/// Storage backend serving a fixed listing and accepting all transfers.
pub(crate) struct MockStorage {
    pub entries: Vec<StorageEntry>,
    pub local: bool,
}

impl MockStorage {
    pub fn new(entries: Vec<StorageEntry>) -> Self {
        Self {
            entries,
            local: false,
        }
    }

    pub fn entry(name: &str, path: &str) -> StorageEntry {
        StorageEntry {
            name: name.to_string(),
            kind: "file".to_string(),
            last_modified: None,
            size: 0,
            path: path.to_string(),
        }
    }
}

#[async_trait]
impl StorageBackend for MockStorage {
    fn local(&self) -> bool {
        self.local
    }

    async fn list_contents(&self, _dir: &str) -> Result<Vec<StorageEntry>> {
        Ok(self.entries.clone())
    }

    async fn download_dir(&self, _dir: &str, _dest: &Path) -> Result<()> {
        Ok(())
    }

    async fn upload_dir(&self, _dir: &str, _src: &Path) -> Result<()> {
        Ok(())
    }

    async fn remove_dir(&self, _dir: &str) -> Result<()> {
        Ok(())
    }

    async fn get_file_contents(&self, _path: &str) -> Result<String> {
        Ok(String::new())
    }
}
