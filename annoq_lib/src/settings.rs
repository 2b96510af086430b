use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Runtime configuration for the job coordinator.
///
/// Every field has a sensible default so a partial config (or none at all)
/// still yields a working instance; the server extracts this struct from its
/// figment, so values can come from `Rocket.toml` or environment variables.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Host running the annotation tool.
    pub remote_host: String,
    /// Account used for ssh/rsync against `remote_host`.
    pub remote_user: String,
    pub ssh_key: String,
    /// Directory on the annotation host under which corpus working
    /// directories are created.
    pub remote_corpora_dir: String,

    /// Corpus layout names, shared between storage and the annotation host.
    pub source_dir: String,
    pub export_dir: String,
    pub work_dir: String,
    pub corpus_config: String,
    /// Name of the plain-text snapshot files produced in the work dir.
    pub plain_text_file: String,

    /// Environment prefix prepended to every tool invocation.
    pub environ: String,
    /// Command used to invoke the annotation tool on the remote host.
    pub command: String,
    pub run_args: String,
    pub install_args: String,
    pub clean_args: String,
    pub default_exports: Vec<String>,
    pub default_installs: Vec<String>,
    pub plain_install: String,
    pub scrambled_install: String,
    /// File collecting the detached process output for a job.
    pub log_file: String,
    /// Run script created on the remote host for every launch.
    pub run_script: String,

    /// Local directory holding job backup files and queue priorities.
    pub queue_dir: PathBuf,
    /// Local staging area for corpus files in transit.
    pub tmp_dir: PathBuf,
    /// Root directory of the local storage backend.
    pub storage_dir: PathBuf,

    /// How many jobs may run on the annotation host at once.
    pub workers: usize,
    /// Seconds between reconciler ticks; 0 disables the built-in driver.
    pub check_queue_frequency: u64,
    /// Shared secret for operator-only routes.
    pub secret_key: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            remote_host: String::new(),
            remote_user: String::new(),
            ssh_key: "~/.ssh/id_rsa".to_string(),
            remote_corpora_dir: "annoq-data".to_string(),
            source_dir: "source".to_string(),
            export_dir: "export".to_string(),
            work_dir: "workdir".to_string(),
            corpus_config: "config.yaml".to_string(),
            plain_text_file: "@text".to_string(),
            environ: String::new(),
            command: "annotate".to_string(),
            run_args: "run".to_string(),
            install_args: "install".to_string(),
            clean_args: "clean".to_string(),
            default_exports: vec!["xml:pretty".to_string()],
            default_installs: Vec::new(),
            plain_install: "search:install_corpus".to_string(),
            scrambled_install: "search:install_corpus_scrambled".to_string(),
            log_file: "process.out".to_string(),
            run_script: "run_job.sh".to_string(),
            queue_dir: PathBuf::from("queue"),
            tmp_dir: PathBuf::from("tmp"),
            storage_dir: PathBuf::from("storage"),
            workers: 1,
            check_queue_frequency: 20,
            secret_key: String::new(),
        }
    }
}

impl Settings {
    /// Working directory for a corpus on the annotation host.
    pub fn remote_corpus_dir(&self, corpus_id: &str) -> String {
        format!("{}/{}", self.remote_corpora_dir, corpus_id)
    }

    pub fn remote_log_file(&self, corpus_id: &str) -> String {
        format!("{}/{}", self.remote_corpus_dir(corpus_id), self.log_file)
    }

    pub fn remote_export_dir(&self, corpus_id: &str) -> String {
        format!("{}/{}", self.remote_corpus_dir(corpus_id), self.export_dir)
    }

    pub fn remote_work_dir(&self, corpus_id: &str) -> String {
        format!("{}/{}", self.remote_corpus_dir(corpus_id), self.work_dir)
    }

    /// Logical corpus paths on the storage backend.
    pub fn storage_corpus_dir(&self, corpus_id: &str) -> String {
        corpus_id.to_string()
    }

    pub fn storage_source_dir(&self, corpus_id: &str) -> String {
        format!("{}/{}", corpus_id, self.source_dir)
    }

    pub fn storage_export_dir(&self, corpus_id: &str) -> String {
        format!("{}/{}", corpus_id, self.export_dir)
    }

    pub fn storage_work_dir(&self, corpus_id: &str) -> String {
        format!("{}/{}", corpus_id, self.work_dir)
    }

    /// Local staging directory for a corpus.
    pub fn local_corpus_dir(&self, corpus_id: &str) -> PathBuf {
        self.tmp_dir.join(corpus_id)
    }

    pub fn local_config_file(&self, corpus_id: &str) -> PathBuf {
        self.local_corpus_dir(corpus_id).join(&self.corpus_config)
    }

    pub fn local_source_dir(&self, corpus_id: &str) -> PathBuf {
        self.local_corpus_dir(corpus_id).join(&self.source_dir)
    }

    pub fn local_export_dir(&self, corpus_id: &str) -> PathBuf {
        self.local_corpus_dir(corpus_id).join(&self.export_dir)
    }

    pub fn local_work_dir(&self, corpus_id: &str) -> PathBuf {
        self.local_corpus_dir(corpus_id).join(&self.work_dir)
    }
}
