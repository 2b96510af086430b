use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle stage of a corpus annotation job.
///
/// The symbolic snake_case name is the only representation that ever leaves
/// the process (persisted job files, API responses), so reordering or adding
/// variants can never corrupt stored jobs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    None,
    SyncingCorpus,
    Waiting,
    Annotating,
    DoneAnnotating,
    SyncingResults,
    DoneSyncing,
    WaitingInstall,
    Installing,
    DoneInstalling,
    Error,
    Aborted,
}

impl Default for Status {
    fn default() -> Self {
        Status::None
    }
}

impl Status {
    pub fn name(self) -> &'static str {
        match self {
            Status::None => "none",
            Status::SyncingCorpus => "syncing_corpus",
            Status::Waiting => "waiting",
            Status::Annotating => "annotating",
            Status::DoneAnnotating => "done_annotating",
            Status::SyncingResults => "syncing_results",
            Status::DoneSyncing => "done_syncing",
            Status::WaitingInstall => "waiting_install",
            Status::Installing => "installing",
            Status::DoneInstalling => "done_installing",
            Status::Error => "error",
            Status::Aborted => "aborted",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Status::None => "Job does not exist",
            Status::SyncingCorpus => "Syncing corpus files to the annotation server",
            Status::Waiting => "Waiting to be annotated",
            Status::Annotating => "Annotation process is running",
            Status::DoneAnnotating => "Annotation process has finished",
            Status::SyncingResults => "Syncing results from the annotation server to storage",
            Status::DoneSyncing => "Results have been synced to storage",
            Status::WaitingInstall => "Waiting to be installed",
            Status::Installing => "Corpus is being installed",
            Status::DoneInstalling => "Corpus is done installing",
            Status::Error => "An error occurred",
            Status::Aborted => "Aborted by the user",
        }
    }

    pub fn is_active(self) -> bool {
        matches!(
            self,
            Status::SyncingCorpus
                | Status::Waiting
                | Status::Annotating
                | Status::WaitingInstall
                | Status::Installing
        )
    }

    pub fn is_inactive(self) -> bool {
        matches!(
            self,
            Status::DoneSyncing | Status::DoneInstalling | Status::Error | Status::Aborted
        )
    }

    pub fn is_syncing(self) -> bool {
        matches!(self, Status::SyncingCorpus | Status::SyncingResults)
    }

    pub fn is_waiting(self) -> bool {
        matches!(self, Status::Waiting | Status::WaitingInstall)
    }

    pub fn is_running(self) -> bool {
        matches!(self, Status::Annotating | Status::Installing)
    }

    pub fn is_done_processing(self) -> bool {
        matches!(
            self,
            Status::DoneAnnotating | Status::DoneSyncing | Status::DoneInstalling
        )
    }

    pub fn has_process_output(self) -> bool {
        matches!(
            self,
            Status::Annotating
                | Status::DoneAnnotating
                | Status::SyncingResults
                | Status::DoneSyncing
                | Status::Installing
                | Status::DoneInstalling
                | Status::Error
        )
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One row of a storage-backend directory listing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StorageEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub last_modified: Option<DateTime<Utc>>,
    pub size: u64,
    pub path: String,
}

impl StorageEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == "dir"
    }
}

/// Persisted state of one corpus's processing lifecycle.
///
/// Exactly one record exists per corpus id; every mutation made by the job
/// state machine is written through to the store before the side effect it
/// gates is trusted. Loading tolerates unknown and missing fields so that
/// records written by older or newer versions never fail to parse.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobRecord {
    pub corpus_id: String,
    pub user_id: Option<String>,
    pub contact: Option<String>,
    pub status: Status,
    pub pid: Option<u32>,
    pub started: Option<DateTime<Utc>>,
    pub done: Option<DateTime<Utc>>,
    pub exports: Vec<String>,
    pub files: Vec<String>,
    pub available_files: Vec<StorageEntry>,
    pub install_scrambled: bool,
    pub installed: bool,
    pub latest_seconds_taken: f64,
    /// Latest progress string parsed from remote process output. `None`
    /// means no output has been read yet; an empty string means output was
    /// read but contained no progress line.
    #[serde(skip)]
    pub latest_progress: Option<String>,
    /// Completion timestamp reported by the remote process itself
    /// (its `real <seconds>` line relative to `started`).
    #[serde(skip)]
    pub process_done: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(corpus_id: &str) -> Self {
        Self {
            corpus_id: corpus_id.to_string(),
            ..Default::default()
        }
    }

    /// Apply caller-supplied overrides on top of a rehydrated record.
    pub fn apply(&mut self, options: JobOptions) {
        if let Some(user_id) = options.user_id {
            self.user_id = Some(user_id);
        }
        if let Some(contact) = options.contact {
            self.contact = Some(contact);
        }
        if let Some(exports) = options.exports {
            self.exports = exports;
        }
        if let Some(files) = options.files {
            self.files = files;
        }
        if let Some(available_files) = options.available_files {
            self.available_files = available_files;
        }
        if let Some(install_scrambled) = options.install_scrambled {
            self.install_scrambled = install_scrambled;
        }
    }

    /// Progress to report to users. Never claims 100% before the state
    /// machine has confirmed completion: a parsed "100%" is clamped to
    /// "99%" until the status reaches one of the done states.
    pub fn progress(&self) -> Option<String> {
        if self.status.has_process_output() {
            match self.latest_progress.as_deref() {
                Some("100%") if !self.status.is_done_processing() => Some("99%".to_string()),
                Some(progress) if !progress.is_empty() => Some(progress.to_string()),
                _ => Some("0%".to_string()),
            }
        } else if self.status.is_active() {
            Some("0%".to_string())
        } else {
            None
        }
    }

    /// Update the elapsed-time estimate for this job and return it.
    ///
    /// While the remote process runs this is `max(last measured, now -
    /// started)`, so a rewound clock can never make the estimate go down.
    /// Once the process has reported its own duration, the end timestamp is
    /// fixed in `done`. The caller persists the record if the value changed.
    pub fn measure_seconds(&mut self, now: DateTime<Utc>) -> f64 {
        let started = match self.started {
            Some(started) if !self.status.is_waiting() => started,
            _ => {
                self.latest_seconds_taken = 0.0;
                return 0.0;
            }
        };

        let seconds = if self.status.is_running() {
            let elapsed = now.signed_duration_since(started).num_milliseconds() as f64 / 1000.0;
            self.latest_seconds_taken.max(elapsed)
        } else if let Some(end) = self.process_done.or(self.done) {
            let elapsed = end.signed_duration_since(started).num_milliseconds() as f64 / 1000.0;
            let seconds = self.latest_seconds_taken.max(elapsed);
            self.done = Some(started + Duration::milliseconds((seconds * 1000.0).round() as i64));
            seconds
        } else {
            0.0
        };
        self.latest_seconds_taken = seconds;
        seconds
    }
}

/// Caller-supplied overrides applied when a job record is fetched.
#[derive(Clone, Debug, Default)]
pub struct JobOptions {
    pub user_id: Option<String>,
    pub contact: Option<String>,
    pub exports: Option<Vec<String>>,
    pub files: Option<Vec<String>>,
    pub available_files: Option<Vec<StorageEntry>>,
    pub install_scrambled: Option<bool>,
}

/// Serializable status view of a job, as returned by the HTTP layer.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSummary {
    pub corpus_id: String,
    pub status: Status,
    pub description: String,
    pub progress: Option<String>,
    pub seconds_taken: f64,
    pub started: Option<DateTime<Utc>>,
    pub done: Option<DateTime<Utc>>,
    pub exports: Vec<String>,
    pub files: Vec<String>,
    pub installed: bool,
    pub install_scrambled: bool,
    pub priority: Option<i32>,
    pub warnings: String,
    pub errors: String,
    pub output: String,
}

impl JobSummary {
    pub fn new(job: &JobRecord) -> Self {
        Self {
            corpus_id: job.corpus_id.clone(),
            status: job.status,
            description: job.status.description().to_string(),
            progress: job.progress(),
            seconds_taken: job.latest_seconds_taken,
            started: job.started,
            done: job.done,
            exports: job.exports.clone(),
            files: job.files.clone(),
            installed: job.installed,
            install_scrambled: job.install_scrambled,
            priority: None,
            warnings: String::new(),
            errors: String::new(),
            output: String::new(),
        }
    }
}

/// Corpus ids name directories and files on several hosts, so only URL-safe
/// names are accepted: ASCII alphanumerics, `-` and `_`.
pub fn valid_corpus_id(corpus_id: &str) -> bool {
    !corpus_id.is_empty()
        && corpus_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_status_symbolic_names() {
        let serialized = serde_json::to_string(&Status::WaitingInstall).unwrap();
        assert_eq!("\"waiting_install\"", serialized);
        let parsed: Status = serde_json::from_str("\"done_annotating\"").unwrap();
        assert_eq!(Status::DoneAnnotating, parsed);
    }

    #[test]
    fn test_status_classification() {
        assert!(Status::Waiting.is_active());
        assert!(Status::Installing.is_active());
        assert!(!Status::Error.is_active());
        assert!(Status::Error.is_inactive());
        assert!(Status::Aborted.is_inactive());
        assert!(Status::Annotating.is_running());
        assert!(!Status::Waiting.is_running());
        assert!(Status::WaitingInstall.is_waiting());
        assert!(Status::DoneSyncing.is_done_processing());
        assert!(Status::Error.has_process_output());
        assert!(!Status::Waiting.has_process_output());
    }

    #[test]
    fn test_progress_clamped_before_done() {
        let mut job = JobRecord::new("corpus");
        job.status = Status::Annotating;
        job.latest_progress = Some("100%".to_string());
        assert_eq!(Some("99%".to_string()), job.progress());
        job.status = Status::DoneAnnotating;
        assert_eq!(Some("100%".to_string()), job.progress());
    }

    #[test]
    fn test_progress_defaults() {
        let mut job = JobRecord::new("corpus");
        assert_eq!(None, job.progress());
        job.status = Status::Waiting;
        assert_eq!(Some("0%".to_string()), job.progress());
        job.status = Status::Annotating;
        assert_eq!(Some("0%".to_string()), job.progress());
        job.latest_progress = Some("57%".to_string());
        assert_eq!(Some("57%".to_string()), job.progress());
    }

    #[test]
    fn test_measure_seconds_monotonic() {
        let mut job = JobRecord::new("corpus");
        let started = Utc::now();
        job.status = Status::Annotating;
        job.started = Some(started);
        let first = job.measure_seconds(started + Duration::seconds(10));
        assert!((first - 10.0).abs() < 0.01);
        // A clock read lower than the previous one must not lower the estimate.
        let second = job.measure_seconds(started + Duration::seconds(5));
        assert!(second >= first);
    }

    #[test]
    fn test_measure_seconds_fixes_end_timestamp() {
        let mut job = JobRecord::new("corpus");
        let started = Utc::now();
        job.status = Status::DoneAnnotating;
        job.started = Some(started);
        job.process_done = Some(started + Duration::seconds(42));
        let seconds = job.measure_seconds(started + Duration::seconds(120));
        assert!((seconds - 42.0).abs() < 0.01);
        assert_eq!(Some(started + Duration::seconds(42)), job.done);
    }

    #[test]
    fn test_record_load_discards_unknown_fields() {
        let raw = r#"{"corpus_id":"abc","status":"waiting","obsolete_field":42}"#;
        let job: JobRecord = serde_json::from_str(raw).unwrap();
        assert_eq!("abc", job.corpus_id);
        assert_eq!(Status::Waiting, job.status);
    }

    #[test]
    fn test_valid_corpus_id() {
        assert!(valid_corpus_id("demo-1"));
        assert!(valid_corpus_id("my_corpus_2"));
        assert!(!valid_corpus_id(""));
        assert!(!valid_corpus_id("../escape"));
        assert!(!valid_corpus_id("with space"));
    }
}
