use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("missing requirement for corpus '{corpus_id}': {reason}")]
    MissingRequirement { corpus_id: String, reason: String },

    #[error("no remote process is running for this job")]
    ProcessNotRunning,

    #[error("no process id recorded for this job")]
    ProcessNotFound,

    #[error("remote command failed: {0}")]
    Job(String),

    #[error("file transfer failed: {0}")]
    Transfer(String),

    #[error("storage backend error: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
