use std::path::PathBuf;

use thiserror::Error;

use crate::scheduler::TaskHandle;

/// Setup and configuration faults. These are the only errors allowed to
/// terminate a run; everything raised during batch processing is classified
/// and handled inside the dispatcher.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Base directory does not exist: {0}")]
    BaseDirMissing(PathBuf),

    #[error("No slots configured")]
    NoSlots,

    #[error("Backend unreachable at startup: {0}")]
    BackendUnreachable(#[source] BackendError),

    #[error("Failed to prepare output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Logger setup failed: {0}")]
    Logging(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DispatchError>;

/// Errors raised at the backend boundary.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Submission timed out after {0}s")]
    SubmitTimeout(u64),

    #[error("Submission command exited with {code:?}: {stderr}")]
    SubmitExit { code: Option<i32>, stderr: String },

    #[error("Submission output has no task id")]
    MissingTaskId,

    #[error("Failed to spawn submission command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Backend returned HTTP {0}")]
    Status(u16),

    #[error("Unusable backend response: {0}")]
    MalformedResponse(String),

    #[error("Artifact for task {handle} unreadable: {source}")]
    Artifact {
        handle: TaskHandle,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised at the filing (storage) boundary.
#[derive(Error, Debug)]
pub enum FilingError {
    #[error("Failed to move {from} to {to}: {source}")]
    Relocate {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to persist artifact to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Registry bookkeeping violations. A rejected insert leaves the registry
/// unchanged.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Task {0} is already tracked")]
    DuplicateHandle(TaskHandle),

    #[error("Slot {slot} is already occupied by task {holder}")]
    SlotOccupied { slot: String, holder: TaskHandle },
}
