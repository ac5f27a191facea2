pub mod store;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::backend::Backend;
use crate::error::FilingError;
use crate::scheduler::{FailureKind, Sample, Task, TaskHandle};

pub use store::DirectoryStore;

/// Where a sample goes when its lifecycle ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Processed { handle: TaskHandle },
    Failed { kind: FailureKind },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relocation {
    Moved(PathBuf),
    /// Source was already gone; nothing was moved.
    AlreadyAbsent,
}

/// Storage boundary for terminal filing.
#[async_trait]
pub trait Filing: Send + Sync {
    /// Move the sample's file to `dest`. Re-invoking for a sample whose source
    /// no longer exists returns [`Relocation::AlreadyAbsent`].
    async fn relocate(&self, sample: &Sample, dest: &Destination) -> Result<Relocation, FilingError>;

    /// Store a task's report next to the batch outputs.
    async fn persist_artifact(
        &self,
        sample: &Sample,
        handle: &TaskHandle,
        bytes: &[u8],
    ) -> Result<PathBuf, FilingError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilingOutcome {
    Processed,
    /// Filed as failed. `FailureKind::FilingError` means the sample could not
    /// be moved and was left in place for manual recovery.
    Failed(FailureKind),
}

/// Performs the one terminal action per sample.
#[derive(Clone)]
pub struct OutcomeFiler {
    backend: Arc<dyn Backend>,
    store: Arc<dyn Filing>,
}

impl OutcomeFiler {
    pub fn new(backend: Arc<dyn Backend>, store: Arc<dyn Filing>) -> Self {
        Self { backend, store }
    }

    /// Handle a task that reached `Reported`: fetch and keep its report, move
    /// the sample to processed, then drop the traffic capture.
    ///
    /// A missing or unreadable report files the sample as failed; the fetch
    /// is not retried.
    pub async fn file_reported(&self, task: &Task) -> FilingOutcome {
        let bytes = match self.backend.fetch_artifact(&task.handle).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                tracing::warn!(task = %task.handle, "Report not found");
                return self
                    .file_failed(&task.sample, Some(&task.handle), FailureKind::ArtifactRetrievalError)
                    .await;
            }
            Err(e) => {
                tracing::error!(task = %task.handle, error = %e, "Failed to retrieve report");
                return self
                    .file_failed(&task.sample, Some(&task.handle), FailureKind::ArtifactRetrievalError)
                    .await;
            }
        };

        match self.store.persist_artifact(&task.sample, &task.handle, &bytes).await {
            Ok(path) => {
                tracing::info!(task = %task.handle, path = %path.display(), "Retrieved JSON report");
            }
            Err(e) => {
                tracing::error!(
                    task = %task.handle,
                    sample = %task.sample.name(),
                    error = %e,
                    "Failed to store report, leaving sample in place"
                );
                return FilingOutcome::Failed(FailureKind::FilingError);
            }
        }

        let dest = Destination::Processed {
            handle: task.handle.clone(),
        };
        match self.store.relocate(&task.sample, &dest).await {
            Ok(Relocation::Moved(to)) => {
                tracing::info!(
                    sample = %task.sample.name(),
                    to = %to.display(),
                    "Moved processed sample"
                );
            }
            Ok(Relocation::AlreadyAbsent) => {
                tracing::warn!(sample = %task.sample.name(), "Sample no longer exists");
            }
            Err(e) => {
                tracing::error!(sample = %task.sample.name(), error = %e, "Failed to move processed sample");
                return FilingOutcome::Failed(FailureKind::FilingError);
            }
        }

        self.backend.discard_side_artifact(&task.handle).await;
        FilingOutcome::Processed
    }

    /// Move a sample to the failed location, tagged with `kind`.
    pub async fn file_failed(
        &self,
        sample: &Sample,
        handle: Option<&TaskHandle>,
        kind: FailureKind,
    ) -> FilingOutcome {
        match self.store.relocate(sample, &Destination::Failed { kind }).await {
            Ok(Relocation::Moved(to)) => {
                tracing::warn!(
                    sample = %sample.name(),
                    task = ?handle.map(TaskHandle::as_str),
                    to = %to.display(),
                    reason = %kind,
                    "Moved failed sample"
                );
                FilingOutcome::Failed(kind)
            }
            Ok(Relocation::AlreadyAbsent) => {
                tracing::warn!(sample = %sample.name(), reason = %kind, "Failed sample no longer exists");
                FilingOutcome::Failed(kind)
            }
            Err(e) => {
                tracing::error!(
                    sample = %sample.name(),
                    reason = %kind,
                    error = %e,
                    "Failed to move failed sample, leaving it in place"
                );
                FilingOutcome::Failed(FailureKind::FilingError)
            }
        }
    }
}
