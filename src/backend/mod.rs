//! Gateway to the external analysis service.
//!
//! The dispatcher only talks to the backend through the [`Backend`] trait.
//! Every call is independently fallible and never partially applied:
//!
//! - [`Backend::submit`] hands a sample to the service and returns the
//!   assigned handle. It is never retried here; the caller decides.
//! - [`Backend::poll`] returns `None` when the service cannot be reached or
//!   answers with something unusable. `None` means "no new information".
//! - [`Backend::fetch_artifact`] returns `Ok(None)` while the report is not
//!   yet materialized.
//! - [`Backend::discard_side_artifact`] is best effort and only logs.
//! - [`Backend::slot_usage`] is the service's own view of which slots are
//!   executing a task.
//!
//! [`cape::CapeBackend`] implements the trait for a CAPE sandbox (REST
//! status API, submission script, on-disk analysis storage).

pub mod cape;

use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::BackendError;
use crate::scheduler::{Sample, TaskHandle, TaskState};

pub use cape::CapeBackend;

#[async_trait]
pub trait Backend: Send + Sync {
    /// Submit a sample, optionally pinned to a slot.
    async fn submit(&self, sample: &Sample, slot: Option<&str>) -> Result<TaskHandle, BackendError>;

    /// Current lifecycle state of a task, or `None` if unknown right now.
    async fn poll(&self, handle: &TaskHandle) -> Option<TaskState>;

    /// Report bytes for a task, `Ok(None)` if not materialized.
    async fn fetch_artifact(&self, handle: &TaskHandle) -> Result<Option<Vec<u8>>, BackendError>;

    /// Drop large auxiliary data kept for a task.
    async fn discard_side_artifact(&self, handle: &TaskHandle);

    /// Slots the backend reports as running a pending or running task.
    async fn slot_usage(&self) -> Result<HashSet<String>, BackendError>;
}
