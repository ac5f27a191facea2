use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::config::DispatchConfig;
use crate::discovery::{self, Batch};
use crate::error::Result;
use crate::filer::{DirectoryStore, Filing, FilingOutcome, OutcomeFiler};
use crate::scheduler::{
    FailureKind, Sample, SlotPool, Task, TaskHandle, TaskRegistry, TaskState, Transition,
};
use crate::status::{self, SlotReport, StatusReport};

/// State shared between the reconciliation loop and the read-only reporters.
#[derive(Clone)]
pub struct DispatchState {
    pub registry: Arc<RwLock<TaskRegistry>>,
    pub pending: Arc<AtomicUsize>,
    pub slots: SlotPool,
    pub backend: Arc<dyn Backend>,
}

impl DispatchState {
    /// Build a status report. The backend is asked before the registry lock
    /// is taken, so a slow backend never blocks the dispatcher.
    pub async fn report(&self) -> StatusReport {
        let busy = self.backend.slot_usage().await.ok();
        let registry = self.registry.read().await;
        StatusReport {
            slots: self
                .slots
                .statuses(busy.as_ref(), &registry)
                .into_iter()
                .map(|(name, status)| SlotReport { name, status })
                .collect(),
            pending: self.pending.load(Ordering::Relaxed),
            snapshot: registry.snapshot(),
        }
    }
}

/// Outcome of one batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub batch: String,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub failed_by_kind: HashMap<FailureKind, usize>,
    /// Samples never submitted because the run was interrupted.
    pub remaining: usize,
    /// Tasks still tracked when the run was interrupted.
    pub still_active: usize,
    pub average_duration_secs: Option<f64>,
    pub interrupted: bool,
}

impl BatchSummary {
    pub fn success_rate(&self) -> Option<f64> {
        let finished = self.completed + self.failed;
        (finished > 0).then(|| self.completed as f64 / finished as f64 * 100.0)
    }
}

/// The control loop: fills idle slots from the pending queue, reconciles the
/// registry against the backend, and files terminal tasks.
///
/// Cycles never overlap. The registry lock is taken only around map
/// mutation and copies, never across a backend or filing call.
pub struct Dispatcher {
    config: DispatchConfig,
    state: DispatchState,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        config: DispatchConfig,
        backend: Arc<dyn Backend>,
        cancel: CancellationToken,
    ) -> Self {
        let state = DispatchState {
            registry: Arc::new(RwLock::new(TaskRegistry::new(
                config.release_slot_on_completed,
            ))),
            pending: Arc::new(AtomicUsize::new(0)),
            slots: SlotPool::new(config.slots.clone()),
            backend,
        };
        Self {
            config,
            state,
            cancel,
        }
    }

    pub fn state(&self) -> DispatchState {
        self.state.clone()
    }

    /// Process batches one after another, filing into per-batch directories
    /// under the base directory. Empty batches are skipped. Stops early when
    /// cancelled.
    pub async fn run_all(&self, batches: &[Batch]) -> Result<Vec<BatchSummary>> {
        let mut summaries = Vec::new();
        for batch in batches {
            if self.cancel.is_cancelled() {
                break;
            }
            let samples = match discovery::samples(&batch.path, &self.config.extensions) {
                Ok(samples) => samples,
                Err(e) => {
                    tracing::error!(batch = %batch.name, error = %e, "Failed to list samples, skipping folder");
                    continue;
                }
            };
            if samples.is_empty() {
                tracing::info!(batch = %batch.name, "Skipping empty folder");
                continue;
            }

            tracing::info!(batch = %batch.name, samples = samples.len(), "Processing folder");
            let store = DirectoryStore::for_batch(&self.config.base_dir, &batch.name);
            store.prepare().await?;

            let summary = self
                .run_batch(&batch.name, samples, Arc::new(store.clone()))
                .await;
            println!("{}", status::render_batch_summary(&summary, Some(&store)));

            let interrupted = summary.interrupted;
            summaries.push(summary);
            if interrupted {
                break;
            }
        }
        Ok(summaries)
    }

    /// Run one batch to completion: zero tracked tasks and an empty queue.
    pub async fn run_batch(
        &self,
        batch: &str,
        samples: Vec<Sample>,
        store: Arc<dyn Filing>,
    ) -> BatchSummary {
        self.state.registry.write().await.begin_batch(batch);
        let total = samples.len();
        let mut queue: VecDeque<Sample> = samples.into();
        self.state.pending.store(queue.len(), Ordering::Relaxed);
        let filer = OutcomeFiler::new(Arc::clone(&self.state.backend), store);

        tracing::info!(batch, total, "Starting to process samples");

        let initial = self
            .fill_slots(&mut queue, &filer, Some(self.state.slots.len()))
            .await;
        tracing::info!(batch, submitted = initial, "Initial submissions");

        let mut interrupted = false;
        loop {
            if self.cancel.is_cancelled() {
                interrupted = true;
                break;
            }

            self.reconcile(&filer).await;
            self.fill_slots(&mut queue, &filer, None).await;

            if queue.is_empty() && self.state.registry.read().await.is_empty() {
                tracing::info!(batch, "Completed processing folder");
                break;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = tokio::time::sleep(self.config.cycle_interval()) => {}
            }
        }

        if interrupted {
            tracing::warn!(
                batch,
                remaining = queue.len(),
                "Stopped before the batch finished; unsubmitted samples left in place"
            );
        }

        let registry = self.state.registry.read().await;
        let mut failed_by_kind = HashMap::new();
        for record in registry.failed() {
            *failed_by_kind.entry(record.kind).or_insert(0) += 1;
        }
        BatchSummary {
            batch: batch.to_string(),
            total,
            completed: registry.completed().len(),
            failed: registry.failed().len(),
            failed_by_kind,
            remaining: queue.len(),
            still_active: registry.active_count(),
            average_duration_secs: registry.average_duration_secs(),
            interrupted,
        }
    }

    /// One reconciliation pass: poll every tracked task, then file the ones
    /// that reached a terminal state.
    pub async fn reconcile(&self, filer: &OutcomeFiler) {
        let handles = self.state.registry.read().await.handles();

        for handle in handles {
            let Some(polled) = self.state.backend.poll(&handle).await else {
                continue;
            };
            let mut registry = self.state.registry.write().await;
            match registry.update_state(&handle, polled) {
                Transition::Advanced { from, to } => {
                    tracing::info!(task = %handle, %from, %to, "Task status changed");
                    if to == TaskState::Completed {
                        if let Some(task) = registry.get(&handle) {
                            tracing::info!(
                                task = %handle,
                                slot = %task.slot,
                                sample = %task.sample.name(),
                                "Analysis finished, slot freed while the report is generated"
                            );
                        }
                    }
                }
                Transition::Regressed { from, to } => {
                    tracing::debug!(task = %handle, %from, %to, "Ignoring stale status");
                }
                Transition::Unchanged | Transition::Unknown => {}
            }
        }

        let terminal = self.state.registry.read().await.terminal();
        for task in terminal {
            let outcome = match task.state.failure_kind() {
                None => filer.file_reported(&task).await,
                Some(kind) => filer.file_failed(&task.sample, Some(&task.handle), kind).await,
            };
            self.finish(&task.handle, outcome).await;
        }
    }

    /// Submit queue heads while a slot is free. `limit` caps the number of
    /// submission attempts. Returns the number of accepted submissions.
    pub async fn fill_slots(
        &self,
        queue: &mut VecDeque<Sample>,
        filer: &OutcomeFiler,
        limit: Option<usize>,
    ) -> usize {
        let mut attempts = 0;
        let mut accepted = 0;

        while !queue.is_empty() && !self.cancel.is_cancelled() {
            if limit.is_some_and(|limit| attempts >= limit) {
                break;
            }

            let busy = match self.state.backend.slot_usage().await {
                Ok(busy) => Some(busy),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to get VM status, using local state only");
                    None
                }
            };
            let slot = {
                let registry = self.state.registry.read().await;
                self.state.slots.available_slot(busy.as_ref(), &registry)
            };
            let Some(slot) = slot else {
                break;
            };
            let Some(sample) = queue.pop_front() else {
                break;
            };
            self.state.pending.store(queue.len(), Ordering::Relaxed);
            attempts += 1;

            match self.state.backend.submit(&sample, Some(&slot)).await {
                Ok(handle) => {
                    let task = Task::new(handle.clone(), sample.clone(), slot.clone());
                    let inserted = self.state.registry.write().await.insert(task);
                    match inserted {
                        Ok(()) => accepted += 1,
                        Err(e) => {
                            tracing::error!(task = %handle, %slot, error = %e, "Cannot track submitted task");
                            let outcome = filer
                                .file_failed(&sample, Some(&handle), FailureKind::SubmissionError)
                                .await;
                            self.record_untracked(sample, Some(handle), outcome).await;
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(sample = %sample.name(), %slot, error = %e, "Submission failed");
                    let outcome = filer
                        .file_failed(&sample, None, FailureKind::SubmissionError)
                        .await;
                    self.record_untracked(sample, None, outcome).await;
                }
            }
        }
        accepted
    }

    /// Remove a filed task and record its outcome. Removal happens whatever
    /// the filing result.
    async fn finish(&self, handle: &TaskHandle, outcome: FilingOutcome) {
        let mut registry = self.state.registry.write().await;
        let Some(task) = registry.remove(handle) else {
            return;
        };
        match outcome {
            FilingOutcome::Processed => {
                tracing::info!(task = %handle, sample = %task.sample.name(), "Retrieved and processed task");
                registry.record_completed(task);
            }
            FilingOutcome::Failed(kind) => {
                tracing::warn!(task = %handle, sample = %task.sample.name(), reason = %kind, "Failed task");
                registry.record_failed(task.sample, Some(task.handle), kind);
            }
        }
    }

    async fn record_untracked(
        &self,
        sample: Sample,
        handle: Option<TaskHandle>,
        outcome: FilingOutcome,
    ) {
        let kind = match outcome {
            FilingOutcome::Failed(kind) => kind,
            FilingOutcome::Processed => return,
        };
        self.state
            .registry
            .write()
            .await
            .record_failed(sample, handle, kind);
    }
}
