use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::RegistryError;
use crate::scheduler::task::{FailureKind, Sample, Task, TaskHandle, TaskState};

/// Result of applying a polled state to a tracked task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Handle is not tracked.
    Unknown,
    /// Same state as before.
    Unchanged,
    Advanced { from: TaskState, to: TaskState },
    /// Backend reported an earlier lifecycle stage; ignored.
    Regressed { from: TaskState, to: TaskState },
}

/// A sample that ended in the failed location.
#[derive(Debug, Clone, Serialize)]
pub struct FailedRecord {
    pub sample: Sample,
    pub handle: Option<TaskHandle>,
    pub kind: FailureKind,
    pub at: DateTime<Utc>,
}

/// Consistent copy of the registry for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub batch: Option<String>,
    pub taken_at: DateTime<Utc>,
    pub active: Vec<Task>,
    pub completed: usize,
    pub failed: usize,
    pub average_duration_secs: Option<f64>,
}

/// Authoritative map of in-flight tasks plus the outcome lists of the current
/// batch.
///
/// Lives behind a single `RwLock`; callers never hold the lock across a
/// backend call.
#[derive(Debug)]
pub struct TaskRegistry {
    tasks: HashMap<TaskHandle, Task>,
    completed: Vec<Task>,
    failed: Vec<FailedRecord>,
    batch: Option<String>,
    release_slot_on_completed: bool,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new(true)
    }
}

impl TaskRegistry {
    pub fn new(release_slot_on_completed: bool) -> Self {
        Self {
            tasks: HashMap::new(),
            completed: Vec::new(),
            failed: Vec::new(),
            batch: None,
            release_slot_on_completed,
        }
    }

    /// Clear all tracking and outcome lists for a new batch.
    pub fn begin_batch(&mut self, name: impl Into<String>) {
        self.tasks.clear();
        self.completed.clear();
        self.failed.clear();
        self.batch = Some(name.into());
    }

    /// Whether a task in this state still holds its slot.
    pub fn holds_slot(&self, state: TaskState) -> bool {
        if self.release_slot_on_completed {
            state.is_executing()
        } else {
            !state.is_terminal()
        }
    }

    /// Track a newly accepted task. Rejects duplicate handles and a second
    /// slot-holding task on the same slot.
    pub fn insert(&mut self, task: Task) -> Result<(), RegistryError> {
        if self.tasks.contains_key(&task.handle) {
            return Err(RegistryError::DuplicateHandle(task.handle));
        }
        if let Some(holder) = self.slot_holder(&task.slot) {
            return Err(RegistryError::SlotOccupied {
                slot: task.slot,
                holder: holder.clone(),
            });
        }
        self.tasks.insert(task.handle.clone(), task);
        Ok(())
    }

    /// Apply a polled state. Only forward moves in the lifecycle are stored.
    pub fn update_state(&mut self, handle: &TaskHandle, state: TaskState) -> Transition {
        let Some(task) = self.tasks.get_mut(handle) else {
            return Transition::Unknown;
        };
        let from = task.state;
        if from == state {
            return Transition::Unchanged;
        }
        if state.rank() < from.rank() || (from.is_terminal() && state.is_terminal()) {
            return Transition::Regressed { from, to: state };
        }
        task.state = state;
        task.updated_at = Utc::now();
        Transition::Advanced { from, to: state }
    }

    pub fn remove(&mut self, handle: &TaskHandle) -> Option<Task> {
        self.tasks.remove(handle)
    }

    pub fn get(&self, handle: &TaskHandle) -> Option<&Task> {
        self.tasks.get(handle)
    }

    /// Handles of all tracked tasks, oldest submission first.
    pub fn handles(&self) -> Vec<TaskHandle> {
        self.sorted_tasks().into_iter().map(|t| t.handle.clone()).collect()
    }

    /// Tracked tasks in any terminal state, oldest first.
    pub fn terminal(&self) -> Vec<Task> {
        self.sorted_tasks()
            .into_iter()
            .filter(|t| t.state.is_terminal())
            .cloned()
            .collect()
    }

    /// The task currently holding `slot`, if any.
    pub fn slot_holder(&self, slot: &str) -> Option<&TaskHandle> {
        self.tasks
            .values()
            .find(|t| t.slot == slot && self.holds_slot(t.state))
            .map(|t| &t.handle)
    }

    /// Slot name to holding task, for every held slot.
    pub fn occupied_slots(&self) -> HashMap<String, TaskHandle> {
        self.tasks
            .values()
            .filter(|t| self.holds_slot(t.state))
            .map(|t| (t.slot.clone(), t.handle.clone()))
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn record_completed(&mut self, mut task: Task) {
        task.finished_at = Some(Utc::now());
        self.completed.push(task);
    }

    pub fn record_failed(&mut self, sample: Sample, handle: Option<TaskHandle>, kind: FailureKind) {
        self.failed.push(FailedRecord {
            sample,
            handle,
            kind,
            at: Utc::now(),
        });
    }

    pub fn completed(&self) -> &[Task] {
        &self.completed
    }

    pub fn failed(&self) -> &[FailedRecord] {
        &self.failed
    }

    /// Mean submission-to-filing time of completed tasks.
    pub fn average_duration_secs(&self) -> Option<f64> {
        let durations: Vec<i64> = self
            .completed
            .iter()
            .filter_map(Task::duration_secs)
            .collect();
        if durations.is_empty() {
            return None;
        }
        Some(durations.iter().sum::<i64>() as f64 / durations.len() as f64)
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            batch: self.batch.clone(),
            taken_at: Utc::now(),
            active: self.sorted_tasks().into_iter().cloned().collect(),
            completed: self.completed.len(),
            failed: self.failed.len(),
            average_duration_secs: self.average_duration_secs(),
        }
    }

    fn sorted_tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().collect();
        tasks.sort_by(|a, b| {
            a.submitted_at
                .cmp(&b.submitted_at)
                .then_with(|| a.handle.cmp(&b.handle))
        });
        tasks
    }
}
