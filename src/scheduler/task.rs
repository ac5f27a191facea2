use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Backend-assigned task identifier. Never changes once assigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskHandle(String);

impl TaskHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskHandle {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One unit of work: a sample file waiting to be analysed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sample {
    pub path: PathBuf,
}

impl Sample {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File name used for display and for naming filed copies.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Remote lifecycle of a submitted task, as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Submitted,
    Pending,
    Running,
    Completed,
    Reported,
    FailedAnalysis,
    FailedProcessing,
    FailedReporting,
}

impl TaskState {
    /// Map a backend status string. Unknown strings carry no information.
    pub fn from_backend(status: &str) -> Option<Self> {
        match status {
            "pending" => Some(TaskState::Pending),
            "running" => Some(TaskState::Running),
            "completed" => Some(TaskState::Completed),
            "reported" => Some(TaskState::Reported),
            "failed_analysis" => Some(TaskState::FailedAnalysis),
            "failed_processing" => Some(TaskState::FailedProcessing),
            "failed_reporting" => Some(TaskState::FailedReporting),
            _ => None,
        }
    }

    /// Position in the lifecycle. All terminal states share the top rank.
    pub fn rank(self) -> u8 {
        match self {
            TaskState::Submitted => 0,
            TaskState::Pending => 1,
            TaskState::Running => 2,
            TaskState::Completed => 3,
            TaskState::Reported
            | TaskState::FailedAnalysis
            | TaskState::FailedProcessing
            | TaskState::FailedReporting => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 4
    }

    /// Whether the remote side is still executing on the bound slot.
    pub fn is_executing(self) -> bool {
        matches!(
            self,
            TaskState::Submitted | TaskState::Pending | TaskState::Running
        )
    }

    /// Backend-declared terminal failure, if any.
    pub fn failure_kind(self) -> Option<FailureKind> {
        match self {
            TaskState::FailedAnalysis => Some(FailureKind::AnalysisFailure),
            TaskState::FailedProcessing => Some(FailureKind::ProcessingFailure),
            TaskState::FailedReporting => Some(FailureKind::ReportingFailure),
            _ => None,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Submitted => "submitted",
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Reported => "reported",
            TaskState::FailedAnalysis => "failed_analysis",
            TaskState::FailedProcessing => "failed_processing",
            TaskState::FailedReporting => "failed_reporting",
        };
        f.write_str(s)
    }
}

/// Why a sample ended up in the failed location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    SubmissionError,
    ArtifactRetrievalError,
    AnalysisFailure,
    ProcessingFailure,
    ReportingFailure,
    /// Filing itself failed; the sample was left where it was.
    FilingError,
}

impl FailureKind {
    /// Tag embedded in the failed file name for postmortem.
    pub fn tag(self) -> &'static str {
        match self {
            FailureKind::SubmissionError => "submission_failed",
            FailureKind::ArtifactRetrievalError => "report_retrieval_failed",
            FailureKind::AnalysisFailure => "failed_analysis",
            FailureKind::ProcessingFailure => "failed_processing",
            FailureKind::ReportingFailure => "failed_reporting",
            FailureKind::FilingError => "filing_failed",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub handle: TaskHandle,
    pub sample: Sample,
    pub slot: String,
    pub state: TaskState,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set once the task leaves tracking.
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(handle: TaskHandle, sample: Sample, slot: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            handle,
            sample,
            slot: slot.into(),
            state: TaskState::Submitted,
            submitted_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Seconds since submission, relative to `now`.
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.submitted_at).num_seconds().max(0)
    }

    /// Processing time, if the task has finished.
    pub fn duration_secs(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.submitted_at).num_seconds().max(0))
    }
}
