use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tokio::process::Command;

use crate::backend::Backend;
use crate::config::BackendConfig;
use crate::error::BackendError;
use crate::scheduler::{Sample, TaskHandle, TaskState};

/// Line printed by the submission script on success.
const SUCCESS_MARKER: &str = "added as task with ID";

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct TaskView {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    machine: Option<String>,
}

/// CAPE sandbox adapter.
///
/// Status comes from the REST API, submission goes through the checkout's
/// `utils/submit.py`, and reports are read straight from analysis storage.
#[derive(Debug, Clone)]
pub struct CapeBackend {
    config: BackendConfig,
    client: reqwest::Client,
}

impl CapeBackend {
    pub fn new(config: BackendConfig) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()?;
        Ok(Self { config, client })
    }

    fn report_path(&self, handle: &TaskHandle) -> PathBuf {
        self.config
            .storage_dir
            .join(handle.as_str())
            .join("reports")
            .join("report.json")
    }

    fn pcap_path(&self, handle: &TaskHandle) -> PathBuf {
        self.config.storage_dir.join(handle.as_str()).join("dump.pcap")
    }

    /// Full argument vector for submitting `sample`, program first.
    pub fn submit_argv(&self, sample: &Sample, slot: Option<&str>) -> Vec<String> {
        let mut argv = self.config.submit_command.clone();
        argv.push(sample.path.display().to_string());
        if let Some(route) = &self.config.route {
            argv.push("--route".to_string());
            argv.push(route.clone());
        }
        if let Some(slot) = slot {
            argv.push("--machine".to_string());
            argv.push(slot.to_string());
        }
        argv
    }

    async fn get_json(&self, path: &str) -> Result<String, BackendError> {
        let url = format!("{}/{}", self.config.api_url.trim_end_matches('/'), path);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status(status.as_u16()));
        }
        Ok(response.text().await?)
    }
}

#[async_trait]
impl Backend for CapeBackend {
    async fn submit(&self, sample: &Sample, slot: Option<&str>) -> Result<TaskHandle, BackendError> {
        let argv = self.submit_argv(sample, slot);
        let Some((program, args)) = argv.split_first() else {
            return Err(BackendError::Spawn(std::io::Error::new(
                ErrorKind::InvalidInput,
                "empty submission command",
            )));
        };

        tracing::debug!(sample = %sample.name(), slot = ?slot, program, "Submitting sample");

        let child = Command::new(program)
            .args(args)
            .current_dir(&self.config.cape_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.config.submit_timeout(), child)
            .await
            .map_err(|_| BackendError::SubmitTimeout(self.config.submit_timeout_secs))?
            .map_err(BackendError::Spawn)?;

        if !output.status.success() {
            return Err(BackendError::SubmitExit {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let handle = parse_task_id(&stdout).ok_or(BackendError::MissingTaskId)?;
        tracing::info!(
            sample = %sample.name(),
            task = %handle,
            slot = slot.unwrap_or("any VM"),
            "Submitted sample"
        );
        Ok(handle)
    }

    async fn poll(&self, handle: &TaskHandle) -> Option<TaskState> {
        let body = match self.get_json(&format!("tasks/view/{handle}/")).await {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(task = %handle, error = %e, "Failed to get task status");
                return None;
            }
        };
        let state = parse_task_status(&body);
        if state.is_none() {
            tracing::debug!(task = %handle, "Task status missing or not tracked");
        }
        state
    }

    async fn fetch_artifact(&self, handle: &TaskHandle) -> Result<Option<Vec<u8>>, BackendError> {
        match tokio::fs::read(self.report_path(handle)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(BackendError::Artifact {
                handle: handle.clone(),
                source,
            }),
        }
    }

    async fn discard_side_artifact(&self, handle: &TaskHandle) {
        match tokio::fs::remove_file(self.pcap_path(handle)).await {
            Ok(()) => tracing::debug!(task = %handle, "Deleted PCAP"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(task = %handle, error = %e, "Failed to delete PCAP"),
        }
    }

    async fn slot_usage(&self) -> Result<HashSet<String>, BackendError> {
        let body = self.get_json("tasks/list/").await?;
        parse_busy_slots(&body)
    }
}

fn task_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // Hardcoded pattern, always valid.
    PATTERN.get_or_init(|| Regex::new(r"\d+").expect("task id pattern is valid"))
}

/// Extract the task id from submission output: the last number on the first
/// line carrying the success marker.
pub fn parse_task_id(stdout: &str) -> Option<TaskHandle> {
    stdout
        .lines()
        .filter(|line| line.contains(SUCCESS_MARKER))
        .find_map(|line| task_id_pattern().find_iter(line).last())
        .map(|m| TaskHandle::new(m.as_str()))
}

/// Lifecycle state from a `tasks/view` body.
pub fn parse_task_status(body: &str) -> Option<TaskState> {
    let envelope: Envelope<TaskView> = serde_json::from_str(body).ok()?;
    let status = envelope.data?.status?;
    TaskState::from_backend(&status)
}

/// Machines with a pending or running task, from a `tasks/list` body.
/// A body that is not a task list envelope is an error, never an empty set.
pub fn parse_busy_slots(body: &str) -> Result<HashSet<String>, BackendError> {
    let envelope: Envelope<Vec<TaskView>> = serde_json::from_str(body)
        .map_err(|e| BackendError::MalformedResponse(e.to_string()))?;
    let tasks = envelope
        .data
        .ok_or_else(|| BackendError::MalformedResponse("task list has no data".to_string()))?;
    Ok(tasks
        .into_iter()
        .filter(|t| matches!(t.status.as_deref(), Some("pending") | Some("running")))
        .filter_map(|t| t.machine)
        .collect())
}
