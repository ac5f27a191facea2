use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

/// How samples are handed to the analysis backend and how its state is read.
#[derive(Debug, Clone, Serialize)]
pub struct BackendConfig {
    /// Base URL of the backend's REST API.
    pub api_url: String,
    /// Checkout directory the submission command runs in.
    pub cape_dir: PathBuf,
    /// Directory holding per-task analysis folders.
    pub storage_dir: PathBuf,
    /// Submission program and its leading arguments. The sample path,
    /// routing and machine options are appended.
    pub submit_command: Vec<String>,
    /// Network routing option passed to the submission command.
    pub route: Option<String>,
    pub submit_timeout_secs: u64,
    pub http_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8000/apiv2".to_string(),
            cape_dir: PathBuf::from("/opt/CAPEv2"),
            storage_dir: PathBuf::from("/opt/CAPEv2/storage/analyses"),
            submit_command: ["poetry", "run", "python3", "utils/submit.py"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            route: Some("inetsim".to_string()),
            submit_timeout_secs: 30,
            http_timeout_secs: 10,
        }
    }
}

impl BackendConfig {
    pub fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchConfig {
    /// Directory scanned for `<Prefix>_<N>` batch folders.
    pub base_dir: PathBuf,
    /// Batch folder prefixes to process (case-insensitive).
    pub folder_prefixes: Vec<String>,
    /// Sample file extensions, without the dot (case-insensitive).
    pub extensions: Vec<String>,
    /// Analysis machines, in the order they are filled.
    pub slots: Vec<String>,
    pub cycle_interval_ms: u64,
    pub status_interval_ms: u64,
    /// Free a slot as soon as its task reports `completed`, instead of
    /// waiting for `reported` or a failure.
    pub release_slot_on_completed: bool,
    pub backend: BackendConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/home/cape/Documents"),
            folder_prefixes: [
                "Infostealer",
                "Adware",
                "Banker",
                "Downloader",
                "RAT",
                "Ransomware",
                "DDoS",
                "Miner",
                "Benign",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            extensions: vec!["exe".to_string()],
            slots: vec!["HEY".to_string(), "HEY_2".to_string(), "HEY_3".to_string()],
            cycle_interval_ms: 10_000,
            status_interval_ms: 60_000,
            release_slot_on_completed: true,
            backend: BackendConfig::default(),
        }
    }
}

impl DispatchConfig {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }
}
