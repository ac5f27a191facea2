//! Periodic status output and end-of-batch summaries.

use std::fmt::Write as _;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::{BatchSummary, DispatchState};
use crate::filer::DirectoryStore;
use crate::scheduler::{RegistrySnapshot, SlotStatus};

/// Active tasks listed individually in the text report.
const LISTED_TASKS: usize = 5;

#[derive(Debug, Clone, Serialize)]
pub struct SlotReport {
    pub name: String,
    pub status: SlotStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub snapshot: RegistrySnapshot,
    pub slots: Vec<SlotReport>,
    /// Samples still waiting for a slot.
    pub pending: usize,
}

/// Human-readable status block.
pub fn render_report(report: &StatusReport, now: DateTime<Utc>) -> String {
    let snap = &report.snapshot;
    let mut out = String::new();

    let _ = writeln!(out, "{}", "=".repeat(60));
    let _ = writeln!(
        out,
        "CAPE dispatch status - {}",
        now.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(batch) = &snap.batch {
        let _ = writeln!(out, "Folder: {batch}");
    }
    let _ = writeln!(out, "{}", "=".repeat(60));

    let _ = writeln!(out, "Slots:");
    for slot in &report.slots {
        let _ = writeln!(out, "  {:<12} {}", slot.name, slot.status);
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "Active tasks: {}", snap.active.len());
    let _ = writeln!(out, "Completed:    {}", snap.completed);
    let _ = writeln!(out, "Failed:       {}", snap.failed);
    let _ = writeln!(out, "Pending:      {}", report.pending);
    if let Some(avg) = snap.average_duration_secs {
        let _ = writeln!(out, "Avg time:     {avg:.1}s");
    }

    if !snap.active.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "Active:");
        for task in snap.active.iter().take(LISTED_TASKS) {
            let _ = writeln!(
                out,
                "  task {:<6} {:<10} {:<8} {:>5}s  {}",
                task.handle,
                task.state.to_string(),
                task.slot,
                task.age_secs(now),
                task.sample.name()
            );
        }
        if snap.active.len() > LISTED_TASKS {
            let _ = writeln!(out, "  ... and {} more", snap.active.len() - LISTED_TASKS);
        }
    }
    out
}

/// Final per-batch summary.
pub fn render_batch_summary(summary: &BatchSummary, store: Option<&DirectoryStore>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", "=".repeat(60));
    let _ = writeln!(out, "Folder {} finished", summary.batch);
    let _ = writeln!(out, "{}", "=".repeat(60));
    let _ = writeln!(out, "Total samples: {}", summary.total);
    let _ = writeln!(out, "Completed:     {}", summary.completed);
    let _ = writeln!(out, "Failed:        {}", summary.failed);

    let mut kinds: Vec<_> = summary.failed_by_kind.iter().collect();
    kinds.sort_by_key(|(kind, _)| kind.tag());
    for (kind, count) in kinds {
        let _ = writeln!(out, "  {kind}: {count}");
    }

    if let Some(rate) = summary.success_rate() {
        let _ = writeln!(out, "Success rate:  {rate:.1}%");
    }
    if let Some(avg) = summary.average_duration_secs {
        let _ = writeln!(out, "Avg time:      {avg:.1}s");
    }
    if summary.interrupted {
        let _ = writeln!(
            out,
            "Interrupted: {} not submitted, {} still tracked",
            summary.remaining, summary.still_active
        );
    }
    if let Some(store) = store {
        let _ = writeln!(out, "Reports:   {}", store.json_dir().display());
        let _ = writeln!(out, "Processed: {}", store.processed_dir().display());
        let _ = writeln!(out, "Failed:    {}", store.failed_dir().display());
    }
    out
}

/// Print a status block every `interval` until cancelled. Reads shared state
/// only; never mutates the registry.
pub async fn run_reporter(state: DispatchState, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let report = state.report().await;
                println!("{}", render_report(&report, Utc::now()));
            }
        }
    }
    tracing::debug!("Status reporter stopped");
}
