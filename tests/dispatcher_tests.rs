//! End-to-end batch runs against the scripted backend.


use std::sync::Arc;
use std::time::Duration;

use cape_dispatch::discovery;
use cape_dispatch::scheduler::{FailureKind, TaskState};
use test_harness::{dispatcher, samples, test_config, within, MemoryStore, MockBackend};

#[tokio::test]
async fn test_all_samples_reported() {
    let backend = MockBackend::new();
    let batch = samples(&["a.exe", "b.exe", "c.exe", "d.exe", "e.exe"]);
    let store = MemoryStore::holding(&batch);
    let (dispatcher, _cancel) = dispatcher(test_config(&["HEY", "HEY_2"]), &backend);

    let summary = within(5, dispatcher.run_batch("Downloader_1", batch, Arc::new(store.clone()))).await;

    assert_eq!(summary.total, 5);
    assert_eq!(summary.completed, 5);
    assert_eq!(summary.failed, 0);
    assert!(!summary.interrupted);
    assert_eq!(summary.success_rate(), Some(100.0));

    assert_eq!(store.processed().len(), 5);
    assert_eq!(store.artifact_count(), 5);
    assert_eq!(store.remaining(), 0);
    assert_eq!(backend.discarded().len(), 5);
    assert_eq!(backend.exclusivity_violations(), 0);
    assert!(backend.max_executing() <= 2);
}

#[tokio::test]
async fn test_initial_fill_uses_every_slot_once() {
    let backend = MockBackend::new().with_default_script(vec![Some(TaskState::Running)]);
    let batch = samples(&["a.exe", "b.exe", "c.exe", "d.exe", "e.exe"]);
    let store = MemoryStore::holding(&batch);
    let (dispatcher, cancel) = dispatcher(test_config(&["HEY", "HEY_2", "HEY_3"]), &backend);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
    });
    let summary = within(5, dispatcher.run_batch("Downloader_2", batch, Arc::new(store))).await;

    assert_eq!(summary.still_active, 3);
    assert_eq!(summary.remaining, 2);
    let slots: Vec<String> = backend.submissions().into_iter().map(|(_, slot)| slot).collect();
    assert_eq!(slots, vec!["HEY", "HEY_2", "HEY_3"]);
}

#[tokio::test]
async fn test_one_report_admits_exactly_one_queued_sample() {
    let backend = MockBackend::new()
        .with_default_script(vec![Some(TaskState::Running)])
        .with_script("a.exe", vec![Some(TaskState::Running), Some(TaskState::Reported)]);
    let batch = samples(&["a.exe", "b.exe", "c.exe", "d.exe", "e.exe"]);
    let store = MemoryStore::holding(&batch);
    let (dispatcher, cancel) = dispatcher(test_config(&["HEY", "HEY_2", "HEY_3"]), &backend);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
    });
    let summary = within(5, dispatcher.run_batch("Downloader_3", batch, Arc::new(store.clone()))).await;

    assert!(summary.interrupted);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.still_active, 3);
    assert_eq!(summary.remaining, 1);
    let submissions = backend.submissions();
    assert_eq!(submissions.len(), 4);
    assert_eq!(submissions[3], ("d.exe".to_string(), "HEY".to_string()));
    assert_eq!(store.processed().len(), 1);
    assert!(store.contains(&samples(&["e.exe"])[0]));
}

#[tokio::test]
async fn test_active_tasks_never_exceed_slots() {
    let backend = MockBackend::new();
    let batch = samples(&["a.exe", "b.exe", "c.exe", "d.exe", "e.exe"]);
    let store = MemoryStore::holding(&batch);
    let (dispatcher, _cancel) = dispatcher(test_config(&["HEY", "HEY_2", "HEY_3"]), &backend);

    let summary = within(5, dispatcher.run_batch("Downloader_4", batch, Arc::new(store))).await;

    assert_eq!(summary.completed, 5);
    assert_eq!(backend.max_executing(), 3);
    assert_eq!(backend.exclusivity_violations(), 0);
}

#[tokio::test]
async fn test_queue_order_is_preserved() {
    let backend = MockBackend::new();
    let batch = samples(&["a.exe", "b.exe", "c.exe", "d.exe"]);
    let store = MemoryStore::holding(&batch);
    let (dispatcher, _cancel) = dispatcher(test_config(&["HEY"]), &backend);

    within(5, dispatcher.run_batch("RAT_1", batch, Arc::new(store))).await;

    let order: Vec<String> = backend.submissions().into_iter().map(|(s, _)| s).collect();
    assert_eq!(order, vec!["a.exe", "b.exe", "c.exe", "d.exe"]);
}

#[tokio::test]
async fn test_submission_failure_keeps_slot_available() {
    let backend = MockBackend::new().with_failing_submission("b.exe");
    let batch = samples(&["a.exe", "b.exe", "c.exe"]);
    let store = MemoryStore::holding(&batch);
    let (dispatcher, _cancel) = dispatcher(test_config(&["HEY"]), &backend);

    let summary = within(5, dispatcher.run_batch("RAT_1", batch, Arc::new(store.clone()))).await;

    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failed_by_kind.get(&FailureKind::SubmissionError), Some(&1));
    assert_eq!(
        store.failed(),
        vec![("b.exe".to_string(), FailureKind::SubmissionError)]
    );
    let slots: Vec<String> = backend.submissions().into_iter().map(|(_, slot)| slot).collect();
    assert_eq!(slots, vec!["HEY", "HEY"]);
}

#[tokio::test]
async fn test_backend_failure_states_are_filed_with_reason() {
    let backend = MockBackend::new()
        .with_script(
            "a.exe",
            vec![Some(TaskState::Running), Some(TaskState::FailedAnalysis)],
        )
        .with_script(
            "b.exe",
            vec![
                Some(TaskState::Running),
                Some(TaskState::Completed),
                Some(TaskState::FailedProcessing),
            ],
        )
        .with_script("c.exe", vec![Some(TaskState::FailedReporting)]);
    let batch = samples(&["a.exe", "b.exe", "c.exe"]);
    let store = MemoryStore::holding(&batch);
    let (dispatcher, _cancel) = dispatcher(test_config(&["HEY", "HEY_2", "HEY_3"]), &backend);

    let summary = within(5, dispatcher.run_batch("Banker_1", batch, Arc::new(store.clone()))).await;

    assert_eq!(summary.completed, 0);
    assert_eq!(summary.failed, 3);
    let mut failed = store.failed();
    failed.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        failed,
        vec![
            ("a.exe".to_string(), FailureKind::AnalysisFailure),
            ("b.exe".to_string(), FailureKind::ProcessingFailure),
            ("c.exe".to_string(), FailureKind::ReportingFailure),
        ]
    );
    assert!(backend.fetched().is_empty());
    assert!(backend.discarded().is_empty());
}

#[tokio::test]
async fn test_missing_report_is_retrieval_failure() {
    let backend = MockBackend::new().with_missing_artifact("a.exe");
    let batch = samples(&["a.exe", "b.exe"]);
    let store = MemoryStore::holding(&batch);
    let (dispatcher, _cancel) = dispatcher(test_config(&["HEY", "HEY_2"]), &backend);

    let summary = within(5, dispatcher.run_batch("Miner_1", batch, Arc::new(store.clone()))).await;

    assert_eq!(summary.completed, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(
        store.failed(),
        vec![("a.exe".to_string(), FailureKind::ArtifactRetrievalError)]
    );
    assert_eq!(store.processed(), vec!["b.exe"]);
    // Fetched once each, never retried.
    assert_eq!(backend.fetched().len(), 2);
}

#[tokio::test]
async fn test_unknown_polls_keep_last_state() {
    let backend = MockBackend::new().with_default_script(vec![
        None,
        Some(TaskState::Running),
        None,
        None,
        Some(TaskState::Reported),
    ]);
    let batch = samples(&["a.exe"]);
    let store = MemoryStore::holding(&batch);
    let (dispatcher, _cancel) = dispatcher(test_config(&["HEY"]), &backend);

    let summary = within(5, dispatcher.run_batch("Adware_1", batch, Arc::new(store))).await;

    assert_eq!(summary.completed, 1);
    assert_eq!(summary.failed, 0);
}

#[tokio::test]
async fn test_stale_status_does_not_regress() {
    let backend = MockBackend::new().with_default_script(vec![
        Some(TaskState::Running),
        Some(TaskState::Pending),
        Some(TaskState::Reported),
    ]);
    let batch = samples(&["a.exe", "b.exe"]);
    let store = MemoryStore::holding(&batch);
    let (dispatcher, _cancel) = dispatcher(test_config(&["HEY"]), &backend);

    let summary = within(5, dispatcher.run_batch("DDoS_1", batch, Arc::new(store))).await;

    assert_eq!(summary.completed, 2);
    assert_eq!(backend.exclusivity_violations(), 0);
}

#[tokio::test]
async fn test_externally_busy_slot_is_not_used() {
    let backend = MockBackend::new().with_external_busy("HEY");
    let batch = samples(&["a.exe", "b.exe", "c.exe"]);
    let store = MemoryStore::holding(&batch);
    let (dispatcher, _cancel) = dispatcher(test_config(&["HEY", "HEY_2"]), &backend);

    let summary = within(5, dispatcher.run_batch("RAT_2", batch, Arc::new(store))).await;

    assert_eq!(summary.completed, 3);
    assert!(backend
        .submissions()
        .iter()
        .all(|(_, slot)| slot == "HEY_2"));
}

#[tokio::test]
async fn test_registry_alone_guards_slots_when_backend_view_unavailable() {
    let backend = MockBackend::new().with_slot_usage_unavailable();
    let batch = samples(&["a.exe", "b.exe", "c.exe", "d.exe"]);
    let store = MemoryStore::holding(&batch);
    let (dispatcher, _cancel) = dispatcher(test_config(&["HEY", "HEY_2"]), &backend);

    let summary = within(5, dispatcher.run_batch("Infostealer_1", batch, Arc::new(store))).await;

    assert_eq!(summary.completed, 4);
    assert_eq!(backend.exclusivity_violations(), 0);
    assert!(backend.max_executing() <= 2);
}

fn lingering_completion() -> Vec<Option<TaskState>> {
    vec![
        Some(TaskState::Running),
        Some(TaskState::Completed),
        Some(TaskState::Completed),
        Some(TaskState::Completed),
        Some(TaskState::Reported),
    ]
}

#[tokio::test]
async fn test_completed_task_frees_slot_by_default() {
    let backend = MockBackend::new().with_default_script(lingering_completion());
    let batch = samples(&["a.exe", "b.exe", "c.exe"]);
    let store = MemoryStore::holding(&batch);
    let (dispatcher, _cancel) = dispatcher(test_config(&["HEY"]), &backend);

    let summary = within(5, dispatcher.run_batch("Ransomware_1", batch, Arc::new(store))).await;

    assert_eq!(summary.completed, 3);
    assert!(backend.completed_overlaps() > 0);
    assert_eq!(backend.exclusivity_violations(), 0);
}

#[tokio::test]
async fn test_strict_coupling_holds_slot_until_terminal() {
    let backend = MockBackend::new().with_default_script(lingering_completion());
    let batch = samples(&["a.exe", "b.exe", "c.exe"]);
    let store = MemoryStore::holding(&batch);
    let mut config = test_config(&["HEY"]);
    config.release_slot_on_completed = false;
    let (dispatcher, _cancel) = dispatcher(config, &backend);

    let summary = within(5, dispatcher.run_batch("Ransomware_2", batch, Arc::new(store))).await;

    assert_eq!(summary.completed, 3);
    assert_eq!(backend.completed_overlaps(), 0);
    assert_eq!(backend.exclusivity_violations(), 0);
}

#[tokio::test]
async fn test_filing_error_leaves_sample_in_place() {
    let backend = MockBackend::new();
    let batch = samples(&["a.exe", "b.exe"]);
    let store = MemoryStore::holding(&batch)
        .with_failing_relocation("a.exe")
        .with_failing_persist("b.exe");
    let (dispatcher, _cancel) = dispatcher(test_config(&["HEY", "HEY_2"]), &backend);

    let summary = within(5, dispatcher.run_batch("Banker_2", batch.clone(), Arc::new(store.clone()))).await;

    assert_eq!(summary.completed, 0);
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.failed_by_kind.get(&FailureKind::FilingError), Some(&2));
    assert!(store.contains(&batch[0]));
    assert!(store.contains(&batch[1]));
    // Tasks leave tracking whatever the filing result.
    assert!(dispatcher.state().registry.read().await.is_empty());
}

#[tokio::test]
async fn test_every_sample_has_exactly_one_outcome() {
    let backend = MockBackend::new()
        .with_failing_submission("b.exe")
        .with_missing_artifact("d.exe")
        .with_script("e.exe", vec![Some(TaskState::FailedAnalysis)]);
    let batch = samples(&["a.exe", "b.exe", "c.exe", "d.exe", "e.exe", "f.exe"]);
    let store = MemoryStore::holding(&batch);
    let (dispatcher, _cancel) = dispatcher(test_config(&["HEY", "HEY_2", "HEY_3"]), &backend);

    let summary = within(5, dispatcher.run_batch("Benign_1", batch, Arc::new(store.clone()))).await;

    assert_eq!(summary.completed + summary.failed, summary.total);
    assert_eq!(summary.completed, 3);
    assert_eq!(store.moves().len(), 6);
    assert_eq!(store.remaining(), 0);
}

#[tokio::test]
async fn test_empty_batch_finishes_immediately() {
    let backend = MockBackend::new();
    let (dispatcher, _cancel) = dispatcher(test_config(&["HEY"]), &backend);

    let summary = within(1, dispatcher.run_batch("RAT_9", Vec::new(), Arc::new(MemoryStore::default()))).await;

    assert_eq!(summary.total, 0);
    assert_eq!(summary.success_rate(), None);
    assert!(backend.submissions().is_empty());
}

#[tokio::test]
async fn test_cancellation_stops_between_cycles() {
    let backend = MockBackend::new().with_default_script(vec![Some(TaskState::Running)]);
    let batch = samples(&["a.exe", "b.exe", "c.exe", "d.exe", "e.exe"]);
    let store = MemoryStore::holding(&batch);
    let (dispatcher, cancel) = dispatcher(test_config(&["HEY", "HEY_2"]), &backend);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let summary = within(5, dispatcher.run_batch("Miner_2", batch, Arc::new(store.clone()))).await;

    assert!(summary.interrupted);
    assert_eq!(summary.completed, 0);
    assert_eq!(summary.still_active, 2);
    assert_eq!(summary.remaining, 3);
    // Nothing is filed for in-flight or unsubmitted samples.
    assert_eq!(store.remaining(), 5);
}

#[tokio::test]
async fn test_status_report_reflects_registry() {
    let backend = MockBackend::new().with_default_script(vec![Some(TaskState::Running)]);
    let batch = samples(&["a.exe", "b.exe", "c.exe"]);
    let store = MemoryStore::holding(&batch);
    let (dispatcher, cancel) = dispatcher(test_config(&["HEY", "HEY_2"]), &backend);
    let state = dispatcher.state();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
    });
    within(5, dispatcher.run_batch("Downloader_3", batch, Arc::new(store))).await;

    let report = state.report().await;
    assert_eq!(report.snapshot.batch.as_deref(), Some("Downloader_3"));
    assert_eq!(report.snapshot.active.len(), 2);
    assert_eq!(report.pending, 1);
    assert!(report
        .slots
        .iter()
        .all(|s| s.status == cape_dispatch::scheduler::SlotStatus::Busy));
}

#[tokio::test]
async fn test_run_all_processes_discovered_folders() {
    let base = tempfile::tempdir().unwrap();
    let downloader = base.path().join("Downloader_1");
    std::fs::create_dir(&downloader).unwrap();
    std::fs::write(downloader.join("one.exe"), b"MZ").unwrap();
    std::fs::write(downloader.join("two.exe"), b"MZ").unwrap();
    std::fs::write(downloader.join("notes.txt"), b"skip").unwrap();
    std::fs::create_dir(base.path().join("RAT_1")).unwrap();

    let mut config = test_config(&["HEY", "HEY_2"]);
    config.base_dir = base.path().to_path_buf();
    let batches = discovery::discover_batches(&config.base_dir, &config.folder_prefixes).unwrap();
    assert_eq!(batches.len(), 2);

    let backend = MockBackend::new();
    let (dispatcher, _cancel) = dispatcher(config, &backend);
    let summaries = within(5, dispatcher.run_all(&batches)).await.unwrap();

    // The empty RAT_1 folder is skipped.
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].batch, "Downloader_1");
    assert_eq!(summaries[0].completed, 2);

    let count = |dir: &str| std::fs::read_dir(base.path().join(dir)).unwrap().count();
    assert_eq!(count("Downloader_1_processed"), 2);
    assert_eq!(count("Downloader_1_json"), 2);
    assert_eq!(count("Downloader_1_failed"), 0);
    // Only the non-sample file is left behind.
    assert_eq!(count("Downloader_1"), 1);
    assert!(!base.path().join("RAT_1_processed").exists());
}
