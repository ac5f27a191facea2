
use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use cape_dispatch::dashboard::router;
use cape_dispatch::dispatcher::DispatchState;
use cape_dispatch::scheduler::{Sample, SlotPool, Task, TaskHandle, TaskRegistry, TaskState};
use test_harness::MockBackend;

async fn state_with_tasks() -> DispatchState {
    let mut registry = TaskRegistry::new(true);
    registry.begin_batch("Downloader_1");
    registry
        .insert(Task::new(TaskHandle::from("101"), Sample::new("/b/a.exe"), "HEY"))
        .unwrap();
    registry
        .insert(Task::new(TaskHandle::from("102"), Sample::new("/b/b.exe"), "HEY_2"))
        .unwrap();
    registry.update_state(&TaskHandle::from("102"), TaskState::Completed);
    let done = registry.remove(&TaskHandle::from("102")).unwrap();
    registry.record_completed(done);

    DispatchState {
        registry: Arc::new(tokio::sync::RwLock::new(registry)),
        pending: Arc::new(std::sync::atomic::AtomicUsize::new(3)),
        slots: SlotPool::new(vec!["HEY".into(), "HEY_2".into()]),
        backend: Arc::new(MockBackend::new()),
    }
}

async fn get(state: DispatchState, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = router(state)
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body.to_vec())
}

#[tokio::test]
async fn test_status_endpoint_returns_snapshot() {
    let (status, body) = get(state_with_tasks().await, "/api/status").await;
    assert_eq!(status, StatusCode::OK);

    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["snapshot"]["batch"], "Downloader_1");
    assert_eq!(json["snapshot"]["completed"], 1);
    assert_eq!(json["snapshot"]["failed"], 0);
    assert_eq!(json["pending"], 3);

    let active = json["snapshot"]["active"].as_array().unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0]["handle"], "101");
    assert_eq!(active[0]["state"], "submitted");
    assert_eq!(active[0]["slot"], "HEY");

    let slots = json["slots"].as_array().unwrap();
    assert_eq!(slots[0]["name"], "HEY");
    assert_eq!(slots[0]["status"], "busy");
    assert_eq!(slots[1]["status"], "idle");
}

#[tokio::test]
async fn test_index_renders_text_report() {
    let (status, body) = get(state_with_tasks().await, "/").await;
    assert_eq!(status, StatusCode::OK);

    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("Folder: Downloader_1"));
    assert!(text.contains("Active tasks: 1"));
    assert!(text.contains("a.exe"));
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let (status, _) = get(state_with_tasks().await, "/api/jobs").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
