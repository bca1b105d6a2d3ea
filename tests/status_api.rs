//! Status endpoint tests driven through the router.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use tx_orchestrator::api::create_router;
use tx_orchestrator::app::{
    AppState, ConsumerState, RuntimeStats, SchedulerStats, ShutdownController, ShutdownReason,
};
use tx_orchestrator::test_utils::InMemoryLeaseStore;

const PROCESS_ID: i32 = 3;

fn consumer_state(store: Arc<InMemoryLeaseStore>, shutdown: ShutdownController) -> Arc<AppState> {
    Arc::new(AppState::new(
        store,
        PROCESS_ID,
        RuntimeStats::Consumer(Arc::new(ConsumerState::new(4))),
        shutdown,
    ))
}

async fn get(state: Arc<AppState>, uri: &str) -> (StatusCode, Value) {
    let response = create_router(state)
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

#[tokio::test]
async fn test_health_reports_healthy_database() {
    let state = consumer_state(Arc::new(InMemoryLeaseStore::new()), ShutdownController::new());
    let (status, body) = get(state, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["database"], "healthy");
}

#[tokio::test]
async fn test_health_is_unavailable_without_database() {
    let store = Arc::new(InMemoryLeaseStore::new());
    store.set_healthy(false);
    let (status, body) = get(consumer_state(store, ShutdownController::new()), "/health").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unhealthy");
}

#[tokio::test]
async fn test_health_degraded_while_shutting_down() {
    let shutdown = ShutdownController::new();
    shutdown.trigger(ShutdownReason::Signal("SIGTERM"));
    let (status, body) = get(
        consumer_state(Arc::new(InMemoryLeaseStore::new()), shutdown),
        "/health",
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "degraded");
}

#[tokio::test]
async fn test_liveness_ignores_database() {
    let store = Arc::new(InMemoryLeaseStore::new());
    store.set_healthy(false);
    let (status, _) = get(consumer_state(store, ShutdownController::new()), "/health/live").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_consumer_status_exposes_counters() {
    let shutdown = ShutdownController::new();
    shutdown.trigger(ShutdownReason::ZombieOverflow {
        zombies: 2,
        threshold: 1,
    });
    let (status, body) = get(
        consumer_state(Arc::new(InMemoryLeaseStore::new()), shutdown),
        "/status",
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["role"], "consumer");
    assert_eq!(body["process_id"], PROCESS_ID);
    assert_eq!(body["prefetch"], 4);
    assert_eq!(body["zombie_threshold"], 1);
    assert_eq!(body["pending"], 0);
    assert_eq!(body["shutting_down"], true);
    assert!(
        body["shutdown_reason"]
            .as_str()
            .unwrap()
            .contains("zombie")
    );
}

#[tokio::test]
async fn test_observer_status_before_first_tick() {
    let state = Arc::new(AppState::new(
        Arc::new(InMemoryLeaseStore::new()),
        PROCESS_ID,
        RuntimeStats::Observer(Arc::new(SchedulerStats::default())),
        ShutdownController::new(),
    ));
    let (status, body) = get(state, "/status").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["role"], "observer");
    assert_eq!(body["ticks"], 0);
    assert!(body["last_tick"].is_null());
    assert!(body.get("shutdown_reason").is_none());
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let state = consumer_state(Arc::new(InMemoryLeaseStore::new()), ShutdownController::new());
    let (status, _) = get(state, "/transfers").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
