//! Control API tests

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use confdeploy::command::memory::Failure;
use confdeploy::server::serve::router;
use confdeploy::server::state::ServerState;

use crate::common::{orchestrator_options, Fixture};

fn app(fixture: &Fixture) -> Router {
    router(Arc::new(ServerState::new(
        fixture.orchestrator.clone(),
        fixture.coordinator.clone(),
        fixture.backups.clone(),
    )))
}

async fn call(app: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            request = request.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = app.oneshot(request.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_health_reports_connection_state() {
    let fixture = Fixture::new().await;
    let (status, body) = call(app(&fixture), Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "confdeploy");

    fixture.executor.fail_program(
        "repository",
        Failure::Exit {
            code: 1,
            stderr: "auth expired".to_string(),
        },
    );
    fixture.coordinator.health_check_pass().await;
    let (_, body) = call(app(&fixture), Method::GET, "/health", None).await;
    assert_eq!(body["status"], "degraded");

    let (status, body) = call(app(&fixture), Method::GET, "/connections", None).await;
    assert_eq!(status, StatusCode::OK);
    let states: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["state"].as_str().unwrap())
        .collect();
    assert_eq!(states, vec!["connected", "error"]);
}

#[tokio::test]
async fn test_trigger_then_fetch_deployment() {
    let fixture = Fixture::new().await;
    let (status, body) = call(
        app(&fixture),
        Method::POST,
        "/deployments",
        Some(json!({"branch": "release", "priority": "high", "requested_by": "alice"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let id = body["deployment_id"].as_str().unwrap().to_string();

    let (status, body) = call(app(&fixture), Method::GET, &format!("/deployments/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "queued");
    assert_eq!(body["branch"], "release");
    assert_eq!(body["priority"], "high");
    assert_eq!(body["requested_by"], "alice");

    let (status, body) = call(app(&fixture), Method::GET, "/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["processing"], false);
    assert_eq!(body["queue"]["queue_length"], 1);

    let (_, body) = call(app(&fixture), Method::GET, "/deployments?limit=5", None).await;
    assert_eq!(body["total"], 1);
    assert_eq!(body["deployments"][0]["id"], id.as_str());
}

#[tokio::test]
async fn test_unknown_deployment_is_not_found() {
    let fixture = Fixture::new().await;
    let (status, body) = call(app(&fixture), Method::GET, "/deployments/deploy-nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");

    let (status, _) = call(
        app(&fixture),
        Method::POST,
        "/deployments/deploy-nope/rollback",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_rollback_endpoint() {
    let fixture = Fixture::new().await;
    let (_, body) = call(app(&fixture), Method::POST, "/deployments", Some(json!({}))).await;
    let id = body["deployment_id"].as_str().unwrap().to_string();

    // still queued
    let uri = format!("/deployments/{}/rollback", id);
    let (status, body) = call(app(&fixture), Method::POST, &uri, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "validation");

    fixture.orchestrator.process_queue().await;
    let (status, body) = call(
        app(&fixture),
        Method::POST,
        &uri,
        Some(json!({"requested_by": "oncall"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let rollback_id = body["deployment_id"].as_str().unwrap();
    let record = fixture
        .orchestrator
        .deployment(rollback_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.requested_by, "oncall");
}

#[tokio::test]
async fn test_webhook_endpoint() {
    let fixture = Fixture::new().await;
    let (status, body) = call(
        app(&fixture),
        Method::POST,
        "/webhook",
        Some(json!({"shouldDeploy": false, "repository": "config-repo", "branch": "dev"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deployment_id"], Value::Null);

    let (_, body) = call(
        app(&fixture),
        Method::POST,
        "/webhook",
        Some(json!({"shouldDeploy": true, "repository": "config-repo", "branch": "main"})),
    )
    .await;
    assert!(body["deployment_id"].is_string());
}

#[tokio::test]
async fn test_full_queue_maps_to_service_unavailable() {
    let fixture = Fixture::new().await;
    for _ in 0..100 {
        fixture
            .orchestrator
            .trigger_deployment(Default::default())
            .await
            .unwrap();
    }
    let (status, body) = call(app(&fixture), Method::POST, "/deployments", Some(json!({}))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["kind"], "capacity");
}

#[tokio::test]
async fn test_backups_endpoint() {
    let fixture = Fixture::new().await;
    fixture.orchestrator
        .trigger_deployment(Default::default())
        .await
        .unwrap();
    fixture.orchestrator.process_queue().await;

    let (status, body) = call(
        app(&fixture),
        Method::GET,
        "/backups?backup_type=pre-deployment",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    assert_eq!(body["stats"]["count"], 1);
    assert_eq!(body["backups"][0]["backup_type"], "pre-deployment");

    let without_backups = Fixture::build(orchestrator_options(), false).await;
    let (status, _) = call(app(&without_backups), Method::GET, "/backups", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
