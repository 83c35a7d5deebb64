use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use notification_dispatch::{
    api::{AppState, router},
    clients::health::HealthChecker,
    dead_letter::DeadLetterStore,
    error::{DispatchError, ErrorKind},
    idempotency::{Admission, IdempotencyStore},
    models::{
        message::DeadLetterEntry,
        record::{ErrorInfo, NotificationRecord},
    },
};
use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use uuid::Uuid;

use crate::support::{Harness, ScriptedSender, email_request};

struct UnreachableIdempotency;

#[async_trait]
impl IdempotencyStore for UnreachableIdempotency {
    async fn admit(&self, _request_id: &str, _candidate: Uuid) -> Result<Admission, DispatchError> {
        Err(DispatchError::Internal(anyhow!("connection refused")))
    }

    async fn release(&self, _request_id: &str, _id: Uuid) -> Result<(), DispatchError> {
        Err(DispatchError::Internal(anyhow!("connection refused")))
    }

    async fn retire(&self, _request_id: &str) -> Result<(), DispatchError> {
        Err(DispatchError::Internal(anyhow!("connection refused")))
    }

    async fn ping(&self) -> Result<(), DispatchError> {
        Err(DispatchError::Internal(anyhow!("connection refused")))
    }
}

fn state(harness: &Harness) -> AppState {
    AppState {
        admission: harness.admission(),
        dead_letters: harness.feed(),
        health_checker: HealthChecker::new(
            harness.records.clone(),
            harness.idempotency.clone(),
            harness.fabric.clone(),
            vec![harness.breaker.clone()],
        ),
    }
}

async fn serve(state: AppState) -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move { axum::serve(listener, router(Arc::new(state))).await });
    Ok(format!("http://{}", addr))
}

fn submit_body(request_id: &str) -> Value {
    json!({
        "request_id": request_id,
        "user_id": "user-1",
        "channel": "email",
        "template_code": "welcome",
        "variables": { "name": "Ada" },
        "priority": 8
    })
}

/// Test: Submitting returns 202 and repeats are flagged as duplicates
#[tokio::test]
async fn test_submit_endpoint() -> Result<()> {
    let harness = Harness::new(ScriptedSender::succeeding());
    let base = serve(state(&harness)).await?;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/api/v1/notifications", base))
        .json(&submit_body("api-submit"))
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let body: Value = response.json().await?;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["duplicate"], false);
    let id = body["data"]["notification_id"]
        .as_str()
        .ok_or_else(|| anyhow!("missing notification_id"))?
        .to_string();

    let body: Value = client
        .post(format!("{}/api/v1/notifications", base))
        .json(&submit_body("api-submit"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(body["data"]["duplicate"], true);
    assert_eq!(body["data"]["notification_id"], id.as_str());

    let record = harness.record(id.parse()?).await?;
    assert_eq!(record.request.priority, 8);

    Ok(())
}

/// Test: Invalid submissions are rejected with a structured error
#[tokio::test]
async fn test_submit_validation_error() -> Result<()> {
    let harness = Harness::new(ScriptedSender::succeeding());
    let base = serve(state(&harness)).await?;

    let mut body = submit_body("api-invalid");
    body["channel"] = json!("sms");

    let response = reqwest::Client::new()
        .post(format!("{}/api/v1/notifications", base))
        .json(&body)
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body: Value = response.json().await?;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], ErrorKind::ValidationError.as_str());
    assert!(harness.records.is_empty());

    Ok(())
}

/// Test: Status lookup and per-user listing
#[tokio::test]
async fn test_status_and_list_endpoints() -> Result<()> {
    let harness = Harness::new(ScriptedSender::succeeding());
    let admission = harness.admission();
    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(admission.submit(email_request(&format!("api-list-{}", i))).await?);
    }
    let base = serve(state(&harness)).await?;

    let body: Value = reqwest::get(format!(
        "{}/api/v1/notifications/{}/status",
        base, ids[0].notification_id
    ))
    .await?
    .json()
    .await?;
    assert_eq!(body["data"]["status"], "QUEUED");
    assert_eq!(body["data"]["attempt"], 0);

    let response = reqwest::get(format!(
        "{}/api/v1/notifications/{}/status",
        base,
        Uuid::new_v4()
    ))
    .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: Value = response.json().await?;
    assert_eq!(body["error"], "NOT_FOUND");

    let body: Value = reqwest::get(format!(
        "{}/api/v1/notifications?user_id=user-1&page=1&limit=2",
        base
    ))
    .await?
    .json()
    .await?;
    assert_eq!(body["data"].as_array().map(Vec::len), Some(2));
    assert_eq!(body["meta"]["total"], 3);
    assert_eq!(body["meta"]["total_pages"], 2);
    assert_eq!(body["meta"]["has_next"], true);

    let response = reqwest::get(format!(
        "{}/api/v1/notifications?user_id=user-1&limit=500",
        base
    ))
    .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    Ok(())
}

/// Test: Dead-letter list, inspect and replay endpoints
#[tokio::test]
async fn test_dead_letter_endpoints() -> Result<()> {
    let harness = Harness::new(ScriptedSender::succeeding());

    let record = NotificationRecord::new(Uuid::new_v4(), email_request("api-dlq"));
    let entry = DeadLetterEntry::from_record(
        &record,
        ErrorInfo::new(ErrorKind::Exhausted, "retries exhausted", 3),
    );
    harness.dead_letters.append(&entry).await?;

    let base = serve(state(&harness)).await?;
    let client = reqwest::Client::new();

    let body: Value = client
        .get(format!("{}/api/v1/dead-letters", base))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(body["meta"]["total"], 1);
    assert_eq!(body["data"][0]["id"], entry.id.to_string());
    assert_eq!(body["data"][0]["error"]["kind"], "EXHAUSTED");

    let response = client
        .get(format!("{}/api/v1/dead-letters/{}", base, Uuid::new_v4()))
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = client
        .post(format!("{}/api/v1/dead-letters/{}/replay", base, entry.id))
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let replay: Value = response.json().await?;
    assert_eq!(replay["data"]["duplicate"], false);

    let body: Value = client
        .get(format!("{}/api/v1/dead-letters/{}", base, entry.id))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(body["data"]["replayed_as"], replay["data"]["notification_id"]);

    Ok(())
}

/// Test: Health is OK when dependencies are up and the circuit is closed
#[tokio::test]
async fn test_health_healthy() -> Result<()> {
    let harness = Harness::new(ScriptedSender::succeeding());
    let base = serve(state(&harness)).await?;

    let response = reqwest::get(format!("{}/health", base)).await?;
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = response.json().await?;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["checks"]["record_store"]["status"], "healthy");
    assert_eq!(body["checks"]["message_broker"]["status"], "healthy");
    assert_eq!(
        body["checks"]["circuit:email:scripted"]["circuit_breaker"],
        "closed"
    );

    Ok(())
}

/// Test: An open circuit degrades health without failing it
#[tokio::test]
async fn test_health_degraded_by_open_circuit() -> Result<()> {
    let harness = Harness::new(ScriptedSender::succeeding());
    for _ in 0..5 {
        let _ = harness
            .breaker
            .call(|| async { Err::<(), _>(DispatchError::Provider("down".to_string())) })
            .await;
    }
    let base = serve(state(&harness)).await?;

    let response = reqwest::get(format!("{}/health", base)).await?;
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = response.json().await?;
    assert_eq!(body["status"], "degraded");
    assert_eq!(
        body["checks"]["circuit:email:scripted"]["circuit_breaker"],
        "open"
    );

    Ok(())
}

/// Test: A critical dependency outage returns 503
#[tokio::test]
async fn test_health_unhealthy_dependency() -> Result<()> {
    let harness = Harness::new(ScriptedSender::succeeding());
    let mut state = state(&harness);
    state.health_checker = HealthChecker::new(
        harness.records.clone(),
        Arc::new(UnreachableIdempotency),
        harness.fabric.clone(),
        Vec::new(),
    );
    let base = serve(state).await?;

    let response = reqwest::get(format!("{}/health", base)).await?;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let body: Value = response.json().await?;
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["checks"]["idempotency_store"]["status"], "unhealthy");

    Ok(())
}
