use axum::http::StatusCode;
use cbc_core::endpoint::EvaluationEndpoint;
use cbc_core::store::{LocalComplianceStore, MemoryObjectStore, ObjectStore};
use cbc_core::tasks::{InputMode, OrderingTimestamp, SubmissionAck};
use cbc_core::workflow::{
    DefinitionParams, Engine, EngineSettings, RunDb, Services, StateMachine, SystemClock,
};
use http_body_util::BodyExt;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Endpoint that accepts every submission and points at one report.
struct AcceptingEndpoint;

impl EvaluationEndpoint for AcceptingEndpoint {
    fn submit(&self, _envelope: &serde_json::Value) -> cbc_core::Result<SubmissionAck> {
        Ok(SubmissionAck {
            status_code: 200,
            content: serde_json::json!({ "ResultsReport": { "S3Uri": "s3://results/report.json" } }),
        })
    }
}

struct Fixture {
    _dir: TempDir,
    engine: Arc<Engine>,
    objects: Arc<MemoryObjectStore>,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let db = RunDb::open(&dir.path().join("runs.db")).unwrap();
    let objects = Arc::new(MemoryObjectStore::new());
    let services = Services {
        objects: objects.clone(),
        compliance: Arc::new(LocalComplianceStore::in_memory()),
        endpoint: Arc::new(AcceptingEndpoint),
        urls: None,
    };
    let settings = EngineSettings {
        orchestrator_id: "it".into(),
        raw_input_bucket: "raw".into(),
        results_bucket: Some("results".into()),
        environment: "Prod".into(),
        input_mode: InputMode::Pointer,
        ordering_timestamp: OrderingTimestamp::Now,
    };
    let engine = Engine::new(
        StateMachine::standard(&DefinitionParams::default()),
        db,
        services,
        settings,
        Arc::new(SystemClock),
    )
    .unwrap();
    Fixture {
        _dir: dir,
        engine: Arc::new(engine),
        objects,
    }
}

fn trigger_event(resource_id: &str, token: &str) -> serde_json::Value {
    let invoking = serde_json::json!({
        "configurationItem": {
            "configurationItemStatus": "OK",
            "resourceType": "AWS::SQS::Queue",
            "resourceId": resource_id,
            "configuration": { "fifoQueue": true }
        },
        "notificationCreationTime": "2024-01-01T00:00:00Z"
    });
    serde_json::json!({
        "invokingEvent": invoking.to_string(),
        "resultToken": token,
        "configRuleName": "SQS-PoC"
    })
}

async fn send(app: axum::Router, req: axum::http::Request<axum::body::Body>) -> (StatusCode, serde_json::Value) {
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

/// Send a GET request via `oneshot` and return (status, parsed JSON body).
async fn get(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let req = axum::http::Request::builder()
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap();
    send(app, req).await
}

/// Send a POST request with a raw body via `oneshot`.
async fn post(app: axum::Router, uri: &str, body: Vec<u8>) -> (StatusCode, serde_json::Value) {
    let req = axum::http::Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body))
        .unwrap();
    send(app, req).await
}

// ---------------------------------------------------------------------------
// Health and definition
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_reports_orchestrator() {
    let fx = fixture();
    let (status, body) = get(cbc_server::build_router(fx.engine.clone()), "/api/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["orchestrator_id"], "it");
}

#[tokio::test]
async fn definition_is_served_in_state_language_shape() {
    let fx = fixture();
    let (status, body) = get(cbc_server::build_router(fx.engine.clone()), "/api/definition").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["StartAt"], "ParseInput");
    assert_eq!(body["States"]["PollForReport"]["Type"], "Task");
    assert_eq!(body["States"]["Confirmed"]["Type"], "Succeed");
}

// ---------------------------------------------------------------------------
// Event intake
// ---------------------------------------------------------------------------

#[tokio::test]
async fn post_event_returns_202_with_pending_run() {
    let fx = fixture();
    let body = serde_json::to_vec(&trigger_event("q-1", "tok-1")).unwrap();
    let (status, run) = post(cbc_server::build_router(fx.engine.clone()), "/api/events", body).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(run["status"]["type"], "pending");
    assert_eq!(run["state"], "ParseInput");
    assert_eq!(run["event"]["resource_id"], "q-1");
}

#[tokio::test]
async fn malformed_event_is_400() {
    let fx = fixture();
    let app = cbc_server::build_router(fx.engine.clone());

    let (status, body) = post(app.clone(), "/api/events", b"not json".to_vec()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("invalid trigger event"));

    let missing_token = serde_json::json!({ "invokingEvent": "{}", "configRuleName": "r" });
    let (status, _) = post(app.clone(), "/api/events", serde_json::to_vec(&missing_token).unwrap()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post(app, "/api/events", Vec::new()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ---------------------------------------------------------------------------
// Run inspection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn runs_are_listed_and_found_by_prefix() {
    let fx = fixture();
    let app = cbc_server::build_router(fx.engine.clone());
    let body = serde_json::to_vec(&trigger_event("q-1", "tok-1")).unwrap();
    let (_, run) = post(app.clone(), "/api/events", body).await;
    let id = run["id"].as_str().unwrap().to_string();

    let (status, list) = get(app.clone(), "/api/runs").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);

    let (status, list) = get(app.clone(), "/api/runs?status=succeeded").await;
    assert_eq!(status, StatusCode::OK);
    assert!(list.as_array().unwrap().is_empty());

    let (status, found) = get(app.clone(), &format!("/api/runs/{}", &id[..8])).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(found["id"], id.as_str());
}

#[tokio::test]
async fn unknown_run_is_404() {
    let fx = fixture();
    let (status, body) = get(
        cbc_server::build_router(fx.engine.clone()),
        "/api/runs/00000000-0000-4000-8000-000000000000",
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("run not found"));
}

#[tokio::test]
async fn accepted_event_completes_after_a_tick() {
    let fx = fixture();
    fx.objects
        .put(
            "results",
            "report.json",
            br#"{"Evaluation":{"IsCompliant":true}}"#,
        )
        .unwrap();
    let app = cbc_server::build_router(fx.engine.clone());
    let body = serde_json::to_vec(&trigger_event("q-7", "tok-7")).unwrap();
    let (_, run) = post(app.clone(), "/api/events", body).await;
    let id = run["id"].as_str().unwrap().to_string();

    let engine = fx.engine.clone();
    let report = tokio::task::spawn_blocking(move || engine.tick())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.succeeded, 1);

    let (status, run) = get(app, &format!("/api/runs/{id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(run["status"]["type"], "succeeded");
    assert_eq!(run["state"], "Confirmed");
    assert_eq!(run["context"]["verdict"], true);
}
