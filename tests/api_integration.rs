use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use mailcheck_core::clients::{Client, ClientStore, EmailTesting, MemoryClientStore, TestResultRecord};
use mailcheck_core::config::{MonitorConfig, SimulatorConfig};
use mailcheck_core::server::{create_router, AppState};
use mailcheck_core::{ExecutionMonitor, MemoryQueueStore, SimulatedExecutor};

fn test_state() -> Arc<AppState> {
    let client = Client {
        client_id: "c-1".to_string(),
        name: "Acme Finance".to_string(),
        email_testing: EmailTesting {
            test_results: vec![TestResultRecord {
                test_result_id: "tr-1".to_string(),
                test_case_id: "tc-1".to_string(),
                status: "completed".to_string(),
                ..TestResultRecord::default()
            }],
            ..EmailTesting::default()
        },
    };
    let executor = SimulatedExecutor::new(SimulatorConfig {
        email_delay_ms: (0, 0),
        ai_delay_ms: (0, 0),
        success_rate: 1.0,
    });
    Arc::new(AppState {
        clients: Arc::new(MemoryClientStore::with_clients(vec![client])),
        monitor: Arc::new(ExecutionMonitor::new(
            Arc::new(MemoryQueueStore::new()),
            Arc::new(executor),
            MonitorConfig::default(),
        )),
    })
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

const ANALYSIS: &str = "/api/clients/c-1/email-testing/ai-analysis";
const MONITORING: &str = "/api/clients/c-1/email-testing/monitoring";

#[tokio::test]
async fn health_check() {
    let app = create_router(test_state());
    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn analysis_scores_and_stores_result() {
    let state = test_state();
    let app = create_router(state.clone());

    let (status, body) = send(
        &app,
        "POST",
        ANALYSIS,
        Some(json!({
            "testResultId": "tr-1",
            "expectedExtraction": {"loanAmount": 250000, "applicantName": "John Smith"},
            "actualExtraction": {"loanAmount": 250100, "applicantName": "Jon Smith"},
            "analysisType": "comprehensive"
        })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["overallAccuracy"], 1.0);
    assert_eq!(body["fieldValidations"].as_array().unwrap().len(), 2);
    assert_eq!(body["testResultId"], "tr-1");

    let client = state.clients.get("c-1").unwrap().unwrap();
    assert_eq!(client.email_testing.find_result("tr-1").unwrap().analyses.len(), 1);

    let (status, body) = send(&app, "GET", &format!("{}?testResultId=tr-1", ANALYSIS), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["testResult"]["testResultId"], "tr-1");
    assert_eq!(body["config"]["aiAnalysisEnabled"], true);
}

#[tokio::test]
async fn analysis_input_errors() {
    let app = create_router(test_state());

    let (status, body) = send(&app, "POST", ANALYSIS, Some(json!({"testResultId": "tr-1"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("Missing required fields"));

    let (status, _) = send(
        &app,
        "POST",
        "/api/clients/nobody/email-testing/ai-analysis",
        Some(json!({"testResultId": "x", "expectedExtraction": {}, "actualExtraction": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, "GET", &format!("{}?testResultId=missing", ANALYSIS), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&app, "GET", ANALYSIS, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["analysisTypes"].as_array().unwrap().len() == 3);
}

#[tokio::test]
async fn monitoring_lifecycle() {
    let state = test_state();
    let app = create_router(state.clone());

    let (status, body) = send(
        &app,
        "POST",
        MONITORING,
        Some(json!({"action": "start", "testCaseIds": ["tc-1", "tc-2", "tc-3"], "options": {"parallelLimit": 2}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    let queue_id = body["queueId"].as_str().unwrap().to_string();

    state.monitor.wait(&queue_id).await;

    let (status, body) = send(
        &app,
        "POST",
        MONITORING,
        Some(json!({"action": "status", "queueId": queue_id})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["progress"]["completed"], 3);

    let (status, body) = send(
        &app,
        "GET",
        &format!("{}?queueId={}&action=logs&limit=2", MONITORING, queue_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["logs"].as_array().unwrap().len(), 2);
    assert!(body["total"].as_u64().unwrap() > 2);

    // Cancelling a finished queue is not an error
    let (status, body) = send(
        &app,
        "POST",
        MONITORING,
        Some(json!({"action": "cancel", "queueId": queue_id})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);

    let client = state.clients.get("c-1").unwrap().unwrap();
    assert_eq!(client.email_testing.execution_history.len(), 1);
    assert_eq!(client.email_testing.execution_history[0].queue_id, queue_id);
}

#[tokio::test]
async fn monitoring_input_errors() {
    let app = create_router(test_state());

    let (status, _) = send(&app, "POST", MONITORING, Some(json!({"action": "start"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, "POST", MONITORING, Some(json!({"action": "explode"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, "POST", MONITORING, Some(json!({"action": "cancel"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &app,
        "POST",
        MONITORING,
        Some(json!({"action": "status", "queueId": "queue_missing"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("queue_missing"));

    let (status, _) = send(&app, "GET", MONITORING, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn partial_options_keep_client_defaults() {
    let state = test_state();
    state
        .clients
        .update_email_testing("c-1", &mut |et| et.config.default_retry_attempts = 2)
        .unwrap();
    let app = create_router(state.clone());

    let (status, body) = send(
        &app,
        "POST",
        MONITORING,
        Some(json!({"action": "start", "testCaseIds": ["tc-1"], "options": {"parallelLimit": 4}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let queue_id = body["queueId"].as_str().unwrap().to_string();
    state.monitor.wait(&queue_id).await;

    // No action defaults to the queue status
    let (status, body) = send(&app, "GET", &format!("{}?queueId={}", MONITORING, queue_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["queueId"], queue_id);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["options"]["parallelLimit"], 4);
    assert_eq!(body["options"]["retryAttempts"], 2);
    assert_eq!(body["options"]["retryBackoffMs"], 1000);

    let (status, _) = send(
        &app,
        "GET",
        &format!("/api/clients/other/email-testing/monitoring?queueId={}", queue_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
