//! HTTP API
//!
//! Thin adapters exposing the analysis and monitoring operations for a
//! client's email tests.

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::analysis::{self, AnalysisRequest};
use crate::clients::{ClientStore, EmailTestingConfig, ExecutionHistoryEntry};
use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::monitor::ExecutionMonitor;
use crate::queue::ExecutionOptions;
use crate::similarity::MATCH_THRESHOLD;

pub struct AppState {
    pub clients: Arc<dyn ClientStore>,
    pub monitor: Arc<ExecutionMonitor>,
}

type SharedState = Arc<AppState>;

pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route(
            "/api/clients/:client_id/email-testing/ai-analysis",
            get(analysis_info).post(run_analysis),
        )
        .route(
            "/api/clients/:client_id/email-testing/monitoring",
            get(monitoring_query).post(monitoring_action),
        )
        .route("/health", get(health_check))
        .with_state(state)
}

/// HTTP server for the email testing API
pub struct ApiServer {
    config: ServerConfig,
    state: SharedState,
}

impl ApiServer {
    pub fn new(config: ServerConfig, state: SharedState) -> Self {
        Self { config, state }
    }

    pub async fn start(&self) -> Result<()> {
        let app = create_router(self.state.clone())
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive());

        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port).parse()?;
        tracing::info!("Email testing API listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to start API server: {}", e))?;
        Ok(())
    }
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "healthy", "service": "mailcheck" }))
}

fn require_client(state: &AppState, client_id: &str) -> Result<crate::clients::Client, ApiError> {
    state
        .clients
        .get(client_id)?
        .ok_or_else(|| ApiError::NotFound(format!("Client not found: {}", client_id)))
}

async fn run_analysis(
    State(state): State<SharedState>,
    Path(client_id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let has_id = body.get("testResultId").and_then(Value::as_str).is_some_and(|s| !s.is_empty());
    let has_expected = body.get("expectedExtraction").is_some_and(Value::is_object);
    let has_actual = body.get("actualExtraction").is_some_and(Value::is_object);
    if !(has_id && has_expected && has_actual) {
        return Err(ApiError::BadRequest(
            "Missing required fields: testResultId, expectedExtraction, actualExtraction".to_string(),
        ));
    }
    let request: AnalysisRequest =
        serde_json::from_value(body).map_err(|e| ApiError::BadRequest(format!("Invalid request: {}", e)))?;

    let client = require_client(&state, &client_id)?;
    if !client.email_testing.config.ai_analysis_enabled {
        return Err(ApiError::BadRequest("AI analysis is disabled for this client".to_string()));
    }

    let result = analysis::analyze(&request);

    // Keep the analysis next to its test result when one is stored
    let mut stored = false;
    let mut pending = Some(result.clone());
    let updated = state.clients.update_email_testing(&client_id, &mut |et| {
        if let Some(record) = et
            .test_results
            .iter_mut()
            .find(|r| r.test_result_id == request.test_result_id)
        {
            if let Some(result) = pending.take() {
                record.analyses.push(result);
                stored = true;
            }
        }
    });
    match updated {
        Ok(_) if !stored => tracing::debug!("No stored test result {} for client {}", request.test_result_id, client_id),
        Ok(_) => {}
        Err(e) => tracing::warn!("Failed to store analysis for {}: {}", request.test_result_id, e),
    }

    Ok(Json(serde_json::to_value(result).map_err(anyhow::Error::from)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalysisQuery {
    test_result_id: Option<String>,
}

async fn analysis_info(
    State(state): State<SharedState>,
    Path(client_id): Path<String>,
    Query(query): Query<AnalysisQuery>,
) -> Result<Json<Value>, ApiError> {
    let client = require_client(&state, &client_id)?;

    let Some(test_result_id) = query.test_result_id else {
        return Ok(Json(json!({
            "analysisTypes": ["basic", "detailed", "comprehensive"],
            "matchThreshold": MATCH_THRESHOLD,
            "supportedValueTypes": ["string", "number", "boolean", "object", "array"],
            "features": ["fieldValidation", "recommendations", "insights"],
            "aiAnalysisEnabled": client.email_testing.config.ai_analysis_enabled,
        })));
    };

    let record = client
        .email_testing
        .find_result(&test_result_id)
        .ok_or_else(|| ApiError::NotFound(format!("Test result not found: {}", test_result_id)))?;

    Ok(Json(json!({
        "testResult": record,
        "config": client.email_testing.config,
    })))
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum MonitoringAction {
    Start,
    Cancel,
    Status,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MonitoringRequest {
    action: MonitoringAction,
    #[serde(default)]
    test_case_ids: Option<Vec<String>>,
    #[serde(default)]
    queue_id: Option<String>,
    #[serde(default)]
    options: Option<OptionOverrides>,
}

/// Options supplied with a start request; unset fields keep the client defaults
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OptionOverrides {
    parallel_limit: Option<usize>,
    retry_attempts: Option<u32>,
    retry_backoff_ms: Option<u64>,
}

impl OptionOverrides {
    fn apply(self, base: ExecutionOptions) -> ExecutionOptions {
        ExecutionOptions {
            parallel_limit: self.parallel_limit.unwrap_or(base.parallel_limit),
            retry_attempts: self.retry_attempts.unwrap_or(base.retry_attempts),
            retry_backoff_ms: self.retry_backoff_ms.unwrap_or(base.retry_backoff_ms),
        }
    }
}

fn client_options(config: &EmailTestingConfig, monitor: &ExecutionMonitor) -> ExecutionOptions {
    ExecutionOptions {
        parallel_limit: config.default_parallel_limit,
        retry_attempts: config.default_retry_attempts,
        retry_backoff_ms: monitor.config().retry_backoff_ms,
    }
}

fn require_queue_id(queue_id: Option<String>) -> Result<String, ApiError> {
    queue_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::BadRequest("queueId is required".to_string()))
}

/// Load a queue and check it belongs to the client.
fn client_queue(
    state: &AppState,
    client_id: &str,
    queue_id: &str,
) -> Result<crate::queue::ExecutionQueue, ApiError> {
    let queue = state.monitor.status(queue_id)?;
    if queue.client_id != client_id {
        return Err(ApiError::NotFound(format!("Queue not found: {}", queue_id)));
    }
    Ok(queue)
}

async fn monitoring_action(
    State(state): State<SharedState>,
    Path(client_id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let request: MonitoringRequest =
        serde_json::from_value(body).map_err(|e| ApiError::BadRequest(format!("Invalid request: {}", e)))?;

    match request.action {
        MonitoringAction::Start => {
            let test_case_ids = request
                .test_case_ids
                .filter(|ids| !ids.is_empty())
                .ok_or_else(|| ApiError::BadRequest("testCaseIds are required".to_string()))?;
            let client = require_client(&state, &client_id)?;
            let options = request
                .options
                .unwrap_or_default()
                .apply(client_options(&client.email_testing.config, &state.monitor));

            let count = test_case_ids.len();
            let queue_id = state.monitor.start(&client_id, test_case_ids, Some(options))?;

            let entry = ExecutionHistoryEntry {
                queue_id: queue_id.clone(),
                test_case_count: count,
                started_at: Utc::now(),
            };
            let mut entry = Some(entry);
            if let Err(e) = state.clients.update_email_testing(&client_id, &mut |et| {
                if let Some(entry) = entry.take() {
                    et.execution_history.push(entry);
                }
            }) {
                tracing::warn!("Failed to record execution history for {}: {}", client_id, e);
            }

            Ok(Json(json!({
                "success": true,
                "queueId": queue_id,
                "message": format!("Started execution of {} test cases", count),
            })))
        }
        MonitoringAction::Cancel => {
            let queue_id = require_queue_id(request.queue_id)?;
            client_queue(&state, &client_id, &queue_id)?;
            let cancelled = state.monitor.cancel(&queue_id)?;
            let message = if cancelled {
                "Execution cancelled"
            } else {
                "Execution already finished"
            };
            Ok(Json(json!({ "success": cancelled, "message": message })))
        }
        MonitoringAction::Status => {
            let queue_id = require_queue_id(request.queue_id)?;
            let queue = client_queue(&state, &client_id, &queue_id)?;
            Ok(Json(serde_json::to_value(queue).map_err(anyhow::Error::from)?))
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MonitoringQuery {
    queue_id: Option<String>,
    action: Option<String>,
    limit: Option<usize>,
    since: Option<DateTime<Utc>>,
}

async fn monitoring_query(
    State(state): State<SharedState>,
    Path(client_id): Path<String>,
    Query(query): Query<MonitoringQuery>,
) -> Result<Json<Value>, ApiError> {
    let queue_id = require_queue_id(query.queue_id)?;
    let queue = client_queue(&state, &client_id, &queue_id)?;

    match query.action.as_deref() {
        Some("logs") => {
            let (logs, total) = state.monitor.logs(&queue_id, query.limit, query.since)?;
            Ok(Json(json!({ "logs": logs, "total": total })))
        }
        Some("status") | None => Ok(Json(serde_json::to_value(queue).map_err(anyhow::Error::from)?)),
        Some(other) => Err(ApiError::BadRequest(format!("Unknown action: {}", other))),
    }
}
