/// Flow management and execution REST API endpoints
///
/// Flow definitions are registered into the hot-reload registry and driven
/// through the orchestrator: manual passes, execution-order diagnostics,
/// trigger firing, deploy/undeploy, and the test-mode lifecycle.

use crate::{
    error::EngineError,
    flow::{params, types::FlowDefinition},
    runtime::orchestrator::{Orchestrator, TestModeOptions},
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post, put},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::{collections::HashMap, sync::Arc};

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Request body for a manual/test execution pass
#[derive(Debug, Default, Deserialize)]
pub struct ExecuteRequest {
    /// Runtime overrides keyed "{node_id}.{config_key}"
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
}

/// Request body for entering test mode
#[derive(Debug, Deserialize)]
pub struct StartTestModeRequest {
    #[serde(default)]
    pub suppress_writes: bool,
    #[serde(default)]
    pub auto_exit: bool,
    #[serde(default)]
    pub duration_seconds: u64,
}

/// Request body for compile-only script validation
#[derive(Debug, Deserialize)]
pub struct ValidateScriptRequest {
    pub code: String,
}

type ApiError = (StatusCode, Json<Value>);

/// Create flow management and execution routes
pub fn create_flow_routes() -> Router<AppState> {
    Router::new()
        .route("/api/flows", post(upsert_flow))
        .route("/api/flows", get(list_flows))
        .route("/api/flows/{id}", get(get_flow))
        .route("/api/flows/{id}", put(upsert_flow_by_id))
        .route("/api/flows/{id}", delete(delete_flow))
        .route("/api/flows/{id}/execute", post(execute_flow))
        .route("/api/flows/{id}/execution-order", get(execution_order))
        .route("/api/flows/{id}/parameters", get(flow_parameters))
        .route("/api/flows/{id}/status", get(flow_status))
        .route("/api/flows/{id}/deploy", post(deploy_flow))
        .route("/api/flows/{id}/undeploy", post(undeploy_flow))
        .route("/api/flows/{id}/test-mode", post(start_test_mode))
        .route("/api/flows/{id}/test-mode", delete(stop_test_mode))
        .route(
            "/api/flows/{id}/triggers/{node_id}/fire",
            post(fire_trigger),
        )
        .route("/api/scripts/validate", post(validate_script))
}

fn engine_error(e: EngineError) -> ApiError {
    let status = match &e {
        EngineError::FlowNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::NotDeployed(_)
        | EngineError::TestModeNotActive(_)
        | EngineError::NotATrigger { .. } => StatusCode::CONFLICT,
        EngineError::Scheduler(_) => StatusCode::INTERNAL_SERVER_ERROR,
        // Graph validation errors: the definition itself is unacceptable.
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    };
    (status, Json(json!({ "error": e.to_string() })))
}

/// Register or replace a flow definition
///
/// POST /api/flows
/// Body: { "id": "...", "name": "...", "nodes": [...], "edges": [...] }
async fn upsert_flow(
    State(state): State<AppState>,
    Json(flow): Json<FlowDefinition>,
) -> Result<Json<Value>, ApiError> {
    if flow.id.is_empty() || flow.name.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "flow id and name are required" })),
        ));
    }

    let flow_id = flow.id.clone();
    state
        .orchestrator
        .registry()
        .upsert(flow, state.orchestrator.engine().executors())
        .map_err(engine_error)?;

    tracing::info!("🔥 Registered flow: {}", flow_id);
    Ok(Json(json!({
        "id": flow_id,
        "message": "flow registered"
    })))
}

/// PUT /api/flows/:id (the path id must match the body)
async fn upsert_flow_by_id(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(flow): Json<FlowDefinition>,
) -> Result<Json<Value>, ApiError> {
    if flow.id != id {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "flow id in path and body must match" })),
        ));
    }
    upsert_flow(State(state), Json(flow)).await
}

/// GET /api/flows
async fn list_flows(State(state): State<AppState>) -> Json<Value> {
    let flows: Vec<Value> = state
        .orchestrator
        .registry()
        .list()
        .into_iter()
        .map(|f| json!({ "id": f.id, "name": f.name, "mode": f.mode }))
        .collect();
    Json(json!({ "flows": flows }))
}

/// GET /api/flows/:id
async fn get_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<FlowDefinition>, ApiError> {
    state
        .orchestrator
        .registry()
        .get(&id)
        .map(|compiled| Json(compiled.flow))
        .ok_or_else(|| engine_error(EngineError::FlowNotFound(id)))
}

/// DELETE /api/flows/:id
///
/// Tears down all background work for the flow before removing it.
async fn delete_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.orchestrator.remove_flow(&id).await;
    state
        .orchestrator
        .registry()
        .remove(&id)
        .ok_or_else(|| engine_error(EngineError::FlowNotFound(id.clone())))?;
    Ok(Json(json!({ "id": id, "message": "flow removed" })))
}

/// One manual/test pass
///
/// POST /api/flows/:id/execute
/// Body: { "parameters": { "node_id.key": value, ... } }
async fn execute_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Option<Json<ExecuteRequest>>,
) -> Result<Json<Value>, ApiError> {
    let parameters = payload.map(|Json(p)| p.parameters).unwrap_or_default();
    let result = state
        .orchestrator
        .run_once(&id, parameters)
        .await
        .map_err(engine_error)?;
    Ok(Json(json!(result)))
}

/// "Show execution order" diagnostic, no side effects
///
/// GET /api/flows/:id/execution-order
async fn execution_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let order = state
        .orchestrator
        .calculate_execution_order(&id)
        .map_err(engine_error)?;
    Ok(Json(json!({ "order": order })))
}

/// GET /api/flows/:id/parameters
async fn flow_parameters(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let compiled = state
        .orchestrator
        .registry()
        .get(&id)
        .ok_or_else(|| engine_error(EngineError::FlowNotFound(id)))?;
    Ok(Json(
        json!({ "parameters": params::exposed_parameters(&compiled.flow) }),
    ))
}

/// GET /api/flows/:id/status
async fn flow_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .orchestrator
        .registry()
        .get(&id)
        .ok_or_else(|| engine_error(EngineError::FlowNotFound(id.clone())))?;
    let status = state.orchestrator.status(&id).await;
    Ok(Json(json!(status)))
}

/// POST /api/flows/:id/deploy
async fn deploy_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.orchestrator.deploy(&id).await.map_err(engine_error)?;
    Ok(Json(json!({ "id": id, "message": "flow deployed" })))
}

/// POST /api/flows/:id/undeploy
async fn undeploy_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .orchestrator
        .undeploy(&id)
        .await
        .map_err(engine_error)?;
    Ok(Json(json!({ "id": id, "message": "flow undeployed" })))
}

/// POST /api/flows/:id/test-mode
/// Body: { "suppress_writes": bool, "auto_exit": bool, "duration_seconds": u64 }
async fn start_test_mode(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<StartTestModeRequest>,
) -> Result<Json<Value>, ApiError> {
    state
        .orchestrator
        .start_test_mode(
            &id,
            TestModeOptions {
                suppress_writes: payload.suppress_writes,
                auto_exit: payload.auto_exit,
                duration_seconds: payload.duration_seconds,
            },
        )
        .await
        .map_err(engine_error)?;
    Ok(Json(json!({ "id": id, "message": "test mode started" })))
}

/// DELETE /api/flows/:id/test-mode
async fn stop_test_mode(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .orchestrator
        .stop_test_mode(&id)
        .await
        .map_err(engine_error)?;
    Ok(Json(json!({ "id": id, "message": "test mode stopped" })))
}

/// Register a manual-trigger firing
///
/// POST /api/flows/:id/triggers/:node_id/fire
/// Manual-mode flows run an immediate pass and return its result; continuous
/// flows answer with "pending" and the next scan tick consumes the intent.
async fn fire_trigger(
    State(state): State<AppState>,
    Path((id, node_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    match state
        .orchestrator
        .fire_trigger(&id, &node_id)
        .await
        .map_err(engine_error)?
    {
        Some(result) => Ok(Json(json!({ "status": "executed", "result": result }))),
        None => Ok(Json(json!({ "status": "pending" }))),
    }
}

/// Compile-only script check
///
/// POST /api/scripts/validate
/// Body: { "code": "..." }
async fn validate_script(
    State(state): State<AppState>,
    Json(payload): Json<ValidateScriptRequest>,
) -> Json<Value> {
    let diagnostics = state.orchestrator.engine().validate_script(&payload.code);
    Json(json!({ "diagnostics": diagnostics }))
}
