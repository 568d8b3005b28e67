//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use super::state::AppState;
use super::ApiError;
use crate::detect::circuit::{SafetyCircuitStatus, SentinelSummary};
use crate::detect::engine::Measurement;
use crate::detect::incident::{DetectionOutcome, IncidentFilter};
use crate::detect::{Agent, AgentStatus, AgentType, DetectError};

type ApiResult = Result<Json<Value>, ApiError>;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/measurements", post(ingest_measurement))
        .route("/incidents", get(list_incidents))
        .route("/incidents/{id}", get(get_incident))
        .route("/incidents/{id}/approve", post(approve_incident))
        .route("/incidents/{id}/resolve", post(resolve_incident))
        .route("/incidents/{id}/notes", post(annotate_incident))
        .route("/agents", get(list_agents))
        .route("/agents/register", post(register_agent))
        .route("/agents/{id}", get(get_agent))
        .route("/agents/{id}/heartbeat", post(heartbeat))
        .route("/agents/{id}/status", post(set_agent_status))
        .route("/safety-circuit", get(safety_circuit))
        .route("/summary", get(summary))
        .route("/streams", get(list_streams))
        .route("/spc/{source}/{parameter}", get(spc_report))
}

fn meta() -> Value {
    json!({
        "timestamp": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let pool = state.pool.clone();
    let database = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let conn = pool.get()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    })
    .await
    .map(|r| r.is_ok())
    .unwrap_or(false);

    Json(json!({
        "data": {
            "status": if database { "ok" } else { "degraded" },
            "database": database,
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": meta()
    }))
}

// ---------------------------------------------------------------------------
// Measurements
// ---------------------------------------------------------------------------

async fn ingest_measurement(State(state): State<AppState>, Json(m): Json<Measurement>) -> ApiResult {
    let outcomes = state.pipeline.submit(m).await?;
    let mut created = Vec::new();
    let mut suppressed = Vec::new();
    for outcome in outcomes {
        match outcome {
            DetectionOutcome::Created(incident) => created.push(incident),
            DetectionOutcome::Suppressed { existing } => suppressed.push(existing),
        }
    }
    Ok(Json(json!({
        "data": { "created": created, "suppressed": suppressed },
        "meta": meta()
    })))
}

// ---------------------------------------------------------------------------
// Incidents
// ---------------------------------------------------------------------------

async fn list_incidents(State(state): State<AppState>, Query(filter): Query<IncidentFilter>) -> ApiResult {
    let incidents = state.incidents.list(&filter).await;
    Ok(Json(json!({ "data": incidents, "meta": { "total": incidents.len() } })))
}

async fn get_incident(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    let incident = state.incidents.get(id).await?;
    Ok(Json(json!({ "data": incident, "meta": meta() })))
}

#[derive(Debug, Deserialize)]
struct ApproveRequest {
    approved: bool,
    #[serde(default)]
    notes: Option<String>,
}

async fn approve_incident(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ApproveRequest>,
) -> ApiResult {
    let incident = state.incidents.approve_incident(id, req.approved, req.notes).await?;
    Ok(Json(json!({ "data": incident, "meta": meta() })))
}

#[derive(Debug, Deserialize)]
struct NotesRequest {
    #[serde(default)]
    notes: Option<String>,
}

async fn resolve_incident(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<NotesRequest>,
) -> ApiResult {
    let incident = state.incidents.resolve_incident(id, req.notes, Utc::now()).await?;
    Ok(Json(json!({ "data": incident, "meta": meta() })))
}

async fn annotate_incident(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<NotesRequest>,
) -> ApiResult {
    let notes = req
        .notes
        .ok_or_else(|| ApiError::BadRequest("notes is required".to_string()))?;
    let incident = state.incidents.annotate_incident(id, notes).await?;
    Ok(Json(json!({ "data": incident, "meta": meta() })))
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct AgentView {
    #[serde(flatten)]
    agent: Agent,
    uptime_hours: f64,
}

async fn list_agents(State(state): State<AppState>) -> ApiResult {
    let now = Utc::now();
    let agents: Vec<AgentView> = state
        .agents
        .list()
        .await
        .into_iter()
        .map(|agent| AgentView {
            uptime_hours: agent.uptime_hours(now),
            agent,
        })
        .collect();
    Ok(Json(json!({ "data": agents, "meta": { "total": agents.len() } })))
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    source_id: String,
    agent_type: AgentType,
    #[serde(default)]
    capabilities: Vec<String>,
    #[serde(default = "default_protocol")]
    protocol: String,
}

fn default_protocol() -> String {
    "mqtt".to_string()
}

async fn register_agent(State(state): State<AppState>, Json(req): Json<RegisterRequest>) -> ApiResult {
    if req.source_id.trim().is_empty() {
        return Err(ApiError::BadRequest("source_id must not be empty".to_string()));
    }
    let agent = state
        .agents
        .register(&req.source_id, req.agent_type, req.capabilities, &req.protocol, Utc::now())
        .await;
    Ok(Json(json!({ "data": agent, "meta": meta() })))
}

async fn get_agent(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    let agent = state
        .agents
        .get(id)
        .await
        .ok_or_else(|| DetectError::not_found("agent", id))?;
    let view = AgentView {
        uptime_hours: agent.uptime_hours(Utc::now()),
        agent,
    };
    Ok(Json(json!({ "data": view, "meta": meta() })))
}

async fn heartbeat(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    let agent = state.agents.heartbeat(id, Utc::now()).await?;
    Ok(Json(json!({ "data": agent, "meta": meta() })))
}

#[derive(Debug, Deserialize)]
struct StatusRequest {
    status: AgentStatus,
}

/// Agents report their own faults here (`{"status": "error"}`) and clear
/// them the same way.
async fn set_agent_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<StatusRequest>,
) -> ApiResult {
    let agent = state.agents.set_status(id, req.status).await?;
    Ok(Json(json!({ "data": agent, "meta": meta() })))
}

// ---------------------------------------------------------------------------
// Read models
// ---------------------------------------------------------------------------

async fn safety_circuit(State(state): State<AppState>) -> ApiResult {
    let incidents = state.incidents.snapshot().await;
    let agents = state.agents.list().await;
    let status = SafetyCircuitStatus::compute(&incidents, &agents, Utc::now());
    Ok(Json(json!({ "data": status, "meta": meta() })))
}

async fn summary(State(state): State<AppState>) -> ApiResult {
    let incidents = state.incidents.snapshot().await;
    let agents = state.agents.list().await;
    let summary = SentinelSummary::compute(&incidents, &agents, Utc::now());
    Ok(Json(json!({ "data": summary, "meta": meta() })))
}

async fn list_streams(State(state): State<AppState>) -> ApiResult {
    let streams: Vec<Value> = state
        .pipeline
        .streams()
        .await
        .into_iter()
        .map(|k| json!({ "source_id": k.source_id, "parameter": k.parameter }))
        .collect();
    Ok(Json(json!({ "data": streams, "meta": { "total": streams.len() } })))
}

async fn spc_report(
    State(state): State<AppState>,
    Path((source, parameter)): Path<(String, String)>,
) -> ApiResult {
    let report = state.pipeline.spc_report(&source, &parameter).await?;
    Ok(Json(json!({ "data": report, "meta": meta() })))
}
