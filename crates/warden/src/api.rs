//! HTTP API for health checks, Prometheus metrics and admin controls

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use warden_lib::{AdmissionGate, AnomalyDetector, RateLimiter, ThreatEngine};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<AdmissionGate>,
    pub threat: Arc<ThreatEngine>,
    pub limiter: Arc<RateLimiter>,
    pub detector: Arc<AnomalyDetector>,
}

/// Agent liveness. The defense core has no failure mode that leaves the
/// process up but unusable, so a response is the health signal.
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

/// Agent readiness. Every component is constructed before the server
/// starts listening, so a served response means admission checks work.
async fn readyz() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "ready": true })))
}

/// Prometheus metrics endpoint
async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder.encode(&metric_families, &mut buffer).unwrap();

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

async fn threat_score(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.threat.calculate_threat_score())
}

async fn banned_ips(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.threat.banned_ips())
}

#[derive(Deserialize)]
struct LimitQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

async fn honeypot_hits(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    Json(state.threat.honeypot_hits(query.limit))
}

async fn honeypot_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.threat.honeypot_stats())
}

async fn payload_hits(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    Json(state.threat.payload_hits(query.limit))
}

async fn ratelimit_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.limiter.status())
}

async fn anomaly_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.detector.status())
}

async fn anomaly_history(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.detector.history())
}

/// One admission evaluation on behalf of a fronting request layer.
#[derive(Deserialize)]
struct AdmissionQuery {
    ip: String,
    path: String,
    #[serde(default)]
    method: String,
    #[serde(default)]
    query: String,
    #[serde(default)]
    body: String,
}

async fn admission_check(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AdmissionQuery>,
) -> impl IntoResponse {
    let outcome = state.gate.evaluate(
        &request.ip,
        &request.path,
        &request.method,
        &request.query,
        &request.body,
    );
    Json(outcome)
}

#[derive(Deserialize)]
struct UnbanRequest {
    ip: String,
}

async fn unban(
    State(state): State<Arc<AppState>>,
    Json(request): Json<UnbanRequest>,
) -> impl IntoResponse {
    let removed = state.threat.unban(&request.ip);
    let status = if removed {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    (status, Json(json!({ "ip": request.ip, "unbanned": removed })))
}

#[derive(Deserialize)]
struct ToggleRequest {
    active: bool,
}

async fn kill_switch(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ToggleRequest>,
) -> impl IntoResponse {
    if request.active {
        state.threat.activate_kill_switch();
    } else {
        state.threat.deactivate_kill_switch();
    }
    Json(json!({ "kill_switch_active": request.active }))
}

async fn attack_mode(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ToggleRequest>,
) -> impl IntoResponse {
    state.limiter.set_attack_mode(request.active);
    Json(json!({ "attack_mode": request.active }))
}

async fn circuit_breaker(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ToggleRequest>,
) -> impl IntoResponse {
    state.limiter.set_circuit_breaker(request.active);
    Json(json!({ "circuit_breaker_open": request.active }))
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/admission/check", post(admission_check))
        .route("/status/threat", get(threat_score))
        .route("/status/bans", get(banned_ips))
        .route("/status/honeypot", get(honeypot_hits))
        .route("/status/honeypot/stats", get(honeypot_stats))
        .route("/status/payloads", get(payload_hits))
        .route("/status/ratelimit", get(ratelimit_status))
        .route("/status/anomaly", get(anomaly_status))
        .route("/status/anomaly/history", get(anomaly_history))
        .route("/admin/unban", post(unban))
        .route("/admin/kill-switch", post(kill_switch))
        .route("/admin/attack-mode", post(attack_mode))
        .route("/admin/circuit-breaker", post(circuit_breaker))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
