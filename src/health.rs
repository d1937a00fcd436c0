use crate::hardening::CircuitState;
use crate::server::AppState;
use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub upstream: &'static str,
    pub circuit: CircuitState,
}

pub async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse { status: "ok" })
}

/// The fallback keeps answers flowing with the upstream down, so an open
/// circuit reports `degraded` rather than failing the probe.
pub async fn readiness(State(state): State<Arc<AppState>>) -> (StatusCode, Json<ReadinessResponse>) {
    let circuit = state.circuit_breaker.state().await;
    let upstream = if state.upstream_url.is_some() {
        "configured"
    } else {
        "fallback_only"
    };

    let status = match (state.upstream_url.is_some(), circuit) {
        (true, CircuitState::Open) => {
            tracing::warn!("Readiness check: upstream circuit is open");
            "degraded"
        }
        _ => "ready",
    };

    (
        StatusCode::OK,
        Json(ReadinessResponse {
            status,
            upstream,
            circuit,
        }),
    )
}
