//! Operator-facing status endpoint (`spec.md` §6 additions: "a small
//! `axum` status endpoint (`GET /status`) reporting session count, tunnel
//! states, and pipeline queue depths"). Not part of the wire protocol the
//! servers speak — this is observability tooling only.

use crate::state::AppState;
use axum::{extract::State, Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct StatusResponse {
    pub session_count: usize,
    pub configured_tunnels: usize,
    pub pending_items: usize,
    pub snmp_targets: usize,
    pub servers_with_queued_data: usize,
}

/// `GET /status` — a point-in-time snapshot of the running daemon's
/// session and pipeline state, for operators and health checks.
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        session_count: state.session_registry.len(),
        configured_tunnels: state.configured_tunnels,
        pending_items: state.pipeline.items.len(),
        snmp_targets: state.pipeline.snmp_targets.len(),
        servers_with_queued_data: state
            .pipeline
            .sync_status
            .iter()
            .filter(|e| e.value().queued > 0)
            .count(),
    })
}
