//! Shared state for the operator-facing status endpoint (`spec.md` §6
//! additions: "a small `axum` status endpoint reporting session count,
//! tunnel states, and pipeline queue depths"). Purely observational —
//! nothing here is part of the wire protocol the servers speak.

use crate::pipeline::Pipeline;
use crate::session::SessionRegistry;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub session_registry: Arc<SessionRegistry>,
    pub pipeline: Arc<Pipeline>,
    pub configured_tunnels: usize,
}

impl AppState {
    pub fn new(session_registry: Arc<SessionRegistry>, pipeline: Arc<Pipeline>, configured_tunnels: usize) -> Self {
        Self {
            session_registry,
            pipeline,
            configured_tunnels,
        }
    }
}
