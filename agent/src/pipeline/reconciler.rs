//! The reconciliation task (`spec.md` §4.3 "Reconciliation"): bulk-ships
//! whatever the local queue holds for servers that currently have a
//! session able to accept a bulk reply, with jittered backoff on "busy".

use crate::db::{queries, DbPool};
use crate::model::{now_ms, DataElement, DciType, ServerSyncStatus};
use crate::session::{RoleFlags, Session, SessionRegistry};
use agentd_protocol::{FramedMessage, MessageCode};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const IDLE_SLEEP: Duration = Duration::from_secs(30);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// A session is reconciliation-capable if it carries the `CONTROL` role —
/// the server side that accepts bulk acknowledgement frames
/// (`spec.md` §4.3 "a live session that supports bulk reconciliation").
fn pick_bulk_session(session_registry: &SessionRegistry, server_id: u64) -> Option<Arc<Session>> {
    session_registry
        .sessions_for_server(server_id)
        .into_iter()
        .find(|s| s.role.contains(RoleFlags::CONTROL))
}

/// Jittered exponential backoff for repeated "busy"/"processing" replies,
/// capped at [`MAX_BACKOFF`]. `attempt` is clamped internally.
fn backoff_for_attempt(attempt: u32, jitter_ms: u64) -> Duration {
    let capped = attempt.min(6);
    let base = Duration::from_secs(1 << capped).min(MAX_BACKOFF);
    base + Duration::from_millis(jitter_ms % 1000)
}

pub async fn run(
    db: DbPool,
    sync_status: Arc<DashMap<u64, ServerSyncStatus>>,
    session_registry: Arc<SessionRegistry>,
    block_size: usize,
    shutdown: CancellationToken,
) {
    let mut attempt: u32 = 0;
    loop {
        if shutdown.is_cancelled() {
            return;
        }

        let due_servers: Vec<u64> = sync_status
            .iter()
            .filter(|e| e.queued > 0)
            .map(|e| *e.key())
            .collect();

        let mut did_work = false;
        let mut busy = false;

        for server_id in due_servers {
            let Some(session) = pick_bulk_session(&session_registry, server_id) else {
                continue;
            };
            match reconcile_server(&db, &sync_status, &session, server_id, block_size).await {
                Ok(ReconcileOutcome::Busy) => busy = true,
                Ok(ReconcileOutcome::Progressed) => did_work = true,
                Ok(ReconcileOutcome::Exhausted) => {}
                Err(e) => warn!(server_id, error = %e, "reconciliation pass failed"),
            }
        }

        if busy {
            attempt += 1;
            let jitter = now_ms() as u64;
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(backoff_for_attempt(attempt, jitter)) => {}
            }
            continue;
        }
        attempt = 0;

        if !did_work {
            flush_idle(&db).await;
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(IDLE_SLEEP) => {}
            }
        }
    }
}

enum ReconcileOutcome {
    Progressed,
    Busy,
    Exhausted,
}

async fn reconcile_server(
    db: &DbPool,
    sync_status: &Arc<DashMap<u64, ServerSyncStatus>>,
    session: &Arc<Session>,
    server_id: u64,
    block_size: usize,
) -> crate::error::AgentResult<ReconcileOutcome> {
    let db = db.clone();
    let batch = tokio::task::spawn_blocking(move || -> crate::error::AgentResult<Vec<DataElement>> {
        let conn = db
            .get()
            .map_err(|e| crate::error::AgentError::InternalError(format!("db pool: {e}")))?;
        queries::select_batch(&conn, server_id, block_size)
    })
    .await
    .map_err(|e| crate::error::AgentError::InternalError(format!("reconciler join: {e}")))??;

    if batch.is_empty() {
        return Ok(ReconcileOutcome::Exhausted);
    }

    let (scalars, tables): (Vec<_>, Vec<_>) =
        batch.into_iter().partition(|e| e.dci_type != DciType::Table);

    let mut delivered = Vec::new();
    let mut retry_keys = Vec::new();

    if !scalars.is_empty() {
        let id = session.next_id();
        let frame = build_bulk_frame(&scalars, id);
        let reply_rx = session.wait_for(MessageCode::RequestCompleted, id).await;
        if session.send(frame).await.is_err() {
            return Ok(ReconcileOutcome::Exhausted);
        }
        match tokio::time::timeout(Duration::from_secs(30), reply_rx).await {
            Ok(Ok(reply)) => {
                if is_busy_reply(&reply) {
                    return Ok(ReconcileOutcome::Busy);
                }
                let retry_mask = reply
                    .field(1)
                    .and_then(|v| match v {
                        agentd_protocol::FieldValue::Binary(bytes) => Some(bytes.clone()),
                        _ => None,
                    })
                    .unwrap_or_default();
                for (idx, element) in scalars.iter().enumerate() {
                    let should_retry = retry_mask.get(idx).copied().unwrap_or(0) != 0;
                    if should_retry {
                        retry_keys.push(element.unique_key());
                    } else {
                        delivered.push(element.unique_key());
                    }
                }
            }
            _ => return Ok(ReconcileOutcome::Busy),
        }
    }

    for table_element in &tables {
        let id = session.next_id();
        let frame = build_single_frame(table_element, id);
        let reply_rx = session.wait_for(MessageCode::RequestCompleted, id).await;
        if session.send(frame).await.is_err() {
            break;
        }
        match tokio::time::timeout(Duration::from_secs(30), reply_rx).await {
            Ok(Ok(reply)) if !is_busy_reply(&reply) => delivered.push(table_element.unique_key()),
            _ => retry_keys.push(table_element.unique_key()),
        }
    }

    let delivered_count = delivered.len() as u64;
    if !delivered.is_empty() {
        let db = db.clone();
        let keys = delivered;
        tokio::task::spawn_blocking(move || -> crate::error::AgentResult<()> {
            let mut conn = db
                .get()
                .map_err(|e| crate::error::AgentError::InternalError(format!("db pool: {e}")))?;
            queries::delete_queue_rows(&mut conn, &keys)
        })
        .await
        .map_err(|e| crate::error::AgentError::InternalError(format!("reconciler join: {e}")))??;
    }

    if let Some(mut status) = sync_status.get_mut(&server_id) {
        status.queued = status.queued.saturating_sub(delivered_count);
        status.last_sync_ms = now_ms();
    }

    debug!(server_id, delivered = delivered_count, retried = retry_keys.len(), "reconciliation pass");
    Ok(ReconcileOutcome::Progressed)
}

fn is_busy_reply(reply: &FramedMessage) -> bool {
    reply
        .field(99)
        .and_then(|v| v.as_u32())
        .map(|code| code == 1)
        .unwrap_or(false)
}

fn build_bulk_frame(elements: &[DataElement], id: u32) -> FramedMessage {
    let mut msg = FramedMessage::new(MessageCode::DciData, id);
    msg.set_field(2, elements.len() as u32);
    for (idx, element) in elements.iter().enumerate() {
        let base = 100 + idx as u32 * 4;
        msg.set_field(base, element.server_id);
        msg.set_field(base + 1, element.dci_id);
        msg.set_field(base + 2, element.timestamp_ms as u64);
        msg.set_field(base + 3, element.scalar_value.clone().unwrap_or_default());
    }
    msg
}

fn build_single_frame(element: &DataElement, id: u32) -> FramedMessage {
    let mut msg = FramedMessage::new(MessageCode::DciData, id)
        .with_field(1, element.server_id)
        .with_field(2, element.dci_id)
        .with_field(3, element.timestamp_ms as u64);
    if let Some(table) = &element.table_value {
        msg.set_field(7, table.clone());
    }
    msg
}

async fn flush_idle(db: &DbPool) {
    let db = db.clone();
    let _ = tokio::task::spawn_blocking(move || -> crate::error::AgentResult<()> {
        let conn = db
            .get()
            .map_err(|e| crate::error::AgentError::InternalError(format!("db pool: {e}")))?;
        queries::vacuum(&conn)
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_is_capped() {
        assert!(backoff_for_attempt(1, 0) < backoff_for_attempt(5, 0));
        assert!(backoff_for_attempt(20, 0) <= MAX_BACKOFF + Duration::from_millis(999));
    }
}
