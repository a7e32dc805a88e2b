//! Stalled-data expiration (`spec.md` §4.3 "Stalled data expiration"): an
//! hourly sweep that drops everything the agent is holding for a server
//! that has not synced in `offline_expiration_days`.

use crate::db::{queries, DbPool};
use crate::model::{now_ms, DataCollectionItem, ServerSyncStatus};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);
const MS_PER_DAY: i64 = 86_400_000;

/// Servers whose `last_sync_ms` is stale enough to expire, given `now`.
pub fn stale_servers(statuses: &[(u64, u64, i64)], now: i64, offline_expiration_days: i64) -> Vec<u64> {
    let threshold_ms = offline_expiration_days * MS_PER_DAY;
    statuses
        .iter()
        .filter(|(_, _, last_sync_ms)| now - last_sync_ms > threshold_ms)
        .map(|(server_id, ..)| *server_id)
        .collect()
}

pub async fn run(
    db: DbPool,
    items: Arc<DashMap<(u64, u64), DataCollectionItem>>,
    sync_status: Arc<DashMap<u64, ServerSyncStatus>>,
    offline_expiration_days: i64,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
        }
        sweep_once(&db, &items, &sync_status, offline_expiration_days).await;
    }
}

async fn sweep_once(
    db: &DbPool,
    items: &Arc<DashMap<(u64, u64), DataCollectionItem>>,
    sync_status: &Arc<DashMap<u64, ServerSyncStatus>>,
    offline_expiration_days: i64,
) {
    let now = now_ms();
    let db_for_blocking = db.clone();
    let statuses = tokio::task::spawn_blocking(move || -> crate::error::AgentResult<Vec<(u64, u64, i64)>> {
        let conn = db_for_blocking
            .get()
            .map_err(|e| crate::error::AgentError::InternalError(format!("db pool: {e}")))?;
        queries::load_all_sync_status(&conn)
    })
    .await;

    let Ok(Ok(statuses)) = statuses else {
        return;
    };

    for server_id in stale_servers(&statuses, now, offline_expiration_days) {
        info!(server_id, "expiring stalled data for offline server");

        // Mark mid-flight items disabled before dropping them from the
        // live map, so a collector task already in flight writes a
        // no-op rather than resurrecting the entry.
        let keys: Vec<(u64, u64)> = items
            .iter()
            .filter(|e| e.key().0 == server_id)
            .map(|e| *e.key())
            .collect();
        for key in &keys {
            if let Some(mut item) = items.get_mut(key) {
                item.disabled = true;
            }
        }
        for key in &keys {
            items.remove(key);
        }
        sync_status.remove(&server_id);

        let db = db.clone();
        let _ = tokio::task::spawn_blocking(move || -> crate::error::AgentResult<()> {
            let mut conn = db
                .get()
                .map_err(|e| crate::error::AgentError::InternalError(format!("db pool: {e}")))?;
            queries::delete_server_data(&mut conn, server_id)
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_past_threshold_is_stale() {
        let now = 100 * MS_PER_DAY;
        let statuses = vec![(1u64, 0u64, 0i64)];
        assert_eq!(stale_servers(&statuses, now, 30), vec![1]);
    }

    #[test]
    fn recently_synced_server_is_not_stale() {
        let now = 10 * MS_PER_DAY;
        let statuses = vec![(1u64, 0u64, now - MS_PER_DAY)];
        assert!(stale_servers(&statuses, now, 30).is_empty());
    }
}
