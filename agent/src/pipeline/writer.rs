//! The database writer task (`spec.md` §4.3 "Database writer"): drains the
//! writer queue in batches, committing each batch as one transaction, so
//! the sender never blocks on disk.

use crate::db::{queries, DbPool};
use crate::model::{DataElement, ServerSyncStatus};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Drains up to `max_transaction_size` queued elements and commits them in
/// one transaction, sleeping `flush_interval_ms` between drains.
pub async fn run(
    mut writer_rx: mpsc::Receiver<DataElement>,
    db: DbPool,
    sync_status: Arc<DashMap<u64, ServerSyncStatus>>,
    max_transaction_size: usize,
    flush_interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        let mut batch = Vec::with_capacity(max_transaction_size);
        while batch.len() < max_transaction_size {
            match writer_rx.try_recv() {
                Ok(element) => batch.push(element),
                Err(_) => break,
            }
        }

        if batch.is_empty() {
            if shutdown.is_cancelled() {
                return;
            }
            tokio::select! {
                _ = shutdown.cancelled() => return,
                received = writer_rx.recv() => match received {
                    Some(element) => batch.push(element),
                    None => return,
                },
                _ = tokio::time::sleep(flush_interval) => continue,
            }
        }

        if let Err(e) = commit_batch(&db, &batch).await {
            warn!(error = %e, "failed to commit data-collection batch");
            continue;
        }

        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(flush_interval) => {}
        }
    }
}

async fn commit_batch(db: &DbPool, batch: &[DataElement]) -> crate::error::AgentResult<()> {
    let db = db.clone();
    let batch = batch.to_vec();
    tokio::task::spawn_blocking(move || -> crate::error::AgentResult<()> {
        let mut conn = db
            .get()
            .map_err(|e| crate::error::AgentError::InternalError(format!("db pool: {e}")))?;
        let tx = conn.transaction()?;
        for element in &batch {
            queries::enqueue_element(&tx, element)?;
        }
        tx.commit()?;
        Ok(())
    })
    .await
    .map_err(|e| crate::error::AgentError::InternalError(format!("writer task join: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::model::{now_ms, DciOrigin, DciStatus, DciType};
    use tempfile::tempdir;

    fn sample_element(ts: i64) -> DataElement {
        DataElement {
            server_id: 1,
            dci_id: 1,
            origin: DciOrigin::LocalAgent,
            dci_type: DciType::Scalar,
            status: DciStatus::Success,
            snmp_source_guid: None,
            timestamp_ms: ts,
            scalar_value: Some("42".into()),
            table_value: None,
        }
    }

    #[tokio::test]
    async fn commit_batch_persists_every_element() {
        let dir = tempdir().unwrap();
        let pool = db::open(&dir.path().join("agentd.db")).unwrap();
        let batch = vec![sample_element(now_ms()), sample_element(now_ms() + 1)];
        commit_batch(&pool, &batch).await.unwrap();

        let conn = pool.get().unwrap();
        assert_eq!(queries::count_queued(&conn, 1).unwrap(), 2);
    }
}
