//! The data-collection pipeline (`spec.md` §4.3, §5): configuration
//! intake, the scheduler, per-item collectors, the sender, the database
//! writer, reconciliation, and stalled-data expiration.

pub mod collector;
pub mod expiration;
pub mod pool;
pub mod reconciler;
pub mod scheduler;
pub mod sender;
pub mod writer;

use crate::config::Config;
use crate::db::{queries, DbPool};
use crate::error::AgentResult;
use crate::model::{
    DataCollectionItem, DataCollectionProxy, DataCollectionSnapshot, ServerSyncStatus, SnmpTarget,
    ZoneConfiguration,
};
use crate::proxy::snmp::SnmpProxyPool;
use crate::proxy::ProxyCounters;
use crate::registry::metrics::MetricRegistry;
use crate::session::SessionRegistry;
use dashmap::DashMap;
use pool::CollectorPool;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

const ELEMENT_QUEUE_CAPACITY: usize = 4096;
const WRITER_QUEUE_CAPACITY: usize = 4096;

/// The in-memory state shared by every pipeline task, plus the database
/// pool everything ultimately persists to (`spec.md` §3, §9 "Global
/// mutable state").
pub struct Pipeline {
    pub items: Arc<DashMap<(u64, u64), DataCollectionItem>>,
    pub snmp_targets: Arc<DashMap<Uuid, SnmpTarget>>,
    pub proxies: Arc<DashMap<(u64, u32), DataCollectionProxy>>,
    pub zones: Arc<DashMap<u64, ZoneConfiguration>>,
    pub sync_status: Arc<DashMap<u64, ServerSyncStatus>>,
    pub db: DbPool,
    pub snmp_pool: Arc<SnmpProxyPool>,
    pub proxy_counters: Arc<ProxyCounters>,
    element_tx: mpsc::Sender<crate::model::DataElement>,
}

impl Pipeline {
    pub fn new(
        db: DbPool,
        snmp_poller_cap: usize,
        element_tx: mpsc::Sender<crate::model::DataElement>,
    ) -> Self {
        Self {
            items: Arc::new(DashMap::new()),
            snmp_targets: Arc::new(DashMap::new()),
            proxies: Arc::new(DashMap::new()),
            zones: Arc::new(DashMap::new()),
            sync_status: Arc::new(DashMap::new()),
            db,
            snmp_pool: Arc::new(SnmpProxyPool::new(snmp_poller_cap)),
            proxy_counters: Arc::new(ProxyCounters::default()),
            element_tx,
        }
    }

    /// Loads the live maps for `server_id` from the database, for use at
    /// startup before the first snapshot push arrives.
    pub fn hydrate_server(&self, server_id: u64) -> AgentResult<()> {
        let conn = self.db.get().map_err(|e| {
            crate::error::AgentError::InternalError(format!("db pool: {e}"))
        })?;
        for item in queries::load_items_for_server(&conn, server_id)? {
            self.items.insert(item.key(), item);
        }
        for target in queries::load_snmp_targets_for_server(&conn, server_id)? {
            self.snmp_targets.insert(target.guid, target);
        }
        for proxy in queries::load_proxies_for_server(&conn, server_id)? {
            self.proxies.insert((proxy.server_id, proxy.proxy_id), proxy);
        }
        if let Some(zone) = queries::load_zone_config(&conn, server_id)? {
            self.zones.insert(server_id, zone);
        }
        Ok(())
    }

    /// Applies a configuration-intake snapshot under one database
    /// transaction, then mirrors the result into the live maps
    /// (`spec.md` §4.3 "Configuration intake", five numbered steps).
    pub async fn apply_snapshot(&self, snapshot: DataCollectionSnapshot) -> AgentResult<()> {
        let db = self.db.clone();
        let snapshot_for_db = snapshot.clone();
        let removed = tokio::task::spawn_blocking(move || -> AgentResult<Vec<(u64, u64)>> {
            let mut conn = db.get().map_err(|e| {
                crate::error::AgentError::InternalError(format!("db pool: {e}"))
            })?;
            let tx = conn.transaction()?;

            // 1. Upsert SNMP targets and persist.
            for target in &snapshot_for_db.snmp_targets {
                queries::upsert_snmp_target(&tx, target)?;
            }

            // 2 & 5. Build + persist the new proxy map for this server.
            // (Done against the outer connection below since it needs
            // `&mut Connection` for its own nested transaction; see note.)

            // 3. Upsert every item in the snapshot.
            for item in &snapshot_for_db.items {
                queries::upsert_item(&tx, item)?;
            }

            // 4. Delete anything this server owns that the snapshot
            // doesn't mention anymore.
            let keep_ids: Vec<u64> = snapshot_for_db.items.iter().map(|i| i.dci_id).collect();
            let removed = queries::delete_items_not_in(&tx, snapshot_for_db.server_id, &keep_ids)?;

            if let Some(zone) = &snapshot_for_db.zone {
                queries::upsert_zone_config(&tx, zone)?;
            }

            tx.commit()?;
            drop(conn);
            Ok(removed)
        })
        .await
        .map_err(|e| crate::error::AgentError::InternalError(format!("apply_snapshot join: {e}")))??;

        // Proxies are replaced via their own small transaction (the helper
        // takes `&mut Connection` directly, matching its other callers).
        {
            let db = self.db.clone();
            let proxies = snapshot.proxies.clone();
            let server_id = snapshot.server_id;
            tokio::task::spawn_blocking(move || -> AgentResult<()> {
                let mut conn = db.get().map_err(|e| {
                    crate::error::AgentError::InternalError(format!("db pool: {e}"))
                })?;
                queries::replace_proxies_for_server(&mut conn, server_id, &proxies)
            })
            .await
            .map_err(|e| crate::error::AgentError::InternalError(format!("apply_snapshot join: {e}")))??;
        }

        for target in snapshot.snmp_targets {
            self.snmp_targets.insert(target.guid, target);
        }
        for item in snapshot.items {
            self.items.insert(item.key(), item);
        }
        for (server_id, dci_id) in removed {
            self.items.remove(&(server_id, dci_id));
        }
        self.proxies.retain(|k, _| k.0 != snapshot.server_id);
        for proxy in snapshot.proxies {
            self.proxies.insert((proxy.server_id, proxy.proxy_id), proxy);
        }
        if let Some(zone) = snapshot.zone {
            self.zones.insert(snapshot.server_id, zone);
        }

        info!(server_id = snapshot.server_id, "applied data-collection configuration snapshot");
        Ok(())
    }
}

/// Spawns every pipeline task and returns once `shutdown` has stopped all
/// of them (`spec.md` §4.7 "each of the above is its own supervised task").
pub async fn run_all(
    pipeline: Arc<Pipeline>,
    config: Arc<Config>,
    metric_registry: Arc<MetricRegistry>,
    session_registry: Arc<SessionRegistry>,
    element_rx: mpsc::Receiver<crate::model::DataElement>,
    shutdown: CancellationToken,
) {
    let pool = Arc::new(CollectorPool::new(config.max_collector_pool.max(config.min_collector_pool)));
    let (writer_tx, writer_rx) = mpsc::channel(WRITER_QUEUE_CAPACITY);

    let mut tasks = tokio::task::JoinSet::new();

    tasks.spawn(scheduler::run(
        pipeline.items.clone(),
        pipeline.proxies.clone(),
        pipeline.snmp_targets.clone(),
        metric_registry,
        pool,
        pipeline.snmp_pool.clone(),
        pipeline.proxy_counters.clone(),
        config.snmp_request_timeout,
        pipeline.element_tx.clone(),
        shutdown.clone(),
    ));

    tasks.spawn(sender::run(
        element_rx,
        writer_tx,
        pipeline.sync_status.clone(),
        session_registry.clone(),
        shutdown.clone(),
    ));

    tasks.spawn(writer::run(
        writer_rx,
        pipeline.db.clone(),
        pipeline.sync_status.clone(),
        config.max_transaction_size,
        std::time::Duration::from_millis(config.flush_interval_ms),
        shutdown.clone(),
    ));

    tasks.spawn(reconciler::run(
        pipeline.db.clone(),
        pipeline.sync_status.clone(),
        session_registry,
        config.reconciliation_block_size,
        shutdown.clone(),
    ));

    tasks.spawn(expiration::run(
        pipeline.db.clone(),
        pipeline.items.clone(),
        pipeline.sync_status.clone(),
        config.offline_expiration_days,
        shutdown,
    ));

    while tasks.join_next().await.is_some() {}
}

/// The `(element_tx, element_rx)` pair a supervisor wires between
/// [`Pipeline::new`] and [`run_all`].
pub fn element_channel() -> (mpsc::Sender<crate::model::DataElement>, mpsc::Receiver<crate::model::DataElement>) {
    mpsc::channel(ELEMENT_QUEUE_CAPACITY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DciOrigin, DciType};
    use tempfile::tempdir;

    fn sample_item(server_id: u64, dci_id: u64) -> DataCollectionItem {
        DataCollectionItem {
            server_id,
            dci_id,
            origin: DciOrigin::LocalAgent,
            dci_type: DciType::Scalar,
            metric_name: "Agent.Uptime".into(),
            polling_interval_secs: 10,
            schedules: Vec::new(),
            snmp_target_guid: None,
            snmp_port: None,
            snmp_version: None,
            snmp_raw_oid: None,
            snmp_columns: Vec::new(),
            backup_proxy_id: None,
            last_poll_ms: 0,
            busy: false,
            disabled: false,
        }
    }

    #[tokio::test]
    async fn apply_snapshot_populates_live_maps_and_drops_missing_items() {
        let dir = tempdir().unwrap();
        let db = crate::db::open(&dir.path().join("agentd.db")).unwrap();
        let (tx, _rx) = element_channel();
        let pipeline = Pipeline::new(db, 64, tx);

        pipeline.items.insert((1, 99), sample_item(1, 99));

        let snapshot = DataCollectionSnapshot {
            server_id: 1,
            snmp_targets: Vec::new(),
            proxies: Vec::new(),
            zone: None,
            items: vec![sample_item(1, 1)],
            has_schedule_extras: false,
        };
        pipeline.apply_snapshot(snapshot).await.unwrap();

        assert!(pipeline.items.contains_key(&(1, 1)));
        assert!(!pipeline.items.contains_key(&(1, 99)));
    }
}
