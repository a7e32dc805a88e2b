//! The scheduler task (`spec.md` §4.3 "Scheduler"): one task, ticking on a
//! dynamic sleep bounded above by 60s, deciding per item whether it is due
//! and, if so, handing it to the [`super::pool::CollectorPool`].

use super::pool::CollectorPool;
use crate::model::{now_ms, DataCollectionItem, DataCollectionProxy, SnmpTarget};
use crate::proxy::snmp::SnmpProxyPool;
use crate::proxy::ProxyCounters;
use crate::registry::metrics::MetricRegistry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

const MAX_TICK_WAIT: Duration = Duration::from_secs(60);

/// Whether `item` is due to run on this tick, given the current proxy map.
/// `spec.md` §4.3 "Per-item decision":
/// - disabled items are always skipped;
/// - a zero/absent backup-proxy schedules unconditionally;
/// - otherwise the named proxy must exist and currently be disconnected.
pub fn is_due(
    item: &DataCollectionItem,
    now: i64,
    proxies: &DashMap<(u64, u32), DataCollectionProxy>,
) -> bool {
    if item.disabled || item.busy {
        return false;
    }
    let proxy_gate = match item.backup_proxy_id {
        None | Some(0) => true,
        Some(proxy_id) => proxies
            .get(&(item.server_id, proxy_id))
            .map(|p| !p.connected)
            .unwrap_or(false),
    };
    if !proxy_gate {
        return false;
    }
    item.time_to_next_poll_ms(now) == Some(0)
}

/// Drives the tick loop until `shutdown` fires. `items` is the live
/// in-memory map the configuration-intake handler also writes to.
pub async fn run(
    items: Arc<DashMap<(u64, u64), DataCollectionItem>>,
    proxies: Arc<DashMap<(u64, u32), DataCollectionProxy>>,
    snmp_targets: Arc<DashMap<Uuid, SnmpTarget>>,
    metric_registry: Arc<MetricRegistry>,
    pool: Arc<CollectorPool>,
    snmp_pool: Arc<SnmpProxyPool>,
    proxy_counters: Arc<ProxyCounters>,
    snmp_timeout: Duration,
    element_tx: mpsc::Sender<crate::model::DataElement>,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        let now = now_ms();
        let mut next_wait = MAX_TICK_WAIT;

        for mut entry in items.iter_mut() {
            let item = entry.value_mut();
            if item.disabled {
                continue;
            }
            if is_due(item, now, &proxies) {
                item.busy = true;
                item.last_poll_ms = now;
                // The item is due again in exactly its own interval from
                // now; fold that into next_wait too, or a same-tick batch
                // of short-interval items stalls at MAX_TICK_WAIT until
                // the next unrelated item happens to wake the loop sooner.
                let next_due = Duration::from_secs(item.polling_interval_secs as u64);
                if next_due < next_wait {
                    next_wait = next_due;
                }
                dispatch(
                    item,
                    &items,
                    &snmp_targets,
                    &metric_registry,
                    &pool,
                    &snmp_pool,
                    &proxy_counters,
                    snmp_timeout,
                    &element_tx,
                );
            } else if let Some(remaining_ms) = item.time_to_next_poll_ms(now) {
                let remaining = Duration::from_millis(remaining_ms.max(0) as u64);
                if remaining < next_wait {
                    next_wait = remaining;
                }
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(next_wait) => {}
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn dispatch(
    item: &DataCollectionItem,
    items: &Arc<DashMap<(u64, u64), DataCollectionItem>>,
    snmp_targets: &Arc<DashMap<Uuid, SnmpTarget>>,
    metric_registry: &Arc<MetricRegistry>,
    pool: &Arc<CollectorPool>,
    snmp_pool: &Arc<SnmpProxyPool>,
    proxy_counters: &Arc<ProxyCounters>,
    snmp_timeout: Duration,
    element_tx: &mpsc::Sender<crate::model::DataElement>,
) {
    let key = item.key();
    let item = item.clone();
    let metric_registry = metric_registry.clone();
    let element_tx = element_tx.clone();
    let items = items.clone();

    match item.snmp_target_guid {
        Some(guid) => {
            let snmp_targets = snmp_targets.clone();
            let snmp_pool = snmp_pool.clone();
            let proxy_counters = proxy_counters.clone();
            pool.submit_serialized(guid, async move {
                let Some(target) = snmp_targets.get(&guid).map(|t| t.clone()) else {
                    warn!(server_id = key.0, dci_id = key.1, "snmp target not found for due item");
                    let element = super::collector::element_from_scalar_result(
                        &item,
                        Some(guid),
                        Err(crate::error::AgentError::UnknownInstance),
                    );
                    let _ = element_tx.send(element).await;
                    if let Some(mut entry) = items.get_mut(&key) {
                        entry.busy = false;
                    }
                    return;
                };

                let element = if item.dci_type == crate::model::DciType::Table {
                    let base_oid = item.snmp_raw_oid.clone().unwrap_or_default();
                    let result = crate::proxy::snmp::collect_table(
                        &snmp_pool,
                        &target,
                        &base_oid,
                        &item.snmp_columns,
                        snmp_timeout,
                        &proxy_counters,
                    )
                    .await;
                    super::collector::element_from_table_result(&item, Some(guid), result)
                } else {
                    let raw_oid = item.snmp_raw_oid.clone().unwrap_or_default();
                    let result = crate::proxy::snmp::collect_scalar(
                        &snmp_pool,
                        &target,
                        &raw_oid,
                        snmp_timeout,
                        &proxy_counters,
                    )
                    .await;
                    super::collector::element_from_scalar_result(&item, Some(guid), result)
                };
                debug!(server_id = key.0, dci_id = key.1, "snmp item collected");
                let _ = element_tx.send(element).await;
                if let Some(mut entry) = items.get_mut(&key) {
                    entry.busy = false;
                }
            });
        }
        None => {
            pool.submit_general(async move {
                let element = super::collector::collect_local(&metric_registry, &item);
                let _ = element_tx.send(element).await;
                if let Some(mut entry) = items.get_mut(&key) {
                    entry.busy = false;
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DciOrigin, DciType};

    fn sample_item(backup_proxy_id: Option<u32>, last_poll_ms: i64) -> DataCollectionItem {
        DataCollectionItem {
            server_id: 1,
            dci_id: 1,
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
            backup_proxy_id,
            last_poll_ms,
            busy: false,
            disabled: false,
        }
    }

    #[test]
    fn disabled_item_is_never_due() {
        let mut item = sample_item(None, 0);
        item.disabled = true;
        let proxies = DashMap::new();
        assert!(!is_due(&item, 100_000, &proxies));
    }

    #[test]
    fn zero_backup_proxy_schedules_unconditionally() {
        let item = sample_item(Some(0), 0);
        let proxies = DashMap::new();
        assert!(is_due(&item, 10_000, &proxies));
    }

    #[test]
    fn named_proxy_gates_on_disconnected() {
        let item = sample_item(Some(7), 0);
        let proxies = DashMap::new();
        proxies.insert(
            (1, 7),
            DataCollectionProxy {
                server_id: 1,
                proxy_id: 7,
                address: "10.0.0.1".into(),
                in_use: true,
                connected: true,
            },
        );
        assert!(!is_due(&item, 10_000, &proxies));

        proxies.get_mut(&(1, 7)).unwrap().connected = false;
        assert!(is_due(&item, 10_000, &proxies));
    }

    #[test]
    fn not_yet_due_item_is_skipped() {
        let item = sample_item(None, 9_999);
        let proxies = DashMap::new();
        assert!(!is_due(&item, 10_000, &proxies));
    }
}
