//! The sender task (`spec.md` §4.3 "Sender"): the single path a freshly
//! collected [`DataElement`] takes either straight to a live session or
//! into the database-writer queue, and the rule that keeps per-DCI
//! ordering intact while doing so.

use crate::model::{now_ms, DataElement, DciStatus, ServerSyncStatus};
use crate::session::{RoleFlags, SessionRegistry};
use agentd_protocol::{FramedMessage, MessageCode};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

fn status_u16(status: DciStatus) -> u16 {
    match status {
        DciStatus::Success => 0,
        DciStatus::NoSuchMetric => 1,
        DciStatus::NoSuchInstance => 2,
        DciStatus::Unsupported => 3,
        DciStatus::Timeout => 4,
        DciStatus::InternalError => 5,
    }
}

/// Encodes a [`DataElement`] as a `DCI_DATA` frame.
pub fn element_to_message(element: &DataElement, id: u32) -> FramedMessage {
    let mut msg = FramedMessage::new(MessageCode::DciData, id)
        .with_field(1, element.server_id)
        .with_field(2, element.dci_id)
        .with_field(3, element.timestamp_ms as u64)
        .with_field(4, status_u16(element.status));
    if let Some(guid) = element.snmp_source_guid {
        msg.set_field(5, guid);
    }
    if let Some(scalar) = &element.scalar_value {
        msg.set_field(6, scalar.clone());
    }
    if let Some(table) = &element.table_value {
        msg.set_field(7, table.clone());
    }
    msg
}

/// A session "can accept data" if it is registered for the element's
/// server and was not admitted read-only.
fn pick_data_session(
    session_registry: &SessionRegistry,
    server_id: u64,
) -> Option<Arc<crate::session::Session>> {
    session_registry
        .sessions_for_server(server_id)
        .into_iter()
        .find(|s| !s.role.contains(RoleFlags::READ_ONLY))
}

/// Drives the sender loop until `shutdown` fires and the element channel
/// is drained and closed.
pub async fn run(
    mut element_rx: mpsc::Receiver<DataElement>,
    writer_tx: mpsc::Sender<DataElement>,
    sync_status: Arc<DashMap<u64, ServerSyncStatus>>,
    session_registry: Arc<SessionRegistry>,
    shutdown: CancellationToken,
) {
    loop {
        let element = tokio::select! {
            _ = shutdown.cancelled() => return,
            received = element_rx.recv() => match received {
                Some(e) => e,
                None => return,
            },
        };
        handle_one(element, &writer_tx, &sync_status, &session_registry).await;
    }
}

async fn handle_one(
    element: DataElement,
    writer_tx: &mpsc::Sender<DataElement>,
    sync_status: &Arc<DashMap<u64, ServerSyncStatus>>,
    session_registry: &Arc<SessionRegistry>,
) {
    let server_id = element.server_id;
    let queued_now = sync_status.get(&server_id).map(|s| s.queued).unwrap_or(0);

    if queued_now == 0 {
        if let Some(session) = pick_data_session(session_registry, server_id) {
            let id = session.next_id();
            let message = element_to_message(&element, id);
            if session.send(message).await.is_ok() {
                return;
            }
        }
    }

    let mut entry = sync_status.entry(server_id).or_insert_with(ServerSyncStatus::default);
    entry.queued += 1;
    drop(entry);

    if writer_tx.send(element).await.is_err() {
        debug!(server_id, "database writer channel closed, element dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DciOrigin, DciType};
    use crate::session::SessionOrigin;
    use crate::transport::VirtualSession;

    fn sample_element(server_id: u64) -> DataElement {
        DataElement {
            server_id,
            dci_id: 1,
            origin: DciOrigin::LocalAgent,
            dci_type: DciType::Scalar,
            status: DciStatus::Success,
            snmp_source_guid: None,
            timestamp_ms: now_ms(),
            scalar_value: Some("1".into()),
            table_value: None,
        }
    }

    #[tokio::test]
    async fn element_with_no_live_session_is_enqueued_for_the_writer() {
        let sync_status: Arc<DashMap<u64, ServerSyncStatus>> = Arc::new(DashMap::new());
        let session_registry = Arc::new(SessionRegistry::new(16));
        let (writer_tx, mut writer_rx) = mpsc::channel(4);

        handle_one(sample_element(1), &writer_tx, &sync_status, &session_registry).await;

        assert_eq!(sync_status.get(&1).unwrap().queued, 1);
        assert!(writer_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn already_queued_server_forces_elements_through_the_writer() {
        let sync_status: Arc<DashMap<u64, ServerSyncStatus>> = Arc::new(DashMap::new());
        sync_status.insert(1, ServerSyncStatus { queued: 3, last_sync_ms: 0 });
        let session = Arc::new(crate::session::Session::new(
            SessionOrigin::Inbound,
            RoleFlags::CONTROL,
            false,
            Arc::new(VirtualSession::new()),
        ));
        session.set_server_id(1);
        let session_registry = Arc::new(SessionRegistry::new(16));
        session_registry.register(session).unwrap();
        let (writer_tx, mut writer_rx) = mpsc::channel(4);

        handle_one(sample_element(1), &writer_tx, &sync_status, &session_registry).await;

        assert_eq!(sync_status.get(&1).unwrap().queued, 4);
        assert!(writer_rx.try_recv().is_ok());
    }
}
