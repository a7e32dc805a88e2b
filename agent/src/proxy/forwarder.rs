//! Drains the notification-processor queue fed by the trap and syslog
//! receivers into every live session toward a server that accepts traps
//! (`spec.md` §4.4 "enqueued into a notification-processor queue that is
//! drained by a forwarder into any current sessions toward servers that
//! accept traps").

use super::{NotificationKind, NotificationRecord};
use crate::session::{RoleFlags, SessionRegistry};
use agentd_protocol::{FramedMessage, MessageCode};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

fn record_to_message(record: &NotificationRecord, id: u32) -> FramedMessage {
    let (code, payload_field) = match &record.kind {
        NotificationKind::SnmpTrap(pdu) => (MessageCode::SnmpTrap, pdu.clone()),
        NotificationKind::SyslogLine(line) => (MessageCode::SyslogRecords, line.clone()),
    };
    FramedMessage::new(code, id)
        .with_field(1, record.zone_uin)
        .with_field(2, record.source_addr.to_string())
        .with_field(3, record.arrival_ms as u64)
        .with_field(4, payload_field)
}

/// A session "accepts traps" if it is not read-only, the same predicate
/// the data-collection sender uses for "can accept data".
fn accepts_traps(role: RoleFlags) -> bool {
    !role.contains(RoleFlags::READ_ONLY)
}

pub async fn run(
    mut queue: mpsc::Receiver<NotificationRecord>,
    session_registry: Arc<SessionRegistry>,
    shutdown: CancellationToken,
) {
    loop {
        let record = tokio::select! {
            _ = shutdown.cancelled() => return,
            received = queue.recv() => match received {
                Some(r) => r,
                None => return,
            },
        };

        let targets: Vec<_> = session_registry
            .values_snapshot()
            .into_iter()
            .filter(|s| accepts_traps(s.role))
            .collect();

        if targets.is_empty() {
            debug!("no session available to forward notification, dropping");
            continue;
        }

        for session in targets {
            let id = session.next_id();
            let message = record_to_message(&record, id);
            let _ = session.send(message).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Session, SessionOrigin};
    use crate::transport::VirtualSession;
    use std::net::SocketAddr;

    #[tokio::test]
    async fn notification_is_forwarded_to_every_non_read_only_session() {
        let session_registry = Arc::new(SessionRegistry::new(16));
        let accepting = Arc::new(Session::new(
            SessionOrigin::Inbound,
            RoleFlags::CONTROL,
            false,
            Arc::new(VirtualSession::new()),
        ));
        let read_only = Arc::new(Session::new(
            SessionOrigin::Inbound,
            RoleFlags::READ_ONLY,
            false,
            Arc::new(VirtualSession::new()),
        ));
        session_registry.register(accepting.clone()).unwrap();
        session_registry.register(read_only).unwrap();

        let (tx, rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();
        let record = NotificationRecord {
            zone_uin: 7,
            source_addr: "127.0.0.1:162".parse::<SocketAddr>().unwrap(),
            arrival_ms: 0,
            kind: NotificationKind::SyslogLine(b"hello".to_vec()),
        };
        tx.send(record).await.unwrap();
        drop(tx);

        run(rx, session_registry, shutdown).await;
    }
}
