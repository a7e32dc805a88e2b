//! Local IPC endpoints (`spec.md` §4.7 "Local IPC"): three Unix-domain
//! sockets accepting the same `FramedMessage` codec the network session
//! layer speaks, each with a narrow, dedicated handler.
//!
//! - `push` — `{name, value}` pairs from local producers, relayed to
//!   every session that accepts traps.
//! - `session-agent` — user-session-context messages, acknowledged and
//!   otherwise out of scope for this core.
//! - `master-agent` — sub-process metric queries answered directly from
//!   the in-process [`MetricRegistry`].

use crate::error::AgentResult;
use crate::model::now_ms;
use crate::proxy::{NotificationKind, NotificationRecord};
use crate::registry::metrics::MetricRegistry;
use crate::transport::{FramedIoTransport, Transport};
use agentd_protocol::{FieldValue, FramedMessage, MessageCode};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

async fn bind_socket(path: &Path) -> std::io::Result<UnixListener> {
    let _ = std::fs::remove_file(path);
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    UnixListener::bind(path)
}

async fn accept_loop<F, Fut>(
    path: PathBuf,
    shutdown: CancellationToken,
    handle: F,
) where
    F: Fn(Arc<FramedIoTransport>) -> Fut + Clone + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = match bind_socket(&path).await {
        Ok(l) => l,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to bind local IPC socket");
            return;
        }
    };
    info!(path = %path.display(), "local IPC socket ready");

    loop {
        let stream: UnixStream = tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => stream,
                Err(e) => {
                    warn!(error = %e, "local IPC accept failed");
                    continue;
                }
            },
        };
        let (transport, _reader, _writer) = FramedIoTransport::spawn(stream);
        let handle = handle.clone();
        tokio::spawn(async move { handle(transport).await });
    }
}

/// Runs the `push` endpoint until `shutdown` fires.
pub async fn run_push(
    path: PathBuf,
    zone_uin: u32,
    queue: mpsc::Sender<NotificationRecord>,
    shutdown: CancellationToken,
) {
    let handle = move |transport: Arc<FramedIoTransport>| {
        let queue = queue.clone();
        async move {
            while let Ok(Some(message)) = transport.recv().await {
                let name = message.field(1).and_then(FieldValue::as_str).unwrap_or_default();
                let value = message.field(2).and_then(FieldValue::as_str).unwrap_or_default();
                let record = NotificationRecord {
                    zone_uin,
                    source_addr: "127.0.0.1:0".parse().unwrap(),
                    arrival_ms: now_ms(),
                    kind: NotificationKind::SyslogLine(format!("{name}={value}").into_bytes()),
                };
                if queue.send(record).await.is_err() {
                    return;
                }
            }
        }
    };
    accept_loop(path, shutdown, handle).await;
}

/// Runs the `session-agent` endpoint until `shutdown` fires. Every frame
/// is acknowledged; interpreting user-session context is a collaborator
/// concern outside this core.
pub async fn run_session_agent(path: PathBuf, shutdown: CancellationToken) {
    let handle = |transport: Arc<FramedIoTransport>| async move {
        while let Ok(Some(message)) = transport.recv().await {
            debug!(code = ?message.code, "session-agent message received");
            let reply = FramedMessage::new(MessageCode::RequestCompleted, message.id);
            let _ = transport.send(reply).await;
        }
    };
    accept_loop(path, shutdown, handle).await;
}

/// Runs the `master-agent` endpoint until `shutdown` fires: answers
/// `GET_PARAMETER` queries from the in-process metric registry.
pub async fn run_master_agent(
    path: PathBuf,
    metric_registry: Arc<MetricRegistry>,
    shutdown: CancellationToken,
) {
    let handle = move |transport: Arc<FramedIoTransport>| {
        let metric_registry = metric_registry.clone();
        async move {
            while let Ok(Some(message)) = transport.recv().await {
                let reply = handle_master_agent_request(&metric_registry, &message);
                if transport.send(reply).await.is_err() {
                    return;
                }
            }
        }
    };
    accept_loop(path, shutdown, handle).await;
}

fn handle_master_agent_request(metric_registry: &MetricRegistry, message: &FramedMessage) -> FramedMessage {
    if message.code != MessageCode::GetParameter {
        return FramedMessage::new(MessageCode::RequestCompleted, message.id)
            .with_field(1, crate::error::ResultCode::UnknownCommand.as_u32());
    }
    let metric_name = message
        .field(1)
        .and_then(FieldValue::as_str)
        .unwrap_or_default();
    let (rcc, result) = metric_registry.get_metric(metric_name, None);
    let mut reply =
        FramedMessage::new(MessageCode::RequestCompleted, message.id).with_field(1, rcc.as_u32());
    if let Ok(value) = result {
        reply.set_field(2, value);
    }
    reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::metrics::{AgentMetricRegistration, MetricDataType, MetricRegistryBuilder};
    use tempfile::tempdir;

    #[tokio::test]
    async fn master_agent_answers_a_registered_metric() {
        let mut builder = MetricRegistryBuilder::new();
        builder.register(AgentMetricRegistration {
            name_pattern: "Agent.Test".into(),
            handler: Arc::new(|_name, _arg| Ok("42".to_string())),
            argument: None,
            data_type: MetricDataType::String,
        });
        let registry = builder.build();

        let request = FramedMessage::new(MessageCode::GetParameter, 1).with_field(1, "Agent.Test");
        let reply = handle_master_agent_request(&registry, &request);
        assert_eq!(
            reply.field(2).and_then(FieldValue::as_str),
            Some("42")
        );
    }

    #[tokio::test]
    async fn push_endpoint_forwards_name_value_pairs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("push.sock");
        let (queue_tx, mut queue_rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();

        let server = tokio::spawn(run_push(path.clone(), 7, queue_tx, shutdown.clone()));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let stream = UnixStream::connect(&path).await.unwrap();
        let (transport, _r, _w) = FramedIoTransport::spawn(stream);
        let message = FramedMessage::new(MessageCode::Unknown(900), 1)
            .with_field(1, "cpu.load")
            .with_field(2, "0.5");
        transport.send(message).await.unwrap();

        let record = tokio::time::timeout(std::time::Duration::from_secs(1), queue_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.zone_uin, 7);
        shutdown.cancel();
        server.abort();
    }
}
