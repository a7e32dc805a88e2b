//! Request dispatch (`spec.md` §4.1 "Dispatch"): the single `code ->
//! handler` table every decoded, authenticated request is routed
//! through, whichever transport the owning [`Session`] sits on — an
//! inbound TCP/TLS session or a tunnel-promoted virtual-channel session
//! (`spec.md` §2: "a `Session` is the single demultiplexing point").
//!
//! The reply convention (field(1) = RCC, field(2) = payload when the
//! request succeeds) generalizes the one `ipc.rs`'s master-agent bridge
//! already uses for `GET_PARAMETER`.

use crate::error::{AgentError, AgentResult, ResultCode};
use crate::model::{DataCollectionItem, DataCollectionSnapshot, DciOrigin, DciType};
use crate::pipeline::Pipeline;
use crate::registry::actions::ActionRegistry;
use crate::registry::aitools::AiToolRegistry;
use crate::registry::metrics::MetricRegistry;
use crate::session::{Session, SessionState};
use agentd_protocol::{FieldValue, FramedMessage, MessageCode, Table};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Everything a dispatched request needs besides the message itself.
/// One instance is shared by every live session regardless of which
/// transport it runs over.
#[derive(Clone)]
pub struct DispatchContext {
    pub pipeline: Arc<Pipeline>,
    pub metric_registry: Arc<MetricRegistry>,
    pub action_registry: Arc<ActionRegistry>,
    pub ai_tool_registry: Arc<AiToolRegistry>,
    pub snmp_request_timeout: Duration,
}

fn reply_rcc(id: u32, rcc: ResultCode) -> FramedMessage {
    FramedMessage::new(MessageCode::RequestCompleted, id).with_field(1, rcc.as_u32())
}

fn reply_ok(id: u32) -> FramedMessage {
    reply_rcc(id, ResultCode::Success)
}

fn reply_err(id: u32, err: &AgentError) -> FramedMessage {
    reply_rcc(id, err.rcc())
}

/// Drives one session's request loop: the authentication gate, tunnel
/// reset, then routing every other request through [`route`]. Shared
/// verbatim by inbound sessions and tunnel-promoted virtual sessions
/// (`spec.md` §4.2 "promoted to full inbound-session semantics").
pub async fn run_session(ctx: DispatchContext, session: Arc<Session>, shutdown: CancellationToken) -> AgentResult<()> {
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            received = session.recv_request() => received?,
        };
        let Some(message) = message else {
            return Ok(());
        };

        if message.code == MessageCode::ResetTunnel {
            session.transition(SessionState::Draining).await?;
            return Ok(());
        }

        if session.state().await == SessionState::Authenticating {
            if message.code != MessageCode::Authenticate {
                continue;
            }
            session.transition(SessionState::Ready).await?;
            session.send(reply_ok(message.id)).await?;
            continue;
        }

        let reply = route(&ctx, &session, message).await;
        session.send(reply).await?;
    }
}

/// The `code -> handler` table itself.
async fn route(ctx: &DispatchContext, session: &Arc<Session>, message: FramedMessage) -> FramedMessage {
    let id = message.id;
    match message.code {
        MessageCode::Keepalive => reply_ok(id),
        MessageCode::GetParameter => handle_get_parameter(ctx, &message),
        MessageCode::GetList => handle_get_list(ctx, &message),
        // MetricRegistry handlers are scalar-only (`spec.md` §4.5); there
        // is no table-valued local collector to serve this from.
        MessageCode::GetTable => reply_rcc(id, ResultCode::Unsupported),
        MessageCode::ConfigureDataCollection => handle_configure_data_collection(ctx, &message).await,
        MessageCode::Action => handle_action(ctx, &message).await,
        MessageCode::ExecuteAiTool => handle_execute_ai_tool(ctx, session, &message),
        MessageCode::GetAiToolSchema => handle_get_ai_tool_schema(ctx, &message),
        MessageCode::SnmpRequest => handle_snmp_request(ctx, &message).await,
        _ => reply_rcc(id, ResultCode::NotImplemented),
    }
}

fn handle_get_parameter(ctx: &DispatchContext, message: &FramedMessage) -> FramedMessage {
    let Some(name) = message.field(1).and_then(FieldValue::as_str) else {
        return reply_rcc(message.id, ResultCode::MalformedCommand);
    };
    let (rcc, result) = ctx.metric_registry.get_metric(name, None);
    let mut reply = reply_rcc(message.id, rcc);
    if let Ok(value) = result {
        reply.set_field(2, value);
    }
    reply
}

/// Splits the registry's scalar result on commas into a single-column
/// table — a pragmatic reading of `GET_LIST` given `MetricRegistry` has
/// no list-valued handler type of its own.
fn handle_get_list(ctx: &DispatchContext, message: &FramedMessage) -> FramedMessage {
    let Some(name) = message.field(1).and_then(FieldValue::as_str) else {
        return reply_rcc(message.id, ResultCode::MalformedCommand);
    };
    let (rcc, result) = ctx.metric_registry.get_metric(name, None);
    let mut reply = reply_rcc(message.id, rcc);
    if let Ok(value) = result {
        let mut table = Table::new(["value"]);
        for part in value.split(',') {
            table.push_row(vec![FieldValue::Str(part.to_string())]);
        }
        reply.set_field(2, table);
    }
    reply
}

async fn handle_configure_data_collection(ctx: &DispatchContext, message: &FramedMessage) -> FramedMessage {
    let id = message.id;
    let Some(server_id) = message.field(1).and_then(FieldValue::as_u64) else {
        return reply_rcc(id, ResultCode::MalformedCommand);
    };
    let Some(table) = message.field(2).and_then(FieldValue::as_table) else {
        return reply_rcc(id, ResultCode::MalformedCommand);
    };
    let items = match parse_items(server_id, table) {
        Ok(items) => items,
        Err(_) => return reply_rcc(id, ResultCode::MalformedCommand),
    };

    // Zone/proxy/SNMP-target push share this same message code on the
    // real wire but use a wire shape this build doesn't decode yet; this
    // handler carries the item list, which is all local/SNMP-proxied
    // polling needs to start (`DESIGN.md`).
    let snapshot = DataCollectionSnapshot {
        server_id,
        snmp_targets: Vec::new(),
        proxies: Vec::new(),
        zone: None,
        items,
        has_schedule_extras: false,
    };

    match ctx.pipeline.apply_snapshot(snapshot).await {
        Ok(()) => reply_ok(id),
        Err(e) => reply_err(id, &e),
    }
}

/// Decodes the item table carried by `CONFIGURE_DATA_COLLECTION`'s
/// field(2): one row per [`DataCollectionItem`], columns named
/// `dci_id`, `origin`, `dci_type`, `metric_name`,
/// `polling_interval_secs`, `snmp_target_guid`, `snmp_port`,
/// `snmp_version`, `snmp_raw_oid`, `backup_proxy_id`. A nil GUID or a
/// zero-valued optional column means "absent", matching the scheduler's
/// existing `None | Some(0)` convention for `backup_proxy_id`.
fn parse_items(server_id: u64, table: &Table) -> AgentResult<Vec<DataCollectionItem>> {
    let col = |name: &str| {
        table
            .columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| AgentError::MalformedCommand(format!("missing column {name}")))
    };
    let dci_id_col = col("dci_id")?;
    let origin_col = col("origin")?;
    let dci_type_col = col("dci_type")?;
    let metric_name_col = col("metric_name")?;
    let interval_col = col("polling_interval_secs")?;
    let snmp_target_col = col("snmp_target_guid")?;
    let snmp_port_col = col("snmp_port")?;
    let snmp_version_col = col("snmp_version")?;
    let snmp_oid_col = col("snmp_raw_oid")?;
    let backup_proxy_col = col("backup_proxy_id")?;

    let mut items = Vec::with_capacity(table.rows.len());
    for row in &table.rows {
        let dci_id = row
            .get(dci_id_col)
            .and_then(FieldValue::as_u64)
            .ok_or_else(|| AgentError::MalformedCommand("dci_id".into()))?;
        let origin = match row.get(origin_col).and_then(FieldValue::as_u32) {
            Some(0) => DciOrigin::LocalAgent,
            Some(1) => DciOrigin::Snmp,
            Some(2) => DciOrigin::Modbus,
            Some(3) => DciOrigin::Script,
            _ => return Err(AgentError::MalformedCommand("origin".into())),
        };
        let dci_type = match row.get(dci_type_col).and_then(FieldValue::as_u32) {
            Some(0) => DciType::Scalar,
            Some(1) => DciType::Table,
            _ => return Err(AgentError::MalformedCommand("dci_type".into())),
        };
        let metric_name = row
            .get(metric_name_col)
            .and_then(FieldValue::as_str)
            .ok_or_else(|| AgentError::MalformedCommand("metric_name".into()))?
            .to_string();
        let polling_interval_secs = row
            .get(interval_col)
            .and_then(FieldValue::as_u32)
            .ok_or_else(|| AgentError::MalformedCommand("polling_interval_secs".into()))?;
        let snmp_target_guid = match row.get(snmp_target_col) {
            Some(FieldValue::Guid(guid)) if !guid.is_nil() => Some(*guid),
            _ => None,
        };
        let snmp_port = row
            .get(snmp_port_col)
            .and_then(FieldValue::as_u32)
            .and_then(|p| if p == 0 { None } else { Some(p as u16) });
        let snmp_version = row
            .get(snmp_version_col)
            .and_then(FieldValue::as_u32)
            .and_then(|v| if v == 0 { None } else { Some(v as u8) });
        let snmp_raw_oid = row
            .get(snmp_oid_col)
            .and_then(FieldValue::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let backup_proxy_id = row
            .get(backup_proxy_col)
            .and_then(FieldValue::as_u32)
            .and_then(|p| if p == 0 { None } else { Some(p) });

        items.push(DataCollectionItem {
            server_id,
            dci_id,
            origin,
            dci_type,
            metric_name,
            polling_interval_secs,
            schedules: Vec::new(),
            snmp_target_guid,
            snmp_port,
            snmp_version,
            snmp_raw_oid,
            snmp_columns: Vec::new(),
            backup_proxy_id,
            last_poll_ms: 0,
            busy: false,
            disabled: false,
        });
    }
    Ok(items)
}

async fn handle_action(ctx: &DispatchContext, message: &FramedMessage) -> FramedMessage {
    let id = message.id;
    let Some(name) = message.field(1).and_then(FieldValue::as_str) else {
        return reply_rcc(id, ResultCode::MalformedCommand);
    };
    let args: Vec<String> = match message.field(2) {
        Some(FieldValue::Table(table)) => table
            .rows
            .iter()
            .filter_map(|row| row.first().and_then(FieldValue::as_str))
            .map(str::to_string)
            .collect(),
        Some(FieldValue::Str(s)) => s.split(',').map(str::to_string).collect(),
        _ => Vec::new(),
    };

    match ctx.action_registry.execute(name, &args).await {
        Ok(output) => {
            let mut reply = reply_ok(id);
            reply.set_field(2, output);
            reply
        }
        Err(e) => reply_err(id, &e),
    }
}

fn handle_execute_ai_tool(ctx: &DispatchContext, session: &Arc<Session>, message: &FramedMessage) -> FramedMessage {
    let id = message.id;
    let Some(name) = message.field(1).and_then(FieldValue::as_str) else {
        return reply_rcc(id, ResultCode::MalformedCommand);
    };
    let raw_args = message.field(2).and_then(FieldValue::as_str).unwrap_or("{}");
    match ctx.ai_tool_registry.invoke(name, raw_args, &session.id.to_string()) {
        Ok(value) => {
            let mut reply = reply_ok(id);
            reply.set_field(2, value.to_string());
            reply
        }
        Err(e) => reply_err(id, &e),
    }
}

fn handle_get_ai_tool_schema(ctx: &DispatchContext, message: &FramedMessage) -> FramedMessage {
    let id = message.id;
    let Some(name) = message.field(1).and_then(FieldValue::as_str) else {
        return reply_rcc(id, ResultCode::MalformedCommand);
    };
    match ctx.ai_tool_registry.schema_for(name) {
        Ok(schema) => {
            let mut reply = reply_ok(id);
            reply.set_field(2, schema.to_string());
            reply
        }
        Err(e) => reply_err(id, &e),
    }
}

/// Relays the opaque PDU in field(2) to the target address in field(1)
/// through the SNMP proxy pool, per `spec.md` §4.4 "SNMP request proxy".
async fn handle_snmp_request(ctx: &DispatchContext, message: &FramedMessage) -> FramedMessage {
    let id = message.id;
    let Some(target_str) = message.field(1).and_then(FieldValue::as_str) else {
        return reply_rcc(id, ResultCode::MalformedCommand);
    };
    let Ok(target) = target_str.parse::<SocketAddr>() else {
        return reply_rcc(id, ResultCode::BadArguments);
    };
    let Some(pdu) = message.field(2).and_then(|v| match v {
        FieldValue::Binary(bytes) => Some(bytes.clone()),
        _ => None,
    }) else {
        return reply_rcc(id, ResultCode::MalformedCommand);
    };

    match ctx
        .pipeline
        .snmp_pool
        .request(target, &pdu, ctx.snmp_request_timeout, &ctx.pipeline.proxy_counters)
        .await
    {
        Ok(response) => {
            let mut reply = reply_ok(id);
            reply.set_field(2, response);
            reply
        }
        Err(e) => reply_err(id, &e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use crate::registry::aitools::AiToolRegistry;
    use crate::registry::metrics::{AgentMetricRegistration, MetricDataType, MetricRegistryBuilder};
    use crate::session::{RoleFlags, SessionOrigin};
    use crate::transport::VirtualSession;
    use std::sync::Arc;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn test_context() -> (DispatchContext, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let db = crate::db::open(&dir.path().join("agentd.db")).unwrap();
        let (element_tx, _element_rx) = crate::pipeline::element_channel();
        let pipeline = Arc::new(Pipeline::new(db, 4, element_tx));

        let mut builder = MetricRegistryBuilder::new();
        builder.register(AgentMetricRegistration {
            name_pattern: "Agent.Uptime".into(),
            handler: Arc::new(|_name, _arg| Ok("42".to_string())),
            argument: None,
            data_type: MetricDataType::Int64,
        });

        let ctx = DispatchContext {
            pipeline,
            metric_registry: Arc::new(builder.build()),
            action_registry: Arc::new(ActionRegistry::new(Duration::from_secs(5))),
            ai_tool_registry: Arc::new(AiToolRegistry::new()),
            snmp_request_timeout: Duration::from_millis(50),
        };
        (ctx, dir)
    }

    fn test_session() -> Arc<Session> {
        Arc::new(Session::new(
            SessionOrigin::Inbound,
            RoleFlags::empty(),
            false,
            Arc::new(VirtualSession::new()),
        ))
    }

    #[tokio::test]
    async fn get_parameter_returns_success_and_value() {
        let (ctx, _dir) = test_context();
        let session = test_session();
        let request = FramedMessage::new(MessageCode::GetParameter, 1).with_field(1, "Agent.Uptime".to_string());
        let reply = route(&ctx, &session, request).await;
        assert_eq!(reply.field(1).and_then(FieldValue::as_u32), Some(ResultCode::Success.as_u32()));
        assert_eq!(reply.field(2).and_then(FieldValue::as_str), Some("42"));
    }

    #[tokio::test]
    async fn get_parameter_reports_unknown_metric() {
        let (ctx, _dir) = test_context();
        let session = test_session();
        let request = FramedMessage::new(MessageCode::GetParameter, 1).with_field(1, "Nope.Bogus".to_string());
        let reply = route(&ctx, &session, request).await;
        assert_eq!(
            reply.field(1).and_then(FieldValue::as_u32),
            Some(ResultCode::UnknownMetric.as_u32())
        );
        assert!(reply.field(2).is_none());
    }

    #[tokio::test]
    async fn get_table_is_unsupported() {
        let (ctx, _dir) = test_context();
        let session = test_session();
        let request = FramedMessage::new(MessageCode::GetTable, 1).with_field(1, "Agent.Uptime".to_string());
        let reply = route(&ctx, &session, request).await;
        assert_eq!(
            reply.field(1).and_then(FieldValue::as_u32),
            Some(ResultCode::Unsupported.as_u32())
        );
    }

    #[tokio::test]
    async fn configure_data_collection_populates_the_pipeline() {
        let (ctx, _dir) = test_context();
        let session = test_session();

        let mut table = Table::new([
            "dci_id",
            "origin",
            "dci_type",
            "metric_name",
            "polling_interval_secs",
            "snmp_target_guid",
            "snmp_port",
            "snmp_version",
            "snmp_raw_oid",
            "backup_proxy_id",
        ]);
        table.push_row(vec![
            FieldValue::Int64(1),
            FieldValue::Int32(0),
            FieldValue::Int32(0),
            FieldValue::Str("Agent.Uptime".into()),
            FieldValue::Int32(10),
            FieldValue::Guid(Uuid::nil()),
            FieldValue::Int32(0),
            FieldValue::Int32(0),
            FieldValue::Str(String::new()),
            FieldValue::Int32(0),
        ]);
        let request = FramedMessage::new(MessageCode::ConfigureDataCollection, 1)
            .with_field(1, 7u64)
            .with_field(2, table);
        let reply = route(&ctx, &session, request).await;
        assert_eq!(reply.field(1).and_then(FieldValue::as_u32), Some(ResultCode::Success.as_u32()));
        assert!(ctx.pipeline.items.contains_key(&(7, 1)));
    }

    #[tokio::test]
    async fn unhandled_code_reports_not_implemented() {
        let (ctx, _dir) = test_context();
        let session = test_session();
        let request = FramedMessage::new(MessageCode::InstallPackage, 1);
        let reply = route(&ctx, &session, request).await;
        assert_eq!(
            reply.field(1).and_then(FieldValue::as_u32),
            Some(ResultCode::NotImplemented.as_u32())
        );
    }

    #[tokio::test]
    async fn unknown_action_is_reported() {
        let (ctx, _dir) = test_context();
        let session = test_session();
        let request = FramedMessage::new(MessageCode::Action, 1).with_field(1, "Nope".to_string());
        let reply = route(&ctx, &session, request).await;
        assert_eq!(
            reply.field(1).and_then(FieldValue::as_u32),
            Some(ResultCode::UnknownCommand.as_u32())
        );
    }
}
