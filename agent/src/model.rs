//! # Data Model
//!
//! The entities and lifecycles described in `spec.md` §3, shared across
//! the data-collection pipeline, the local database, and the proxies.

use agentd_protocol::Table;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DciOrigin {
    LocalAgent,
    Snmp,
    Modbus,
    Script,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DciType {
    Scalar,
    Table,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DciStatus {
    Success,
    NoSuchMetric,
    NoSuchInstance,
    Unsupported,
    Timeout,
    InternalError,
}

/// One SNMP table column descriptor: the relative OID suffix for the
/// column plus whether its string values should be hex-decoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnmpColumn {
    pub name: String,
    pub oid_suffix: String,
    pub hex_convert: bool,
}

/// A single scheduled collection target — `spec.md` §3 `DataCollectionItem`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataCollectionItem {
    pub server_id: u64,
    pub dci_id: u64,
    pub origin: DciOrigin,
    pub dci_type: DciType,
    pub metric_name: String,
    pub polling_interval_secs: u32,
    /// Cron-like schedule tokens; a non-empty set overrides
    /// `polling_interval_secs`. A schedule with a seconds field present
    /// drops tick granularity to 1s for this item.
    pub schedules: Vec<String>,
    pub snmp_target_guid: Option<Uuid>,
    pub snmp_port: Option<u16>,
    pub snmp_version: Option<u8>,
    pub snmp_raw_oid: Option<String>,
    pub snmp_columns: Vec<SnmpColumn>,
    pub backup_proxy_id: Option<u32>,
    pub last_poll_ms: i64,
    pub busy: bool,
    pub disabled: bool,
}

impl DataCollectionItem {
    pub fn key(&self) -> (u64, u64) {
        (self.server_id, self.dci_id)
    }

    /// Returns the seconds granularity the scheduler should use for this
    /// item's tick: 1s if any schedule token carries a seconds field
    /// (5-field crontab, no seconds, is assumed otherwise), else 60s.
    pub fn tick_granularity_secs(&self) -> u64 {
        let has_seconds_field = self
            .schedules
            .iter()
            .any(|s| s.split_whitespace().count() >= 6);
        if has_seconds_field {
            1
        } else {
            60
        }
    }

    /// Milliseconds until this item's next scheduled poll, given `now_ms`.
    /// A polling interval of 0 means "never auto-polled" (manual/push-only).
    pub fn time_to_next_poll_ms(&self, now: i64) -> Option<i64> {
        if self.polling_interval_secs == 0 {
            return None;
        }
        let due_at = self.last_poll_ms + (self.polling_interval_secs as i64) * 1000;
        Some((due_at - now).max(0))
    }
}

/// A single observed value ready for delivery — `spec.md` §3 `DataElement`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataElement {
    pub server_id: u64,
    pub dci_id: u64,
    pub origin: DciOrigin,
    pub dci_type: DciType,
    pub status: DciStatus,
    pub snmp_source_guid: Option<Uuid>,
    pub timestamp_ms: i64,
    pub scalar_value: Option<String>,
    pub table_value: Option<Table>,
}

impl DataElement {
    pub fn unique_key(&self) -> (u64, u64, i64) {
        (self.server_id, self.dci_id, self.timestamp_ms)
    }
}

/// Per-server counters driving the DB writer and reconciler —
/// `spec.md` §3 `ServerSyncStatus`.
#[derive(Debug, Clone, Default)]
pub struct ServerSyncStatus {
    pub queued: u64,
    pub last_sync_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnmpAuthMode {
    NoAuth,
    Md5,
    Sha1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnmpPrivMode {
    None,
    Des,
    Aes,
}

/// `spec.md` §3 `SnmpTarget`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnmpTarget {
    pub guid: Uuid,
    pub server_id: u64,
    pub address: String,
    pub version: u8,
    pub port: u16,
    pub auth_mode: SnmpAuthMode,
    pub priv_mode: SnmpPrivMode,
    pub auth_name: Option<String>,
    pub auth_pass: Option<String>,
    pub priv_pass: Option<String>,
}

/// `spec.md` §3 `Proxy entry (DataCollectionProxy)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataCollectionProxy {
    pub server_id: u64,
    pub proxy_id: u32,
    pub address: String,
    #[serde(skip)]
    pub in_use: bool,
    #[serde(skip)]
    pub connected: bool,
}

/// `spec.md` §3 `ZoneConfiguration`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneConfiguration {
    pub server_id: u64,
    pub this_node_id: u32,
    pub zone_uin: u32,
    pub shared_secret: [u8; 32],
}

/// A full configuration snapshot pushed by the server for one `server_id`,
/// per `spec.md` §4.3 "Configuration intake".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataCollectionSnapshot {
    pub server_id: u64,
    pub snmp_targets: Vec<SnmpTarget>,
    pub proxies: Vec<DataCollectionProxy>,
    pub zone: Option<ZoneConfiguration>,
    pub items: Vec<DataCollectionItem>,
    pub has_schedule_extras: bool,
}

/// One parameter of an [`AiToolDefinition`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiToolParameter {
    pub name: String,
    pub json_type: String,
    pub description: String,
    pub required: bool,
    pub default: Option<serde_json::Value>,
    /// Extra JSON-schema constraint fragment merged into the generated
    /// property schema (e.g. `{"minimum": 0}`).
    pub constraint: Option<serde_json::Value>,
}

/// A plugin-contributed, JSON-schema-described callable — `spec.md` §3
/// `AIToolDefinition`. The execution callback itself lives in
/// [`crate::registry::plugin::Subagent`]; this struct is the catalog entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiToolDefinition {
    pub name: String,
    pub category: String,
    pub description: String,
    pub parameters: Vec<AiToolParameter>,
}

impl AiToolDefinition {
    /// Builds the JSON schema for this tool's parameters on demand, per
    /// `spec.md` §4.5: `{"type": "object", "properties": {...}, "required":
    /// [...]}` with each property's `type`/`description` filled from the
    /// parameter, `default` merged in when present, and any extra
    /// constraint fragment merged on top.
    pub fn json_schema(&self) -> serde_json::Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for param in &self.parameters {
            let mut prop = serde_json::json!({
                "type": param.json_type,
                "description": param.description,
            });
            if let Some(default) = &param.default {
                prop["default"] = default.clone();
            }
            if let Some(constraint) = &param.constraint {
                if let (Some(prop_obj), Some(constraint_obj)) =
                    (prop.as_object_mut(), constraint.as_object())
                {
                    for (k, v) in constraint_obj {
                        prop_obj.insert(k.clone(), v.clone());
                    }
                }
            }
            properties.insert(param.name.clone(), prop);
            if param.required {
                required.push(serde_json::Value::String(param.name.clone()));
            }
        }
        serde_json::json!({
            "type": "object",
            "properties": serde_json::Value::Object(properties),
            "required": required,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_item() -> DataCollectionItem {
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
            backup_proxy_id: None,
            last_poll_ms: 0,
            busy: false,
            disabled: false,
        }
    }

    #[test]
    fn zero_interval_is_never_auto_polled() {
        let mut item = sample_item();
        item.polling_interval_secs = 0;
        assert_eq!(item.time_to_next_poll_ms(1_000_000), None);
    }

    #[test]
    fn due_item_reports_zero_wait() {
        let item = sample_item();
        assert_eq!(item.time_to_next_poll_ms(10_000), Some(0));
    }

    #[test]
    fn schedule_with_seconds_field_drops_granularity_to_one_second() {
        let mut item = sample_item();
        item.schedules.push("*/5 * * * * *".into());
        assert_eq!(item.tick_granularity_secs(), 1);
    }

    #[test]
    fn ai_tool_schema_lists_required_parameters() {
        let tool = AiToolDefinition {
            name: "restart_service".into(),
            category: "system".into(),
            description: "Restarts a named service".into(),
            parameters: vec![AiToolParameter {
                name: "service".into(),
                json_type: "string".into(),
                description: "Service name".into(),
                required: true,
                default: None,
                constraint: None,
            }],
        };
        let schema = tool.json_schema();
        assert_eq!(schema["required"][0], "service");
        assert_eq!(schema["properties"]["service"]["type"], "string");
    }
}
