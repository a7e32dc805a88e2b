//! Turns a raw collection result into a [`DataElement`] (`spec.md` §4.3
//! "Collectors"). The actual network I/O for SNMP lives in
//! [`crate::proxy::snmp`]; this module only knows how to interpret results,
//! which keeps it testable without a socket.

use crate::error::AgentError;
use crate::model::{now_ms, DataCollectionItem, DataElement, DciStatus};
use crate::registry::metrics::MetricRegistry;
use agentd_protocol::Table;
use uuid::Uuid;

fn status_for_error(err: &AgentError) -> DciStatus {
    match err {
        AgentError::UnknownMetric(_) => DciStatus::NoSuchMetric,
        AgentError::UnknownInstance => DciStatus::NoSuchInstance,
        AgentError::Unsupported | AgentError::NotImplemented => DciStatus::Unsupported,
        AgentError::RequestTimeout => DciStatus::Timeout,
        _ => DciStatus::InternalError,
    }
}

/// The local-agent collector: calls the metric registry with
/// `(metric_name, session=virtual)` and wraps the string result
/// (`spec.md` §4.3 "A local-agent collector calls the registry with
/// (metric-name, session=virtual)").
pub fn collect_local(registry: &MetricRegistry, item: &DataCollectionItem) -> DataElement {
    let (_, result) = registry.get_metric(&item.metric_name, None);
    element_from_scalar_result(item, None, result)
}

/// Builds the scalar [`DataElement`] for an item, from either the local
/// registry or an SNMP GET's result — both report the "no such metric /
/// no such instance" status verbatim (`spec.md` §4.3).
pub fn element_from_scalar_result(
    item: &DataCollectionItem,
    snmp_source_guid: Option<Uuid>,
    result: Result<String, AgentError>,
) -> DataElement {
    let timestamp_ms = now_ms();
    match result {
        Ok(value) => DataElement {
            server_id: item.server_id,
            dci_id: item.dci_id,
            origin: item.origin,
            dci_type: item.dci_type,
            status: DciStatus::Success,
            snmp_source_guid,
            timestamp_ms,
            scalar_value: Some(value),
            table_value: None,
        },
        Err(err) => DataElement {
            server_id: item.server_id,
            dci_id: item.dci_id,
            origin: item.origin,
            dci_type: item.dci_type,
            status: status_for_error(&err),
            snmp_source_guid,
            timestamp_ms,
            scalar_value: None,
            table_value: None,
        },
    }
}

/// Builds the table [`DataElement`] for an SNMP table-walk result
/// (`spec.md` §4.3 "An SNMP table collector walks the table OID ...").
pub fn element_from_table_result(
    item: &DataCollectionItem,
    snmp_source_guid: Option<Uuid>,
    result: Result<Table, AgentError>,
) -> DataElement {
    let timestamp_ms = now_ms();
    match result {
        Ok(table) => DataElement {
            server_id: item.server_id,
            dci_id: item.dci_id,
            origin: item.origin,
            dci_type: item.dci_type,
            status: DciStatus::Success,
            snmp_source_guid,
            timestamp_ms,
            scalar_value: None,
            table_value: Some(table),
        },
        Err(err) => DataElement {
            server_id: item.server_id,
            dci_id: item.dci_id,
            origin: item.origin,
            dci_type: item.dci_type,
            status: status_for_error(&err),
            snmp_source_guid,
            timestamp_ms,
            scalar_value: None,
            table_value: None,
        },
    }
}

/// Hex-decodes an SNMP string value for a column that requests it
/// (`spec.md` §4.3 "optional hex-conversion of string values"). Invalid
/// hex is passed through unchanged rather than failing the whole row.
pub fn hex_convert_if_requested(value: String, hex_convert: bool) -> String {
    if !hex_convert {
        return value;
    }
    match hex::decode(value.trim()) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DciOrigin, DciType};
    use crate::registry::metrics::{AgentMetricRegistration, MetricDataType, MetricRegistryBuilder};
    use std::sync::Arc;

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
    fn local_collector_reports_success() {
        let mut builder = MetricRegistryBuilder::new();
        builder.register(AgentMetricRegistration {
            name_pattern: "Agent.Uptime".into(),
            handler: Arc::new(|_n, _a| Ok("3600".to_string())),
            argument: None,
            data_type: MetricDataType::Int64,
        });
        let registry = builder.build();
        let element = collect_local(&registry, &sample_item());
        assert_eq!(element.status, DciStatus::Success);
        assert_eq!(element.scalar_value.as_deref(), Some("3600"));
    }

    #[test]
    fn unknown_metric_status_is_preserved_verbatim() {
        let registry = MetricRegistryBuilder::new().build();
        let element = collect_local(&registry, &sample_item());
        assert_eq!(element.status, DciStatus::NoSuchMetric);
    }

    #[test]
    fn hex_convert_decodes_when_requested() {
        let decoded = hex_convert_if_requested("68656c6c6f".to_string(), true);
        assert_eq!(decoded, "hello");
    }

    #[test]
    fn hex_convert_is_a_no_op_when_not_requested() {
        let value = hex_convert_if_requested("68656c6c6f".to_string(), false);
        assert_eq!(value, "68656c6c6f");
    }
}
