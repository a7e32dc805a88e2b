//! Typed query helpers over the schema in [`super::schema`].

use crate::error::AgentResult;
use crate::model::{
    DataCollectionItem, DataCollectionProxy, DataElement, DciOrigin, DciStatus, DciType,
    SnmpAuthMode, SnmpColumn, SnmpPrivMode, SnmpTarget, ZoneConfiguration,
};
use agentd_protocol::Table;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

fn origin_str(o: DciOrigin) -> &'static str {
    match o {
        DciOrigin::LocalAgent => "local",
        DciOrigin::Snmp => "snmp",
        DciOrigin::Modbus => "modbus",
        DciOrigin::Script => "script",
    }
}

fn origin_from_str(s: &str) -> DciOrigin {
    match s {
        "snmp" => DciOrigin::Snmp,
        "modbus" => DciOrigin::Modbus,
        "script" => DciOrigin::Script,
        _ => DciOrigin::LocalAgent,
    }
}

fn type_str(t: DciType) -> &'static str {
    match t {
        DciType::Scalar => "scalar",
        DciType::Table => "table",
    }
}

fn type_from_str(s: &str) -> DciType {
    if s == "table" {
        DciType::Table
    } else {
        DciType::Scalar
    }
}

fn status_str(s: DciStatus) -> &'static str {
    match s {
        DciStatus::Success => "success",
        DciStatus::NoSuchMetric => "no_such_metric",
        DciStatus::NoSuchInstance => "no_such_instance",
        DciStatus::Unsupported => "unsupported",
        DciStatus::Timeout => "timeout",
        DciStatus::InternalError => "internal_error",
    }
}

fn status_from_str(s: &str) -> DciStatus {
    match s {
        "no_such_metric" => DciStatus::NoSuchMetric,
        "no_such_instance" => DciStatus::NoSuchInstance,
        "unsupported" => DciStatus::Unsupported,
        "timeout" => DciStatus::Timeout,
        _ if s == "success" => DciStatus::Success,
        _ => DciStatus::InternalError,
    }
}

/// Inserts or updates a data-collection item. Returns `true` if the row
/// was new or materially changed, `false` if the push was a no-op
/// (idempotent config push, `spec.md` §8).
pub fn upsert_item(conn: &Connection, item: &DataCollectionItem) -> AgentResult<bool> {
    let existing: Option<(String, u32, Option<String>)> = conn
        .query_row(
            "SELECT metric_name, polling_interval_secs, snmp_raw_oid
             FROM dc_config WHERE server_id = ?1 AND dci_id = ?2",
            params![item.server_id as i64, item.dci_id as i64],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    if let Some((name, interval, oid)) = &existing {
        if name == &item.metric_name
            && *interval == item.polling_interval_secs
            && oid.as_deref() == item.snmp_raw_oid.as_deref()
        {
            return Ok(false);
        }
    }

    conn.execute(
        "INSERT INTO dc_config
            (server_id, dci_id, origin, dci_type, metric_name, polling_interval_secs,
             snmp_target_guid, snmp_port, snmp_version, snmp_raw_oid, backup_proxy_id,
             last_poll_ms, disabled)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
         ON CONFLICT(server_id, dci_id) DO UPDATE SET
            origin = excluded.origin,
            dci_type = excluded.dci_type,
            metric_name = excluded.metric_name,
            polling_interval_secs = excluded.polling_interval_secs,
            snmp_target_guid = excluded.snmp_target_guid,
            snmp_port = excluded.snmp_port,
            snmp_version = excluded.snmp_version,
            snmp_raw_oid = excluded.snmp_raw_oid,
            backup_proxy_id = excluded.backup_proxy_id,
            disabled = excluded.disabled",
        params![
            item.server_id as i64,
            item.dci_id as i64,
            origin_str(item.origin),
            type_str(item.dci_type),
            item.metric_name,
            item.polling_interval_secs,
            item.snmp_target_guid.map(|g| g.to_string()),
            item.snmp_port,
            item.snmp_version,
            item.snmp_raw_oid,
            item.backup_proxy_id,
            item.last_poll_ms,
            item.disabled as i64,
        ],
    )?;

    conn.execute(
        "DELETE FROM dc_snmp_table_columns WHERE server_id = ?1 AND dci_id = ?2",
        params![item.server_id as i64, item.dci_id as i64],
    )?;
    for (pos, col) in item.snmp_columns.iter().enumerate() {
        conn.execute(
            "INSERT INTO dc_snmp_table_columns (server_id, dci_id, position, name, oid_suffix, hex_convert)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![item.server_id as i64, item.dci_id as i64, pos as i64, col.name, col.oid_suffix, col.hex_convert as i64],
        )?;
    }

    conn.execute(
        "DELETE FROM dc_schedules WHERE server_id = ?1 AND dci_id = ?2",
        params![item.server_id as i64, item.dci_id as i64],
    )?;
    for (pos, sched) in item.schedules.iter().enumerate() {
        conn.execute(
            "INSERT INTO dc_schedules (server_id, dci_id, position, schedule) VALUES (?1, ?2, ?3, ?4)",
            params![item.server_id as i64, item.dci_id as i64, pos as i64, sched],
        )?;
    }

    Ok(true)
}

pub fn delete_item(conn: &Connection, server_id: u64, dci_id: u64) -> AgentResult<()> {
    conn.execute(
        "DELETE FROM dc_config WHERE server_id = ?1 AND dci_id = ?2",
        params![server_id as i64, dci_id as i64],
    )?;
    conn.execute(
        "DELETE FROM dc_snmp_table_columns WHERE server_id = ?1 AND dci_id = ?2",
        params![server_id as i64, dci_id as i64],
    )?;
    conn.execute(
        "DELETE FROM dc_schedules WHERE server_id = ?1 AND dci_id = ?2",
        params![server_id as i64, dci_id as i64],
    )?;
    Ok(())
}

/// Deletes every item whose `server_id` matches but whose `dci_id` is not
/// in `keep_ids`. Returns the deleted `(server_id, dci_id)` keys, per
/// `spec.md` §4.3 step 4.
pub fn delete_items_not_in(
    conn: &Connection,
    server_id: u64,
    keep_ids: &[u64],
) -> AgentResult<Vec<(u64, u64)>> {
    let mut stmt = conn.prepare("SELECT dci_id FROM dc_config WHERE server_id = ?1")?;
    let all_ids: Vec<u64> = stmt
        .query_map(params![server_id as i64], |row| {
            row.get::<_, i64>(0).map(|v| v as u64)
        })?
        .filter_map(Result::ok)
        .collect();

    let mut removed = Vec::new();
    for dci_id in all_ids {
        if !keep_ids.contains(&dci_id) {
            delete_item(conn, server_id, dci_id)?;
            removed.push((server_id, dci_id));
        }
    }
    Ok(removed)
}

pub fn load_items_for_server(
    conn: &Connection,
    server_id: u64,
) -> AgentResult<Vec<DataCollectionItem>> {
    let mut stmt = conn.prepare(
        "SELECT dci_id, origin, dci_type, metric_name, polling_interval_secs,
                snmp_target_guid, snmp_port, snmp_version, snmp_raw_oid,
                backup_proxy_id, last_poll_ms, disabled
         FROM dc_config WHERE server_id = ?1",
    )?;
    let rows = stmt.query_map(params![server_id as i64], |row| {
        Ok((
            row.get::<_, i64>(0)? as u64,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, u32>(4)?,
            row.get::<_, Option<String>>(5)?,
            row.get::<_, Option<u16>>(6)?,
            row.get::<_, Option<u8>>(7)?,
            row.get::<_, Option<String>>(8)?,
            row.get::<_, Option<u32>>(9)?,
            row.get::<_, i64>(10)?,
            row.get::<_, i64>(11)?,
        ))
    })?;

    let mut items = Vec::new();
    for row in rows {
        let (dci_id, origin, dci_type, metric_name, interval, guid, port, version, oid, backup, last_poll, disabled) =
            row?;
        let columns = load_snmp_columns(conn, server_id, dci_id)?;
        let schedules = load_schedules(conn, server_id, dci_id)?;
        items.push(DataCollectionItem {
            server_id,
            dci_id,
            origin: origin_from_str(&origin),
            dci_type: type_from_str(&dci_type),
            metric_name,
            polling_interval_secs: interval,
            schedules,
            snmp_target_guid: guid.and_then(|g| Uuid::parse_str(&g).ok()),
            snmp_port: port,
            snmp_version: version,
            snmp_raw_oid: oid,
            snmp_columns: columns,
            backup_proxy_id: backup,
            last_poll_ms: last_poll,
            busy: false,
            disabled: disabled != 0,
        });
    }
    Ok(items)
}

fn load_snmp_columns(conn: &Connection, server_id: u64, dci_id: u64) -> AgentResult<Vec<SnmpColumn>> {
    let mut stmt = conn.prepare(
        "SELECT name, oid_suffix, hex_convert FROM dc_snmp_table_columns
         WHERE server_id = ?1 AND dci_id = ?2 ORDER BY position",
    )?;
    let rows = stmt
        .query_map(params![server_id as i64, dci_id as i64], |row| {
            Ok(SnmpColumn {
                name: row.get(0)?,
                oid_suffix: row.get(1)?,
                hex_convert: row.get::<_, i64>(2)? != 0,
            })
        })?
        .filter_map(Result::ok)
        .collect();
    Ok(rows)
}

fn load_schedules(conn: &Connection, server_id: u64, dci_id: u64) -> AgentResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT schedule FROM dc_schedules WHERE server_id = ?1 AND dci_id = ?2 ORDER BY position",
    )?;
    let rows = stmt
        .query_map(params![server_id as i64, dci_id as i64], |row| row.get(0))?
        .filter_map(Result::ok)
        .collect();
    Ok(rows)
}

pub fn update_last_poll_times(conn: &mut Connection, updates: &[(u64, u64, i64)]) -> AgentResult<()> {
    let tx = conn.transaction()?;
    for (server_id, dci_id, ts) in updates {
        tx.execute(
            "UPDATE dc_config SET last_poll_ms = ?1 WHERE server_id = ?2 AND dci_id = ?3",
            params![ts, *server_id as i64, *dci_id as i64],
        )?;
    }
    tx.commit()?;
    Ok(())
}

// ── SNMP targets ──────────────────────────────────────────────────────

fn auth_mode_str(m: SnmpAuthMode) -> &'static str {
    match m {
        SnmpAuthMode::NoAuth => "none",
        SnmpAuthMode::Md5 => "md5",
        SnmpAuthMode::Sha1 => "sha1",
    }
}
fn auth_mode_from_str(s: &str) -> SnmpAuthMode {
    match s {
        "md5" => SnmpAuthMode::Md5,
        "sha1" => SnmpAuthMode::Sha1,
        _ => SnmpAuthMode::NoAuth,
    }
}
fn priv_mode_str(m: SnmpPrivMode) -> &'static str {
    match m {
        SnmpPrivMode::None => "none",
        SnmpPrivMode::Des => "des",
        SnmpPrivMode::Aes => "aes",
    }
}
fn priv_mode_from_str(s: &str) -> SnmpPrivMode {
    match s {
        "des" => SnmpPrivMode::Des,
        "aes" => SnmpPrivMode::Aes,
        _ => SnmpPrivMode::None,
    }
}

pub fn upsert_snmp_target(conn: &Connection, target: &SnmpTarget) -> AgentResult<()> {
    conn.execute(
        "INSERT INTO dc_snmp_targets
            (guid, server_id, address, version, port, auth_mode, priv_mode, auth_name, auth_pass, priv_pass)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(guid) DO UPDATE SET
            address = excluded.address, version = excluded.version, port = excluded.port,
            auth_mode = excluded.auth_mode, priv_mode = excluded.priv_mode,
            auth_name = excluded.auth_name, auth_pass = excluded.auth_pass, priv_pass = excluded.priv_pass",
        params![
            target.guid.to_string(),
            target.server_id as i64,
            target.address,
            target.version,
            target.port,
            auth_mode_str(target.auth_mode),
            priv_mode_str(target.priv_mode),
            target.auth_name,
            target.auth_pass,
            target.priv_pass,
        ],
    )?;
    Ok(())
}

pub fn load_snmp_targets_for_server(conn: &Connection, server_id: u64) -> AgentResult<Vec<SnmpTarget>> {
    let mut stmt = conn.prepare(
        "SELECT guid, address, version, port, auth_mode, priv_mode, auth_name, auth_pass, priv_pass
         FROM dc_snmp_targets WHERE server_id = ?1",
    )?;
    let rows = stmt
        .query_map(params![server_id as i64], |row| {
            Ok(SnmpTarget {
                guid: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap_or_default(),
                server_id,
                address: row.get(1)?,
                version: row.get(2)?,
                port: row.get(3)?,
                auth_mode: auth_mode_from_str(&row.get::<_, String>(4)?),
                priv_mode: priv_mode_from_str(&row.get::<_, String>(5)?),
                auth_name: row.get(6)?,
                auth_pass: row.get(7)?,
                priv_pass: row.get(8)?,
            })
        })?
        .filter_map(Result::ok)
        .collect();
    Ok(rows)
}

pub fn delete_snmp_targets_for_server(conn: &Connection, server_id: u64) -> AgentResult<()> {
    conn.execute(
        "DELETE FROM dc_snmp_targets WHERE server_id = ?1",
        params![server_id as i64],
    )?;
    Ok(())
}

// ── Proxies ───────────────────────────────────────────────────────────

pub fn replace_proxies_for_server(
    conn: &mut Connection,
    server_id: u64,
    proxies: &[DataCollectionProxy],
) -> AgentResult<()> {
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM dc_proxy WHERE server_id = ?1", params![server_id as i64])?;
    for proxy in proxies {
        tx.execute(
            "INSERT INTO dc_proxy (server_id, proxy_id, address) VALUES (?1, ?2, ?3)",
            params![server_id as i64, proxy.proxy_id, proxy.address],
        )?;
    }
    tx.commit()?;
    Ok(())
}

pub fn load_proxies_for_server(conn: &Connection, server_id: u64) -> AgentResult<Vec<DataCollectionProxy>> {
    let mut stmt = conn.prepare("SELECT proxy_id, address FROM dc_proxy WHERE server_id = ?1")?;
    let rows = stmt
        .query_map(params![server_id as i64], |row| {
            Ok(DataCollectionProxy {
                server_id,
                proxy_id: row.get(0)?,
                address: row.get(1)?,
                in_use: false,
                connected: false,
            })
        })?
        .filter_map(Result::ok)
        .collect();
    Ok(rows)
}

// ── Zone configuration ───────────────────────────────────────────────

pub fn upsert_zone_config(conn: &Connection, zone: &ZoneConfiguration) -> AgentResult<()> {
    conn.execute(
        "INSERT INTO zone_config (server_id, this_node_id, zone_uin, shared_secret)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(server_id) DO UPDATE SET
            this_node_id = excluded.this_node_id, zone_uin = excluded.zone_uin,
            shared_secret = excluded.shared_secret",
        params![
            zone.server_id as i64,
            zone.this_node_id,
            zone.zone_uin,
            zone.shared_secret.to_vec(),
        ],
    )?;
    Ok(())
}

pub fn load_zone_config(conn: &Connection, server_id: u64) -> AgentResult<Option<ZoneConfiguration>> {
    conn.query_row(
        "SELECT this_node_id, zone_uin, shared_secret FROM zone_config WHERE server_id = ?1",
        params![server_id as i64],
        |row| {
            let secret: Vec<u8> = row.get(2)?;
            let mut arr = [0u8; 32];
            let n = secret.len().min(32);
            arr[..n].copy_from_slice(&secret[..n]);
            Ok(ZoneConfiguration {
                server_id,
                this_node_id: row.get(0)?,
                zone_uin: row.get(1)?,
                shared_secret: arr,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

// ── Queue (DataElement persistence) ─────────────────────────────────

pub fn enqueue_element(conn: &Connection, element: &DataElement) -> AgentResult<()> {
    let table_json = element
        .table_value
        .as_ref()
        .map(|t| serde_json::to_string(t).unwrap_or_default());
    conn.execute(
        "INSERT INTO dc_queue
            (server_id, dci_id, timestamp_ms, origin, dci_type, status, snmp_source_guid, scalar_value, table_value)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(server_id, dci_id, timestamp_ms) DO NOTHING",
        params![
            element.server_id as i64,
            element.dci_id as i64,
            element.timestamp_ms,
            origin_str(element.origin),
            type_str(element.dci_type),
            status_str(element.status),
            element.snmp_source_guid.map(|g| g.to_string()),
            element.scalar_value,
            table_json,
        ],
    )?;
    Ok(())
}

fn row_to_element(row: &rusqlite::Row) -> rusqlite::Result<DataElement> {
    let table_json: Option<String> = row.get(8)?;
    let table_value: Option<Table> = table_json.and_then(|s| serde_json::from_str(&s).ok());
    Ok(DataElement {
        server_id: row.get::<_, i64>(0)? as u64,
        dci_id: row.get::<_, i64>(1)? as u64,
        timestamp_ms: row.get(2)?,
        origin: origin_from_str(&row.get::<_, String>(3)?),
        dci_type: type_from_str(&row.get::<_, String>(4)?),
        status: status_from_str(&row.get::<_, String>(5)?),
        snmp_source_guid: row
            .get::<_, Option<String>>(6)?
            .and_then(|s| Uuid::parse_str(&s).ok()),
        scalar_value: row.get(7)?,
        table_value,
    })
}

/// Selects up to `limit` oldest queued rows for `server_id`, ordered by
/// timestamp — the ordering the reconciler relies on for the
/// non-decreasing-per-DCI delivery invariant (`spec.md` §4.3, §8).
pub fn select_batch(conn: &Connection, server_id: u64, limit: usize) -> AgentResult<Vec<DataElement>> {
    let mut stmt = conn.prepare(
        "SELECT server_id, dci_id, timestamp_ms, origin, dci_type, status, snmp_source_guid, scalar_value, table_value
         FROM dc_queue WHERE server_id = ?1 ORDER BY timestamp_ms ASC LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![server_id as i64, limit as i64], row_to_element)?
        .filter_map(Result::ok)
        .collect();
    Ok(rows)
}

pub fn delete_queue_rows(conn: &mut Connection, keys: &[(u64, u64, i64)]) -> AgentResult<()> {
    let tx = conn.transaction()?;
    for (server_id, dci_id, ts) in keys {
        tx.execute(
            "DELETE FROM dc_queue WHERE server_id = ?1 AND dci_id = ?2 AND timestamp_ms = ?3",
            params![*server_id as i64, *dci_id as i64, ts],
        )?;
    }
    tx.commit()?;
    Ok(())
}

pub fn count_queued(conn: &Connection, server_id: u64) -> AgentResult<u64> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM dc_queue WHERE server_id = ?1",
        params![server_id as i64],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}

/// Deletes every server-scoped row (`spec.md` §4.3 "Stalled data
/// expiration"): the queue, SNMP targets, and item configuration.
pub fn delete_server_data(conn: &mut Connection, server_id: u64) -> AgentResult<()> {
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM dc_queue WHERE server_id = ?1", params![server_id as i64])?;
    tx.execute(
        "DELETE FROM dc_snmp_targets WHERE server_id = ?1",
        params![server_id as i64],
    )?;
    tx.execute("DELETE FROM dc_config WHERE server_id = ?1", params![server_id as i64])?;
    tx.execute(
        "DELETE FROM dc_snmp_table_columns WHERE server_id = ?1",
        params![server_id as i64],
    )?;
    tx.execute("DELETE FROM dc_schedules WHERE server_id = ?1", params![server_id as i64])?;
    tx.execute("DELETE FROM sync_status WHERE server_id = ?1", params![server_id as i64])?;
    tx.commit()?;
    Ok(())
}

pub fn upsert_sync_status(conn: &Connection, server_id: u64, queued: u64, last_sync_ms: i64) -> AgentResult<()> {
    conn.execute(
        "INSERT INTO sync_status (server_id, queued, last_sync_ms) VALUES (?1, ?2, ?3)
         ON CONFLICT(server_id) DO UPDATE SET queued = excluded.queued, last_sync_ms = excluded.last_sync_ms",
        params![server_id as i64, queued as i64, last_sync_ms],
    )?;
    Ok(())
}

pub fn load_all_sync_status(conn: &Connection) -> AgentResult<Vec<(u64, u64, i64)>> {
    let mut stmt = conn.prepare("SELECT server_id, queued, last_sync_ms FROM sync_status")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)? as u64,
                row.get::<_, i64>(1)? as u64,
                row.get::<_, i64>(2)?,
            ))
        })?
        .filter_map(Result::ok)
        .collect();
    Ok(rows)
}

pub fn vacuum(conn: &Connection) -> AgentResult<()> {
    conn.execute_batch("VACUUM;")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DciOrigin, DciStatus, DciType};
    use rusqlite::Connection;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        for step in super::super::schema::MIGRATIONS {
            conn.execute_batch(step).unwrap();
        }
        conn
    }

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

    #[test]
    fn pushing_the_same_item_twice_is_idempotent() {
        let conn = setup();
        let item = sample_item(1, 1);
        assert!(upsert_item(&conn, &item).unwrap());
        assert!(!upsert_item(&conn, &item).unwrap());
    }

    #[test]
    fn delete_items_not_in_removes_dropped_items() {
        let conn = setup();
        upsert_item(&conn, &sample_item(1, 1)).unwrap();
        upsert_item(&conn, &sample_item(1, 2)).unwrap();
        let removed = delete_items_not_in(&conn, 1, &[1]).unwrap();
        assert_eq!(removed, vec![(1, 2)]);
        assert_eq!(load_items_for_server(&conn, 1).unwrap().len(), 1);
    }

    #[test]
    fn queue_enforces_unique_server_dci_timestamp() {
        let conn = setup();
        let el = DataElement {
            server_id: 1,
            dci_id: 1,
            origin: DciOrigin::LocalAgent,
            dci_type: DciType::Scalar,
            status: DciStatus::Success,
            snmp_source_guid: None,
            timestamp_ms: 1000,
            scalar_value: Some("42".into()),
            table_value: None,
        };
        enqueue_element(&conn, &el).unwrap();
        enqueue_element(&conn, &el).unwrap(); // duplicate key, ignored
        assert_eq!(count_queued(&conn, 1).unwrap(), 1);
    }

    #[test]
    fn select_batch_orders_by_timestamp() {
        let conn = setup();
        for ts in [300, 100, 200] {
            let el = DataElement {
                server_id: 1,
                dci_id: 1,
                origin: DciOrigin::LocalAgent,
                dci_type: DciType::Scalar,
                status: DciStatus::Success,
                snmp_source_guid: None,
                timestamp_ms: ts,
                scalar_value: Some("x".into()),
                table_value: None,
            };
            enqueue_element(&conn, &el).unwrap();
        }
        let batch = select_batch(&conn, 1, 10).unwrap();
        let timestamps: Vec<i64> = batch.iter().map(|e| e.timestamp_ms).collect();
        assert_eq!(timestamps, vec![100, 200, 300]);
    }
}
