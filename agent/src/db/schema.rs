//! Schema migrations, applied sequentially under one transaction per step.
//!
//! `metadata.SchemaVersion` is a monotonic integer; startup reads it and
//! applies every migration whose index is >= the stored version. If the
//! stored version is above [`CURRENT_SCHEMA_VERSION`] the process refuses
//! to start (`spec.md` §4.6, §7).

pub const CURRENT_SCHEMA_VERSION: i64 = 2;

/// Migration steps, 1-indexed by position (step `N` brings the schema
/// from version `N-1` to version `N`).
pub const MIGRATIONS: &[&str] = &[
    // v1: base schema.
    r#"
    CREATE TABLE metadata (key TEXT PRIMARY KEY, value TEXT NOT NULL);

    CREATE TABLE dc_config (
        server_id INTEGER NOT NULL,
        dci_id INTEGER NOT NULL,
        origin TEXT NOT NULL,
        dci_type TEXT NOT NULL,
        metric_name TEXT NOT NULL,
        polling_interval_secs INTEGER NOT NULL,
        snmp_target_guid TEXT,
        snmp_port INTEGER,
        snmp_version INTEGER,
        snmp_raw_oid TEXT,
        backup_proxy_id INTEGER,
        last_poll_ms INTEGER NOT NULL DEFAULT 0,
        disabled INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (server_id, dci_id)
    );

    CREATE TABLE dc_snmp_table_columns (
        server_id INTEGER NOT NULL,
        dci_id INTEGER NOT NULL,
        position INTEGER NOT NULL,
        name TEXT NOT NULL,
        oid_suffix TEXT NOT NULL,
        hex_convert INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (server_id, dci_id, position)
    );

    CREATE TABLE dc_schedules (
        server_id INTEGER NOT NULL,
        dci_id INTEGER NOT NULL,
        position INTEGER NOT NULL,
        schedule TEXT NOT NULL,
        PRIMARY KEY (server_id, dci_id, position)
    );

    CREATE TABLE dc_queue (
        server_id INTEGER NOT NULL,
        dci_id INTEGER NOT NULL,
        timestamp_ms INTEGER NOT NULL,
        origin TEXT NOT NULL,
        dci_type TEXT NOT NULL,
        status TEXT NOT NULL,
        snmp_source_guid TEXT,
        scalar_value TEXT,
        table_value TEXT,
        PRIMARY KEY (server_id, dci_id, timestamp_ms)
    );
    CREATE INDEX idx_dc_queue_timestamp ON dc_queue (server_id, timestamp_ms);

    CREATE TABLE dc_snmp_targets (
        guid TEXT PRIMARY KEY,
        server_id INTEGER NOT NULL,
        address TEXT NOT NULL,
        version INTEGER NOT NULL,
        port INTEGER NOT NULL,
        auth_mode TEXT NOT NULL,
        priv_mode TEXT NOT NULL,
        auth_name TEXT,
        auth_pass TEXT,
        priv_pass TEXT
    );

    CREATE TABLE dc_proxy (
        server_id INTEGER NOT NULL,
        proxy_id INTEGER NOT NULL,
        address TEXT NOT NULL,
        PRIMARY KEY (server_id, proxy_id)
    );

    CREATE TABLE zone_config (
        server_id INTEGER PRIMARY KEY,
        this_node_id INTEGER NOT NULL,
        zone_uin INTEGER NOT NULL,
        shared_secret BLOB NOT NULL
    );
    "#,
    // v2: per-server sync status persisted so a restart doesn't lose the
    // last-flush timestamp used by the stalled-data expiration job, plus
    // the policy inventory table used by DEPLOY_POLICY / GET_POLICY_INVENTORY.
    r#"
    CREATE TABLE sync_status (
        server_id INTEGER PRIMARY KEY,
        queued INTEGER NOT NULL DEFAULT 0,
        last_sync_ms INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE policy (
        server_id INTEGER NOT NULL,
        policy_guid TEXT NOT NULL,
        policy_type TEXT NOT NULL,
        version INTEGER NOT NULL,
        path TEXT NOT NULL,
        PRIMARY KEY (server_id, policy_guid)
    );
    "#,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_count_matches_current_version() {
        assert_eq!(MIGRATIONS.len() as i64, CURRENT_SCHEMA_VERSION);
    }
}
