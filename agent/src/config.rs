//! # Resolved Configuration
//!
//! Parsing a config file is out of scope for this core (see `spec.md`
//! §1); this module only defines the resolved [`Config`] object the rest
//! of the daemon consumes, with the field set listed in `spec.md` §6.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_MAX_SESSIONS: usize = 256;
pub const DEFAULT_MIN_COLLECTOR_POOL: usize = 4;
pub const DEFAULT_MAX_COLLECTOR_POOL: usize = 64;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 900;
pub const DEFAULT_KEEPALIVE_INTERVAL_SECS: u64 = 30;
pub const MIN_RECONCILIATION_BLOCK_SIZE: usize = 16;

/// One entry in the server allowlist: an address or hostname permitted to
/// open inbound sessions, plus the role bits granted to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerAllowlistEntry {
    pub host: String,
    pub is_master: bool,
    pub is_control: bool,
    pub auth_required: bool,
    pub shared_secret: Option<String>,
}

/// One configured outbound tunnel target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelTarget {
    pub hostname: String,
    pub port: u16,
    pub client_cert_path: Option<PathBuf>,
    pub host_store_alias: Option<String>,
    pub pinned_fingerprint: Option<String>,
    pub verify_trust_store: bool,
    pub check_crl: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// This agent's stable identity, carried in the tunnel setup message
    /// and as the CSR subject during certificate binding.
    pub agent_id: Uuid,
    pub system_name: String,
    pub bind_addresses: Vec<IpAddr>,
    pub bind_port: u16,
    pub tls_enabled: bool,
    pub servers: Vec<ServerAllowlistEntry>,
    pub idle_timeout: Duration,
    pub max_sessions: usize,
    pub min_collector_pool: usize,
    pub max_collector_pool: usize,
    pub db_path: PathBuf,
    pub flush_interval_ms: u64,
    pub max_transaction_size: usize,
    pub reconciliation_block_size: usize,
    pub reconciliation_timeout: Duration,
    pub offline_expiration_days: i64,
    pub zone_uin: u32,
    pub keepalive_interval: Duration,
    pub cert_directory: PathBuf,
    pub tunnels: Vec<TunnelTarget>,
    pub snmp_trap_bind: Option<(IpAddr, u16)>,
    pub syslog_bind: Option<(IpAddr, u16)>,
    pub liveness_bind: Option<(IpAddr, u16)>,
    pub status_api_bind: Option<(IpAddr, u16)>,
    pub push_socket_path: Option<PathBuf>,
    pub session_agent_socket_path: Option<PathBuf>,
    pub master_agent_socket_path: Option<PathBuf>,
    pub max_bulk_reconciliation_size: usize,
    pub snmp_request_timeout: Duration,
    pub snmp_poller_cap: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent_id: Uuid::new_v4(),
            system_name: "agentd".to_string(),
            bind_addresses: vec!["0.0.0.0".parse().unwrap()],
            bind_port: 4700,
            tls_enabled: false,
            servers: Vec::new(),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            max_sessions: DEFAULT_MAX_SESSIONS,
            min_collector_pool: DEFAULT_MIN_COLLECTOR_POOL,
            max_collector_pool: DEFAULT_MAX_COLLECTOR_POOL,
            db_path: PathBuf::from("agentd.db"),
            flush_interval_ms: 1000,
            max_transaction_size: 200,
            reconciliation_block_size: 64,
            reconciliation_timeout: Duration::from_secs(30),
            offline_expiration_days: 30,
            zone_uin: 0,
            keepalive_interval: Duration::from_secs(DEFAULT_KEEPALIVE_INTERVAL_SECS),
            cert_directory: PathBuf::from("certs"),
            tunnels: Vec::new(),
            snmp_trap_bind: None,
            syslog_bind: None,
            liveness_bind: None,
            status_api_bind: None,
            push_socket_path: None,
            session_agent_socket_path: None,
            master_agent_socket_path: None,
            max_bulk_reconciliation_size: 500,
            snmp_request_timeout: Duration::from_millis(1500),
            snmp_poller_cap: 64,
        }
    }
}

impl Config {
    /// Normalizes boundary values per `spec.md` §8: `max_sessions == 0`
    /// reverts to the compiled default (it never becomes literally zero),
    /// and the reconciliation block size is clamped into
    /// `[MIN_RECONCILIATION_BLOCK_SIZE, max_bulk_reconciliation_size]`.
    pub fn normalize(mut self) -> Self {
        if self.max_sessions == 0 {
            self.max_sessions = DEFAULT_MAX_SESSIONS;
        }
        self.reconciliation_block_size = self.reconciliation_block_size.clamp(
            MIN_RECONCILIATION_BLOCK_SIZE,
            self.max_bulk_reconciliation_size.max(MIN_RECONCILIATION_BLOCK_SIZE),
        );
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_max_sessions_reverts_to_default() {
        let cfg = Config {
            max_sessions: 0,
            ..Config::default()
        }
        .normalize();
        assert_eq!(cfg.max_sessions, DEFAULT_MAX_SESSIONS);
    }

    #[test]
    fn reconciliation_block_size_is_clamped() {
        let cfg = Config {
            reconciliation_block_size: 4,
            ..Config::default()
        }
        .normalize();
        assert_eq!(cfg.reconciliation_block_size, MIN_RECONCILIATION_BLOCK_SIZE);

        let cfg = Config {
            reconciliation_block_size: 10_000,
            max_bulk_reconciliation_size: 500,
            ..Config::default()
        }
        .normalize();
        assert_eq!(cfg.reconciliation_block_size, 500);
    }
}
