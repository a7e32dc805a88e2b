//! Proxy subsystems (`spec.md` §4.4): the SNMP request/response proxy, the
//! SNMP-trap and syslog receivers, the UDP peer-liveness protocol, and the
//! TCP-proxy channel byte pumps. Each is its own supervised task wired up
//! by the process supervisor (§4.7).

pub mod forwarder;
pub mod liveness;
pub mod snmp;
pub mod syslog;
pub mod tcpproxy;
pub mod trap;

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters called out in `spec.md` §4.4 ("Counters: server requests, SNMP
/// requests, SNMP responses").
#[derive(Debug, Default)]
pub struct ProxyCounters {
    pub server_requests: AtomicU64,
    pub snmp_requests: AtomicU64,
    pub snmp_responses: AtomicU64,
}

impl ProxyCounters {
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.server_requests.load(Ordering::Relaxed),
            self.snmp_requests.load(Ordering::Relaxed),
            self.snmp_responses.load(Ordering::Relaxed),
        )
    }
}

/// A received trap or syslog datagram, tagged with the zone it arrived in
/// (`spec.md` §4.4 "The zone UIN is attached"), queued for the forwarder.
#[derive(Debug, Clone)]
pub struct NotificationRecord {
    pub zone_uin: u32,
    pub source_addr: std::net::SocketAddr,
    pub arrival_ms: i64,
    pub kind: NotificationKind,
}

#[derive(Debug, Clone)]
pub enum NotificationKind {
    SnmpTrap(Vec<u8>),
    SyslogLine(Vec<u8>),
}
