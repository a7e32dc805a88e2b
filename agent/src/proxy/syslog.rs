//! The syslog receiver (`spec.md` §4.4 "SNMP-trap and syslog receivers"):
//! a UDP listener that wraps every received line into a
//! [`NotificationRecord`] carrying the raw bytes and arrival time.

use super::{NotificationKind, NotificationRecord};
use crate::model::now_ms;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const RECV_BUF_SIZE: usize = 65_507;

pub async fn run(
    bind_addr: SocketAddr,
    zone_uin: u32,
    queue: mpsc::Sender<NotificationRecord>,
    shutdown: CancellationToken,
) {
    let socket = match UdpSocket::bind(bind_addr).await {
        Ok(s) => s,
        Err(e) => {
            warn!(%bind_addr, error = %e, "failed to bind syslog listener");
            return;
        }
    };
    info!(%bind_addr, "syslog listener ready");

    let mut buf = vec![0u8; RECV_BUF_SIZE];
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            result = socket.recv_from(&mut buf) => {
                let (n, source_addr) = match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "syslog recv failed");
                        continue;
                    }
                };
                let record = NotificationRecord {
                    zone_uin,
                    source_addr,
                    arrival_ms: now_ms(),
                    kind: NotificationKind::SyslogLine(buf[..n].to_vec()),
                };
                if queue.send(record).await.is_err() {
                    return;
                }
            }
        }
    }
}
