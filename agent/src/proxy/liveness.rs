//! The UDP peer-liveness protocol (`spec.md` §4.4 "Peer-liveness probe",
//! §6 "UDP peer-liveness packet"): a fixed-layout, HMAC-signed challenge
//! sent to every in-use proxy node, and the listener that answers it.
//!
//! Packet layout (`spec.md` §6), all multi-byte integers network order:
//! `{challenge[32], server_id: u64, zone_uin: u32, proxy_id_dest: u32,
//! proxy_id_self: u32, hmac_sha256[32]}`. Bytes `0..len-32` are HMAC'd.

use crate::model::{DataCollectionProxy, ZoneConfiguration};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

const PACKET_LEN: usize = 32 + 8 + 4 + 4 + 4 + 32;
const SIGNED_LEN: usize = PACKET_LEN - 32;
const MAX_RETRIES: u32 = 5;
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const CHECK_INTERVAL: Duration = Duration::from_secs(30);

struct Packet {
    challenge: [u8; 32],
    server_id: u64,
    zone_uin: u32,
    proxy_id_dest: u32,
    proxy_id_self: u32,
    hmac: [u8; 32],
}

impl Packet {
    fn sign(mut self, secret: &[u8; 32]) -> Self {
        let signed = self.to_signed_bytes();
        let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
        mac.update(&signed);
        self.hmac.copy_from_slice(&mac.finalize().into_bytes());
        self
    }

    fn to_signed_bytes(&self) -> [u8; SIGNED_LEN] {
        let mut buf = [0u8; SIGNED_LEN];
        buf[0..32].copy_from_slice(&self.challenge);
        buf[32..40].copy_from_slice(&self.server_id.to_be_bytes());
        buf[40..44].copy_from_slice(&self.zone_uin.to_be_bytes());
        buf[44..48].copy_from_slice(&self.proxy_id_dest.to_be_bytes());
        buf[48..52].copy_from_slice(&self.proxy_id_self.to_be_bytes());
        buf
    }

    fn to_bytes(&self) -> [u8; PACKET_LEN] {
        let mut buf = [0u8; PACKET_LEN];
        buf[..SIGNED_LEN].copy_from_slice(&self.to_signed_bytes());
        buf[SIGNED_LEN..].copy_from_slice(&self.hmac);
        buf
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != PACKET_LEN {
            return None;
        }
        let mut challenge = [0u8; 32];
        challenge.copy_from_slice(&bytes[0..32]);
        let server_id = u64::from_be_bytes(bytes[32..40].try_into().ok()?);
        let zone_uin = u32::from_be_bytes(bytes[40..44].try_into().ok()?);
        let proxy_id_dest = u32::from_be_bytes(bytes[44..48].try_into().ok()?);
        let proxy_id_self = u32::from_be_bytes(bytes[48..52].try_into().ok()?);
        let mut hmac = [0u8; 32];
        hmac.copy_from_slice(&bytes[52..84]);
        Some(Self {
            challenge,
            server_id,
            zone_uin,
            proxy_id_dest,
            proxy_id_self,
            hmac,
        })
    }

    fn verify(&self, secret: &[u8; 32]) -> bool {
        let signed = self.to_signed_bytes();
        let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
        mac.update(&signed);
        mac.verify_slice(&self.hmac).is_ok()
    }
}

/// Probes every in-use proxy for `server_id` once, updating `connected`
/// on each entry. `spec.md`: "retries up to five times; any one valid
/// reply sets connected=true for this tick, otherwise connected=false."
pub async fn check_once(
    socket: &UdpSocket,
    zone: &ZoneConfiguration,
    proxies: &DashMap<(u64, u32), DataCollectionProxy>,
) {
    let targets: Vec<DataCollectionProxy> = proxies
        .iter()
        .filter(|e| e.key().0 == zone.server_id && e.value().in_use)
        .map(|e| e.value().clone())
        .collect();

    for proxy in targets {
        let connected = probe_one(socket, zone, &proxy).await;
        if let Some(mut entry) = proxies.get_mut(&(zone.server_id, proxy.proxy_id)) {
            entry.connected = connected;
        }
        debug!(proxy_id = proxy.proxy_id, connected, "peer-liveness check");
    }
}

async fn probe_one(socket: &UdpSocket, zone: &ZoneConfiguration, proxy: &DataCollectionProxy) -> bool {
    let addr: SocketAddr = match proxy.address.parse() {
        Ok(addr) => addr,
        Err(_) => return false,
    };

    let mut challenge = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut challenge);

    let request = Packet {
        challenge,
        server_id: zone.server_id,
        zone_uin: zone.zone_uin,
        proxy_id_dest: proxy.proxy_id,
        proxy_id_self: zone.this_node_id,
        hmac: [0u8; 32],
    }
    .sign(&zone.shared_secret);

    let mut buf = [0u8; PACKET_LEN];
    for attempt in 0..=MAX_RETRIES {
        if socket.send_to(&request.to_bytes(), addr).await.is_err() {
            return false;
        }
        match tokio::time::timeout(PROBE_TIMEOUT, socket.recv_from(&mut buf)).await {
            Ok(Ok((n, from))) if from == addr && n == PACKET_LEN => {
                if let Some(reply) = Packet::from_bytes(&buf[..n]) {
                    if reply.verify(&zone.shared_secret)
                        && reply.challenge == request.challenge
                        && reply.proxy_id_dest == zone.this_node_id
                        && reply.proxy_id_self == proxy.proxy_id
                    {
                        return true;
                    }
                }
            }
            _ => {
                debug!(proxy_id = proxy.proxy_id, attempt, "liveness probe attempt failed");
            }
        }
    }
    false
}

/// The receiving side (`spec.md`: "The same listener on the receiving side
/// validates the signature, the stored this-node-id, the zone-uin, and
/// that the sender appears in the local proxy list.").
pub async fn run_listener(
    socket: Arc<UdpSocket>,
    zones: Arc<DashMap<u64, ZoneConfiguration>>,
    proxies: Arc<DashMap<(u64, u32), DataCollectionProxy>>,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; PACKET_LEN];
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            result = socket.recv_from(&mut buf) => {
                let (n, from) = match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "liveness listener recv failed");
                        continue;
                    }
                };
                let Some(request) = Packet::from_bytes(&buf[..n]) else { continue };
                let Some(zone) = zones.get(&request.server_id).map(|z| z.clone()) else { continue };
                if request.zone_uin != zone.zone_uin || request.proxy_id_dest != zone.this_node_id {
                    continue;
                }
                if !request.verify(&zone.shared_secret) {
                    continue;
                }
                if !proxies.contains_key(&(request.server_id, request.proxy_id_self)) {
                    continue;
                }

                let reply = Packet {
                    challenge: request.challenge,
                    server_id: request.server_id,
                    zone_uin: request.zone_uin,
                    proxy_id_dest: request.proxy_id_self,
                    proxy_id_self: request.proxy_id_dest,
                    hmac: [0u8; 32],
                }
                .sign(&zone.shared_secret);

                let _ = socket.send_to(&reply.to_bytes(), from).await;
            }
        }
    }
}

/// Drives periodic liveness checks for every configured zone until
/// `shutdown` fires.
pub async fn run(
    socket: Arc<UdpSocket>,
    zones: Arc<DashMap<u64, ZoneConfiguration>>,
    proxies: Arc<DashMap<(u64, u32), DataCollectionProxy>>,
    shutdown: CancellationToken,
) {
    loop {
        let zone_list: Vec<ZoneConfiguration> = zones.iter().map(|e| e.value().clone()).collect();
        for zone in zone_list {
            check_once(&socket, &zone, &proxies).await;
        }
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(CHECK_INTERVAL) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_zone() -> ZoneConfiguration {
        ZoneConfiguration {
            server_id: 1,
            this_node_id: 10,
            zone_uin: 99,
            shared_secret: [7u8; 32],
        }
    }

    #[test]
    fn packet_round_trips_through_bytes() {
        let packet = Packet {
            challenge: [1u8; 32],
            server_id: 1,
            zone_uin: 99,
            proxy_id_dest: 5,
            proxy_id_self: 10,
            hmac: [0u8; 32],
        }
        .sign(&[7u8; 32]);
        let bytes = packet.to_bytes();
        let decoded = Packet::from_bytes(&bytes).unwrap();
        assert!(decoded.verify(&[7u8; 32]));
        assert_eq!(decoded.server_id, 1);
        assert_eq!(decoded.proxy_id_dest, 5);
    }

    #[test]
    fn tampered_packet_fails_verification() {
        let packet = Packet {
            challenge: [1u8; 32],
            server_id: 1,
            zone_uin: 99,
            proxy_id_dest: 5,
            proxy_id_self: 10,
            hmac: [0u8; 32],
        }
        .sign(&[7u8; 32]);
        let mut bytes = packet.to_bytes();
        bytes[0] ^= 0xff;
        let decoded = Packet::from_bytes(&bytes).unwrap();
        assert!(!decoded.verify(&[7u8; 32]));
    }

    #[tokio::test]
    async fn probe_against_an_answering_peer_reports_connected() {
        let zone = sample_zone();
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let responder_addr = responder.local_addr().unwrap();
        let responder = Arc::new(responder);
        let zones = Arc::new(DashMap::new());
        zones.insert(zone.server_id, zone.clone());
        // The listener's local proxy list must recognize the prober's own
        // id (10) as a known peer for the sender-in-proxy-list check.
        let proxies = Arc::new(DashMap::new());
        proxies.insert(
            (zone.server_id, 10),
            DataCollectionProxy {
                server_id: zone.server_id,
                proxy_id: 10,
                address: "127.0.0.1:0".into(),
                in_use: true,
                connected: false,
            },
        );

        let shutdown = CancellationToken::new();
        let listener_task = tokio::spawn(run_listener(
            responder.clone(),
            zones.clone(),
            proxies.clone(),
            shutdown.clone(),
        ));

        let prober = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let proxy = DataCollectionProxy {
            server_id: zone.server_id,
            proxy_id: 10,
            address: responder_addr.to_string(),
            in_use: true,
            connected: false,
        };
        let connected = probe_one(&prober, &zone, &proxy).await;
        assert!(connected);

        shutdown.cancel();
        listener_task.abort();
    }
}
