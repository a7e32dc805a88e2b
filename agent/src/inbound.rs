//! The inbound session layer (`spec.md` §4.1 "Session layer (inbound)").
//!
//! Accepts TCP connections on the configured bind addresses, admits only
//! peers matching the server allowlist, optionally layers TLS, and spawns
//! a [`Session`] per accepted connection.

use crate::config::{Config, ServerAllowlistEntry};
use crate::dispatch::DispatchContext;
use crate::error::AgentResult;
use crate::session::{RoleFlags, Session, SessionOrigin, SessionRegistry, SessionState};
use crate::transport::FramedIoTransport;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Consecutive-admission-failure count beyond which a peer address is
/// throttled for [`RETRY_STORM_COOLDOWN`] (`spec.md` §4.1 "A per-peer
/// retry storm is bounded by a consecutive-error counter that throttles
/// the accept loop.").
const RETRY_STORM_THRESHOLD: u32 = 5;
const RETRY_STORM_COOLDOWN: Duration = Duration::from_secs(30);

/// The outcome of matching a peer address against the server allowlist.
struct Admission {
    role: RoleFlags,
    auth_required: bool,
}

fn match_allowlist(servers: &[ServerAllowlistEntry], peer: IpAddr) -> Option<Admission> {
    servers.iter().find_map(|entry| {
        let matches = entry
            .host
            .parse::<IpAddr>()
            .map(|addr| addr == peer)
            .unwrap_or(false);
        if !matches {
            return None;
        }
        let mut role = RoleFlags::empty();
        if entry.is_master {
            role |= RoleFlags::MASTER;
        }
        if entry.is_control {
            role |= RoleFlags::CONTROL;
        }
        Some(Admission {
            role,
            auth_required: entry.auth_required,
        })
    })
}

struct RetryStorm {
    counters: Mutex<HashMap<IpAddr, (u32, std::time::Instant)>>,
}

impl RetryStorm {
    fn new() -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `peer` is currently throttled due to repeated admission
    /// failures.
    async fn is_throttled(&self, peer: IpAddr) -> bool {
        let counters = self.counters.lock().await;
        matches!(counters.get(&peer), Some((count, since)) if *count >= RETRY_STORM_THRESHOLD && since.elapsed() < RETRY_STORM_COOLDOWN)
    }

    async fn record_failure(&self, peer: IpAddr) {
        let mut counters = self.counters.lock().await;
        let entry = counters.entry(peer).or_insert((0, std::time::Instant::now()));
        entry.0 += 1;
        entry.1 = std::time::Instant::now();
    }

    async fn record_success(&self, peer: IpAddr) {
        self.counters.lock().await.remove(&peer);
    }
}

pub struct Listener {
    config: Arc<Config>,
    registry: Arc<SessionRegistry>,
    tls_acceptor: Option<TlsAcceptor>,
    retry_storm: RetryStorm,
    dispatch_ctx: DispatchContext,
}

impl Listener {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<SessionRegistry>,
        tls_acceptor: Option<TlsAcceptor>,
        dispatch_ctx: DispatchContext,
    ) -> Self {
        Self {
            config,
            registry,
            tls_acceptor,
            retry_storm: RetryStorm::new(),
            dispatch_ctx,
        }
    }

    /// Binds every configured address and serves inbound connections until
    /// `shutdown` is cancelled. Bind failure on every configured listener
    /// is fatal (`spec.md` §7).
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> AgentResult<()> {
        let mut listeners = Vec::new();
        for addr in &self.config.bind_addresses {
            match TcpListener::bind((*addr, self.config.bind_port)).await {
                Ok(listener) => listeners.push(listener),
                Err(e) => warn!(%addr, error = %e, "failed to bind inbound listener"),
            }
        }
        if listeners.is_empty() {
            return Err(crate::error::AgentError::IoFailure(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "no configured bind address could be bound",
            )));
        }

        let mut accept_tasks = tokio::task::JoinSet::new();
        for listener in listeners {
            let this = self.clone();
            let shutdown = shutdown.clone();
            accept_tasks.spawn(async move { this.accept_loop(listener, shutdown).await });
        }
        while accept_tasks.join_next().await.is_some() {}
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => return,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };

            let peer_ip = peer.ip();
            if self.retry_storm.is_throttled(peer_ip).await {
                debug!(%peer_ip, "peer throttled after repeated admission failures");
                continue;
            }

            let admission = match match_allowlist(&self.config.servers, peer_ip) {
                Some(admission) => admission,
                None => {
                    debug!(%peer_ip, "rejecting connection, not in server allowlist");
                    self.retry_storm.record_failure(peer_ip).await;
                    continue;
                }
            };
            self.retry_storm.record_success(peer_ip).await;

            let this = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = this.serve_connection(stream, admission, shutdown).await {
                    debug!(%peer_ip, error = %e, "session ended with an error");
                }
            });
        }
    }

    async fn serve_connection(
        self: Arc<Self>,
        stream: TcpStream,
        admission: Admission,
        shutdown: CancellationToken,
    ) -> AgentResult<()> {
        let _ = stream.set_nodelay(true);

        let (transport, reader, writer) = if let Some(acceptor) = &self.tls_acceptor {
            let tls_stream = acceptor
                .accept(stream)
                .await
                .map_err(|e| crate::error::AgentError::EncryptionError(e.to_string()))?;
            let (t, r, w) = FramedIoTransport::spawn(tls_stream);
            (t as Arc<dyn crate::transport::Transport>, r, w)
        } else {
            let (t, r, w) = FramedIoTransport::spawn(stream);
            (t as Arc<dyn crate::transport::Transport>, r, w)
        };

        let session = Arc::new(Session::new(
            SessionOrigin::Inbound,
            admission.role,
            admission.auth_required,
            transport,
        ));
        session.transition(if admission.auth_required {
            SessionState::Authenticating
        } else {
            SessionState::Ready
        }).await?;
        if let Err(e) = self.registry.register(session.clone()) {
            warn!(session = %session.id, "session cap reached, rejecting connection");
            session.close();
            reader.abort();
            writer.abort();
            return Err(e);
        }
        info!(session = %session.id, "inbound session established");

        let result = crate::dispatch::run_session(self.dispatch_ctx.clone(), session.clone(), shutdown.clone()).await;

        let _ = session.transition(SessionState::Draining).await;
        session.close();
        reader.abort();
        writer.abort();
        let _ = session.transition(SessionState::Closed).await;
        self.registry.remove(&session.id);
        result
    }
}

/// Builds the server-side `TlsAcceptor` from `server.crt`/`server.key`
/// under `cert_directory`. Their provisioning is a collaborator concern
/// (`spec.md` §1); a missing pair just means inbound sessions run
/// unencrypted and a warning is logged.
pub fn build_server_tls_acceptor(cert_directory: &std::path::Path) -> AgentResult<Option<TlsAcceptor>> {
    let cert_path = cert_directory.join("server.crt");
    let key_path = cert_directory.join("server.key");
    if !cert_path.exists() || !key_path.exists() {
        warn!(dir = %cert_directory.display(), "no server certificate found, inbound sessions will be unencrypted");
        return Ok(None);
    }

    let cert_pem = std::fs::read(&cert_path).map_err(|e| crate::error::AgentError::FileOpenError(e.to_string()))?;
    let key_pem = std::fs::read(&key_path).map_err(|e| crate::error::AgentError::FileOpenError(e.to_string()))?;

    let certs: Vec<rustls::pki_types::CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| crate::error::AgentError::EncryptionError(e.to_string()))?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|e| crate::error::AgentError::EncryptionError(e.to_string()))?
        .ok_or_else(|| crate::error::AgentError::EncryptionError("no private key found in PEM".into()))?;

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| crate::error::AgentError::EncryptionError(e.to_string()))?;
    Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(host: &str) -> ServerAllowlistEntry {
        ServerAllowlistEntry {
            host: host.to_string(),
            is_master: true,
            is_control: false,
            auth_required: true,
            shared_secret: None,
        }
    }

    #[test]
    fn matching_peer_carries_role_bits() {
        let servers = vec![entry("10.0.0.1")];
        let admission = match_allowlist(&servers, "10.0.0.1".parse().unwrap()).unwrap();
        assert!(admission.role.contains(RoleFlags::MASTER));
        assert!(admission.auth_required);
    }

    #[test]
    fn non_matching_peer_is_rejected() {
        let servers = vec![entry("10.0.0.1")];
        assert!(match_allowlist(&servers, "10.0.0.2".parse().unwrap()).is_none());
    }

    #[tokio::test]
    async fn repeated_failures_trigger_throttling() {
        let storm = RetryStorm::new();
        let peer: IpAddr = "10.0.0.9".parse().unwrap();
        for _ in 0..RETRY_STORM_THRESHOLD {
            storm.record_failure(peer).await;
        }
        assert!(storm.is_throttled(peer).await);
        storm.record_success(peer).await;
        assert!(!storm.is_throttled(peer).await);
    }
}
