//! The outbound tunnel layer (`spec.md` §3 "Tunnel", §4.2).
//!
//! Maintains, per configured upstream, a persistent mutually-authenticated
//! TLS connection and a demux of [`channel::VirtualChannel`]s on top of it.

pub mod cert;
pub mod channel;
pub mod verify;

use crate::config::{Config, TunnelTarget};
use crate::dispatch::DispatchContext;
use crate::error::{AgentError, AgentResult};
use crate::registry::Registry;
use crate::session::{RoleFlags, Session, SessionOrigin, SessionRegistry, SessionState};
use crate::transport::{FramedIoTransport, Transport};
use agentd_protocol::{FramedMessage, MessageCode};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::ClientConfig;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Consecutive handshake failures after which the next attempt drops the
/// client certificate once (`spec.md` §7 "TLS handshake errors").
const CERT_DROP_THRESHOLD: u32 = 10;
const MAX_BACKOFF: Duration = Duration::from_secs(60);

fn field_agent_id() -> u32 {
    1
}
fn field_system_name() -> u32 {
    2
}
fn field_zone_uin() -> u32 {
    3
}

/// Connection/backoff state for one configured upstream, plus its table
/// of live virtual channels (`spec.md` §3 "Tunnel").
pub struct Tunnel {
    target: TunnelTarget,
    config: Arc<Config>,
    channels: Registry<u32, Arc<channel::VirtualChannel>>,
    next_channel_id: AtomicU32,
    consecutive_failures: AtomicU32,
    tls_failures: AtomicU32,
}

impl Tunnel {
    pub fn new(target: TunnelTarget, config: Arc<Config>) -> Self {
        Self {
            target,
            config,
            channels: Registry::new(),
            next_channel_id: AtomicU32::new(1),
            consecutive_failures: AtomicU32::new(0),
            tls_failures: AtomicU32::new(0),
        }
    }

    fn backoff_delay(&self) -> Duration {
        let failures = self.consecutive_failures.load(Ordering::Relaxed).min(6);
        let secs = 1u64 << failures;
        Duration::from_secs(secs).min(MAX_BACKOFF)
    }

    fn build_client_config(&self, drop_client_cert: bool) -> AgentResult<ClientConfig> {
        let verifier = verify::PinningVerifier::new(
            self.target.verify_trust_store,
            self.target.pinned_fingerprint.as_deref(),
        )
        .map_err(|e| AgentError::EncryptionError(e.to_string()))?;

        let builder = ClientConfig::builder().with_custom_certificate_verifier(Arc::new(verifier));

        if drop_client_cert {
            return Ok(builder.with_no_client_auth());
        }

        match cert::resolve_client_identity(&self.target, &self.config.cert_directory)? {
            Some(identity) => {
                let cert_chain: Vec<CertificateDer<'static>> =
                    rustls_pemfile::certs(&mut identity.cert_pem.as_bytes())
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(|e| AgentError::EncryptionError(e.to_string()))?;
                let key = rustls_pemfile::private_key(&mut identity.key_pem.as_bytes())
                    .map_err(|e| AgentError::EncryptionError(e.to_string()))?
                    .ok_or_else(|| AgentError::EncryptionError("no private key found in PEM".into()))?;
                builder
                    .with_client_auth_cert(cert_chain, key)
                    .map_err(|e| AgentError::EncryptionError(e.to_string()))
            }
            None => Ok(builder.with_no_client_auth()),
        }
    }

    fn allocate_channel_id(&self) -> u32 {
        self.next_channel_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Drives the connect/handshake/serve/disconnect loop forever, with
    /// bounded backoff, until `shutdown` is cancelled (`spec.md` §3
    /// "Tunnel" lifecycle).
    pub async fn run(
        self: Arc<Self>,
        session_registry: Arc<SessionRegistry>,
        dispatch_ctx: DispatchContext,
        force_resolve: Arc<std::sync::atomic::AtomicBool>,
        shutdown: CancellationToken,
    ) {
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            match self
                .connect_and_serve(&session_registry, &dispatch_ctx, &force_resolve, &shutdown)
                .await
            {
                Ok(()) => {
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!(hostname = %self.target.hostname, error = %e, "tunnel attempt failed");
                    self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
            if shutdown.is_cancelled() {
                return;
            }
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.backoff_delay()) => {}
            }
        }
    }

    async fn connect_and_serve(
        &self,
        session_registry: &Arc<SessionRegistry>,
        dispatch_ctx: &DispatchContext,
        force_resolve: &Arc<std::sync::atomic::AtomicBool>,
        shutdown: &CancellationToken,
    ) -> AgentResult<()> {
        let mut addrs = tokio::net::lookup_host((self.target.hostname.as_str(), self.target.port))
            .await
            .map_err(AgentError::IoFailure)?;
        let addr = addrs
            .next()
            .ok_or_else(|| AgentError::SocketError("hostname resolved to no addresses".into()))?;

        let stream = TcpStream::connect(addr).await.map_err(AgentError::IoFailure)?;
        let _ = stream.set_nodelay(true);

        let drop_client_cert = self.tls_failures.load(Ordering::Relaxed) >= CERT_DROP_THRESHOLD;
        let client_config = self.build_client_config(drop_client_cert)?;
        let connector = TlsConnector::from(Arc::new(client_config));
        let server_name = ServerName::try_from(self.target.hostname.clone())
            .map_err(|e| AgentError::EncryptionError(e.to_string()))?;

        let tls_stream = match connector.connect(server_name, stream).await {
            Ok(stream) => {
                self.tls_failures.store(0, Ordering::Relaxed);
                stream
            }
            Err(e) => {
                self.tls_failures.fetch_add(1, Ordering::Relaxed);
                return Err(AgentError::EncryptionError(e.to_string()));
            }
        };

        let (transport, reader, writer) = FramedIoTransport::spawn(tls_stream);
        let setup = FramedMessage::new(MessageCode::SetupAgentTunnel, 1)
            .with_field(field_agent_id(), self.agent_id_string())
            .with_field(field_system_name(), self.config.system_name.clone())
            .with_field(field_zone_uin(), self.config.zone_uin);
        transport.send(setup).await?;

        let reply = transport
            .recv()
            .await?
            .ok_or_else(|| AgentError::ConnectionBroken)?;
        if reply.code != MessageCode::RequestCompleted {
            reader.abort();
            writer.abort();
            return Err(AgentError::AuthenticationFailed);
        }

        info!(hostname = %self.target.hostname, "tunnel established");
        force_resolve.store(true, Ordering::Relaxed);

        let result = self.demux(transport, session_registry, dispatch_ctx, shutdown).await;
        reader.abort();
        writer.abort();
        self.channels.shutdown();
        result
    }

    fn agent_id_string(&self) -> String {
        self.config.agent_id.to_string()
    }

    /// Reads frames off the tunnel's single transport and fans them out:
    /// `CreateChannel` promotes a channel to a full [`Session`];
    /// `ChannelData` delivers bytes into an existing channel;
    /// `CloseChannel` tears one down; `ResetTunnel` or a read error ends
    /// the loop so the caller reconnects (`spec.md` §4.2 "Tunnel reset").
    async fn demux(
        &self,
        transport: Arc<FramedIoTransport>,
        session_registry: &Arc<SessionRegistry>,
        dispatch_ctx: &DispatchContext,
        shutdown: &CancellationToken,
    ) -> AgentResult<()> {
        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                received = transport.recv() => received?,
            };
            let Some(message) = message else {
                return Err(AgentError::ConnectionBroken);
            };

            match message.code {
                MessageCode::ResetTunnel => return Ok(()),
                MessageCode::CreateChannel => {
                    let channel_id = self.allocate_channel_id();
                    let (vchannel, mut outbound_rx) = channel::VirtualChannel::new(channel_id);
                    self.channels.insert(channel_id, vchannel.clone());

                    // Ships whatever the promoted session writes back as
                    // ChannelData frames on the tunnel's own transport.
                    let pump_transport = transport.clone();
                    tokio::spawn(async move {
                        while let Some(data) = outbound_rx.recv().await {
                            let frame = FramedMessage::new(MessageCode::ChannelData, 0)
                                .with_field(1, channel_id)
                                .with_field(2, data);
                            if pump_transport.send(frame).await.is_err() {
                                break;
                            }
                        }
                    });

                    let channel_transport: Arc<dyn Transport> =
                        Arc::new(channel::VirtualChannelTransport::new(vchannel));
                    let session = Arc::new(Session::new(
                        SessionOrigin::Virtual,
                        RoleFlags::empty(),
                        false,
                        channel_transport,
                    ));
                    if let Err(e) = session.transition(SessionState::Ready).await {
                        debug!(error = %e, "failed to ready a tunnel-promoted session");
                        self.channels.remove(&channel_id);
                        continue;
                    }
                    if let Err(e) = session_registry.register(session.clone()) {
                        debug!(error = %e, "failed to promote tunnel channel to a session");
                        session.close();
                        self.channels.remove(&channel_id);
                        continue;
                    }

                    // The same dispatch loop an inbound session runs
                    // (`spec.md` §4.2 "promoted to full inbound-session
                    // semantics").
                    let dispatch_ctx = dispatch_ctx.clone();
                    let run_shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        let _ = crate::dispatch::run_session(dispatch_ctx, session, run_shutdown).await;
                    });
                }
                MessageCode::ChannelData => {
                    if let Some(id) = message.field(1).and_then(|v| v.as_u32()) {
                        if let Some(vchannel) = self.channels.get(&id) {
                            if let Some(data) = message.field(2).and_then(|v| match v {
                                agentd_protocol::FieldValue::Binary(bytes) => Some(bytes.clone()),
                                _ => None,
                            }) {
                                vchannel.deliver(data).await;
                            }
                        }
                    }
                }
                MessageCode::CloseChannel => {
                    if let Some(id) = message.field(1).and_then(|v| v.as_u32()) {
                        if let Some(vchannel) = self.channels.get(&id) {
                            vchannel.close();
                        }
                        self.channels.remove(&id);
                    }
                }
                _ => {
                    debug!(code = ?message.code, "unhandled frame on tunnel demux");
                }
            }
        }
    }
}

/// Drives every configured tunnel concurrently (`spec.md` §4.7 "tunnel
/// manager (one task that drives all configured tunnels)").
pub async fn run_all(
    config: Arc<Config>,
    session_registry: Arc<SessionRegistry>,
    dispatch_ctx: DispatchContext,
    force_resolve: Arc<std::sync::atomic::AtomicBool>,
    shutdown: CancellationToken,
) {
    let mut tasks = tokio::task::JoinSet::new();
    for target in config.tunnels.clone() {
        let tunnel = Arc::new(Tunnel::new(target, config.clone()));
        let session_registry = session_registry.clone();
        let dispatch_ctx = dispatch_ctx.clone();
        let force_resolve = force_resolve.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move { tunnel.run(session_registry, dispatch_ctx, force_resolve, shutdown).await });
    }
    while tasks.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_target() -> TunnelTarget {
        TunnelTarget {
            hostname: "server.example".into(),
            port: 4703,
            client_cert_path: None,
            host_store_alias: None,
            pinned_fingerprint: None,
            verify_trust_store: false,
            check_crl: false,
        }
    }

    #[test]
    fn backoff_is_capped_at_max_backoff() {
        let tunnel = Tunnel::new(test_target(), Arc::new(Config::default()));
        for _ in 0..20 {
            tunnel.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        }
        assert_eq!(tunnel.backoff_delay(), MAX_BACKOFF);
    }

    #[test]
    fn channel_ids_are_allocated_sequentially() {
        let tunnel = Tunnel::new(test_target(), Arc::new(Config::default()));
        let a = tunnel.allocate_channel_id();
        let b = tunnel.allocate_channel_id();
        assert_eq!(b, a + 1);
    }
}
