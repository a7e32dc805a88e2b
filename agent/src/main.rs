//! # Monitoring Endpoint Daemon
//!
//! A session-oriented agent core: it accepts inbound server sessions and
//! dials outbound tunnels, runs the data-collection pipeline against
//! local and SNMP-proxied sources, proxies SNMP requests and trap/syslog
//! notifications on behalf of peer agents, and exposes a small set of
//! local IPC endpoints.
//!
//! ## Modules
//!
//! - [`config`]   — resolved runtime configuration
//! - [`session`]  — the session state machine shared by inbound and
//!   tunnel-originated connections
//! - [`dispatch`] — the request-code -> handler table every session's
//!   processing loop runs through
//! - [`inbound`]  — the TCP/TLS accept loop
//! - [`tunnel`]   — outbound tunnel management and virtual channels
//! - [`pipeline`] — data-collection scheduling, collection, and storage
//! - [`proxy`]    — SNMP proxying, trap/syslog receivers, peer liveness,
//!   TCP-proxy channel pumps
//! - [`ipc`]      — local Unix-domain-socket endpoints
//! - [`registry`] — process-wide metric/action/AI-tool/plugin registries
//! - [`db`]       — the local SQLite store
//! - [`api`]      — the operator-facing status endpoint

mod api;
mod config;
mod db;
mod dispatch;
mod error;
mod inbound;
mod ipc;
mod model;
mod pipeline;
mod proxy;
mod registry;
mod session;
mod state;
mod transport;
mod tunnel;

use axum::{routing::get, Router};
use config::Config;
use registry::actions::ActionRegistry;
use registry::aitools::AiToolRegistry;
use registry::metrics::MetricRegistryBuilder;
use registry::plugin::PluginManager;
use session::SessionRegistry;
use state::AppState;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

const SESSION_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);
const ACTION_EXEC_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Brings up every supervised task and blocks until `Ctrl-C`/`SIGTERM`,
/// then drives an orderly shutdown in reverse start order (`spec.md`
/// §4.7 "Process supervisor", §9 "shutdown propagates through every
/// registry in reverse init order").
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "agentd=info".into()),
        )
        .init();

    let config = Arc::new(Config::default().normalize());
    let started_at_ms = model::now_ms();

    let db = match db::open(&config.db_path) {
        Ok(db) => db,
        Err(e) => {
            tracing::error!(error = %e, "failed to open local database, aborting");
            std::process::exit(1);
        }
    };

    // Process-supplied metrics are registered before any plugin's own, so
    // they can never be shadowed by a later duplicate registration.
    let mut metric_builder = MetricRegistryBuilder::new();
    for reg in registry::metrics::builtin_registrations(started_at_ms) {
        metric_builder.register(reg);
    }
    for name in metric_builder.shadowed_names() {
        warn!(metric = %name, "duplicate metric registration shadowed");
    }
    let metric_registry = Arc::new(metric_builder.build());

    // No concrete plugins ship with this core (`spec.md` §1); the action
    // and AI-tool registries still dispatch whatever a future plugin load
    // registers into them.
    let action_registry = Arc::new(ActionRegistry::new(ACTION_EXEC_TIMEOUT));
    let ai_tool_registry = Arc::new(AiToolRegistry::new());
    let mut plugin_manager = PluginManager::new();
    info!(loaded = plugin_manager.loaded_count(), "plugin manager ready, no plugins configured");

    let session_registry = Arc::new(SessionRegistry::new(config.max_sessions));

    let (element_tx, element_rx) = pipeline::element_channel();
    let pipeline = Arc::new(pipeline::Pipeline::new(db, config.snmp_poller_cap, element_tx));

    // Shared by every session's processing loop regardless of which
    // transport it runs over (`spec.md` §2 "a Session is the single
    // demultiplexing point").
    let dispatch_ctx = dispatch::DispatchContext {
        pipeline: pipeline.clone(),
        metric_registry: metric_registry.clone(),
        action_registry,
        ai_tool_registry,
        snmp_request_timeout: config.snmp_request_timeout,
    };

    let shutdown = CancellationToken::new();
    let mut tasks = tokio::task::JoinSet::new();

    let tls_acceptor = if config.tls_enabled {
        match inbound::build_server_tls_acceptor(&config.cert_directory) {
            Ok(acceptor) => acceptor,
            Err(e) => {
                warn!(error = %e, "failed to build server tls acceptor, running unencrypted");
                None
            }
        }
    } else {
        None
    };
    let listener = Arc::new(inbound::Listener::new(
        config.clone(),
        session_registry.clone(),
        tls_acceptor,
        dispatch_ctx.clone(),
    ));
    {
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            if let Err(e) = listener.run(shutdown).await {
                tracing::error!(error = %e, "inbound listener exited");
            }
        });
    }

    tasks.spawn(session::watchdog::run(
        session_registry.clone(),
        config.idle_timeout,
        SESSION_SWEEP_INTERVAL,
        shutdown.clone(),
    ));

    {
        let pipeline = pipeline.clone();
        let config = config.clone();
        let metric_registry = metric_registry.clone();
        let session_registry = session_registry.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            pipeline::run_all(pipeline, config, metric_registry, session_registry, element_rx, shutdown).await;
        });
    }

    let (notification_tx, notification_rx) = tokio::sync::mpsc::channel(1024);
    if let Some((addr, port)) = config.snmp_trap_bind {
        let queue = notification_tx.clone();
        let shutdown = shutdown.clone();
        let zone_uin = config.zone_uin;
        tasks.spawn(async move {
            proxy::trap::run(SocketAddr::from((addr, port)), zone_uin, queue, shutdown).await;
        });
    }
    if let Some((addr, port)) = config.syslog_bind {
        let queue = notification_tx.clone();
        let shutdown = shutdown.clone();
        let zone_uin = config.zone_uin;
        tasks.spawn(async move {
            proxy::syslog::run(SocketAddr::from((addr, port)), zone_uin, queue, shutdown).await;
        });
    }
    tasks.spawn(proxy::forwarder::run(notification_rx, session_registry.clone(), shutdown.clone()));

    if let Some((addr, port)) = config.liveness_bind {
        match UdpSocket::bind(SocketAddr::from((addr, port))).await {
            Ok(socket) => {
                let socket = Arc::new(socket);
                tasks.spawn(proxy::liveness::run_listener(
                    socket.clone(),
                    pipeline.zones.clone(),
                    pipeline.proxies.clone(),
                    shutdown.clone(),
                ));
                tasks.spawn(proxy::liveness::run(
                    socket,
                    pipeline.zones.clone(),
                    pipeline.proxies.clone(),
                    shutdown.clone(),
                ));
            }
            Err(e) => warn!(%addr, %port, error = %e, "failed to bind peer-liveness socket"),
        }
    }

    if let Some(path) = &config.push_socket_path {
        let path = path.clone();
        let queue = notification_tx.clone();
        let zone_uin = config.zone_uin;
        let shutdown = shutdown.clone();
        tasks.spawn(async move { ipc::run_push(path, zone_uin, queue, shutdown).await });
    }
    if let Some(path) = &config.session_agent_socket_path {
        let path = path.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move { ipc::run_session_agent(path, shutdown).await });
    }
    if let Some(path) = &config.master_agent_socket_path {
        let path = path.clone();
        let metric_registry = metric_registry.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move { ipc::run_master_agent(path, metric_registry, shutdown).await });
    }

    let force_resolve = Arc::new(AtomicBool::new(false));
    {
        let config = config.clone();
        let session_registry = session_registry.clone();
        let force_resolve = force_resolve.clone();
        let dispatch_ctx = dispatch_ctx.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            tunnel::run_all(config, session_registry, dispatch_ctx, force_resolve, shutdown).await
        });
    }

    if let Some((addr, port)) = config.status_api_bind {
        let app_state = AppState::new(session_registry.clone(), pipeline.clone(), config.tunnels.len());
        let app = Router::new()
            .route("/status", get(api::status))
            .layer(CorsLayer::permissive())
            .with_state(app_state);
        let bind_addr = SocketAddr::from((addr, port));
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            let listener = match tokio::net::TcpListener::bind(bind_addr).await {
                Ok(l) => l,
                Err(e) => {
                    warn!(%bind_addr, error = %e, "failed to bind status endpoint");
                    return;
                }
            };
            info!(%bind_addr, "status endpoint ready");
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = serve.await {
                warn!(error = %e, "status endpoint exited");
            }
        });
    }

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining supervised tasks");
    shutdown.cancel();
    while tasks.join_next().await.is_some() {}

    // Registry teardown happens in reverse init order: plugins (the
    // outermost consumers) first, then the sessions they were serving.
    plugin_manager.shutdown_all();
    session_registry.shutdown();
    info!("agentd shut down cleanly");
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
