//! Idle-timeout watchdog (`spec.md` §4.1 "The watchdog moves a READY
//! session to DRAINING if `now - last_activity > idle_timeout`.").

use super::{SessionRegistry, SessionState};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Sweeps the session registry on a fixed interval, draining and closing
/// any `READY` session that has exceeded `idle_timeout`. Runs until
/// `shutdown` is cancelled (`spec.md` §5 "global flag checked at every
/// sleep/poll wake").
pub async fn run(
    registry: Arc<SessionRegistry>,
    idle_timeout: Duration,
    sweep_interval: Duration,
    shutdown: CancellationToken,
) {
    let idle_timeout_ms = idle_timeout.as_millis() as i64;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("session watchdog shutting down");
                return;
            }
            _ = tokio::time::sleep(sweep_interval) => {}
        }

        for session in registry.values_snapshot() {
            if session.state().await != SessionState::Ready {
                continue;
            }
            if session.idle_for_ms() > idle_timeout_ms {
                debug!(session = %session.id, "idle timeout exceeded, draining session");
                if session.transition(SessionState::Draining).await.is_ok() {
                    session.close();
                    let _ = session.transition(SessionState::Closed).await;
                    registry.remove(&session.id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{RoleFlags, Session, SessionOrigin};
    use super::*;
    use crate::transport::VirtualSession;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn idle_session_is_drained_and_removed() {
        let registry = Arc::new(SessionRegistry::new(8));
        let session = Arc::new(Session::new(
            SessionOrigin::Inbound,
            RoleFlags::empty(),
            false,
            Arc::new(VirtualSession::new()),
        ));
        session.transition(SessionState::Ready).await.unwrap();
        let id = session.id;
        registry.register(session).unwrap();

        let shutdown = CancellationToken::new();
        let shutdown_clone = shutdown.clone();
        let registry_clone = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(StdDuration::from_millis(30)).await;
            shutdown_clone.cancel();
        });
        run(
            registry_clone,
            StdDuration::from_millis(0),
            StdDuration::from_millis(5),
            shutdown,
        )
        .await;

        assert!(registry.get(&id).is_none());
    }
}
