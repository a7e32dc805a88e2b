//! The session layer (`spec.md` §3 "Session", §4.1, §9 "Deep inheritance").
//!
//! A [`Session`] is the single demultiplexing point regardless of whether it
//! came from an inbound accept or a tunnel virtual channel (`spec.md` §2).
//! It owns a `Transport` trait object rather than a concrete socket type, so
//! the inbound listener and the outbound tunnel share every bit of dispatch,
//! wait-queue, and watchdog logic below this module.

pub mod watchdog;

use crate::error::{AgentError, AgentResult};
use crate::transport::Transport;
use agentd_protocol::{FramedMessage, MessageCode};
use bitflags::bitflags;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tracing::warn;
use uuid::Uuid;

bitflags! {
    /// Role bits carried by a server-allowlist match (`spec.md` §4.1
    /// "Admission").
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RoleFlags: u8 {
        const MASTER = 0x01;
        const CONTROL = 0x02;
        const READ_ONLY = 0x04;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOrigin {
    Inbound,
    Outbound,
    Virtual,
}

/// `NEW -> AUTHENTICATING -> READY -> DRAINING -> CLOSED` (`spec.md` §4.1
/// "Session state machine").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Authenticating,
    Ready,
    Draining,
    Closed,
}

impl SessionState {
    /// Whether `self -> next` is a legal transition per the state machine.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (New, Authenticating)
                | (New, Ready)
                | (Authenticating, Ready)
                | (Authenticating, Draining)
                | (Ready, Draining)
                | (Draining, Closed)
        )
    }
}

/// A logical conversation with one server (`spec.md` §3 "Session").
pub struct Session {
    pub id: Uuid,
    pub server_id: AtomicU64,
    pub origin: SessionOrigin,
    pub role: RoleFlags,
    pub auth_required: bool,
    state: Mutex<SessionState>,
    last_activity_ms: AtomicI64,
    transport: Arc<dyn Transport>,
    write_lock: Mutex<()>,
    wait_queue: Mutex<HashMap<(u16, u32), oneshot::Sender<FramedMessage>>>,
    next_request_id: AtomicUsize,
}

impl Session {
    pub fn new(origin: SessionOrigin, role: RoleFlags, auth_required: bool, transport: Arc<dyn Transport>) -> Self {
        Self {
            id: Uuid::new_v4(),
            server_id: AtomicU64::new(0),
            origin,
            role,
            auth_required,
            state: Mutex::new(SessionState::New),
            last_activity_ms: AtomicI64::new(crate::model::now_ms()),
            transport,
            write_lock: Mutex::new(()),
            wait_queue: Mutex::new(HashMap::new()),
            next_request_id: AtomicUsize::new(1),
        }
    }

    pub async fn state(&self) -> SessionState {
        *self.state.lock().await
    }

    /// Applies a state transition, rejecting illegal ones (a caller bug,
    /// not a protocol error — returns `Err` so callers can log and bail).
    pub async fn transition(&self, next: SessionState) -> AgentResult<()> {
        let mut state = self.state.lock().await;
        if !state.can_transition_to(next) {
            warn!(session = %self.id, from = ?*state, to = ?next, "illegal session state transition");
            return Err(AgentError::InternalError(
                "illegal session state transition".into(),
            ));
        }
        *state = next;
        Ok(())
    }

    pub fn touch(&self) {
        self.last_activity_ms.store(crate::model::now_ms(), Ordering::Relaxed);
    }

    pub fn idle_for_ms(&self) -> i64 {
        crate::model::now_ms() - self.last_activity_ms.load(Ordering::Relaxed)
    }

    pub fn server_id(&self) -> u64 {
        self.server_id.load(Ordering::Relaxed)
    }

    pub fn set_server_id(&self, server_id: u64) {
        self.server_id.store(server_id, Ordering::Relaxed);
    }

    /// Sends a frame, serialized under the session's writer mutex
    /// (`spec.md` §3 "a writer mutex"; §5 "Per-session outbound framing is
    /// serialized by the session's writer mutex").
    pub async fn send(&self, message: FramedMessage) -> AgentResult<()> {
        let _guard = self.write_lock.lock().await;
        self.transport.send(message).await
    }

    /// Allocates the next correlation id for a request originated by this
    /// session (as opposed to replying to one).
    pub fn next_id(&self) -> u32 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed) as u32
    }

    /// Registers a waiter for the reply to `(code, id)`, returning a future
    /// that resolves when [`Session::complete_wait`] delivers the matching
    /// frame (`spec.md` §3 "an in-memory wait-queue keyed by (code,id)").
    pub async fn wait_for(&self, code: MessageCode, id: u32) -> oneshot::Receiver<FramedMessage> {
        let (tx, rx) = oneshot::channel();
        self.wait_queue
            .lock()
            .await
            .insert((code.as_u16(), id), tx);
        rx
    }

    /// Delivers a reply frame to its waiter, if one is registered. Returns
    /// `true` if a waiter consumed it (the processing task should not also
    /// treat it as an unsolicited request in that case).
    pub async fn complete_wait(&self, code: u16, id: u32, message: FramedMessage) -> bool {
        if let Some(tx) = self.wait_queue.lock().await.remove(&(code, id)) {
            let _ = tx.send(message);
            true
        } else {
            false
        }
    }

    /// Reads the next frame that is not a reply to an outstanding
    /// `wait_for` — replies are routed to their waiter and otherwise
    /// swallowed, matching requests/notifications are handed to the
    /// caller for dispatch (`spec.md` §4.1 "The processing task maps
    /// request code -> handler").
    pub async fn recv_request(&self) -> AgentResult<Option<FramedMessage>> {
        loop {
            let message = match self.transport.recv().await? {
                Some(message) => message,
                None => return Ok(None),
            };
            self.touch();
            if self
                .complete_wait(message.code.as_u16(), message.id, message.clone())
                .await
            {
                continue;
            }
            return Ok(Some(message));
        }
    }

    pub fn close(&self) {
        self.transport.close();
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }
}

/// The process-wide session registry (`spec.md` §3 "Invariant: at most
/// `max_sessions` live sessions at once; registration enforces the cap and
/// rejects with a soft error beyond it.").
pub struct SessionRegistry {
    sessions: crate::registry::Registry<Uuid, Arc<Session>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: crate::registry::Registry::new(),
            max_sessions,
        }
    }

    pub fn register(&self, session: Arc<Session>) -> AgentResult<()> {
        if self.sessions.len() >= self.max_sessions {
            return Err(AgentError::OutOfResources);
        }
        self.sessions.insert(session.id, session);
        Ok(())
    }

    pub fn remove(&self, id: &Uuid) -> Option<Arc<Session>> {
        self.sessions.remove(id)
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<Session>> {
        self.sessions.get(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// A point-in-time snapshot of every registered session, for sweeps
    /// that must not hold the map locked across an `.await`.
    pub fn values_snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.values()
    }

    /// All sessions currently targeting `server_id`, for fan-out sends
    /// (the sender's "any can-accept-data session" lookup, broadcasts).
    pub fn sessions_for_server(&self, server_id: u64) -> Vec<Arc<Session>> {
        self.sessions
            .values()
            .into_iter()
            .filter(|s| s.server_id() == server_id)
            .collect()
    }

    pub fn shutdown(&self) {
        for session in self.sessions.values() {
            session.close();
        }
        self.sessions.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::VirtualSession;

    fn test_session() -> Arc<Session> {
        Arc::new(Session::new(
            SessionOrigin::Inbound,
            RoleFlags::empty(),
            false,
            Arc::new(VirtualSession::new()),
        ))
    }

    #[tokio::test]
    async fn new_session_starts_in_new_state() {
        let session = test_session();
        assert_eq!(session.state().await, SessionState::New);
    }

    #[tokio::test]
    async fn legal_transition_sequence_succeeds() {
        let session = test_session();
        session.transition(SessionState::Authenticating).await.unwrap();
        session.transition(SessionState::Ready).await.unwrap();
        session.transition(SessionState::Draining).await.unwrap();
        session.transition(SessionState::Closed).await.unwrap();
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected() {
        let session = test_session();
        let err = session.transition(SessionState::Closed).await.unwrap_err();
        assert!(matches!(err, AgentError::InternalError(_)));
    }

    #[tokio::test]
    async fn registry_enforces_max_sessions_cap() {
        let registry = SessionRegistry::new(1);
        registry.register(test_session()).unwrap();
        let err = registry.register(test_session()).unwrap_err();
        assert!(matches!(err, AgentError::OutOfResources));
    }

    #[tokio::test]
    async fn wait_queue_delivers_matching_reply() {
        let session = test_session();
        let code = MessageCode::GetParameter;
        let rx = session.wait_for(code, 7).await;
        let reply = FramedMessage::new(MessageCode::RequestCompleted, 7);
        let delivered = session.complete_wait(code.as_u16(), 7, reply).await;
        assert!(delivered);
        assert!(rx.await.is_ok());
    }
}
