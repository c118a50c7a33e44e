//! Request session lifecycle: the state machine and shared handle that let
//! the backend control session (dispatching frames) and a tunnel listener's
//! idle sweep reach into a session owned by its per-connection task.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use bifrost_shared::RequestId;

/// Where a [`RequestSessionHandle`] is in its lifecycle.
///
/// `Pending` → `Connected` on the agent's `connect` frame; either state can
/// move to `Closing` on a graceful `end`/FIN, which settles to `Dead` once
/// the owning task exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Connected,
    Closing,
    Dead,
}

/// Events delivered to a request session's owning task, either from the
/// backend control session (dispatching an agent frame) or from the tunnel
/// listener that owns it (idle sweep, tunnel stop).
#[derive(Debug)]
pub enum SessionEvent {
    /// The agent's target dial succeeded.
    Connect,
    /// Bytes read from the target, to be written to the user socket.
    Data(Vec<u8>),
    /// Agent-side graceful half-close.
    End,
    /// Agent-side abortive failure.
    Error(String),
    /// The owning backend session was torn down (socket lost or superseded).
    BackendLost,
    /// The owning tunnel listener swept this session for exceeding
    /// [`bifrost_shared::timeouts::CONNECT_TIMEOUT`] while still `Pending`.
    IdleTimeout,
    /// The tunnel was stopped by the registry.
    Stopped,
}

/// Shared state for one `requestId`, reachable by both the backend session
/// that dispatches frames onto it and the tunnel listener's idle sweep.
/// The user socket itself is owned exclusively by the spawned task that
/// reads `SessionEvent`s from `events`'s receiving end — this handle only
/// ever pushes events in, it never touches the socket directly.
pub struct RequestSessionHandle {
    pub backend_id: String,
    pub tunnel_id: String,
    state: Mutex<SessionState>,
    last_activity: Mutex<Instant>,
    events: mpsc::Sender<SessionEvent>,
}

impl RequestSessionHandle {
    pub fn new(backend_id: String, tunnel_id: String, events: mpsc::Sender<SessionEvent>) -> Self {
        RequestSessionHandle {
            backend_id,
            tunnel_id,
            state: Mutex::new(SessionState::Pending),
            last_activity: Mutex::new(Instant::now()),
            events,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("session state lock poisoned")
    }

    pub fn set_state(&self, state: SessionState) {
        *self.state.lock().expect("session state lock poisoned") = state;
    }

    /// Record that a frame was observed for this request in either
    /// direction; resets the idle-sweep clock.
    pub fn touch(&self) {
        *self.last_activity.lock().expect("session activity lock poisoned") = Instant::now();
    }

    /// Whether this session has sat `Pending` longer than `deadline` —
    /// the only state the idle sweep is allowed to kill (see
    /// `bifrost-server`'s design notes on the idle-threshold open
    /// question: a healthy `Connected` stream is never swept).
    pub fn pending_expired(&self, deadline: Duration) -> bool {
        self.state() == SessionState::Pending
            && self
                .last_activity
                .lock()
                .expect("session activity lock poisoned")
                .elapsed()
                > deadline
    }

    /// Best-effort delivery of an event to the owning task. A full queue
    /// or a task that has already exited is not an error here — the caller
    /// (backend teardown, idle sweep) has no further action to take either
    /// way.
    pub async fn deliver(&self, event: SessionEvent) {
        let _ = self.events.send(event).await;
    }
}

/// Ties a [`RequestId`] to the handle that represents it, for the maps
/// kept by both a [`crate::backend::BackendSession`] (dispatch/teardown)
/// and a [`crate::listener::TunnelListener`] (idle sweep, stop).
pub type RequestIndex = dashmap::DashMap<RequestId, std::sync::Arc<RequestSessionHandle>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pending_session_expires_after_deadline() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = RequestSessionHandle::new("b1".into(), "t1".into(), tx);
        assert!(!handle.pending_expired(Duration::from_millis(0)));
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(handle.pending_expired(Duration::from_millis(1)));
    }

    #[tokio::test]
    async fn connected_session_never_expires() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = RequestSessionHandle::new("b1".into(), "t1".into(), tx);
        handle.set_state(SessionState::Connected);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!handle.pending_expired(Duration::from_millis(0)));
    }

    #[tokio::test]
    async fn touch_resets_the_idle_clock() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = RequestSessionHandle::new("b1".into(), "t1".into(), tx);
        tokio::time::sleep(Duration::from_millis(5)).await;
        handle.touch();
        assert!(!handle.pending_expired(Duration::from_millis(1)));
    }
}
