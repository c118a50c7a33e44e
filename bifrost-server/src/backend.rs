//! Backend control session (server side): registers an agent, demultiplexes
//! inbound frames to the request session they belong to, and tears down
//! every dependent request session when the agent's connection is lost.

use std::sync::Arc;

use anyhow::Result;
use base64::Engine;
use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{info, info_span, warn, Instrument};

use bifrost_shared::{ApiKeyResolver, ClientMessage, Delimited, RequestId, ServerMessage};

use crate::session::{RequestIndex, SessionEvent};

/// One live control connection to a backend agent. Frames addressed to a
/// `requestId` are dispatched to whichever `RequestSessionHandle` is
/// registered for it; frames the agent sends are written by a single task
/// that owns the socket, so writes from many request sessions never
/// interleave mid-line.
pub struct BackendSession {
    backend_id: String,
    outbound: mpsc::Sender<ServerMessage>,
    requests: RequestIndex,
}

impl BackendSession {
    fn new(backend_id: String, outbound: mpsc::Sender<ServerMessage>) -> Self {
        BackendSession {
            backend_id,
            outbound,
            requests: DashMap::new(),
        }
    }

    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    /// Enqueue a frame for this backend. Ordering per connection is
    /// preserved by the single writer task draining this channel.
    pub async fn send(&self, msg: ServerMessage) -> Result<()> {
        self.outbound
            .send(msg)
            .await
            .map_err(|_| anyhow::anyhow!("backend session for {} is closed", self.backend_id))
    }

    pub fn attach(&self, id: RequestId, handle: Arc<crate::session::RequestSessionHandle>) {
        self.requests.insert(id, handle);
    }

    pub fn detach(&self, id: &RequestId) {
        self.requests.remove(id);
    }

    pub fn request_count(&self) -> usize {
        self.requests.len()
    }

    /// Apply an inbound agent frame: look up the request session and hand
    /// it the corresponding event. A frame for an unknown or already-dead
    /// request id is dropped — the agent may simply be racing a teardown
    /// the server already completed.
    async fn dispatch(&self, msg: ClientMessage) {
        match msg {
            ClientMessage::Register { .. } => {
                warn!("ignoring duplicate register on an already-registered session");
            }
            ClientMessage::Connect { request_id } => {
                if let Some(handle) = self.requests.get(&request_id) {
                    handle.touch();
                    handle.deliver(SessionEvent::Connect).await;
                } else {
                    warn!(%request_id, "connect for unknown request id");
                }
            }
            ClientMessage::Data { request_id, data } => {
                let Some(handle) = self.requests.get(&request_id) else {
                    warn!(%request_id, "data for unknown request id");
                    return;
                };
                match base64::engine::general_purpose::STANDARD.decode(data) {
                    Ok(bytes) => {
                        handle.touch();
                        handle.deliver(SessionEvent::Data(bytes)).await;
                    }
                    Err(err) => warn!(%request_id, %err, "dropping frame with invalid base64 payload"),
                }
            }
            ClientMessage::End { request_id } => {
                if let Some(handle) = self.requests.get(&request_id) {
                    handle.touch();
                    handle.deliver(SessionEvent::End).await;
                }
            }
            ClientMessage::Error { request_id, error } => {
                if let Some(handle) = self.requests.get(&request_id) {
                    handle.deliver(SessionEvent::Error(error)).await;
                }
            }
        }
    }

    /// Destroy every request session that depended on this backend. Called
    /// once, when the control connection is lost or superseded.
    async fn tear_down(&self) {
        for entry in self.requests.iter() {
            entry.value().deliver(SessionEvent::BackendLost).await;
        }
        self.requests.clear();
    }
}

/// Owns the map of live backend sessions, keyed by `backendId`. At most one
/// live session per id; a second successful `register` supersedes the
/// first.
#[derive(Default)]
pub struct BackendSessionManager {
    sessions: DashMap<String, Arc<BackendSession>>,
}

impl BackendSessionManager {
    pub fn new() -> Self {
        BackendSessionManager::default()
    }

    pub fn get(&self, backend_id: &str) -> Option<Arc<BackendSession>> {
        self.sessions.get(backend_id).map(|e| e.value().clone())
    }

    pub fn active_backend_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Drive one accepted control connection end to end: wait for
    /// `register`, resolve the API key, evict any prior session for the
    /// same backend, and dispatch frames until the connection drops.
    pub async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        resolver: Arc<dyn ApiKeyResolver>,
    ) -> Result<()> {
        let mut framed = Delimited::new(stream);

        let api_key = match framed.recv_timeout::<ClientMessage>().await? {
            Some(ClientMessage::Register { api_key }) => api_key,
            Some(_) => {
                warn!("first frame on a new control connection was not register");
                return Ok(());
            }
            None => return Ok(()),
        };

        let identity = resolver.resolve(&api_key).await;
        let Some(identity) = identity else {
            warn!("rejecting control connection with unrecognized api key");
            framed.send(ServerMessage::Unauthorized).await?;
            return Ok(());
        };
        let backend_id = identity.backend_id;

        let (tx, mut rx) = mpsc::channel::<ServerMessage>(256);
        let session = Arc::new(BackendSession::new(backend_id.clone(), tx));

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        if let Some(old) = self.sessions.insert(backend_id.clone(), session.clone()) {
            info!(backend_id = %backend_id, "superseding existing control session");
            old.tear_down().await;
        }

        framed
            .send(ServerMessage::Registered {
                backend_id: backend_id.clone(),
            })
            .await?;
        info!(backend_id = %backend_id, "backend registered");

        let result = loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break Ok(()),
                incoming = framed.recv::<ClientMessage>() => {
                    match incoming {
                        Ok(Some(msg)) => session.dispatch(msg).await,
                        Ok(None) => break Ok(()),
                        Err(err) => break Err(err),
                    }
                }
                outgoing = rx.recv() => {
                    match outgoing {
                        Some(msg) => {
                            if let Err(err) = framed.send(msg).await {
                                break Err(err);
                            }
                        }
                        None => break Ok(()),
                    }
                }
            }
        };
        let _ = shutdown_tx.send(true);

        self.sessions
            .remove_if(&backend_id, |_, current| Arc::ptr_eq(current, &session));
        session.tear_down().await;
        info!(backend_id = %backend_id, "control connection closed");

        result
    }
}

/// Accept loop for the control listener: one task per incoming connection,
/// instrumented with its peer address the way the teacher's control loop
/// is.
pub async fn run_control_listener(
    listener: tokio::net::TcpListener,
    manager: Arc<BackendSessionManager>,
    resolver: Arc<dyn ApiKeyResolver>,
) -> Result<()> {
    loop {
        let (stream, addr) = listener.accept().await?;
        let manager = manager.clone();
        let resolver = resolver.clone();
        tokio::spawn(
            async move {
                if let Err(err) = manager.handle_connection(stream, resolver).await {
                    warn!(%err, "control connection exited with error");
                }
            }
            .instrument(info_span!("control", ?addr)),
        );
    }
}
