//! Tunnel listener: one TCP listener per active mapping, accepting
//! end-user sockets, minting request ids, and binding each to the
//! mapping's backend session.

use std::net::IpAddr;
use std::sync::Arc;

use base64::Engine;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};

use bifrost_shared::{timeouts, RequestId, ServerMessage};

use crate::backend::BackendSessionManager;
use crate::registry::{RegistryError, TunnelMapping};
use crate::session::{RequestIndex, RequestSessionHandle, SessionEvent, SessionState};

const READ_CHUNK: usize = 16 * 1024;

/// A bound public listener for one [`TunnelMapping`], accepting end-user
/// connections and tracking the request sessions it has minted.
pub struct TunnelListener {
    mapping: TunnelMapping,
    sessions: Arc<RequestIndex>,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    sweep_task: JoinHandle<()>,
}

impl TunnelListener {
    pub async fn bind(
        mapping: TunnelMapping,
        bind_addr: IpAddr,
        backends: Arc<BackendSessionManager>,
    ) -> Result<Self, RegistryError> {
        let listener = TcpListener::bind((bind_addr, mapping.server_port))
            .await
            .map_err(|err| RegistryError::from_bind_error(mapping.server_port, err))?;

        let sessions: Arc<RequestIndex> = Arc::new(DashMap::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let accept_task = tokio::spawn(
            accept_loop(
                listener,
                mapping.clone(),
                sessions.clone(),
                backends,
                shutdown_rx.clone(),
            )
            .instrument(info_span!("tunnel", port = mapping.server_port)),
        );
        let sweep_task = tokio::spawn(idle_sweep_loop(sessions.clone(), shutdown_rx));

        Ok(TunnelListener {
            mapping,
            sessions,
            shutdown: shutdown_tx,
            accept_task,
            sweep_task,
        })
    }

    pub fn mapping(&self) -> &TunnelMapping {
        &self.mapping
    }

    pub fn active_request_count(&self) -> usize {
        self.sessions.len()
    }

    /// Stop accepting new connections and destroy every request session
    /// this listener owns.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for entry in self.sessions.iter() {
            entry.value().deliver(SessionEvent::Stopped).await;
        }
        self.accept_task.abort();
        self.sweep_task.abort();
        let _ = self.accept_task.await;
        let _ = self.sweep_task.await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    mapping: TunnelMapping,
    sessions: Arc<RequestIndex>,
    backends: Arc<BackendSessionManager>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            accepted = listener.accept() => {
                let (socket, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(%err, "accept failed on tunnel listener");
                        continue;
                    }
                };

                let Some(backend) = backends.get(&mapping.backend_id) else {
                    warn!(backend_id = %mapping.backend_id, "no live backend session, dropping connection");
                    drop(socket);
                    continue;
                };

                let request_id = RequestId::generate();
                info!(?addr, %request_id, "accepted end-user connection");

                let (tx, rx) = mpsc::channel(64);
                let handle = Arc::new(RequestSessionHandle::new(
                    mapping.backend_id.clone(),
                    mapping.tunnel_id.clone(),
                    tx,
                ));
                backend.attach(request_id, handle.clone());
                sessions.insert(request_id, handle.clone());

                let mapping = mapping.clone();
                let sessions = sessions.clone();
                tokio::spawn(
                    async move {
                        run_request_session(socket, request_id, mapping, backend, handle, rx).await;
                        sessions.remove(&request_id);
                    }
                    .instrument(info_span!("request", %request_id)),
                );
            }
        }
    }
}

async fn run_request_session(
    mut socket: TcpStream,
    request_id: RequestId,
    mapping: TunnelMapping,
    backend: Arc<crate::backend::BackendSession>,
    handle: Arc<RequestSessionHandle>,
    mut events: mpsc::Receiver<SessionEvent>,
) {
    if backend
        .send(ServerMessage::Request {
            request_id,
            tunnel_id: mapping.tunnel_id.clone(),
            local_port: mapping.local_port,
            target_ip: mapping.target_host.clone(),
        })
        .await
        .is_err()
    {
        backend.detach(&request_id);
        return;
    }

    let (mut read_half, mut write_half) = socket.split();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        tokio::select! {
            read = read_half.read(&mut buf) => {
                match read {
                    Ok(0) => {
                        handle.set_state(SessionState::Closing);
                        let _ = backend.send(ServerMessage::End { request_id }).await;
                        break;
                    }
                    Ok(n) => {
                        handle.touch();
                        let encoded = base64::engine::general_purpose::STANDARD.encode(&buf[..n]);
                        if backend.send(ServerMessage::Data { request_id, data: encoded }).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(%request_id, %err, "error reading from end-user socket");
                        break;
                    }
                }
            }
            event = events.recv() => {
                match event {
                    Some(SessionEvent::Connect) => {
                        handle.set_state(SessionState::Connected);
                    }
                    Some(SessionEvent::Data(bytes)) => {
                        if write_half.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Some(SessionEvent::End) => {
                        let _ = write_half.shutdown().await;
                        break;
                    }
                    Some(SessionEvent::Error(err)) => {
                        warn!(%request_id, error = %err, "agent reported an error for this request");
                        break;
                    }
                    Some(SessionEvent::BackendLost) | Some(SessionEvent::Stopped) | None => break,
                    Some(SessionEvent::IdleTimeout) => {
                        info!(%request_id, "idle-killed pending request session");
                        break;
                    }
                }
            }
        }
    }

    handle.set_state(SessionState::Dead);
    backend.detach(&request_id);
}

async fn idle_sweep_loop(sessions: Arc<RequestIndex>, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(timeouts::IDLE_SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tick.tick() => {
                for entry in sessions.iter() {
                    if entry.value().pending_expired(timeouts::CONNECT_TIMEOUT) {
                        entry.value().deliver(SessionEvent::IdleTimeout).await;
                    }
                }
            }
        }
    }
}
