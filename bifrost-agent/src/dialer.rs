//! Backend-side dialer session: one task per `request` frame from the
//! server, dialing the local target and bridging bytes in both directions.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use base64::Engine;
use dashmap::DashMap;
use socket2::TcpKeepalive;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{info, info_span, warn, Instrument};

use bifrost_shared::{timeouts, ClientMessage, RequestId};

const READ_CHUNK: usize = 16 * 1024;
const KEEPALIVE_IDLE: std::time::Duration = std::time::Duration::from_secs(1);

/// Where a [`DialerHandle`] sits in its lifecycle. Mirrors the server's
/// request session states, reflected across the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Pending,
    Connected,
    Dead,
}

/// Events delivered to the task that owns the target socket.
enum TargetEvent {
    Data(Vec<u8>),
    End,
}

/// Shared handle for one in-flight or connected backend-side connection,
/// reachable by the control loop (dispatching inbound server frames) and
/// the heartbeat sweep. The target socket itself is owned exclusively by
/// the task spawned in [`dial_and_bridge`].
pub struct DialerHandle {
    state: Mutex<ConnState>,
    last_activity: Mutex<Instant>,
    queue: Mutex<VecDeque<(Instant, Vec<u8>)>>,
    to_target: mpsc::Sender<TargetEvent>,
}

impl DialerHandle {
    fn new(to_target: mpsc::Sender<TargetEvent>) -> Self {
        DialerHandle {
            state: Mutex::new(ConnState::Pending),
            last_activity: Mutex::new(Instant::now()),
            queue: Mutex::new(VecDeque::new()),
            to_target,
        }
    }

    fn state(&self) -> ConnState {
        *self.state.lock().expect("dialer state lock poisoned")
    }

    fn set_state(&self, state: ConnState) {
        *self.state.lock().expect("dialer state lock poisoned") = state;
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .expect("dialer activity lock poisoned") = Instant::now();
    }

    /// Inbound `data` from the server: write straight through if connected,
    /// otherwise buffer (dropping the oldest entry past
    /// [`timeouts::PACKET_QUEUE_CAP`]).
    pub async fn on_data(&self, bytes: Vec<u8>) {
        self.touch();
        if self.state() == ConnState::Connected {
            let _ = self.to_target.send(TargetEvent::Data(bytes)).await;
            return;
        }
        let mut queue = self.queue.lock().expect("dialer queue lock poisoned");
        if queue.len() >= timeouts::PACKET_QUEUE_CAP {
            queue.pop_front();
        }
        queue.push_back((Instant::now(), bytes));
    }

    pub async fn on_end(&self) {
        let _ = self.to_target.send(TargetEvent::End).await;
    }

    /// Drain whatever queued packets survive `PACKET_TTL`, oldest first.
    fn drain_queue(&self) -> Vec<Vec<u8>> {
        let mut queue = self.queue.lock().expect("dialer queue lock poisoned");
        let now = Instant::now();
        queue
            .drain(..)
            .filter(|(queued_at, _)| now.duration_since(*queued_at) <= timeouts::PACKET_TTL)
            .map(|(_, bytes)| bytes)
            .collect()
    }

    /// Drop queued packets older than `PACKET_TTL`. Called by the
    /// heartbeat tick independent of whether a dial is still pending.
    fn sweep_aged_packets(&self) {
        let mut queue = self.queue.lock().expect("dialer queue lock poisoned");
        let now = Instant::now();
        queue.retain(|(queued_at, _)| now.duration_since(*queued_at) <= timeouts::PACKET_TTL);
    }

    /// Whether this record has sat `Pending` past `CONNECT_TIMEOUT` — the
    /// only state the heartbeat is allowed to idle-kill, mirroring the
    /// server's own Pending-only idle sweep so a connection that is
    /// already bridging live target traffic is never torn down just for
    /// being quiet.
    fn pending_expired(&self) -> bool {
        self.state() == ConnState::Pending
            && self
                .last_activity
                .lock()
                .expect("dialer activity lock poisoned")
                .elapsed()
                > timeouts::CONNECT_TIMEOUT
    }
}

/// The agent's live backend-side connections, keyed by `requestId`.
pub type DialerRegistry = Arc<DashMap<RequestId, Arc<DialerHandle>>>;

pub fn new_registry() -> DialerRegistry {
    Arc::new(DashMap::new())
}

/// Periodic sweep: drop aged queued packets and idle-kill records that
/// have sat `Pending` past the connect deadline. Matches the server's own
/// `IDLE_SWEEP_INTERVAL` cadence.
pub async fn heartbeat_sweep(registry: &DialerRegistry) {
    for entry in registry.iter() {
        entry.value().sweep_aged_packets();
    }
    registry.retain(|request_id, handle| {
        let expired = handle.pending_expired();
        if expired {
            info!(%request_id, "idle-killed a pending backend-side connection");
        }
        !expired
    });
}

/// Dial `target_ip:local_port` for one `request` frame, bridge bytes in
/// both directions once connected, and report the outcome to the server
/// over `outbound`. Registers a [`DialerHandle`] in `registry` for the
/// duration of the attempt so inbound `data`/`end` frames can reach it.
pub async fn dial_and_bridge(
    request_id: RequestId,
    target_ip: String,
    local_port: u16,
    registry: DialerRegistry,
    outbound: mpsc::Sender<ClientMessage>,
) {
    let (to_target_tx, mut to_target_rx) = mpsc::channel(64);
    let handle = Arc::new(DialerHandle::new(to_target_tx));
    registry.insert(request_id, handle.clone());

    let mut target = None;
    for attempt in 1..=timeouts::DIAL_RETRIES {
        match timeout(
            timeouts::DIAL_TIMEOUT,
            TcpStream::connect((target_ip.as_str(), local_port)),
        )
        .await
        {
            Ok(Ok(stream)) => {
                target = Some(stream);
                break;
            }
            Ok(Err(err)) => {
                warn!(%request_id, attempt, %err, "dial attempt failed");
            }
            Err(_) => {
                warn!(%request_id, attempt, "dial attempt timed out");
            }
        }
        if attempt < timeouts::DIAL_RETRIES {
            sleep(timeouts::DIAL_BACKOFF).await;
        }
    }

    let Some(mut target) = target else {
        registry.remove(&request_id);
        let _ = outbound
            .send(ClientMessage::Error {
                request_id,
                error: format!(
                    "failed to dial {target_ip}:{local_port} after {} attempts",
                    timeouts::DIAL_RETRIES
                ),
            })
            .await;
        return;
    };

    // The record may have already been idle-killed by the heartbeat while
    // we were still dialing; in that case there is nothing left to notify.
    if registry.get(&request_id).is_none() {
        return;
    }

    if let Err(err) = apply_keepalive(&target) {
        warn!(%request_id, %err, "failed to set TCP keepalive on target socket");
    }

    handle.set_state(ConnState::Connected);
    if outbound
        .send(ClientMessage::Connect { request_id })
        .await
        .is_err()
    {
        registry.remove(&request_id);
        return;
    }

    for queued in handle.drain_queue() {
        if target.write_all(&queued).await.is_err() {
            registry.remove(&request_id);
            return;
        }
    }

    run_bridge(request_id, &mut target, &mut to_target_rx, &outbound)
        .instrument(info_span!("dialer", %request_id))
        .await;

    handle.set_state(ConnState::Dead);
    registry.remove(&request_id);
}

async fn run_bridge(
    request_id: RequestId,
    target: &mut TcpStream,
    events: &mut mpsc::Receiver<TargetEvent>,
    outbound: &mpsc::Sender<ClientMessage>,
) {
    let (mut read_half, mut write_half) = target.split();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        tokio::select! {
            read = read_half.read(&mut buf) => {
                match read {
                    Ok(0) => {
                        let _ = outbound.send(ClientMessage::End { request_id }).await;
                        break;
                    }
                    Ok(n) => {
                        let encoded = base64::engine::general_purpose::STANDARD.encode(&buf[..n]);
                        if outbound.send(ClientMessage::Data { request_id, data: encoded }).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        let _ = outbound
                            .send(ClientMessage::Error { request_id, error: err.to_string() })
                            .await;
                        break;
                    }
                }
            }
            event = events.recv() => {
                match event {
                    Some(TargetEvent::Data(bytes)) => {
                        if write_half.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Some(TargetEvent::End) => {
                        let _ = write_half.shutdown().await;
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}

fn apply_keepalive(stream: &TcpStream) -> io::Result<()> {
    let socket_ref = socket2::SockRef::from(stream);
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_IDLE);
    socket_ref.set_tcp_keepalive(&keepalive)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queued_packets_respect_the_capacity() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = DialerHandle::new(tx);
        for i in 0..(timeouts::PACKET_QUEUE_CAP + 10) {
            handle.on_data(vec![i as u8]).await;
        }
        assert_eq!(handle.queue.lock().unwrap().len(), timeouts::PACKET_QUEUE_CAP);
    }

    #[tokio::test]
    async fn drain_queue_drops_entries_older_than_ttl() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = DialerHandle::new(tx);
        handle
            .queue
            .lock()
            .unwrap()
            .push_back((Instant::now() - timeouts::PACKET_TTL - std::time::Duration::from_secs(1), vec![1]));
        handle.queue.lock().unwrap().push_back((Instant::now(), vec![2]));
        let drained = handle.drain_queue();
        assert_eq!(drained, vec![vec![2]]);
    }

    #[tokio::test]
    async fn connected_records_are_never_idle_killed() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = DialerHandle::new(tx);
        handle.set_state(ConnState::Connected);
        *handle.last_activity.lock().unwrap() = Instant::now() - timeouts::CONNECT_TIMEOUT - std::time::Duration::from_secs(1);
        assert!(!handle.pending_expired());
    }

    #[tokio::test]
    async fn pending_records_expire_past_connect_timeout() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = DialerHandle::new(tx);
        *handle.last_activity.lock().unwrap() = Instant::now() - timeouts::CONNECT_TIMEOUT - std::time::Duration::from_secs(1);
        assert!(handle.pending_expired());
    }
}
