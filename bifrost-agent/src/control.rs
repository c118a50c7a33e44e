//! Backend agent control loop: dials the server, registers, and keeps
//! exactly one outstanding connection, reconnecting with a fixed backoff
//! until the process is told to stop or the server rejects its API key.

use anyhow::{bail, Context, Result};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

use bifrost_shared::{timeouts, ClientMessage, Delimited, ServerMessage};

use crate::dialer::{self, dial_and_bridge, heartbeat_sweep, new_registry};

/// Where to reach the server, and the credential presented on `register`.
pub struct AgentConfig {
    pub server_host: String,
    pub server_port: u16,
    pub api_key: String,
}

/// Run the control loop forever: connect, register, dispatch frames until
/// the connection drops, then back off and retry. Returns only if the
/// server rejects the API key, in which case the caller should exit
/// nonzero.
pub async fn run(config: AgentConfig) -> Result<()> {
    loop {
        match run_once(&config).await {
            Ok(()) => info!("control connection closed, reconnecting"),
            Err(err) if err.downcast_ref::<Unauthorized>().is_some() => {
                error!("server rejected our API key, exiting");
                return Err(err);
            }
            Err(err) => warn!(%err, "control connection failed, reconnecting"),
        }
        sleep(timeouts::RECONNECT_BACKOFF).await;
    }
}

#[derive(Debug)]
struct Unauthorized;

impl std::fmt::Display for Unauthorized {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "server rejected the presented API key")
    }
}

impl std::error::Error for Unauthorized {}

/// One connection's worth of work: register, then dispatch frames until
/// disconnect. All per-request dialer tasks spawned here are tracked in a
/// `JoinSet` and aborted together when this function returns, so a lost
/// control connection destroys every local `BackendSideConn` along with
/// its queued packets, as required.
async fn run_once(config: &AgentConfig) -> Result<()> {
    let stream = timeout(
        timeouts::NETWORK_TIMEOUT,
        TcpStream::connect((config.server_host.as_str(), config.server_port)),
    )
    .await
    .context("timed out connecting to server")?
    .with_context(|| {
        format!(
            "could not connect to {}:{}",
            config.server_host, config.server_port
        )
    })?;

    let mut conn = Delimited::new(stream);
    conn.send(ClientMessage::Register {
        api_key: config.api_key.clone(),
    })
    .await?;

    match conn.recv_timeout::<ServerMessage>().await? {
        Some(ServerMessage::Registered { backend_id }) => {
            info!(%backend_id, "registered with server");
        }
        Some(ServerMessage::Unauthorized) => bail!(Unauthorized),
        Some(other) => bail!("unexpected first reply from server: {other:?}"),
        None => bail!("server closed the connection before replying to register"),
    }

    let registry = new_registry();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ClientMessage>(256);
    let mut dialers = JoinSet::new();
    let mut heartbeat = tokio::time::interval(timeouts::IDLE_SWEEP_INTERVAL);

    let result = loop {
        tokio::select! {
            incoming = conn.recv::<ServerMessage>() => {
                match incoming {
                    Ok(Some(msg)) => dispatch(msg, &registry, &outbound_tx, &mut dialers).await,
                    Ok(None) => break Ok(()),
                    Err(err) => break Err(err),
                }
            }
            outgoing = outbound_rx.recv() => {
                match outgoing {
                    Some(msg) => {
                        if let Err(err) = conn.send(msg).await {
                            break Err(err);
                        }
                    }
                    None => break Ok(()),
                }
            }
            _ = heartbeat.tick() => {
                heartbeat_sweep(&registry).await;
            }
        }
    };

    dialers.abort_all();
    while dialers.join_next().await.is_some() {}

    result
}

/// Apply one inbound server frame. `Data`/`End` are applied inline — not
/// spawned — so that two frames for the same `requestId` arriving back to
/// back are handed to the dialer handle in the order the control loop read
/// them; spawning a task per frame would let the scheduler reorder them,
/// violating the same-`requestId` in-order guarantee (spec.md §5/§8).
/// `Request` still spawns a dedicated dialer task, tracked in `dialers`,
/// since a single dial-and-bridge session must run independently of the
/// control loop for its whole lifetime.
async fn dispatch(
    msg: ServerMessage,
    registry: &dialer::DialerRegistry,
    outbound: &mpsc::Sender<ClientMessage>,
    dialers: &mut JoinSet<()>,
) {
    match msg {
        ServerMessage::Registered { .. } => {
            warn!("ignoring duplicate registered on an already-registered connection");
        }
        ServerMessage::Unauthorized => {
            warn!("ignoring unexpected unauthorized after registration");
        }
        ServerMessage::Request {
            request_id,
            tunnel_id,
            local_port,
            target_ip,
        } => {
            info!(%request_id, %tunnel_id, %target_ip, local_port, "dialing local target");
            let registry = registry.clone();
            let outbound = outbound.clone();
            dialers.spawn(async move {
                dial_and_bridge(request_id, target_ip, local_port, registry, outbound).await;
            });
        }
        ServerMessage::Data { request_id, data } => {
            let Some(handle) = registry.get(&request_id).map(|entry| entry.value().clone()) else {
                warn!(%request_id, "data for unknown request id");
                return;
            };
            match base64::Engine::decode(&base64::engine::general_purpose::STANDARD, data) {
                Ok(bytes) => handle.on_data(bytes).await,
                Err(err) => warn!(%request_id, %err, "dropping frame with invalid base64 payload"),
            }
        }
        ServerMessage::End { request_id } => {
            if let Some(handle) = registry.get(&request_id).map(|entry| entry.value().clone()) {
                handle.on_end().await;
            }
        }
        ServerMessage::Error { request_id, error } => {
            warn!(%request_id, %error, "server reported an error for this request");
        }
    }
}
