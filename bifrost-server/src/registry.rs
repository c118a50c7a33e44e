//! Tunnel registry: the admin-facing map of tunnel mappings to their live
//! [`crate::listener::TunnelListener`], and the port allocation rules a
//! collaborator (admin API, CLI, persistence layer) drives it through.

use std::fmt;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::backend::BackendSessionManager;
use crate::listener::TunnelListener;

/// Lowest port considered for [`TunnelRegistry::find_available_port`].
const EPHEMERAL_RANGE_START: u16 = 10_000;

/// A single tunnel's configuration: which backend serves it, which public
/// port it binds, and which local address the agent dials to reach it.
#[derive(Debug, Clone)]
pub struct TunnelMapping {
    pub tunnel_id: String,
    pub backend_id: String,
    pub server_port: u16,
    pub local_port: u16,
    pub target_host: String,
}

/// Failure modes `TunnelRegistry` reports. Kept as a plain enum rather than
/// a `thiserror` derive since nothing else in this workspace reaches for it
/// either — the set of variants is small and stable.
#[derive(Debug)]
pub enum RegistryError {
    PortInUse(u16),
    PermissionDenied(u16),
    BindFailed(u16, io::Error),
    UnknownTunnel(String),
    UnknownBackend(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::PortInUse(port) => write!(f, "port {port} is already in use"),
            RegistryError::PermissionDenied(port) => {
                write!(f, "permission denied binding port {port}")
            }
            RegistryError::BindFailed(port, err) => {
                write!(f, "failed to bind port {port}: {err}")
            }
            RegistryError::UnknownTunnel(id) => write!(f, "no tunnel with id {id}"),
            RegistryError::UnknownBackend(id) => write!(f, "no backend registered with id {id}"),
        }
    }
}

impl std::error::Error for RegistryError {}

impl RegistryError {
    pub(crate) fn from_bind_error(port: u16, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::AddrInUse => RegistryError::PortInUse(port),
            io::ErrorKind::PermissionDenied => RegistryError::PermissionDenied(port),
            _ => RegistryError::BindFailed(port, err),
        }
    }
}

/// A point-in-time view of one tunnel's liveness, for the registry's
/// `status` operation.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub tunnel_id: String,
    pub backend_id: String,
    pub server_port: u16,
    pub local_port: u16,
    pub target_host: String,
    pub backend_connected: bool,
    pub active_requests: usize,
}

/// Identity of a tunnel mapping, per spec.md §3: `(backendId, tunnelId)`,
/// not `tunnelId` alone — two different backends are free to each name a
/// tunnel `"t1"`.
type TunnelKey = (String, String);

fn tunnel_key(mapping: &TunnelMapping) -> TunnelKey {
    (mapping.backend_id.clone(), mapping.tunnel_id.clone())
}

/// Owns every active tunnel mapping and the listener bound for it.
/// `createTunnel` binds the caller-specified port directly — unlike the
/// teacher's probabilistic random-port search, this registry treats port
/// selection (`findAvailablePort`) and tunnel creation as separate
/// operations, so by the time `create_tunnel` runs the port is already
/// chosen.
pub struct TunnelRegistry {
    bind_addr: IpAddr,
    backends: Arc<BackendSessionManager>,
    listeners: DashMap<TunnelKey, TunnelListener>,
    /// `serverPort` index per §4.E: answers `is_port_available` from our
    /// own bookkeeping rather than an OS-level probe, so a port held by an
    /// unrelated process never shows up as unavailable here.
    ports: DashMap<u16, TunnelKey>,
}

impl TunnelRegistry {
    pub fn new(bind_addr: IpAddr, backends: Arc<BackendSessionManager>) -> Self {
        TunnelRegistry {
            bind_addr,
            backends,
            listeners: DashMap::new(),
            ports: DashMap::new(),
        }
    }

    /// Bind `mapping.server_port` and start forwarding connections to
    /// `mapping.backend_id`. Fails if the backend is not currently
    /// registered, if another mapping already claims the port, or if the
    /// port cannot be bound.
    pub async fn create_tunnel(&self, mapping: TunnelMapping) -> Result<(), RegistryError> {
        if self.backends.get(&mapping.backend_id).is_none() {
            return Err(RegistryError::UnknownBackend(mapping.backend_id));
        }
        if self.ports.contains_key(&mapping.server_port) {
            return Err(RegistryError::PortInUse(mapping.server_port));
        }
        let key = tunnel_key(&mapping);
        let server_port = mapping.server_port;
        let tunnel_id = mapping.tunnel_id.clone();
        let listener = TunnelListener::bind(mapping, self.bind_addr, self.backends.clone()).await?;
        info!(%tunnel_id, "tunnel created");
        self.ports.insert(server_port, key.clone());
        self.listeners.insert(key, listener);
        Ok(())
    }

    /// Stop forwarding for `(backend_id, tunnel_id)` and release its port.
    pub async fn stop_tunnel(&self, backend_id: &str, tunnel_id: &str) -> Result<(), RegistryError> {
        let key = (backend_id.to_string(), tunnel_id.to_string());
        let (_, listener) = self
            .listeners
            .remove(&key)
            .ok_or_else(|| RegistryError::UnknownTunnel(tunnel_id.to_string()))?;
        self.ports.remove(&listener.mapping().server_port);
        listener.stop().await;
        info!(%backend_id, %tunnel_id, "tunnel stopped");
        Ok(())
    }

    /// Whether `port` is free per this registry's own `serverPort` index —
    /// not a live OS bind probe, so an unrelated process already holding
    /// the port doesn't count against it.
    pub fn is_port_available(&self, port: u16) -> bool {
        !self.ports.contains_key(&port)
    }

    /// Linear scan for the first bindable port at or above
    /// [`EPHEMERAL_RANGE_START`]. Unlike the teacher's random-probe search
    /// over a fixed client-supplied range, callers here ask for "any port"
    /// up front via this operation rather than passing `0` through
    /// `create_tunnel`.
    pub fn find_available_port(&self) -> Option<u16> {
        for port in EPHEMERAL_RANGE_START..=u16::MAX {
            if self.is_port_available(port) {
                return Some(port);
            }
        }
        warn!("exhausted the ephemeral port range without finding a free port");
        None
    }

    pub async fn status(&self) -> Vec<StatusSnapshot> {
        let mut out = Vec::with_capacity(self.listeners.len());
        for entry in self.listeners.iter() {
            let mapping = entry.value().mapping();
            out.push(StatusSnapshot {
                tunnel_id: mapping.tunnel_id.clone(),
                backend_id: mapping.backend_id.clone(),
                server_port: mapping.server_port,
                local_port: mapping.local_port,
                target_host: mapping.target_host.clone(),
                backend_connected: self.backends.get(&mapping.backend_id).is_some(),
                active_requests: entry.value().active_request_count(),
            });
        }
        out
    }

    pub fn tunnel_ids(&self) -> Vec<String> {
        self.listeners.iter().map(|e| e.key().1.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(tunnel_id: &str, backend_id: &str, port: u16) -> TunnelMapping {
        TunnelMapping {
            tunnel_id: tunnel_id.to_string(),
            backend_id: backend_id.to_string(),
            server_port: port,
            local_port: 8080,
            target_host: "127.0.0.1".to_string(),
        }
    }

    #[tokio::test]
    async fn create_tunnel_rejects_unknown_backend() {
        let backends = Arc::new(BackendSessionManager::new());
        let registry = TunnelRegistry::new(IpAddr::from([127, 0, 0, 1]), backends);
        let err = registry
            .create_tunnel(mapping("t1", "missing-backend", 19999))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownBackend(_)));
    }

    #[tokio::test]
    async fn stop_tunnel_rejects_unknown_id() {
        let backends = Arc::new(BackendSessionManager::new());
        let registry = TunnelRegistry::new(IpAddr::from([127, 0, 0, 1]), backends);
        let err = registry.stop_tunnel("b1", "nope").await.unwrap_err();
        assert!(matches!(err, RegistryError::UnknownTunnel(_)));
    }

    #[test]
    fn find_available_port_returns_a_bindable_port() {
        let backends = Arc::new(BackendSessionManager::new());
        let registry = TunnelRegistry::new(IpAddr::from([127, 0, 0, 1]), backends);
        let port = registry.find_available_port().expect("a free port");
        assert!(port >= EPHEMERAL_RANGE_START);
        assert!(registry.is_port_available(port));
    }
}
