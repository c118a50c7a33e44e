use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use bifrost_server::backend::{run_control_listener, BackendSessionManager};
use bifrost_shared::{StaticApiKeyResolver, CONTROL_PORT};

#[derive(Parser, Debug)]
#[clap(author, version, about = "bifrost server - reverse TCP tunnel server")]
struct Args {
    /// IP address the control listener binds to. A `TunnelRegistry`
    /// embedding this binary's library uses the same address for tunnel
    /// listeners unless told otherwise.
    #[clap(long, default_value = "0.0.0.0", env = "BIND_ADDR")]
    bind_addr: IpAddr,

    /// Port the backend control listener binds to.
    #[clap(long, default_value_t = CONTROL_PORT, env = "BACKEND_PORT")]
    backend_port: u16,

    /// Comma-separated `api_key=backend_id` pairs for the static resolver.
    /// A deployment that needs database-backed keys embeds
    /// `bifrost_server` as a library and supplies its own
    /// `ApiKeyResolver` instead of running this binary.
    #[clap(long, env = "API_KEYS", hide_env_values = true)]
    api_keys: Option<String>,
}

fn parse_static_keys(raw: &str) -> StaticApiKeyResolver {
    let resolver = StaticApiKeyResolver::new();
    for pair in raw.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((key, backend_id)) => resolver.insert(key.to_string(), backend_id.to_string()),
            None => tracing::warn!(%pair, "ignoring malformed API_KEYS entry, expected key=backend_id"),
        }
    }
    resolver
}

#[tokio::main]
async fn run(args: Args) -> Result<()> {
    let resolver = Arc::new(parse_static_keys(args.api_keys.as_deref().unwrap_or_default()));
    let backends = Arc::new(BackendSessionManager::new());

    let listener = TcpListener::bind((args.bind_addr, args.backend_port)).await?;
    info!(addr = ?args.bind_addr, port = args.backend_port, "bifrost server listening for backend agents");

    run_control_listener(listener, backends, resolver).await
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    run(Args::parse())
}
