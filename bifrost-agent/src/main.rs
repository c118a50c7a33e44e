use anyhow::Result;
use clap::Parser;

use bifrost_agent::{control, AgentConfig};
use bifrost_shared::CONTROL_PORT;

#[derive(Parser, Debug)]
#[clap(author, version, about = "bifrost agent - connects a local service to a bifrost server")]
struct Args {
    /// Hostname or IP address of the bifrost server.
    #[clap(long, env = "SERVER_HOST")]
    server_host: String,

    /// Port the server's backend control listener binds to.
    #[clap(long, default_value_t = CONTROL_PORT, env = "SERVER_PORT")]
    server_port: u16,

    /// API key presented on `register`.
    #[clap(long, env = "API_KEY", hide_env_values = true)]
    api_key: String,
}

#[tokio::main]
async fn run(args: Args) -> Result<()> {
    control::run(AgentConfig {
        server_host: args.server_host,
        server_port: args.server_port,
        api_key: args.api_key,
    })
    .await
}

fn main() {
    tracing_subscriber::fmt::init();
    if let Err(err) = run(Args::parse()) {
        tracing::error!(%err, "agent exited");
        std::process::exit(1);
    }
}
