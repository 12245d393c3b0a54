//! mcp-forge server binary.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use mcp_forge::Broker;
use mcp_forge::channels::{HttpChannel, RpcDispatcher, StdioChannel};
use mcp_forge::config::{BrokerConfig, default_home};
use mcp_forge::tools::{ToolRegistry, register_broker_tools};

#[derive(Parser, Debug)]
#[command(name = "mcp-forge", version, about = "One MCP endpoint for many MCP servers")]
struct Cli {
    /// Directory holding the registry, audit log and managed servers
    #[arg(long, env = "MCP_FORGE_HOME")]
    home: Option<PathBuf>,

    /// Serve MCP over HTTP on this port instead of stdio
    #[arg(long, value_name = "PORT")]
    http: Option<u16>,

    /// Address to bind when serving over HTTP
    #[arg(long, default_value = "127.0.0.1")]
    bind: std::net::IpAddr,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = BrokerConfig::with_home(cli.home.unwrap_or_else(default_home));
    tracing::info!("Broker home: {}", config.home.display());

    let broker = Arc::new(Broker::open(config).await?);
    let tools = Arc::new(ToolRegistry::new());
    register_broker_tools(&tools, broker).await;
    tracing::info!("Registered {} broker tools", tools.count().await);

    let dispatcher = Arc::new(RpcDispatcher::new(tools));

    match cli.http {
        Some(port) => {
            let addr = SocketAddr::new(cli.bind, port);
            HttpChannel::new(dispatcher)
                .serve(addr, async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await?;
        }
        None => {
            let stdio = StdioChannel::new(dispatcher);
            tokio::select! {
                result = stdio.run() => result?,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Interrupted; shutting down");
                }
            }
        }
    }

    Ok(())
}

/// Logs always go to stderr; stdout carries the protocol.
fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mcp_forge=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
