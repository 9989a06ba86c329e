//! Relay node binary. Configured from flags or the environment.

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use relaymesh_core::Codec;
use relaymesh_server::config::{parse_csv, routes_from_lists, NodeMode};
use relaymesh_server::{NodeConfig, RelayNode};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "relay-node", version, about = "HTTP relay node")]
struct Cli {
    /// Node identity used in relay headers and acknowledgements.
    #[arg(long, env = "NODE_NAME", default_value = "relay-node")]
    node_name: String,

    /// `relay` forwards to the next hop; `echo` answers with the request.
    #[arg(long, env = "NODE_MODE", default_value = "relay")]
    mode: NodeMode,

    /// Comma-separated listen addresses, one listener each.
    #[arg(long, env = "ADAPTER_PORTS")]
    adapter_ports: Option<String>,

    /// Single listen address, used when `--adapter-ports` is not set.
    #[arg(long, env = "LISTEN_ADDR", default_value = ":8080")]
    listen_addr: String,

    /// Default next hop for routes without a positional one.
    #[arg(long, env = "NEXT_HOP")]
    next_hop: Option<String>,

    /// Comma-separated next hops, paired positionally with listen addresses.
    #[arg(long, env = "NEXT_HOPS")]
    next_hops: Option<String>,

    #[arg(long, env = "MAX_HOPS", default_value_t = 10)]
    max_hops: u32,

    /// Worker count; defaults to one per listener.
    #[arg(long, env = "WORKER_COUNT")]
    worker_count: Option<usize>,

    #[arg(long, env = "RESPONSE_TIMEOUT_MS", default_value_t = 30_000)]
    response_timeout_ms: u64,

    #[arg(long, env = "FORWARD_TIMEOUT_MS", default_value_t = 10_000)]
    forward_timeout_ms: u64,

    #[arg(long, env = "STATS_INTERVAL_SECS", default_value_t = 30)]
    stats_interval_secs: u64,

    /// Address of the admin listener (`/health`, `/stats`).
    #[arg(long, env = "ADMIN_ADDR")]
    admin_addr: Option<String>,

    /// Encode bus payloads as MessagePack instead of JSON.
    #[arg(long, env = "MSGPACK")]
    msgpack: bool,

    /// Emit logs as JSON lines.
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Cli {
    fn into_config(self) -> NodeConfig {
        let listen = match self.adapter_ports.as_deref() {
            Some(ports) if !parse_csv(ports).is_empty() => parse_csv(ports),
            _ => vec![self.listen_addr.clone()],
        };
        let next_hops = self.next_hops.as_deref().map(parse_csv).unwrap_or_default();
        let routes = routes_from_lists(&listen, &next_hops, self.next_hop.as_deref());

        NodeConfig {
            node_name: self.node_name,
            mode: self.mode,
            routes,
            max_hops: self.max_hops,
            worker_count: self.worker_count,
            response_timeout: Duration::from_millis(self.response_timeout_ms),
            forward_timeout: Duration::from_millis(self.forward_timeout_ms),
            stats_interval: Duration::from_secs(self.stats_interval_secs),
            admin_addr: self.admin_addr,
            codec: if self.msgpack { Codec::MsgPack } else { Codec::Json },
            ..NodeConfig::default()
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C"),
        () = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = cli.into_config();
    let mut node = RelayNode::new(config).context("invalid node configuration")?;
    let addrs = node.start().await?;
    info!(?addrs, admin = ?node.admin_addr(), "Listening");

    node.serve(shutdown_signal()).await
}
