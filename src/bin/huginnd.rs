//! huginnd: the Huginn daemon.
//!
//! Listens for OpenAI-compatible completion requests, relays them to the
//! configured upstream and serves the recorded metrics.

use std::net::SocketAddr;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use huginn::server::config::Config;
use huginn::server::router;

/// Huginn daemon, a metrics-recording proxy for chat-completion APIs.
#[derive(Parser)]
#[command(name = "huginnd")]
#[command(version = huginn::PKG_VERSION)]
#[command(about = "Huginn metrics-recording completion proxy")]
struct Args {
    /// Path to configuration file.
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Upstream base URL (overrides config).
    #[arg(long, env = "HUGINN_UPSTREAM")]
    upstream: Option<String>,

    /// Address to listen on (overrides config).
    #[arg(long, env = "HUGINN_ADDRESS")]
    address: Option<String>,

    /// `model_name` metric label (overrides config).
    #[arg(long, env = "HUGINN_MODEL_NAME")]
    model_name: Option<String>,

    /// Maximum concurrent upstream requests (overrides config).
    #[arg(long, env = "HUGINN_MAX_CONCURRENCY")]
    max_concurrency: Option<usize>,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(upstream) = self.upstream {
            config.upstream.base_url = upstream;
        }
        if let Some(address) = self.address {
            config.server.address = address;
        }
        if let Some(model_name) = self.model_name {
            config.metrics.model_name = model_name;
        }
        if let Some(limit) = self.max_concurrency {
            config.limits.max_concurrent_requests = limit;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // Load configuration, then let flags and env override it
    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);

    let forwarder = config.builder().build()?;

    let addr: SocketAddr = config
        .server
        .address
        .parse()
        .map_err(|e| huginn::HuginnError::Configuration(format!("Invalid address: {e}")))?;
    let listener = TcpListener::bind(addr).await?;

    info!(
        version = huginn::version_string(),
        %addr,
        upstream = %config.upstream.base_url,
        max_concurrency = config.limits.max_concurrent_requests,
        "huginnd starting"
    );

    axum::serve(listener, router(forwarder))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("huginnd stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
