use clap::Parser;
use tinyproxy_rs::{config::Config, server::TinyProxyServer, Error, Result};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "tinyproxy-rs")]
#[command(about = "A forwarding HTTP proxy with a shared in-memory object cache")]
struct Cli {
    /// Port to listen on
    port: u16,

    #[arg(long)]
    listen_host: Option<String>,

    #[arg(short, long)]
    workers: Option<usize>,

    #[arg(short, long)]
    queue_depth: Option<usize>,

    #[arg(short, long)]
    verbose: bool,

    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "info" }));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::internal(format!("setting default subscriber failed: {}", e)))?;

    info!("Starting tinyproxy-rs");

    // Load configuration
    let mut config = match cli.config {
        Some(path) => Config::from_file(&path)?,
        None => Config::default(),
    };

    config.listen_port = cli.port;
    if let Some(listen_host) = cli.listen_host {
        config.listen_host = listen_host;
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(queue_depth) = cli.queue_depth {
        config.queue_depth = queue_depth;
    }

    let server = TinyProxyServer::new(config).await?;
    server.run().await?;

    Ok(())
}
