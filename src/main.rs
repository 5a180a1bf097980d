//! socksd - SOCKS5 proxy server
//!
//! Command-line entry point.

use anyhow::{Context, Result};
use clap::Parser;
use socksd::config::DEFAULT_LISTEN;
use socksd::{Authenticator, NoAuth, ProxyServer, ServerConfig, UserPassAuth};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// SOCKS5 proxy server with CONNECT and UDP ASSOCIATE support
#[derive(Parser, Debug)]
#[command(name = "socksd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on as HOST:PORT; empty host binds all interfaces
    #[arg(short, long, default_value = DEFAULT_LISTEN)]
    listen: String,

    /// Username for username/password authentication
    #[arg(short, long)]
    username: Option<String>,

    /// Password for username/password authentication
    #[arg(short, long)]
    password: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level)?;

    let users = match (args.username, args.password) {
        (Some(username), Some(password)) => Some(HashMap::from([(username, password)])),
        (None, None) => None,
        _ => anyhow::bail!("--username and --password must be given together"),
    };

    let cfg = ServerConfig {
        listen: args.listen,
        users,
        ..Default::default()
    };
    cfg.validate().map_err(anyhow::Error::msg)?;

    let auth: Arc<dyn Authenticator> = match &cfg.users {
        Some(map) => Arc::new(UserPassAuth::new(map.clone())),
        None => Arc::new(NoAuth),
    };

    info!("socksd v{}", socksd::VERSION);
    info!(
        "authentication: {}",
        if cfg.users.is_some() {
            "username/password"
        } else {
            "none"
        }
    );

    // the engine runs on a single reactor thread
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("runtime error")?;

    runtime.block_on(async {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(4);
        tokio::spawn(handle_signals(shutdown_tx));

        let server = ProxyServer::new(cfg, auth);
        let listener = server.bind().await?;
        server.serve(listener, shutdown_rx).await
    })
}

/// First interrupt requests a graceful shutdown, the second forces
/// termination.
async fn handle_signals(tx: broadcast::Sender<()>) {
    wait_for_signal().await;
    info!("interrupt received, stopping listener and draining sessions");
    let _ = tx.send(());

    wait_for_signal().await;
    info!("second interrupt, forcing termination");
    let _ = tx.send(());
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
            return;
        }
    }

    let _ = tokio::signal::ctrl_c().await;
}

/// Setup logging based on configuration
fn setup_logging(level: &str) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    Ok(())
}
