//! Command line entry point. Loads the `.env` settings, installs logging, and
//! serves the relay until interrupted.

mod bus;
mod config;
mod connection;
mod deletion;
mod error;
mod event;
mod filter;
mod hub;
mod message;
mod pipeline;
mod relay;
mod server;
mod storage;
mod ws;

use std::{fs, future::Future, path::Path};

use anyhow::Context;
use clap::Parser;
use config::{Settings, DEFAULT_ENV};
use relay::Relay;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Command line interface entry point.
#[derive(Parser, Debug)]
#[command(name = "strand", author, version, about = "In-memory Nostr relay")]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Listen on this port instead of `PORT`. `0` picks a free one.
    #[arg(long)]
    port: Option<u16>,
    /// Disable ANSI colors in log output.
    #[arg(long)]
    no_color: bool,
}

/// Serve until `shutdown` resolves, then disconnect every client and wait
/// for their sockets to close.
async fn run(
    cli: Cli,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let mut cfg = Settings::from_env(&cli.env)
        .with_context(|| format!("loading settings from {}", cli.env))?;
    if let Some(port) = cli.port {
        cfg.port = port;
    }
    init_tracing(&cfg.log_level, !cli.no_color);

    let relay = Relay::new(&cfg);
    let listener = server::bind(cfg.bind_addr()?).await?;
    info!(addr = %listener.local_addr()?, verify_sig = cfg.verify_sig, "relay listening");

    let closing = std::sync::Arc::clone(&relay);
    server::serve(listener, relay, async move {
        shutdown.await;
        closing.shutdown();
    })
    .await
}

/// Install the fmt subscriber. `RUST_LOG` wins over the configured level.
/// A second call (as happens in tests) leaves the first subscriber in place.
fn init_tracing(level: &str, ansi: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(ansi)
        .try_init();
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(env_path, DEFAULT_ENV).with_context(|| format!("writing {path}"))?;
    Ok(())
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run(cli, async {
        // an error here means no handler could be installed; stop right away
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}
