//! Configuration loading from `.env` files.

use std::{env, net::SocketAddr};

use anyhow::{bail, Context, Result};

/// Written to the env path on first start when no file exists yet.
pub const DEFAULT_ENV: &str = concat!(
    "BIND_HOST=127.0.0.1\n",
    "PORT=7777\n",
    "VERIFY_SIG=1\n",
    "RELAY_NAME=strand\n",
    "RELAY_DESCRIPTION=\n",
    "LOG_LEVEL=info\n",
);

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Interface to listen on, e.g. `127.0.0.1`.
    pub bind_host: String,
    /// TCP port for both HTTP and WebSocket traffic. `0` picks a free one.
    pub port: u16,
    /// Check event ids and Schnorr signatures on ingest.
    pub verify_sig: bool,
    /// Advertised in the information document.
    pub relay_name: String,
    pub relay_description: String,
    /// Fallback tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".into(),
            port: 7777,
            verify_sig: true,
            relay_name: "strand".into(),
            relay_description: String::new(),
            log_level: "info".into(),
        }
    }
}

impl Settings {
    /// Load settings from the specified `.env` file. Variables already set in
    /// the process environment take precedence over the file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let defaults = Self::default();
        let port = match env::var("PORT") {
            Ok(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("PORT must be a port number, got {raw:?}"))?,
            Err(_) => defaults.port,
        };
        let verify_sig = match env::var("VERIFY_SIG") {
            Ok(raw) => parse_flag(&raw).with_context(|| format!("VERIFY_SIG={raw:?}"))?,
            Err(_) => defaults.verify_sig,
        };
        Ok(Self {
            bind_host: env::var("BIND_HOST").unwrap_or(defaults.bind_host),
            port,
            verify_sig,
            relay_name: env::var("RELAY_NAME").unwrap_or(defaults.relay_name),
            relay_description: env::var("RELAY_DESCRIPTION").unwrap_or_default(),
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
        })
    }

    /// Socket address to bind, e.g. `127.0.0.1:7777`.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let addr = format!("{}:{}", self.bind_host, self.port);
        addr.parse()
            .with_context(|| format!("invalid bind address {addr}"))
    }
}

/// Serializes tests that mutate the process environment.
#[cfg(test)]
pub(crate) static ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

fn parse_flag(raw: &str) -> Result<bool> {
    match raw.trim() {
        "1" | "true" => Ok(true),
        "0" | "false" | "" => Ok(false),
        other => bail!("expected 1 or 0, got {other:?}"),
    }
}
