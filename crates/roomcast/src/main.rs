//! # roomcast
//!
//! Roomcast server binary: loads settings, initializes logging and metrics,
//! and runs the HTTP/WebSocket server until ctrl-c.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use roomcast_server::config::ServerConfig;
use roomcast_server::server::RoomcastServer;
use roomcast_settings::RoomcastSettings;
use tracing::{info, warn};

/// Room-based realtime messaging server.
#[derive(Parser, Debug)]
#[command(name = "roomcast", about = "Room-based WebSocket messaging server")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (default `~/.roomcast/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log level or filter directive (overrides settings).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON logs.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn settings_path(&self) -> PathBuf {
        self.settings
            .clone()
            .unwrap_or_else(roomcast_settings::settings_path)
    }

    /// Command-line flags take precedence over file and environment.
    fn apply(&self, settings: &mut RoomcastSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.json_logs {
            settings.logging.json = true;
        }
    }
}

fn load(cli: &Cli) -> Result<RoomcastSettings> {
    let loaded = match &cli.settings {
        Some(path) => roomcast_settings::load_settings_from_path(path),
        None => roomcast_settings::load_settings(),
    };
    let mut settings = loaded.with_context(|| {
        format!("Failed to load settings from {}", cli.settings_path().display())
    })?;
    cli.apply(&mut settings);
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load(&cli)?;

    roomcast_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);

    let metrics = match roomcast_server::metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "metrics disabled");
            None
        }
    };

    let config = ServerConfig::from(&settings);
    let server = RoomcastServer::new(config, metrics);
    let (addr, handle) = server
        .listen()
        .await
        .with_context(|| format!("Failed to bind {}", server.config().bind_addr()))?;
    info!(%addr, "roomcast ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    let _ = server.shutdown().graceful_shutdown(vec![handle], None).await;
    info!("roomcast stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults() {
        let cli = Cli::parse_from(["roomcast"]);
        assert!(cli.host.is_none());
        assert!(cli.port.is_none());
        assert!(!cli.json_logs);
    }

    #[test]
    fn cli_flags_override_settings() {
        let cli = Cli::parse_from([
            "roomcast",
            "--host",
            "0.0.0.0",
            "--port",
            "9000",
            "--log-level",
            "debug",
            "--json-logs",
        ]);
        let mut settings = RoomcastSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.logging.level, "debug");
        assert!(settings.logging.json);
    }

    #[test]
    fn load_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"maxConnections": 7}, "auth": {"apiTokens": ["t"]}}"#)
            .unwrap();

        let cli = Cli::parse_from(["roomcast", "--settings", path.to_str().unwrap(), "--port", "0"]);
        let settings = load(&cli).unwrap();
        let config = ServerConfig::from(&settings);
        assert_eq!(config.max_connections, 7);
        assert_eq!(config.api_tokens, vec!["t".to_owned()]);
        assert_eq!(config.port, 0);
    }

    #[test]
    fn load_without_flag_reads_home_settings() {
        let cli = Cli::parse_from(["roomcast", "--port", "0"]);
        assert_eq!(cli.settings_path(), roomcast_settings::settings_path());
        let settings = load(&cli).unwrap();
        assert_eq!(settings.server.port, 0);
    }

    #[test]
    fn load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        let cli = Cli::parse_from(["roomcast", "--settings", path.to_str().unwrap()]);
        let err = load(&cli).unwrap_err();
        assert!(err.to_string().contains("Failed to load settings"));
    }

    #[tokio::test]
    async fn server_graceful_shutdown() {
        let server = RoomcastServer::new(ServerConfig::default(), None);
        let (_addr, handle) = server.listen().await.unwrap();
        let aborted = server
            .shutdown()
            .graceful_shutdown(vec![handle], Some(std::time::Duration::from_secs(5)))
            .await;
        assert_eq!(aborted, 0);
    }
}
