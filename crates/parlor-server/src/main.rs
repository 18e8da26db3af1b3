//! # parlor-server
//!
//! Parlor gateway binary: loads settings, seeds the in-memory backend and
//! serves `/ws`, `/health` and `/metrics` until interrupted.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use parlor_gateway::backend::memory::Seed;
use parlor_gateway::backend::{Collaborators, MemoryBackend};
use parlor_gateway::gateway::Gateway;
use parlor_gateway::server::ParlorServer;
use parlor_settings::ParlorSettings;

/// Parlor realtime chat gateway.
#[derive(Parser, Debug)]
#[command(name = "parlor-server", about = "Parlor realtime chat gateway")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (defaults to `~/.parlor/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// JSON seed for the in-memory backend (overrides settings).
    #[arg(long)]
    seed: Option<String>,

    /// Log filter when `RUST_LOG` is unset (overrides settings).
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    /// Flags sit above every settings layer.
    fn apply(&self, settings: &mut ParlorSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(seed) = &self.seed {
            settings.server.seed_path = Some(seed.clone());
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
    }
}

fn load_backend(seed_path: Option<&str>) -> Result<MemoryBackend> {
    match seed_path {
        Some(path) => {
            let seed = Seed::load(Path::new(path))
                .with_context(|| format!("Failed to load seed: {path}"))?;
            Ok(MemoryBackend::from_seed(seed))
        }
        None => {
            tracing::warn!("no seed configured, only guests can connect");
            Ok(MemoryBackend::new())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings_path = args
        .settings
        .clone()
        .unwrap_or_else(parlor_settings::settings_path);
    let mut settings = parlor_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings: {}", settings_path.display()))?;
    args.apply(&mut settings);

    parlor_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);
    let metrics = parlor_gateway::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;

    let backend = Arc::new(load_backend(settings.server.seed_path.as_deref())?);
    let gateway = Arc::new(Gateway::new(
        settings.gateway.clone(),
        Collaborators::from_backend(backend),
    ));
    let method_count = gateway.methods().methods().len();

    let server = ParlorServer::new(settings.server.clone(), gateway.clone()).with_metrics(metrics);
    let (addr, handle) = server.listen().await.context("Failed to bind server")?;

    tracing::info!("Parlor listening on ws://{addr}/ws ({method_count} APIs registered)");

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    gateway.stop().await;
    match handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "server exited with error"),
        Err(e) => tracing::warn!(error = %e, "server task panicked"),
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn cli_defaults_leave_settings_alone() {
        let cli = Cli::parse_from(["parlor-server"]);
        let mut settings = ParlorSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 7777);
        assert!(settings.server.seed_path.is_none());
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn cli_flags_override_settings() {
        let cli = Cli::parse_from([
            "parlor-server",
            "--host",
            "127.0.0.1",
            "--port",
            "8080",
            "--seed",
            "/tmp/seed.json",
            "--log-level",
            "debug",
        ]);
        let mut settings = ParlorSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.server.seed_path.as_deref(), Some("/tmp/seed.json"));
        assert_eq!(settings.logging.level, "debug");
    }

    #[test]
    fn cli_settings_path() {
        let cli = Cli::parse_from(["parlor-server", "--settings", "/tmp/p.json"]);
        assert_eq!(cli.settings, Some(PathBuf::from("/tmp/p.json")));
    }

    #[test]
    fn load_backend_from_seed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seed.json");
        std::fs::write(
            &path,
            r#"{"users":[{"id":"alice","nickname":"Alice","token":"t-alice"}],
                "channels":[{"id":"tavern","worldId":"w1","name":"Tavern","members":["alice"]}]}"#,
        )
        .unwrap();
        let backend = load_backend(path.to_str()).unwrap();
        assert_eq!(backend.message_count(&"tavern".into()), 0);
    }

    #[test]
    fn load_backend_missing_seed_fails() {
        let err = load_backend(Some("/nonexistent/seed.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to load seed"));
    }

    #[test]
    fn load_backend_without_seed_is_empty() {
        assert!(load_backend(None).is_ok());
    }
}
