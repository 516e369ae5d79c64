//! Remote device orchestration server.
//!
//! Run with: cargo run -p remote-device-server
//!
//! Configuration is read from the TOML file named by `REMOTE_DEVICE_CONFIG`
//! (default `remote-device.toml`). Observers connect to `/ws`; the HTTP API
//! lives under `/api`.

use std::{io::ErrorKind, path::PathBuf, sync::Arc};

use anyhow::Context;
use remote_device_connection::AdbTransport;
use remote_device_core::EngineConfig;
use remote_device_engine::Engine;
use remote_device_executor::CommandRegistry;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CONFIG_ENV: &str = "REMOTE_DEVICE_CONFIG";
const DEFAULT_CONFIG: &str = "remote-device.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = load_config()?;
    let transport = AdbTransport::locate(config.device.adb_path.as_deref())
        .await
        .context("Failed to locate the adb executable")?;
    let bind = config.server.bind.clone();

    let engine = Engine::new(config, Arc::new(transport), CommandRegistry::with_builtins());
    engine.start().await.context("Failed to start engine")?;

    // Build router
    let app = remote_device_transport::router(Arc::clone(&engine))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;
    tracing::info!("Server listening on http://{bind}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    engine.shutdown().await;
    Ok(())
}

fn load_config() -> anyhow::Result<EngineConfig> {
    let path = std::env::var_os(CONFIG_ENV).map_or_else(|| PathBuf::from(DEFAULT_CONFIG), PathBuf::from);

    match std::fs::read_to_string(&path) {
        Ok(text) => {
            let config = parse_config(&text)
                .with_context(|| format!("Invalid config file {}", path.display()))?;
            tracing::info!(path = %path.display(), tasks = config.tasks.len(), "Configuration loaded");
            Ok(config)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "No config file, using defaults");
            Ok(EngineConfig::default())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

fn parse_config(text: &str) -> Result<EngineConfig, toml::de::Error> {
    toml::from_str(text)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let config = parse_config(
            r#"
            [device]
            address = "192.168.1.40:5555"
            heartbeat_interval_secs = 10

            [server]
            bind = "0.0.0.0:8080"

            [[tasks]]
            name = "morning"
            schedule = "0 30 7 * * 1-5"
            commands = [
                { type = "wake" },
                { type = "launch_app", package = "com.example.tv" },
            ]

            [[tasks]]
            name = "night"
            schedule = "0 0 23 * * *"
            enabled = false
            commands = [{ type = "power_off" }]
            "#,
        )
        .unwrap();

        assert_eq!(config.device.address.as_deref(), Some("192.168.1.40:5555"));
        assert_eq!(config.device.heartbeat_interval_secs, 10);
        assert_eq!(config.device.heartbeat_command, "echo ping");
        assert_eq!(config.server.bind, "0.0.0.0:8080");
        assert_eq!(config.tasks.len(), 2);
        assert_eq!(config.tasks[0].commands[1].kind, "launch_app");
        assert_eq!(
            config.tasks[0].commands[1].params["package"],
            "com.example.tv"
        );
        assert!(!config.tasks[1].enabled);
    }

    #[test]
    fn test_empty_config_is_default() {
        let config = parse_config("").unwrap();
        assert!(config.device.address.is_none());
        assert!(config.device.reconnect_on_start);
        assert_eq!(config.server.bind, "127.0.0.1:3000");
        assert!(config.tasks.is_empty());
    }
}
