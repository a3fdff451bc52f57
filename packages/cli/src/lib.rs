// ABOUTME: Server wiring for the kernel binary
// ABOUTME: Builds the run manager from configuration and serves the API with CORS

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use kernel_api::{create_router, AppState};
use kernel_config::KernelConfig;
use kernel_runtime::{EngineSettings, LocalArtifactStore, RunManager};
use kernel_sandbox::DockerSandbox;
use kernel_security::SecretCipher;
use kernel_storage::SqliteStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

/// Initialise logging; `RUST_LOG` overrides the default `info` level.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();
}

pub fn cors_layer(origin: &str) -> anyhow::Result<CorsLayer> {
    let origin = origin
        .parse::<HeaderValue>()
        .with_context(|| format!("Invalid CORS origin '{}'", origin))?;

    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any))
}

pub fn bind_address(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", host, port))
}

fn cipher_from_config(config: &KernelConfig) -> anyhow::Result<Option<SecretCipher>> {
    match config.secret_key.as_deref() {
        Some(key) => Ok(Some(SecretCipher::from_secret_key(key)?)),
        None => {
            warn!("KERNEL_SECRET_KEY not set; secrets cannot be created or injected");
            Ok(None)
        }
    }
}

/// Open the database and assemble the engine around the Docker sandbox.
pub async fn build_manager(
    config: &KernelConfig,
    cipher: Option<SecretCipher>,
) -> anyhow::Result<RunManager> {
    let pool = kernel_storage::connect(&config.database_url)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_url))?;

    let sandbox = DockerSandbox::new(config.sandbox_image.clone())?;
    if !sandbox.is_available().await {
        warn!("Docker is not reachable; runs will fail until it is");
    }

    Ok(RunManager::new(
        SqliteStore::new(pool),
        Arc::new(sandbox),
        cipher,
        LocalArtifactStore::new(&config.artifacts_dir),
        EngineSettings::from_config(config),
    ))
}

/// Mark runs left unfinished by a previous process as failed.
pub async fn reconcile(config: &KernelConfig) -> anyhow::Result<usize> {
    let manager = build_manager(config, cipher_from_config(config)?).await?;
    Ok(manager.reconcile_orphans().await?)
}

pub async fn run_server(config: KernelConfig) -> anyhow::Result<()> {
    let cipher = cipher_from_config(&config)?;
    let manager = build_manager(&config, cipher.clone()).await?;

    if config.reconcile_on_startup {
        let swept = manager.reconcile_orphans().await?;
        if swept > 0 {
            info!("Marked {} orphaned runs as failed", swept);
        }
    }

    let state = AppState::new(manager, cipher, config.sse_max_connections_per_ip);
    let app = create_router(state).layer(cors_layer(&config.cors_origin)?);

    let addr = bind_address(&config.host, config.port)?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_address() {
        let addr = bind_address("127.0.0.1", 4001).unwrap();
        assert_eq!(addr.port(), 4001);
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn test_bind_address_rejects_hostname() {
        assert!(bind_address("not a host", 80).is_err());
    }

    #[test]
    fn test_cors_layer_rejects_invalid_origin() {
        assert!(cors_layer("http://localhost:5173").is_ok());
        assert!(cors_layer("bad\norigin").is_err());
    }

    #[test]
    fn test_cipher_optional() {
        let mut config = KernelConfig::default();
        config.secret_key = None;
        assert!(cipher_from_config(&config).unwrap().is_none());

        config.secret_key = Some("local-key".to_string());
        assert!(cipher_from_config(&config).unwrap().is_some());
    }
}
