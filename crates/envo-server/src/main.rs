//! Envo server entry point.
//!
//! Loads configuration, opens the store, connects the key management and
//! identity providers, then starts the Axum HTTP server with graceful
//! shutdown on SIGINT or SIGTERM.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use envo_core::crypto::kms::KeyManagement;
use envo_core::login::IdentityProvider;
use envo_storage::{MemoryStore, Store};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use envo_server::build_router;
use envo_server::config::ServerConfig;
use envo_server::google::GoogleProvider;
use envo_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env().context("invalid configuration")?;

    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(config = ?config, "Envo starting");

    let store = open_store(&config).await?;
    let managed_keys = connect_kms(&config).await?;
    let provider: Option<Arc<dyn IdentityProvider>> = config
        .google
        .clone()
        .map(|google| Arc::new(GoogleProvider::new(google)) as Arc<dyn IdentityProvider>);

    let state = AppState::build(&config, store, provider, managed_keys)
        .await
        .context("failed to initialize services")?;

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let audit = state.audit.clone();
    let app = build_router(state);

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;

    info!(addr = %config.bind_addr, "Envo server listening");

    let signal = tokio::spawn(shutdown_signal(shutdown_tx));
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await
        .context("server error")?;

    signal.abort();
    audit.flush().await;
    info!("Envo server stopped");
    Ok(())
}

async fn open_store(config: &ServerConfig) -> anyhow::Result<Arc<dyn Store>> {
    match &config.database_url {
        None => {
            warn!("DATABASE_URL not set, using in-memory store (data will not persist)");
            Ok(Arc::new(MemoryStore::new()))
        }
        #[cfg(feature = "postgres")]
        Some(url) => {
            info!(url = %"[redacted]", "using PostgreSQL store");
            let store = envo_storage::PostgresStore::connect(url)
                .await
                .context("failed to connect to PostgreSQL")?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => {
            anyhow::bail!("DATABASE_URL is set but feature 'postgres' is not enabled");
        }
    }
}

async fn connect_kms(config: &ServerConfig) -> anyhow::Result<Option<Arc<dyn KeyManagement>>> {
    match &config.kms_key_id {
        None => {
            info!("AWS_KMS_KEY_ID not set, encrypting with the local key only");
            Ok(None)
        }
        #[cfg(feature = "aws-kms")]
        Some(key_id) => {
            let kms = envo_core::crypto::kms::AwsKms::connect(key_id.clone()).await;
            match kms.describe_key().await {
                Ok(description) => info!(key_id = %description.key_id, enabled = description.enabled, "AWS KMS connected"),
                Err(e) => warn!(error = %e, "AWS KMS key not reachable at startup, local fallback stays available"),
            }
            Ok(Some(Arc::new(kms)))
        }
        #[cfg(not(feature = "aws-kms"))]
        Some(_) => {
            anyhow::bail!("AWS_KMS_KEY_ID is set but feature 'aws-kms' is not enabled");
        }
    }
}

/// Wait for SIGINT or SIGTERM, then broadcast shutdown.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, stopping server");
    let _ = shutdown_tx.send(true);
}
