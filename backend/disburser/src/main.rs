//! Disburser service — entry point.
//!
//! Disbursements are (re)attached when a client posts them. Each live one
//! gets its own background poller against the Safe Transaction Service; step
//! changes are persisted to SQLite and exposed through a small Axum REST API.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use disburser::api::{self, ApiState};
use disburser::db::{self, SqliteStore};
use disburser::{Config, DisbursementStore, Orchestrator, SafeTxServiceReader, SessionStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url).await?;
    let store: Arc<dyn DisbursementStore> = Arc::new(SqliteStore::new(pool));

    let client = Client::builder()
        .timeout(Duration::from_secs(config.http_timeout_secs))
        .build()?;
    let reader = Arc::new(SafeTxServiceReader::new(
        client,
        config.safe_tx_service_url.clone(),
    ));

    // ─── Orchestrator ─────────────────────────────────────
    let session = Arc::new(SessionStore::new());
    let orchestrator = Arc::new(Orchestrator::new(
        config.orchestrator(),
        reader,
        Arc::clone(&store),
    ));
    orchestrator.subscribe_all(session.listener());

    // ─── REST API ─────────────────────────────────────────
    let api_state = Arc::new(ApiState {
        orchestrator: Arc::clone(&orchestrator),
        store,
        session,
    });

    let app = api::router(api_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!(
        tx_service = %config.safe_tx_service_url,
        "API listening on http://{addr}"
    );

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    orchestrator.shutdown().await;
    info!("Shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
