use axum::{Router, extract::State, routing::get};
use forge_relay::{RelayConfig, RelayServer};
use miette::{Context, IntoDiagnostic, Result};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;

mod ledger;

use ledger::SqliteLedger;

const DEFAULT_DATABASE_URL: &str = "sqlite:forge-relay.db?mode=rwc";
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";

async fn handle_db_init(State(ledger): State<SqliteLedger>) -> forge_relay::Result<&'static str> {
    ledger.init_schema().await?;
    Ok("DB initialized OK")
}

async fn init_db(db_url: &str) -> Result<SqlitePool> {
    SqlitePoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(600))
        .connect(db_url)
        .await
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to open database {}", db_url))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(
                    "forge_relay=debug,forge_relay_server=debug,info",
                )
            }),
        )
        .init();

    let config = RelayConfig::from_env()
        .into_diagnostic()
        .wrap_err("invalid relay configuration")?;
    let db_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());

    let pool = init_db(&db_url).await?;
    let ledger = SqliteLedger::new(pool.clone());
    ledger
        .init_schema()
        .await
        .into_diagnostic()
        .wrap_err("failed to initialize ledger schema")?;
    ledger
        .resume_clock()
        .await
        .into_diagnostic()
        .wrap_err("failed to read latest ledger timestamps")?;

    tracing::info!(
        site = %config.site_url,
        channel = %config.default_channel,
        policy = ?config.routing_policy,
        "relay configured"
    );

    let relay = RelayServer::builder()
        .config(config)
        .ledger(Arc::new(ledger.clone()))
        .build()
        .into_diagnostic()
        .wrap_err("failed to build relay server")?;

    let app = relay
        .router()
        .merge(
            Router::new()
                .route("/db-init", get(handle_db_init))
                .with_state(ledger),
        )
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to bind to {}", bind_addr))?;
    tracing::info!("forge relay listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .into_diagnostic()
        .wrap_err("server error")?;

    pool.close().await;
    tracing::info!("database pool closed");
    Ok(())
}
