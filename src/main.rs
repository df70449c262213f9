use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod db;
mod models;
mod services;
mod utils;
mod websocket;

use crate::config::AppConfig;
use crate::db::store::{PgStore, TradingStore};
use crate::db::Database;
use crate::services::matching::{HoldingsLedger, MatchingEngine};
use crate::services::registry::Registry;
use crate::websocket::broadcaster::Broadcaster;

pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<dyn TradingStore>,
    pub engine: Arc<MatchingEngine>,
    pub broadcaster: Arc<Broadcaster>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bondfi_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = AppConfig::load()?;

    tracing::info!("Starting BondFi Backend v{}", env!("CARGO_PKG_VERSION"));

    // Initialize database
    let db = Database::connect(&config.database_url).await?;
    tracing::info!("Database connected");

    let store: Arc<dyn TradingStore> = Arc::new(PgStore::new(db.pool.clone()));
    let registry = Arc::new(Registry::new(
        store.clone(),
        Duration::from_secs(config.registry_ttl_secs),
    ));
    let ledger = Arc::new(HoldingsLedger::new());
    let broadcaster = Arc::new(Broadcaster::new(config.ws_queue_capacity));

    let engine = Arc::new(MatchingEngine::new(
        store.clone(),
        registry,
        ledger,
        broadcaster.clone(),
        config.broadcast_depth,
    ));

    // Rebuild books and ledger from persisted state
    match engine.recover().await {
        Ok(count) => {
            if count > 0 {
                tracing::info!("Recovered {} resting orders into the books", count);
            } else {
                tracing::info!("No resting orders to recover");
            }
        }
        Err(e) => {
            tracing::error!("Failed to recover orders from database: {}", e);
            tracing::warn!("Starting with empty books");
        }
    }

    // Build application state
    let state = Arc::new(AppState {
        config: config.clone(),
        store,
        engine,
        broadcaster,
    });

    // Build router
    let app = Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", api::routes::create_router(state.clone()))
        .nest("/ws", websocket::routes::create_router(state.clone()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check() -> &'static str {
    "OK"
}
