//! Bonded Converter Backend
//!
//! HTTP API server for bonding-curve conversions. Every session gets its own
//! sandbox market maker, so quotes and transaction plans run end to end.

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bonded_converter_backend::api;
use bonded_converter_backend::config::ConverterConfig;
use bonded_converter_backend::engine::tribute::rate_to_pct;
use bonded_converter_backend::sandbox::SessionManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let config = ConverterConfig::from_env();
    tracing::info!(
        "Chain {}: {} <-> {}, connector weight {} ppm, tribute {}% in / {}% out",
        config.chain_id,
        config.collateral.symbol,
        config.bonded.symbol,
        config.connector_weight(),
        rate_to_pct(config.buy_tribute_rate),
        rate_to_pct(config.sell_tribute_rate)
    );
    tracing::info!(
        "Price retry every {:?}, plan reveal delay {:?}, receipt poll {:?}",
        config.price_retry,
        config.reveal_delay,
        config.receipt_poll
    );

    let addr = config.listen_addr;
    let session_manager = Arc::new(SessionManager::new(config));
    tracing::info!("SessionManager initialized");

    // Build router
    let app = Router::new()
        .route("/health", get(health_check))
        .nest("/api", api::router(session_manager))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // Start server
    tracing::info!("Starting server on {}", addr);
    tracing::info!("API endpoints:");
    tracing::info!("  GET  /health                          - Health check");
    tracing::info!("  POST /api/session                     - Create new sandbox session");
    tracing::info!("  GET  /api/session/:id                 - Get session info & balances");
    tracing::info!("  GET  /api/session/:id/history         - Settled conversions");
    tracing::info!("  POST /api/session/:id/reset           - Reset session to a fresh market");
    tracing::info!("  GET  /api/balance/:session_id         - Get token balances");
    tracing::info!("  POST /api/faucet                      - Mint tokens into session");
    tracing::info!("  GET  /api/market/:session_id          - Curve state and spot prices");
    tracing::info!("  POST /api/quote                       - One-shot conversion quote");
    tracing::info!("  GET  /api/session/:id/form            - Conversion form state");
    tracing::info!("  POST /api/session/:id/form/input      - Type into source or recipient field");
    tracing::info!("  POST /api/session/:id/form/editing    - Move focus between fields");
    tracing::info!("  POST /api/session/:id/form/direction  - Switch the asset pair");
    tracing::info!("  POST /api/session/:id/form/max        - Use the whole source balance");
    tracing::info!("  POST /api/session/:id/form/refresh    - Requote against the current market");
    tracing::info!("  POST /api/session/:id/convert         - Start the conversion");
    tracing::info!("  GET  /api/session/:id/convert         - Conversion step progress");
    tracing::info!("  POST /api/session/:id/convert/cancel  - Stop before the next step");
    tracing::info!("  POST /api/session/:id/convert/home    - Return to an empty form");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_check() -> &'static str {
    "ok"
}
