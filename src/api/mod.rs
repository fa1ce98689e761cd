//! API endpoints for the converter service

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::sync::RwLock;

mod balance;
mod convert;
mod market;
mod quote;
mod session;

use crate::sandbox::{ConversionSession, SessionManager};
use crate::types::{ApiError, ApiResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub session_manager: Arc<SessionManager>,
}

impl AppState {
    pub fn new(session_manager: Arc<SessionManager>) -> Self {
        Self { session_manager }
    }
}

pub(crate) async fn find_session(
    state: &AppState,
    id: &str,
) -> ApiResult<Arc<RwLock<ConversionSession>>> {
    state
        .session_manager
        .get_session(id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("Session not found: {}", id)))
}

/// Create the API router with all endpoints
pub fn router(session_manager: Arc<SessionManager>) -> Router {
    let app_state = AppState::new(session_manager);

    Router::new()
        // Session management
        .route("/session", post(session::create_session))
        .route("/session/:id", get(session::get_session))
        .route("/session/:id/history", get(session::get_conversion_history))
        .route("/session/:id/reset", post(session::reset_session))
        // Wallet operations
        .route("/balance/:session_id", get(balance::get_balance))
        .route("/faucet", post(balance::faucet))
        // Market and quotes
        .route("/market/:session_id", get(market::get_market))
        .route("/quote", post(quote::get_quote))
        // Conversion form
        .route("/session/:id/form", get(quote::get_form))
        .route("/session/:id/form/input", post(quote::set_input))
        .route("/session/:id/form/editing", post(quote::set_editing))
        .route("/session/:id/form/direction", post(quote::set_direction))
        .route("/session/:id/form/max", post(quote::convert_all))
        .route("/session/:id/form/refresh", post(quote::refresh))
        // Conversion execution
        .route(
            "/session/:id/convert",
            post(convert::start_conversion).get(convert::get_progress),
        )
        .route("/session/:id/convert/cancel", post(convert::cancel_conversion))
        .route("/session/:id/convert/home", post(convert::return_home))
        .with_state(app_state)
}
