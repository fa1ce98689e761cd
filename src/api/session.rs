//! Session management endpoints

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::api::balance::TokenBalances;
use crate::api::AppState;
use crate::engine::planner::OrderReceipt;
use crate::types::{ApiError, ApiResult};

const SESSION_TTL_SECS: u64 = 3600;

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session_id: String,
    pub account: String,
    pub chain_id: u64,
    pub created_at: u64,
    pub expires_at: u64,
    pub block_number: u64,
    pub market_maker: String,
    pub balances: TokenBalances,
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {}

#[derive(Debug, Serialize)]
pub struct HistoryEntry {
    #[serde(flatten)]
    pub receipt: OrderReceipt,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explorer_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ConversionHistoryResponse {
    pub session_id: String,
    pub conversion_count: usize,
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub success: bool,
    pub session_id: String,
    pub message: String,
    pub balances: TokenBalances,
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

async fn describe(state: &AppState, session_id: String) -> ApiResult<SessionResponse> {
    let session_arc = state
        .session_manager
        .get_session(&session_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("Session not found: {}", session_id)))?;

    let session = session_arc.read().await;

    // Calculate creation time from the session's monotonic age
    let elapsed_secs = session.created_at.elapsed().as_secs();
    let created_at = unix_now().saturating_sub(elapsed_secs);

    Ok(SessionResponse {
        session_id,
        account: session.account.to_string(),
        chain_id: state.session_manager.config().chain_id,
        created_at,
        expires_at: created_at + SESSION_TTL_SECS,
        block_number: session.chain.block_number(),
        market_maker: session.chain.deployment().market_maker.to_string(),
        balances: TokenBalances::read(&session).await?,
    })
}

/// POST /api/session - Create a new sandbox session
pub async fn create_session(
    State(state): State<AppState>,
    Json(_req): Json<Option<CreateSessionRequest>>,
) -> ApiResult<Json<SessionResponse>> {
    let session_id = state
        .session_manager
        .create_session()
        .await
        .map_err(|e| ApiError::Internal(format!("Failed to create session: {}", e)))?;

    Ok(Json(describe(&state, session_id).await?))
}

/// GET /api/session/:id - Get session info
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionResponse>> {
    Ok(Json(describe(&state, id).await?))
}

/// GET /api/session/:id/history - Settled conversions of a session
pub async fn get_conversion_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ConversionHistoryResponse>> {
    let session_arc = state
        .session_manager
        .get_session(&id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("Session not found: {}", id)))?;

    let history: Vec<HistoryEntry> = session_arc
        .read()
        .await
        .history()
        .into_iter()
        .map(|receipt| HistoryEntry {
            explorer_url: state
                .session_manager
                .config()
                .explorer_tx_url(&receipt.transaction_hash),
            receipt,
        })
        .collect();

    Ok(Json(ConversionHistoryResponse {
        session_id: id,
        conversion_count: history.len(),
        history,
    }))
}

/// POST /api/session/:id/reset - Reset session to a fresh chain
pub async fn reset_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ResetResponse>> {
    let session_arc = state
        .session_manager
        .reset_session(&id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("Session not found: {}", id)))?;

    let session = session_arc.read().await;

    Ok(Json(ResetResponse {
        success: true,
        session_id: id,
        message: "Session reset to initial state".to_string(),
        balances: TokenBalances::read(&session).await?,
    }))
}
