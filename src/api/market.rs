//! Market snapshot endpoint

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;

use crate::api::{find_session, AppState};
use crate::engine::chain::{TokenInfo, TokenKind};
use crate::engine::tribute::rate_to_pct;
use crate::sandbox::{Deployment, MarketSnapshot};
use crate::types::{ApiError, ApiResult};

#[derive(Debug, Serialize)]
pub struct MarketResponse {
    pub collateral: TokenInfo,
    pub bonded: TokenInfo,
    pub contracts: Deployment,
    pub buy_tribute_pct: String,
    pub sell_tribute_pct: String,
    #[serde(flatten)]
    pub snapshot: MarketSnapshot,
}

/// GET /api/market/:session_id - Curve state and spot prices
pub async fn get_market(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<MarketResponse>> {
    let session_arc = find_session(&state, &session_id).await?;
    let session = session_arc.read().await;

    let snapshot = session
        .market()
        .await
        .map_err(|e| ApiError::Internal(format!("Market read failed: {}", e)))?;

    Ok(Json(MarketResponse {
        collateral: session.tokens().token(TokenKind::Collateral).clone(),
        bonded: session.tokens().token(TokenKind::Bonded).clone(),
        contracts: *session.chain.deployment(),
        buy_tribute_pct: rate_to_pct(snapshot.params.buy_tribute_rate),
        sell_tribute_pct: rate_to_pct(snapshot.params.sell_tribute_rate),
        snapshot,
    }))
}
