//! Balance and faucet endpoints

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::api::AppState;
use crate::engine::amount::{format_units, parse_units, Amount, FormatOptions};
use crate::engine::chain::{TokenInfo, TokenKind};
use crate::sandbox::ConversionSession;
use crate::types::{ApiError, ApiResult};

/// Fractional digits shown next to raw balances.
const BALANCE_DECIMALS: usize = 4;

#[derive(Debug, Serialize)]
pub struct TokenBalance {
    pub symbol: String,
    /// Base units
    pub amount: Amount,
    pub human: String,
}

impl TokenBalance {
    pub fn new(token: &TokenInfo, amount: Amount) -> Self {
        Self {
            symbol: token.symbol.clone(),
            amount,
            human: format_units(
                amount,
                token.decimals,
                FormatOptions {
                    truncate_to: Some(BALANCE_DECIMALS),
                    commas: true,
                },
            ),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TokenBalances {
    pub collateral: TokenBalance,
    pub bonded: TokenBalance,
}

impl TokenBalances {
    pub async fn read(session: &ConversionSession) -> ApiResult<Self> {
        let read = |kind: TokenKind| async move {
            session
                .balance(kind)
                .await
                .map(|amount| TokenBalance::new(session.tokens().token(kind), amount))
                .map_err(|e| ApiError::Internal(format!("Balance read failed: {}", e)))
        };
        Ok(Self {
            collateral: read(TokenKind::Collateral).await?,
            bonded: read(TokenKind::Bonded).await?,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub session_id: String,
    pub account: String,
    pub balances: TokenBalances,
}

#[derive(Debug, Deserialize)]
pub struct FaucetRequest {
    pub session_id: String,
    /// Token symbol, e.g. "DAI"
    pub token: String,
    /// Human amount, e.g. "250.5"
    pub amount: String,
}

#[derive(Debug, Serialize)]
pub struct FaucetResponse {
    pub success: bool,
    pub token: String,
    pub new_balance: TokenBalance,
}

/// GET /api/balance/:session_id - Get token balances for a session
pub async fn get_balance(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<BalanceResponse>> {
    let session_arc = state
        .session_manager
        .get_session(&session_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("Session not found: {}", session_id)))?;

    let session = session_arc.read().await;
    let balances = TokenBalances::read(&session).await?;

    Ok(Json(BalanceResponse {
        session_id,
        account: session.account.to_string(),
        balances,
    }))
}

/// POST /api/faucet - Mint tokens into a session
pub async fn faucet(
    State(state): State<AppState>,
    Json(req): Json<FaucetRequest>,
) -> ApiResult<Json<FaucetResponse>> {
    let session_arc = state
        .session_manager
        .get_session(&req.session_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("Session not found: {}", req.session_id)))?;

    let session = session_arc.read().await;
    let kind = session
        .tokens()
        .kind_of(&req.token)
        .ok_or_else(|| ApiError::BadRequest(format!("Unknown token: {}", req.token)))?;
    let token = session.tokens().token(kind).clone();

    let amount = parse_units(&req.amount, token.decimals)
        .filter(|a| !a.is_zero())
        .ok_or_else(|| ApiError::BadRequest(format!("Invalid amount: {}", req.amount)))?;

    let new_balance = session.chain.faucet(kind, session.account, amount);
    tracing::info!(
        "Faucet: {} {} to session {}",
        req.amount,
        token.symbol,
        req.session_id
    );

    Ok(Json(FaucetResponse {
        success: true,
        token: token.symbol.clone(),
        new_balance: TokenBalance::new(&token, new_balance),
    }))
}
