//! Quote endpoints
//!
//! A one-shot quote for scripts, and the form endpoints that drive a session's
//! reactive quote feed (typed input, focus, pair switch, "max").

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::RwLock;

use crate::api::{find_session, AppState};
use crate::engine::amount::{format_units, parse_units, Amount, FormatOptions};
use crate::engine::chain::{ConversionDirection, TokenKind};
use crate::engine::error::QuoteError;
use crate::engine::quote::{
    build_quote, ConversionQuote, ConversionRequest, EditingField, QuoteView, SubmitBlocker,
    SLIPPAGE_PCT,
};
use crate::sandbox::ConversionSession;
use crate::types::{ApiError, ApiResult};

/// Longest a request waits for a pending quote to publish.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
pub struct QuoteRequest {
    pub session_id: String,
    /// Symbol of the token being converted, e.g. "DAI"
    pub from_token: String,
    /// Human amount, e.g. "100.5"
    pub amount: String,
    pub slippage_pct: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct QuoteResponse {
    pub from_token: String,
    pub to_token: String,
    pub quote: ConversionQuote,
    pub estimated_received_human: String,
    pub minimum_received_human: String,
    pub tribute_retained_human: String,
}

fn human(amount: Amount, decimals: u8) -> String {
    format_units(
        amount,
        decimals,
        FormatOptions {
            truncate_to: Some(8),
            commas: true,
        },
    )
}

fn quote_error(err: QuoteError) -> ApiError {
    match err {
        QuoteError::UnknownToken(_) => ApiError::BadRequest(err.to_string()),
        other => ApiError::Internal(format!("Quote failed: {}", other)),
    }
}

/// POST /api/quote - Quote a conversion against the session's market
pub async fn get_quote(
    State(state): State<AppState>,
    Json(req): Json<QuoteRequest>,
) -> ApiResult<Json<QuoteResponse>> {
    let session_arc = state
        .session_manager
        .get_session(&req.session_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("Session not found: {}", req.session_id)))?;
    let session = session_arc.read().await;
    let tokens = session.tokens();

    let kind = tokens
        .kind_of(&req.from_token)
        .ok_or_else(|| quote_error(QuoteError::UnknownToken(req.from_token.clone())))?;
    let direction = match kind {
        TokenKind::Collateral => ConversionDirection::ToBonded,
        TokenKind::Bonded => ConversionDirection::FromBonded,
    };
    let from = tokens.token(direction.source_token());
    let to = tokens.token(direction.target_token());

    let source_amount = parse_units(&req.amount, from.decimals)
        .ok_or_else(|| ApiError::BadRequest(format!("Invalid amount: {}", req.amount)))?;

    let quote = build_quote(
        &session.oracle,
        ConversionRequest {
            source_amount,
            direction,
        },
        req.slippage_pct.unwrap_or(SLIPPAGE_PCT),
    )
    .await
    .map_err(quote_error)?;

    Ok(Json(QuoteResponse {
        from_token: from.symbol.clone(),
        to_token: to.symbol.clone(),
        estimated_received_human: human(quote.estimated_received, to.decimals),
        minimum_received_human: human(quote.minimum_received_with_slippage, to.decimals),
        tribute_retained_human: human(quote.tribute_retained, tokens.token(TokenKind::Collateral).decimals),
        quote,
    }))
}

#[derive(Debug, Serialize)]
pub struct FormResponse {
    pub source_token: String,
    pub target_token: String,
    /// Whether the last input was accepted; rejected input leaves the form unchanged.
    pub accepted: bool,
    pub form: QuoteView,
    pub blockers: Vec<SubmitBlocker>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WaitQuery {
    /// Wait for the pending quote before answering
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Deserialize)]
pub struct InputRequest {
    pub field: EditingField,
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub struct EditingRequest {
    pub field: EditingField,
}

#[derive(Debug, Deserialize)]
pub struct DirectionRequest {
    pub direction: ConversionDirection,
}

async fn form_response(
    session_arc: &RwLock<ConversionSession>,
    accepted: bool,
    wait: bool,
) -> FormResponse {
    if wait {
        let watcher = session_arc.read().await.feed.watcher();
        // wait unlocked; a timeout answers with whatever is there
        let _ = tokio::time::timeout(SETTLE_TIMEOUT, watcher.settled()).await;
    }
    let session = session_arc.read().await;
    let form = session.feed.snapshot();
    let tokens = session.tokens();
    FormResponse {
        source_token: tokens.token(form.direction.source_token()).symbol.clone(),
        target_token: tokens.token(form.direction.target_token()).symbol.clone(),
        accepted,
        blockers: session.blockers().await,
        form,
    }
}

/// GET /api/session/:id/form - Current form state
pub async fn get_form(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<WaitQuery>,
) -> ApiResult<Json<FormResponse>> {
    let session_arc = find_session(&state, &id).await?;
    Ok(Json(form_response(&session_arc, true, query.wait).await))
}

/// POST /api/session/:id/form/input - Typed value for one of the two fields
pub async fn set_input(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<WaitQuery>,
    Json(req): Json<InputRequest>,
) -> ApiResult<Json<FormResponse>> {
    let session_arc = find_session(&state, &id).await?;
    let mut session = session_arc.write().await;
    let accepted = match req.field {
        EditingField::Source => session.feed.on_source_input(&req.value),
        EditingField::Recipient => session.feed.on_recipient_input(&req.value),
        EditingField::None => {
            return Err(ApiError::BadRequest("field must be source or recipient".into()))
        }
    };
    drop(session);
    Ok(Json(form_response(&session_arc, accepted, query.wait).await))
}

/// POST /api/session/:id/form/editing - Focus moved
pub async fn set_editing(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<EditingRequest>,
) -> ApiResult<Json<FormResponse>> {
    let session_arc = find_session(&state, &id).await?;
    let mut session = session_arc.write().await;
    session.feed.set_editing(req.field);
    drop(session);
    Ok(Json(form_response(&session_arc, true, false).await))
}

/// POST /api/session/:id/form/direction - Switch the asset pair
pub async fn set_direction(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<DirectionRequest>,
) -> ApiResult<Json<FormResponse>> {
    let session_arc = find_session(&state, &id).await?;
    let mut session = session_arc.write().await;
    session.feed.on_pair_changed(req.direction);
    drop(session);
    Ok(Json(form_response(&session_arc, true, false).await))
}

/// POST /api/session/:id/form/max - Convert the whole source balance
pub async fn convert_all(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<WaitQuery>,
) -> ApiResult<Json<FormResponse>> {
    let session_arc = find_session(&state, &id).await?;
    let mut session = session_arc.write().await;
    let accepted = session
        .convert_all()
        .await
        .map_err(|e| ApiError::Internal(format!("Balance read failed: {}", e)))?;
    drop(session);
    Ok(Json(form_response(&session_arc, accepted, query.wait).await))
}

/// POST /api/session/:id/form/refresh - Requote against the current market
pub async fn refresh(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<WaitQuery>,
) -> ApiResult<Json<FormResponse>> {
    let session_arc = find_session(&state, &id).await?;
    let mut session = session_arc.write().await;
    session.feed.on_tick();
    drop(session);
    Ok(Json(form_response(&session_arc, true, query.wait).await))
}
