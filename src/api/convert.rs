//! Conversion execution endpoints
//!
//! Starting a conversion plans and runs its transaction steps in the
//! background; clients poll progress until it is done or failed.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;

use crate::api::{find_session, AppState};
use crate::config::ConverterConfig;
use crate::engine::amount::{format_units, FormatOptions};
use crate::engine::cancel::CancelToken;
use crate::engine::planner::{OrderRequest, PlanProgress, PlannerState, StepStatus};
use crate::sandbox::ConversionSession;
use crate::types::ApiResult;

const PROGRESS_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
pub struct StepLink {
    pub label: String,
    pub explorer_url: String,
}

#[derive(Debug, Serialize)]
pub struct ProgressResponse {
    pub progress: PlanProgress,
    /// Explorer links for steps that have a transaction hash.
    pub links: Vec<StepLink>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub converted_human: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub order: OrderRequest,
    pub progress: PlanProgress,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProgressQuery {
    /// Block until the conversion is done or failed
    #[serde(default)]
    pub wait: bool,
}

fn is_settled(state: &PlannerState) -> bool {
    matches!(state, PlannerState::Done { .. } | PlannerState::Failed { .. })
}

fn progress_response(
    session: &ConversionSession,
    config: &ConverterConfig,
    progress: PlanProgress,
) -> ProgressResponse {
    let links = progress
        .steps
        .iter()
        .filter_map(|step| {
            let hash = match &step.status {
                StepStatus::Broadcast { hash } | StepStatus::Confirmed { hash } => hash,
                _ => return None,
            };
            config.explorer_tx_url(hash).map(|explorer_url| StepLink {
                label: step.label.clone(),
                explorer_url,
            })
        })
        .collect();

    let converted_human = match &progress.state {
        PlannerState::Done { receipt } => {
            let target = session.tokens().token(receipt.direction.target_token());
            Some(format!(
                "{} {}",
                format_units(
                    receipt.converted_amount,
                    target.decimals,
                    FormatOptions {
                        truncate_to: Some(4),
                        commas: true,
                    },
                ),
                target.symbol
            ))
        }
        _ => None,
    };

    ProgressResponse {
        progress,
        links,
        converted_human,
    }
}

/// POST /api/session/:id/convert - Start converting the quoted amount
pub async fn start_conversion(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<StartResponse>> {
    let session_arc = find_session(&state, &id).await?;
    let mut session = session_arc.write().await;
    let order = session.start_conversion().await?;

    Ok(Json(StartResponse {
        order,
        progress: session.planner.progress(),
    }))
}

/// Wait for the running conversion to finish, fail or be cancelled.
async fn wait_settled(mut rx: watch::Receiver<PlanProgress>, conversion: Option<CancelToken>) {
    let Some(conversion) = conversion else {
        return;
    };
    loop {
        if is_settled(&rx.borrow_and_update().state) {
            return;
        }
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = conversion.cancelled() => return,
        }
    }
}

/// GET /api/session/:id/convert - Step progress of the current conversion
pub async fn get_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ProgressQuery>,
) -> ApiResult<Json<ProgressResponse>> {
    let session_arc = find_session(&state, &id).await?;

    if query.wait {
        let (rx, conversion) = {
            let session = session_arc.read().await;
            (session.planner.subscribe(), session.conversion_token())
        };
        // the session stays unlocked while waiting so cancel and home go through
        let _ = tokio::time::timeout(PROGRESS_WAIT, wait_settled(rx, conversion)).await;
    }

    let session = session_arc.read().await;
    let progress = session.planner.progress();
    Ok(Json(progress_response(
        &session,
        state.session_manager.config(),
        progress,
    )))
}

/// POST /api/session/:id/convert/cancel - Stop before the next step
pub async fn cancel_conversion(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ProgressResponse>> {
    let session_arc = find_session(&state, &id).await?;
    let mut session = session_arc.write().await;
    session.cancel_conversion();
    tracing::info!("Conversion cancel requested for session {}", id);

    let progress = session.planner.progress();
    Ok(Json(progress_response(
        &session,
        state.session_manager.config(),
        progress,
    )))
}

/// POST /api/session/:id/convert/home - Leave the result screen
pub async fn return_home(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ProgressResponse>> {
    let session_arc = find_session(&state, &id).await?;
    let mut session = session_arc.write().await;
    session.return_home()?;

    let progress = session.planner.progress();
    Ok(Json(progress_response(
        &session,
        state.session_manager.config(),
        progress,
    )))
}
