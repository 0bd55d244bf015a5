//! Reload and save endpoints.

use axum::{Json, extract::State};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Result, ServerError};
use crate::state::{AppState, READY};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadResponse {
    pub status: &'static str,
    pub last_loaded: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveResponse {
    pub saved_at: DateTime<Utc>,
    pub cookies: usize,
}

/// Re-materialize the session from the Credential Store.
pub async fn reload_handler(State(state): State<AppState>) -> Result<Json<ReloadResponse>> {
    let last_loaded = state
        .slot
        .reload()
        .map_err(|e| ServerError::ReloadFailed(e.to_string()))?;

    Ok(Json(ReloadResponse {
        status: READY,
        last_loaded,
    }))
}

/// Write the live session back to the Credential Store.
pub async fn save_handler(State(state): State<AppState>) -> Result<Json<SaveResponse>> {
    let saved = state.slot.save()?;

    tracing::info!(cookies = saved.cookies.len(), "Session saved on request");

    Ok(Json(SaveResponse {
        saved_at: saved.saved_at,
        cookies: saved.cookies.len(),
    }))
}
