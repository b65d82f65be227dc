//! Obfuscation endpoints
//!
//! Two request shapes are served side by side:
//! - `POST /api/obfuscate` takes `{code, preset}` JSON and answers in JSON
//! - `POST /obfuscate` takes the raw script (preset via `?preset=`) and
//!   answers with raw text

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, Query, State},
    response::{IntoResponse, Response},
    Json,
};
use obfusq_core::{ObfuscationError, ObfuscationRequest, ObfuscationResult, Preset, PresetSelection};
use serde::Deserialize;

use crate::errors::ApiError;
use crate::AppState;

/// JSON profile request body
#[derive(Debug, Deserialize)]
pub struct ObfuscateBody {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub preset: Option<String>,
}

/// Obfuscate a script sent as JSON
pub async fn handle_obfuscate_json(
    State(state): State<Arc<AppState>>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<ObfuscationResult>, ApiError> {
    let body = body?;
    let body: ObfuscateBody = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid request body: {}", e)))?;

    let request = ObfuscationRequest::from_client(body.code, body.preset.as_deref())?;
    let output = state.pipeline.run(request).await?;

    Ok(Json(output.into()))
}

/// Raw profile query string
#[derive(Debug, Deserialize)]
pub struct RawQuery {
    pub preset: Option<String>,
}

/// Obfuscate a script sent as the raw request body
pub async fn handle_obfuscate_raw(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RawQuery>,
    body: String,
) -> Response {
    let selection = match query.preset.as_deref() {
        Some(name) => match name.parse::<Preset>() {
            Ok(preset) => PresetSelection::Named(preset),
            Err(_) => {
                return ApiError::from(ObfuscationError::InvalidPreset(name.to_string()))
                    .into_plain_response();
            }
        },
        None => state.default_selection.clone(),
    };

    match state.pipeline.run(ObfuscationRequest::new(body, selection)).await {
        Ok(output) => output.obfuscated.into_response(),
        Err(e) => ApiError::from(e).into_plain_response(),
    }
}

/// Names accepted by the `preset` field, plus the one the selector starts on
pub async fn handle_presets(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let presets: Vec<&str> = Preset::ALL.iter().map(|p| p.as_str()).collect();
    let default = match &state.default_selection {
        PresetSelection::Named(preset) => *preset,
        PresetSelection::ConfigFile(_) => Preset::default(),
    };
    Json(serde_json::json!({ "presets": presets, "default": default.as_str() }))
}
