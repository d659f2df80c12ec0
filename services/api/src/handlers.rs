//! Axum Handlers for the JSON API
//!
//! Outbound Twilio triggers, provider history, integration status and the
//! session admin endpoints. `utoipa` doc comments generate the OpenAPI
//! document.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::{
    models::{
        CallHistory, CallHistoryQuery, ErrorResponse, IntegrationStatus, MessageHistory,
        MessageHistoryQuery, PlaceCallPayload, SendMessagePayload, ServiceInfo, SessionView,
        SweepResult, UpdateSessionPayload,
    },
    state::AppState,
    twilio::{CallInstructions, CallReceipt, CallRequest, MessageReceipt, TelephonyClient, TwilioError},
    webhooks::public_base_url,
};

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    ServiceUnavailable(String),
    BadGateway(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::ServiceUnavailable(message) => (StatusCode::SERVICE_UNAVAILABLE, message),
            ApiError::BadGateway(message) => {
                warn!("Upstream failure: {}", message);
                (StatusCode::BAD_GATEWAY, message)
            }
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal server error occurred.".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { message })).into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

/// Maps Twilio failures onto HTTP statuses.
pub(crate) fn twilio_error(err: TwilioError) -> ApiError {
    match err {
        TwilioError::MissingSender(_) => ApiError::ServiceUnavailable(err.to_string()),
        TwilioError::Api { status, .. } if (400..500).contains(&status) => {
            ApiError::BadRequest(err.to_string())
        }
        TwilioError::Api { .. } | TwilioError::Http(_) => ApiError::BadGateway(err.to_string()),
        TwilioError::Twiml(_) => ApiError::InternalServerError(err.into()),
    }
}

fn telephony(state: &AppState) -> Result<&Arc<dyn TelephonyClient>, ApiError> {
    state.telephony.as_ref().ok_or_else(|| {
        ApiError::ServiceUnavailable("Twilio is not configured".to_string())
    })
}

/// Service name and environment.
#[utoipa::path(
    get,
    path = "/",
    responses((status = 200, description = "Service info", body = ServiceInfo))
)]
pub async fn root(State(state): State<Arc<AppState>>) -> Json<ServiceInfo> {
    Json(ServiceInfo {
        name: state.config.app_name.clone(),
        env: state.config.env.clone(),
    })
}

/// Report which integrations are configured.
#[utoipa::path(
    get,
    path = "/twilio/status",
    responses((status = 200, description = "Integration status", body = IntegrationStatus))
)]
pub async fn twilio_status(State(state): State<Arc<AppState>>) -> Json<IntegrationStatus> {
    let numbers = state
        .telephony
        .as_ref()
        .map(|t| t.numbers())
        .unwrap_or_default();
    Json(IntegrationStatus {
        configured: state.telephony.is_some(),
        whatsapp_number: numbers.whatsapp_number,
        phone_number: numbers.phone_number,
        service: "Twilio".to_string(),
        features: vec!["WhatsApp".to_string(), "Voice Calls".to_string()],
        openai_configured: state.config.openai_api_key.is_some(),
        media_stream_enabled: state.config.media_stream_enabled(),
        session_backend: state.config.backend.name().to_string(),
    })
}

/// Send a WhatsApp message.
#[utoipa::path(
    post,
    path = "/twilio/whatsapp/send",
    request_body = SendMessagePayload,
    responses(
        (status = 200, description = "Message accepted by Twilio", body = MessageReceipt),
        (status = 400, description = "Rejected by Twilio", body = ErrorResponse),
        (status = 502, description = "Twilio unreachable", body = ErrorResponse),
        (status = 503, description = "Twilio not configured", body = ErrorResponse)
    )
)]
pub async fn send_whatsapp(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SendMessagePayload>,
) -> Result<Json<MessageReceipt>, ApiError> {
    if payload.to_number.trim().is_empty() || payload.message.is_empty() {
        return Err(ApiError::BadRequest(
            "to_number and message are required".to_string(),
        ));
    }
    let receipt = telephony(&state)?
        .send_whatsapp(
            &payload.to_number,
            &payload.message,
            payload.media_url.as_deref(),
        )
        .await
        .map_err(twilio_error)?;
    Ok(Json(receipt))
}

/// Place a voice call that speaks a message or runs a TwiML document.
#[utoipa::path(
    post,
    path = "/twilio/voice/call",
    request_body = PlaceCallPayload,
    responses(
        (status = 200, description = "Call queued", body = CallReceipt),
        (status = 400, description = "Bad request", body = ErrorResponse),
        (status = 502, description = "Twilio unreachable", body = ErrorResponse),
        (status = 503, description = "Twilio not configured", body = ErrorResponse)
    )
)]
pub async fn place_call(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<PlaceCallPayload>,
) -> Result<Json<CallReceipt>, ApiError> {
    if payload.to_number.trim().is_empty() {
        return Err(ApiError::BadRequest("to_number is required".to_string()));
    }
    let instructions = match (payload.twiml_url, payload.message) {
        (Some(url), _) => CallInstructions::Url(url),
        (None, Some(message)) => CallInstructions::Say(message),
        (None, None) => {
            return Err(ApiError::BadRequest(
                "either message or twiml_url is required".to_string(),
            ));
        }
    };
    let telephony = telephony(&state)?;
    let base = public_base_url(&state.config, &headers);
    let request = CallRequest {
        instructions,
        status_callback: Some(format!("{base}/twilio/webhook/voice/status")),
    };
    let receipt = telephony
        .place_call(&payload.to_number, &request)
        .await
        .map_err(twilio_error)?;
    Ok(Json(receipt))
}

/// Recent WhatsApp messages.
#[utoipa::path(
    get,
    path = "/twilio/whatsapp/messages",
    params(MessageHistoryQuery),
    responses(
        (status = 200, description = "Message history", body = MessageHistory),
        (status = 503, description = "Twilio not configured", body = ErrorResponse)
    )
)]
pub async fn message_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MessageHistoryQuery>,
) -> Result<Json<MessageHistory>, ApiError> {
    let messages = telephony(&state)?
        .message_history(query.limit, query.from_number.as_deref())
        .await
        .map_err(twilio_error)?;
    Ok(Json(MessageHistory {
        count: messages.len(),
        messages,
    }))
}

/// Recent voice calls.
#[utoipa::path(
    get,
    path = "/twilio/voice/calls",
    params(CallHistoryQuery),
    responses(
        (status = 200, description = "Call history", body = CallHistory),
        (status = 503, description = "Twilio not configured", body = ErrorResponse)
    )
)]
pub async fn call_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallHistoryQuery>,
) -> Result<Json<CallHistory>, ApiError> {
    let calls = telephony(&state)?
        .call_history(query.limit, query.status.as_deref())
        .await
        .map_err(twilio_error)?;
    Ok(Json(CallHistory {
        count: calls.len(),
        calls,
    }))
}

/// List all sessions, most recently active first.
#[utoipa::path(
    get,
    path = "/sessions",
    responses(
        (status = 200, description = "List of sessions", body = [SessionView]),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<SessionView>>, ApiError> {
    let sessions = state.sessions.list().await?;
    Ok(Json(sessions.into_iter().map(SessionView::from).collect()))
}

/// Get the session for a phone number.
#[utoipa::path(
    get,
    path = "/sessions/{phone}",
    responses(
        (status = 200, description = "Session details", body = SessionView),
        (status = 404, description = "Session not found", body = ErrorResponse)
    ),
    params(("phone" = String, Path, description = "Phone number, e.g. +15551234567"))
)]
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(phone): Path<String>,
) -> Result<Json<SessionView>, ApiError> {
    let session = state
        .sessions
        .peek(&phone)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("No session for '{}'", phone)))?;
    Ok(Json(session.into()))
}

/// Merge-patch the session for a phone number, creating it if needed.
#[utoipa::path(
    patch,
    path = "/sessions/{phone}",
    request_body = UpdateSessionPayload,
    responses(
        (status = 200, description = "Session updated", body = SessionView),
        (status = 400, description = "Bad request", body = ErrorResponse)
    ),
    params(("phone" = String, Path, description = "Phone number"))
)]
pub async fn update_session(
    State(state): State<Arc<AppState>>,
    Path(phone): Path<String>,
    Json(payload): Json<UpdateSessionPayload>,
) -> Result<Json<SessionView>, ApiError> {
    if phone.trim().is_empty() {
        return Err(ApiError::BadRequest("phone number is required".to_string()));
    }
    let now = Utc::now();
    let session = state
        .sessions
        .record_at(&phone, &payload.into_patch(now), now)
        .await?;
    Ok(Json(session.into()))
}

/// Delete the session for a phone number.
#[utoipa::path(
    delete,
    path = "/sessions/{phone}",
    responses(
        (status = 204, description = "Session deleted"),
        (status = 404, description = "Session not found", body = ErrorResponse)
    ),
    params(("phone" = String, Path, description = "Phone number"))
)]
pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(phone): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.sessions.clear(&phone).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("No session for '{}'", phone)))
    }
}

/// Delete every session idle longer than the retention window.
#[utoipa::path(
    post,
    path = "/sessions/sweep",
    responses(
        (status = 200, description = "Expired sessions removed", body = SweepResult),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn sweep_sessions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SweepResult>, ApiError> {
    let removed = state.sessions.sweep().await?;
    info!(removed, "Manual session sweep");
    Ok(Json(SweepResult { removed }))
}
