//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application: the
//! Twilio webhooks, the JSON API, the media-stream WebSocket and the OpenAPI
//! documentation.

use crate::{
    handlers,
    models::{
        CallHistory, ErrorResponse, IntegrationStatus, MessageHistory, PlaceCallPayload,
        SendMessagePayload, ServiceInfo, SessionView, SweepResult, UpdateSessionPayload,
    },
    state::AppState,
    twilio::{CallReceipt, CallRecord, MessageReceipt, MessageRecord},
    webhooks,
    ws::ws_handler,
};

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::root,
        handlers::twilio_status,
        handlers::send_whatsapp,
        handlers::place_call,
        handlers::message_history,
        handlers::call_history,
        handlers::list_sessions,
        handlers::get_session,
        handlers::update_session,
        handlers::delete_session,
        handlers::sweep_sessions,
    ),
    components(
        schemas(
            ServiceInfo, IntegrationStatus, SendMessagePayload, PlaceCallPayload,
            MessageReceipt, CallReceipt, MessageRecord, CallRecord, MessageHistory,
            CallHistory, SessionView, UpdateSessionPayload, SweepResult, ErrorResponse
        )
    ),
    tags(
        (name = "AI Superconnector", description = "Twilio WhatsApp and voice gateway with per-phone sessions")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let webhook_router = Router::new()
        .route("/whatsapp", post(webhooks::whatsapp))
        .route("/voice", post(webhooks::voice))
        .route("/voice/conversation", post(webhooks::voice_conversation))
        .route("/voice/outbound", post(webhooks::voice_outbound))
        .route(
            "/voice/outbound/response",
            post(webhooks::voice_outbound_response),
        )
        .route(
            "/voice/outbound/timeout",
            post(webhooks::voice_outbound_timeout),
        )
        .route("/voice/status", post(webhooks::voice_status))
        .route("/voice/menu", post(webhooks::voice_menu))
        .route("/voice/transcription", post(webhooks::voice_transcription));

    let api_router = Router::new()
        .route("/", get(handlers::root))
        .route("/twilio/status", get(handlers::twilio_status))
        .route("/twilio/whatsapp/send", post(handlers::send_whatsapp))
        .route("/twilio/whatsapp/messages", get(handlers::message_history))
        .route("/twilio/voice/call", post(handlers::place_call))
        .route("/twilio/voice/calls", get(handlers::call_history))
        .nest("/twilio/webhook", webhook_router)
        .route("/sessions", get(handlers::list_sessions))
        .route("/sessions/sweep", post(handlers::sweep_sessions))
        .route(
            "/sessions/{phone}",
            get(handlers::get_session)
                .patch(handlers::update_session)
                .delete(handlers::delete_session),
        )
        .route("/ws/realtime-bridge", get(ws_handler))
        // Apply the state ONLY to this group of routes.
        .with_state(app_state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}
