//! API Models
//!
//! Request and response bodies for the JSON API, documented with `utoipa`,
//! plus the form fields Twilio posts to the webhooks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use superconnector_core::{Session, SessionPatch};
use utoipa::{IntoParams, ToSchema};

use crate::twilio::{CallRecord, MessageRecord};

fn default_limit() -> u32 {
    20
}

#[derive(Deserialize, ToSchema, Debug)]
pub struct SendMessagePayload {
    #[schema(example = "+15551234567")]
    pub to_number: String,
    #[schema(example = "Hi! This is Eli.")]
    pub message: String,
    pub media_url: Option<String>,
}

#[derive(Deserialize, ToSchema, Debug)]
pub struct PlaceCallPayload {
    #[schema(example = "+15551234567")]
    pub to_number: String,
    /// Spoken to the callee and then the call ends.
    pub message: Option<String>,
    /// TwiML document URL; wins over `message`.
    pub twiml_url: Option<String>,
}

#[derive(Deserialize, IntoParams, Debug)]
#[into_params(parameter_in = Query)]
pub struct MessageHistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    pub from_number: Option<String>,
}

#[derive(Deserialize, IntoParams, Debug)]
#[into_params(parameter_in = Query)]
pub struct CallHistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    pub status: Option<String>,
}

#[derive(Serialize, ToSchema, Debug)]
pub struct MessageHistory {
    pub messages: Vec<MessageRecord>,
    pub count: usize,
}

#[derive(Serialize, ToSchema, Debug)]
pub struct CallHistory {
    pub calls: Vec<CallRecord>,
    pub count: usize,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, PartialEq)]
pub struct IntegrationStatus {
    pub configured: bool,
    pub whatsapp_number: Option<String>,
    pub phone_number: Option<String>,
    pub service: String,
    pub features: Vec<String>,
    pub openai_configured: bool,
    pub media_stream_enabled: bool,
    #[schema(example = "convex")]
    pub session_backend: String,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, PartialEq)]
pub struct ServiceInfo {
    pub name: String,
    pub env: String,
}

/// A session as returned by the admin API.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct SessionView {
    #[schema(example = "+15551234567")]
    pub phone_number: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub call_initiated: bool,
    pub call_completed: bool,
    pub info_provided: bool,
    pub last_activity: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub call_time: Option<DateTime<Utc>>,
    pub call_completed_time: Option<DateTime<Utc>>,
}

impl From<Session> for SessionView {
    fn from(s: Session) -> Self {
        Self {
            phone_number: s.phone_number,
            name: s.name,
            email: s.email,
            call_initiated: s.call_initiated,
            call_completed: s.call_completed,
            info_provided: s.info_provided,
            last_activity: s.last_activity,
            created_at: s.created_at,
            call_time: s.call_time,
            call_completed_time: s.call_completed_time,
        }
    }
}

/// Merge-patch body for `PATCH /sessions/{phone}`. Absent fields are left alone.
#[derive(Deserialize, ToSchema, Debug, Default)]
pub struct UpdateSessionPayload {
    pub name: Option<String>,
    pub email: Option<String>,
    pub call_initiated: Option<bool>,
    pub call_completed: Option<bool>,
    pub info_provided: Option<bool>,
}

impl UpdateSessionPayload {
    /// Setting a call flag also stamps its timestamp.
    pub fn into_patch(self, now: DateTime<Utc>) -> SessionPatch {
        SessionPatch {
            name: self.name,
            email: self.email,
            call_initiated: self.call_initiated,
            call_completed: self.call_completed,
            info_provided: self.info_provided,
            call_time: self.call_initiated.filter(|&set| set).map(|_| now),
            call_completed_time: self.call_completed.filter(|&set| set).map(|_| now),
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug, PartialEq)]
pub struct SweepResult {
    pub removed: u64,
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct ErrorResponse {
    pub message: String,
}

/// The subset of Twilio's webhook form fields we read.
#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct TwilioWebhookForm {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub body: String,
    pub call_sid: Option<String>,
    #[serde(default)]
    pub call_status: String,
    pub direction: Option<String>,
    #[serde(default)]
    pub speech_result: String,
    pub confidence: Option<String>,
    #[serde(default)]
    pub digits: String,
    pub transcription_text: Option<String>,
    pub recording_url: Option<String>,
}

impl TwilioWebhookForm {
    /// Speech-recognition confidence; missing or malformed values count as 0.
    pub fn confidence(&self) -> f64 {
        self.confidence
            .as_deref()
            .and_then(|c| c.parse().ok())
            .unwrap_or(0.0)
    }
}

/// Caller details carried on outbound-call webhook URLs.
#[derive(Deserialize, Debug, Default, Clone)]
pub struct CallerQuery {
    #[serde(rename = "userName", default)]
    pub user_name: String,
    #[serde(rename = "userEmail", default)]
    pub user_email: String,
}
