//! Twilio webhooks
//!
//! Twilio posts `application/x-www-form-urlencoded` bodies and expects TwiML
//! back. Handlers never answer with an error status: failures are logged and
//! the caller hears (or reads) an apology instead.

use anyhow::Result;
use axum::{
    Form,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use rand::seq::IndexedRandom;
use std::sync::Arc;
use superconnector_core::{
    SessionPatch, TurnAction, assistant, normalize_phone, plan_turn,
};
use tracing::{error, info, warn};

use crate::{
    config::Config,
    models::{CallerQuery, TwilioWebhookForm},
    state::AppState,
    twilio::{CallInstructions, CallRequest},
    twiml::{Gather, MessagingResponse, Record, Say, Stream, VoiceResponse},
};

const INBOUND_GREETINGS: &[&str] = &[
    "Hey there! This is Eli. I'm so glad you called! What's your name?",
    "Hi! It's Eli here. Great to hear from you! May I ask who I'm speaking with?",
    "Hello! This is Eli, your superconnector. I'm excited to chat with you! What's your name?",
    "Hey! Eli here. Thanks for reaching out! I'd love to know your name.",
];

/// Call statuses after which Twilio sends no more events for the call.
const TERMINAL_STATUSES: &[&str] = &["completed", "busy", "no-answer", "failed", "canceled"];

/// The externally reachable base URL used in TwiML callbacks.
///
/// `PUBLIC_BASE_URL` wins; otherwise the request's `Host` (and
/// `X-Forwarded-Proto`, as set by tunnels) is used.
pub fn public_base_url(config: &Config, headers: &HeaderMap) -> String {
    if let Some(base) = &config.public_base_url {
        return base.trim_end_matches('/').to_string();
    }
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost:8000");
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .filter(|p| *p == "https")
        .unwrap_or("http");
    format!("{scheme}://{host}")
}

/// `https://host` becomes `wss://host/ws/realtime-bridge`.
pub fn media_stream_url(base: &str) -> String {
    let (scheme, host) = match base.split_once("://") {
        Some(("https", host)) => ("wss", host),
        Some((_, host)) => ("ws", host),
        None => ("ws", base),
    };
    format!("{scheme}://{host}/ws/realtime-bridge")
}

fn caller_params(name: &str, email: &str) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .append_pair("userName", name)
        .append_pair("userEmail", email)
        .finish()
}

fn xml(body: String) -> Response {
    ([(header::CONTENT_TYPE, "text/xml")], body).into_response()
}

/// Renders a voice response, or a spoken apology if building it failed.
fn voice_reply(result: Result<VoiceResponse>, apology: &str) -> Response {
    let rendered = result.and_then(|response| response.render());
    match rendered {
        Ok(body) => xml(body),
        Err(e) => {
            error!(error = ?e, "Voice webhook failed");
            let fallback = VoiceResponse::new()
                .say(Say::basic(apology))
                .hangup()
                .render()
                .unwrap_or_else(|_| {
                    r#"<?xml version="1.0" encoding="UTF-8"?><Response><Hangup/></Response>"#
                        .to_string()
                });
            xml(fallback)
        }
    }
}

/// Sends a WhatsApp follow-up; failures are logged only.
async fn follow_up(state: &AppState, to: &str, body: &str) {
    let Some(telephony) = &state.telephony else {
        warn!(to, "Twilio not configured; skipping WhatsApp follow-up");
        return;
    };
    if let Err(e) = telephony.send_whatsapp(to, body, None).await {
        error!(to, error = %e, "Failed to send WhatsApp follow-up");
    }
}

async fn mark_completed(state: &AppState, phone: &str) {
    if phone.is_empty() {
        return;
    }
    if let Err(e) = state.sessions.mark_call_completed(phone).await {
        error!(phone, error = ?e, "Failed to mark call completed");
    }
}

fn first_chars(text: &str, n: usize) -> &str {
    match text.char_indices().nth(n) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Incoming WhatsApp message.
pub async fn whatsapp(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(form): Form<TwilioWebhookForm>,
) -> Response {
    info!(from = %form.from, body = %form.body, "Received WhatsApp message");
    let reply = match whatsapp_reply(&state, &headers, &form).await {
        Ok(reply) => reply,
        Err(e) => {
            error!(error = ?e, "Error in AI response/call trigger");
            "I'm here to help you connect! Please start by sharing your name and email address."
                .to_string()
        }
    };
    match MessagingResponse::new().message(reply).render() {
        Ok(body) => xml(body),
        Err(e) => {
            error!(error = ?e, "Failed to render WhatsApp reply");
            xml(r#"<?xml version="1.0" encoding="UTF-8"?><Response><Message>I apologize, but I encountered an error processing your message. Please try again.</Message></Response>"#.to_string())
        }
    }
}

async fn whatsapp_reply(
    state: &AppState,
    headers: &HeaderMap,
    form: &TwilioWebhookForm,
) -> Result<String> {
    let Some(phone) = normalize_phone(&form.from) else {
        anyhow::bail!("message without a sender");
    };
    let session = state.sessions.active_session(&phone).await?;
    let plan = plan_turn(session.as_ref(), &form.body);

    match plan.contact {
        Some(contact) => {
            info!(phone = %phone, email = %contact.email, name = ?contact.name, "Contact details received");
            state
                .sessions
                .record(&phone, &SessionPatch::contact(contact.name, contact.email))
                .await?;
        }
        None => {
            state.sessions.touch(&phone).await?;
        }
    }

    let reply = match plan.action {
        TurnAction::PlaceCall { name, email, reply } => {
            state.sessions.mark_call_initiated(&phone).await?;
            let base = public_base_url(&state.config, headers);
            let request = CallRequest {
                instructions: CallInstructions::Url(format!(
                    "{base}/twilio/webhook/voice/outbound?{}",
                    caller_params(name.as_deref().unwrap_or(""), email.as_deref().unwrap_or(""))
                )),
                status_callback: Some(format!("{base}/twilio/webhook/voice/status")),
            };
            match &state.telephony {
                Some(telephony) => match telephony.place_call(&phone, &request).await {
                    Ok(receipt) => info!(phone = %phone, sid = %receipt.sid, "Outbound call initiated"),
                    Err(e) => error!(phone = %phone, error = %e, "Failed to place outbound call"),
                },
                None => warn!(phone = %phone, "Twilio not configured; cannot place call"),
            }
            reply
        }
        TurnAction::Reply(reply) => reply,
        TurnAction::Chat(prompt) => state.assistant.reply(prompt).await,
    };
    Ok(reply)
}

/// Inbound call: greet the caller and ask for their name.
pub async fn voice(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(form): Form<TwilioWebhookForm>,
) -> Response {
    info!(from = %form.from, status = %form.call_status, "Received voice call event");
    let result: Result<VoiceResponse> = async {
        if let Some(phone) = normalize_phone(&form.from) {
            state.sessions.touch(&phone).await?;
        }
        let base = public_base_url(&state.config, &headers);
        let response = if matches!(
            form.call_status.as_str(),
            "ringing" | "in-progress" | "answered"
        ) {
            let greeting = INBOUND_GREETINGS
                .choose(&mut rand::rng())
                .copied()
                .unwrap_or(INBOUND_GREETINGS[0]);
            VoiceResponse::new()
                .gather(
                    Gather::speech(format!("{base}/twilio/webhook/voice/conversation"))
                        .enhanced()
                        .say(Say::neural(greeting)),
                )
                .say(Say::new("Hmm, I didn't catch that. No worries! Feel free to tell me your name when you're ready.").voice(crate::twiml::NEURAL_VOICE))
                .redirect(format!("{base}/twilio/webhook/voice"))
        } else {
            VoiceResponse::new()
                .say(Say::new("It was great talking with you! Looking forward to connecting again soon. Have an amazing day!").voice(crate::twiml::NEURAL_VOICE))
                .hangup()
        };
        Ok(response)
    }
    .await;
    voice_reply(
        result,
        "Sorry, there was an error processing your call. Please try again later.",
    )
}

/// The inbound caller told us their name.
pub async fn voice_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(form): Form<TwilioWebhookForm>,
) -> Response {
    let speech = form.speech_result.trim();
    info!(from = %form.from, speech, confidence = form.confidence(), "Voice input");

    let response = if speech.is_empty() {
        let base = public_base_url(&state.config, &headers);
        VoiceResponse::new()
            .say(Say::new("I'm sorry, I couldn't quite catch that. Could you tell me your name again?").voice(crate::twiml::NEURAL_VOICE))
            .redirect(format!("{base}/twilio/webhook/voice"))
    } else {
        let reply = state
            .assistant
            .reply(assistant::inbound_voice_prompt(speech))
            .await;
        if !form.from.is_empty() {
            let message = format!(
                "Hi {speech}! 👋 This is Eli following up from our call. I'm here to help you build meaningful connections. What kind of professional connections are you looking to make?"
            );
            follow_up(&state, &form.from, &message).await;
        }
        VoiceResponse::new()
            .say(Say::neural(reply))
            .pause(1)
            .say(Say::new("It was really great talking with you! I'll follow up with you on WhatsApp. Have an amazing day!").voice(crate::twiml::NEURAL_VOICE))
            .hangup()
    };
    voice_reply(
        Ok(response),
        "Sorry about that! Let's continue on WhatsApp. I'll message you right away!",
    )
}

/// TwiML for a call we placed from WhatsApp.
pub async fn voice_outbound(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(caller): Query<CallerQuery>,
    Form(form): Form<TwilioWebhookForm>,
) -> Response {
    info!(
        to = %form.to,
        status = %form.call_status,
        direction = form.direction.as_deref().unwrap_or(""),
        user_name = %caller.user_name,
        "Outbound call webhook"
    );
    let base = public_base_url(&state.config, &headers);
    let user_name = caller.user_name.as_str();

    let response = match form.call_status.as_str() {
        "initiated" => VoiceResponse::new().pause(1),
        "ringing" | "in-progress" | "answered" => {
            let greeting = if !user_name.is_empty() && user_name != "there" {
                format!("Hey {user_name}! This is Eli calling. One moment while I connect you.")
            } else {
                "Hey there! This is Eli. One moment while I connect you.".to_string()
            };
            let response = VoiceResponse::new().say(Say::neural(greeting));

            if state.config.media_stream_enabled() {
                let stream = Stream::new(media_stream_url(&base))
                    .parameter("callSid", form.call_sid.as_deref().unwrap_or(""))
                    .parameter("userName", &caller.user_name)
                    .parameter("userEmail", &caller.user_email)
                    .parameter("phoneNumber", &form.to);
                info!(call_sid = ?form.call_sid, "Bridging call to the realtime media stream");
                response
                    .connect(stream)
                    // Keeps the call up if the stream never connects.
                    .pause(30)
                    .say(Say::neural(
                        "Thanks for the call! I'll follow up with you on WhatsApp.",
                    ))
            } else {
                let params = caller_params(&caller.user_name, &caller.user_email);
                response
                    .gather(
                        Gather::speech(format!(
                            "{base}/twilio/webhook/voice/outbound/response?{params}"
                        ))
                        .say(Say::basic("I'd love to help you grow your network. Tell me briefly what kind of connections you're looking for.")),
                    )
                    .redirect(format!(
                        "{base}/twilio/webhook/voice/outbound/timeout?{params}"
                    ))
            }
        }
        other => {
            info!(status = other, "Unexpected call status");
            VoiceResponse::new()
                .say(Say::basic("Thank you for your time!"))
                .hangup()
        }
    };
    voice_reply(
        Ok(response),
        "I apologize for the technical issue. Let me follow up with you on WhatsApp instead!",
    )
}

/// The callee described their networking goals on a fallback call.
pub async fn voice_outbound_response(
    State(state): State<Arc<AppState>>,
    Query(caller): Query<CallerQuery>,
    Form(form): Form<TwilioWebhookForm>,
) -> Response {
    let speech = form.speech_result.trim();
    let confidence = form.confidence();
    info!(speech, confidence, "User responded");

    let response = if !speech.is_empty() && confidence > 0.5 {
        let reply = state
            .assistant
            .reply(assistant::outbound_voice_prompt(
                &caller.user_name,
                &caller.user_email,
                speech,
            ))
            .await;
        if !form.to.is_empty() {
            mark_completed(&state, &form.to).await;
            let message = format!(
                "Hi {}! 🌟 Great talking with you just now! Based on what you shared about {}..., I'm already thinking of some amazing connections for you. What's your LinkedIn profile URL so I can find the best matches?",
                caller.user_name,
                first_chars(speech, 50)
            );
            follow_up(&state, &form.to, &message).await;
        }
        VoiceResponse::new()
            .say(Say::basic(reply))
            .pause(1)
            .say(Say::basic("This has been really great! I'll send you some personalized connection suggestions on WhatsApp. Looking forward to helping you grow your network!"))
    } else {
        if !form.to.is_empty() {
            mark_completed(&state, &form.to).await;
            let message = format!(
                "Hi {}! I tried calling but couldn't hear your response clearly. Let's continue here on WhatsApp. What kind of professional connections are you looking to make?",
                caller.user_name
            );
            follow_up(&state, &form.to, &message).await;
        }
        VoiceResponse::new().say(Say::basic("I didn't quite catch that, but no worries! Let's continue our conversation on WhatsApp where it's easier to share details."))
    };
    voice_reply(Ok(response.hangup()), "Let's continue on WhatsApp!")
}

/// The callee stayed silent through the first prompt.
pub async fn voice_outbound_timeout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(caller): Query<CallerQuery>,
    Form(form): Form<TwilioWebhookForm>,
) -> Response {
    info!(to = %form.to, "Call timeout");
    let base = public_base_url(&state.config, &headers);
    let params = caller_params(&caller.user_name, &caller.user_email);

    if !form.to.is_empty() {
        mark_completed(&state, &form.to).await;
        let message = format!(
            "Hi {}! 👋 I just tried calling but I think the timing wasn't ideal. No worries! Let's chat here on WhatsApp when you're ready. What kind of professional connections would help you most right now?",
            caller.user_name
        );
        follow_up(&state, &form.to, &message).await;
    }

    let response = VoiceResponse::new()
        .gather(
            Gather::speech(format!(
                "{base}/twilio/webhook/voice/outbound/response?{params}"
            ))
            .timeout(5)
            .say(Say::basic("I'm here to help you expand your professional network. Just tell me what you're looking for!")),
        )
        .say(Say::basic("No worries if now isn't a good time! I'll send you a message on WhatsApp where we can continue at your convenience. Have a great day!"))
        .hangup();
    voice_reply(Ok(response), "Let's continue on WhatsApp!")
}

/// Call status callback registered on every call we place.
pub async fn voice_status(
    State(state): State<Arc<AppState>>,
    Form(form): Form<TwilioWebhookForm>,
) -> Response {
    let outbound = form
        .direction
        .as_deref()
        .is_some_and(|d| d.starts_with("outbound"));
    let phone = if outbound { &form.to } else { &form.from };
    info!(
        call_sid = ?form.call_sid,
        status = %form.call_status,
        phone = %phone,
        "Call status update"
    );

    if !phone.is_empty() {
        let result = if TERMINAL_STATUSES.contains(&form.call_status.as_str()) {
            state.sessions.mark_call_completed(phone).await
        } else {
            state.sessions.touch(phone).await
        };
        if let Err(e) = result {
            error!(phone = %phone, error = ?e, "Failed to record call status");
        }
    }
    voice_reply(Ok(VoiceResponse::new()), "")
}

/// Keypad menu selection.
pub async fn voice_menu(Form(form): Form<TwilioWebhookForm>) -> Response {
    info!(digits = %form.digits, from = %form.from, "Voice menu selection");
    let response = match form.digits.as_str() {
        "1" => VoiceResponse::new()
            .say(Say::basic(
                "Eli helps you build meaningful professional connections through \
                 AI-powered matching, automated outreach, and intelligent conversation management. \
                 We integrate with LinkedIn, email, and WhatsApp to expand your network effectively. \
                 To get started, send us a WhatsApp message at this same number.",
            ))
            .pause(2)
            .say(Say::basic("Thank you for calling Eli. Have a great day!")),
        "2" => VoiceResponse::new()
            .say(Say::basic(
                "To schedule a meeting, please send us a WhatsApp message with your preferred dates and times. \
                 We'll coordinate with all participants and find the best time for everyone. \
                 You can reach us on WhatsApp at the same number you just called.",
            ))
            .pause(1)
            .say(Say::basic("Thank you for choosing Eli!")),
        "3" => VoiceResponse::new()
            .say(Say::basic(
                "Please leave your message after the beep. Press the pound key when finished.",
            ))
            .record(Record {
                max_length: 120,
                finish_on_key: "#".to_string(),
                transcribe_callback: Some("/twilio/webhook/voice/transcription".to_string()),
            })
            .say(Say::basic(
                "Thank you for your message. We'll get back to you soon!",
            )),
        "4" => VoiceResponse::new()
            .say(Say::basic(format!(
                "Great choice! You can reach Eli on WhatsApp at {}. \
                 Send us a message saying 'Hi' to get started. \
                 We're available 24/7 to help you build meaningful connections.",
                form.from.replace('+', "")
            )))
            .pause(1)
            .say(Say::basic(
                "Looking forward to connecting with you on WhatsApp!",
            )),
        _ => VoiceResponse::new().say(Say::basic(
            "Sorry, that's not a valid option. Please call back to try again.",
        )),
    };
    voice_reply(
        Ok(response.hangup()),
        "Sorry, an error occurred. Please try again later.",
    )
}

/// Voicemail transcription is ready.
pub async fn voice_transcription(Form(form): Form<TwilioWebhookForm>) -> StatusCode {
    info!(
        from = %form.from,
        transcription = form.transcription_text.as_deref().unwrap_or(""),
        recording_url = form.recording_url.as_deref().unwrap_or(""),
        "Voicemail received"
    );
    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_public_base_url_prefers_config() {
        let mut config = Config::local_defaults();
        config.public_base_url = Some("https://eli.example.com/".to_string());
        assert_eq!(
            public_base_url(&config, &HeaderMap::new()),
            "https://eli.example.com"
        );
    }

    #[test]
    fn test_public_base_url_from_headers() {
        let config = Config::local_defaults();
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("abc.ngrok.app"));
        assert_eq!(public_base_url(&config, &headers), "http://abc.ngrok.app");

        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        assert_eq!(public_base_url(&config, &headers), "https://abc.ngrok.app");
    }

    #[test]
    fn test_media_stream_url() {
        assert_eq!(
            media_stream_url("https://abc.ngrok.app"),
            "wss://abc.ngrok.app/ws/realtime-bridge"
        );
        assert_eq!(
            media_stream_url("http://localhost:8000"),
            "ws://localhost:8000/ws/realtime-bridge"
        );
    }

    #[test]
    fn test_caller_params_are_encoded() {
        assert_eq!(
            caller_params("Alex Smith", "alex+net@example.com"),
            "userName=Alex+Smith&userEmail=alex%2Bnet%40example.com"
        );
    }

    #[test]
    fn test_first_chars_respects_char_boundaries() {
        assert_eq!(first_chars("héllo", 2), "hé");
        assert_eq!(first_chars("hi", 50), "hi");
    }
}
