//! Manages the lifecycle of one Twilio media-stream connection.

use super::{
    protocol::{TwilioInbound, TwilioOutbound},
    provider::{self, BridgeContext, RealtimeClientEvent},
};
use crate::{audio_utils, state::AppState};
use anyhow::{Result, anyhow};
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use secrecy::{ExposeSecret, SecretString};
use std::{sync::Arc, time::Duration};
use tokio::sync::{Mutex, mpsc};
use tracing::{error, info, instrument, warn};

/// The Twilio-facing half of the socket, shared with the provider task.
pub type TwilioSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

const START_TIMEOUT: Duration = Duration::from_secs(5);

/// Axum handler to upgrade the Twilio media-stream connection.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

#[instrument(name = "media_stream", skip_all, fields(stream_sid, call_sid))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    info!("Media stream connected. Awaiting start event...");
    let (socket_tx, mut socket_rx) = socket.split();
    let socket_tx: TwilioSink = Arc::new(Mutex::new(socket_tx));

    let context = match tokio::time::timeout(START_TIMEOUT, wait_for_start(&mut socket_rx)).await
    {
        Ok(Ok(context)) => context,
        Ok(Err(e)) => {
            warn!(error = %e, "Media stream ended before start");
            return;
        }
        Err(_) => {
            warn!("Timed out waiting for the media stream start event");
            return;
        }
    };

    let span = tracing::Span::current();
    span.record("stream_sid", context.stream_sid.as_str());
    if let Some(call_sid) = &context.call_sid {
        span.record("call_sid", call_sid.as_str());
    }
    info!(
        user_name = context.user_name.as_deref().unwrap_or(""),
        phone = context.phone_number.as_deref().unwrap_or(""),
        "Media stream started"
    );

    if let Err(e) = send_msg(
        &mut *socket_tx.lock().await,
        &TwilioOutbound::clear(&context.stream_sid),
    )
    .await
    {
        error!(error = ?e, "Failed to clear the Twilio audio buffer");
        return;
    }

    let api_key = state
        .config
        .openai_api_key
        .as_ref()
        .map(|k| SecretString::from(k.expose_secret().to_string()));

    if let Err(e) = run_bridge(&state, api_key, &context, socket_tx, socket_rx).await {
        error!(error = ?e, "Media stream terminated with error.");
    }

    if let Some(phone) = &context.phone_number {
        match state.sessions.mark_call_completed(phone).await {
            Ok(_) => info!(phone = %phone, "Call marked completed"),
            Err(e) => error!(phone = %phone, error = ?e, "Failed to mark call completed"),
        }
    }
    info!("Media stream finished.");
}

/// Reads messages until Twilio sends `start`.
async fn wait_for_start(socket_rx: &mut SplitStream<WebSocket>) -> Result<BridgeContext> {
    while let Some(msg) = socket_rx.next().await {
        let Message::Text(text) = msg? else {
            continue;
        };
        match serde_json::from_str::<TwilioInbound>(&text) {
            Ok(TwilioInbound::Start { stream_sid, start }) => {
                return Ok(BridgeContext {
                    stream_sid,
                    call_sid: start.call_sid.clone(),
                    user_name: start.parameter("userName").map(str::to_string),
                    user_email: start.parameter("userEmail").map(str::to_string),
                    phone_number: start.parameter("phoneNumber").map(str::to_string),
                });
            }
            Ok(TwilioInbound::Stop { .. }) => return Err(anyhow!("stream stopped")),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Ignoring malformed media-stream message"),
        }
    }
    Err(anyhow!("socket closed"))
}

/// Forwards caller audio to the realtime provider until the stream stops.
///
/// Without an OpenAI key the stream is drained so Twilio keeps the call up.
async fn run_bridge(
    state: &Arc<AppState>,
    api_key: Option<SecretString>,
    context: &BridgeContext,
    socket_tx: TwilioSink,
    mut socket_rx: SplitStream<WebSocket>,
) -> Result<()> {
    let (mut realtime_tx, provider_handle): (Option<mpsc::Sender<RealtimeClientEvent>>, _) =
        match api_key {
            Some(key) => {
                let (tx, handle) = provider::start_realtime_provider(
                    key,
                    state.config.realtime_model.clone(),
                    context.clone(),
                    socket_tx.clone(),
                );
                (Some(tx), Some(handle))
            }
            None => {
                warn!("OPENAI_API_KEY not set; draining media stream without a voice model");
                (None, None)
            }
        };

    let result = async {
        while let Some(msg) = socket_rx.next().await {
            match msg? {
                Message::Text(text) => match serde_json::from_str::<TwilioInbound>(&text) {
                    Ok(TwilioInbound::Media { media, .. }) => {
                        let Some(tx) = &realtime_tx else { continue };
                        let samples = audio_utils::decode_mulaw_payload(&media.payload);
                        if tx.send(RealtimeClientEvent::Audio(samples)).await.is_err() {
                            warn!("Realtime provider has stopped; draining remaining audio");
                            realtime_tx = None;
                        }
                    }
                    Ok(TwilioInbound::Stop { .. }) => {
                        info!("Twilio sent stop.");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Ignoring malformed media-stream message"),
                },
                Message::Close(_) => {
                    info!("Twilio closed the media stream.");
                    break;
                }
                _ => {}
            }
        }
        Ok::<_, anyhow::Error>(())
    }
    .await;

    if let Some(handle) = provider_handle {
        handle.abort();
    }
    result
}

/// Serializes and sends one message to Twilio.
pub(crate) async fn send_msg(
    socket_tx: &mut SplitSink<WebSocket, Message>,
    msg: &TwilioOutbound,
) -> Result<()> {
    let serialized = serde_json::to_string(msg)?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use serde_json::{Value, json};
    use std::net::SocketAddr;
    use superconnector_core::{Assistant, InMemorySessionStore, SessionService};
    use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

    const PHONE: &str = "+15551234567";

    async fn serve() -> (SocketAddr, Arc<SessionService>) {
        let sessions = Arc::new(SessionService::new(
            Arc::new(InMemorySessionStore::new()),
            chrono::Duration::hours(24),
        ));
        let state = Arc::new(AppState {
            sessions: sessions.clone(),
            telephony: None,
            assistant: Arc::new(Assistant::new(None)),
            config: Arc::new(Config::local_defaults()),
        });
        let app = axum::Router::new()
            .route("/ws/realtime-bridge", axum::routing::get(ws_handler))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, sessions)
    }

    fn text(value: Value) -> WsMessage {
        WsMessage::Text(value.to_string().into())
    }

    fn start_event() -> WsMessage {
        text(json!({
            "event": "start",
            "sequenceNumber": "1",
            "streamSid": "MZ1",
            "start": {
                "streamSid": "MZ1",
                "callSid": "CA1",
                "tracks": ["inbound"],
                "customParameters": { "userName": "Alex", "phoneNumber": PHONE },
                "mediaFormat": { "encoding": "audio/x-mulaw", "sampleRate": 8000, "channels": 1 }
            }
        }))
    }

    fn media_event() -> WsMessage {
        text(json!({
            "event": "media",
            "streamSid": "MZ1",
            "media": {
                "track": "inbound",
                "payload": audio_utils::encode_mulaw_payload(&[0xFF; 160])
            }
        }))
    }

    async fn call_completed(sessions: &SessionService) -> bool {
        for _ in 0..100 {
            if sessions
                .peek(PHONE)
                .await
                .unwrap()
                .is_some_and(|s| s.call_completed)
            {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_stream_without_openai_is_drained_and_completes_call() {
        let (addr, sessions) = serve().await;
        let (mut client, _) = connect_async(format!("ws://{addr}/ws/realtime-bridge"))
            .await
            .unwrap();

        client
            .send(text(json!({ "event": "connected", "protocol": "Call" })))
            .await
            .unwrap();
        client.send(start_event()).await.unwrap();

        let Some(Ok(WsMessage::Text(first))) = client.next().await else {
            panic!("expected a clear message after start");
        };
        let first: Value = serde_json::from_str(&first).unwrap();
        assert_eq!(first, json!({ "event": "clear", "streamSid": "MZ1" }));

        for _ in 0..5 {
            client.send(media_event()).await.unwrap();
        }
        assert!(sessions.peek(PHONE).await.unwrap().is_none());

        client
            .send(text(json!({ "event": "stop", "streamSid": "MZ1" })))
            .await
            .unwrap();
        assert!(call_completed(&sessions).await);
    }

    #[tokio::test]
    async fn test_socket_close_completes_call() {
        let (addr, sessions) = serve().await;
        let (mut client, _) = connect_async(format!("ws://{addr}/ws/realtime-bridge"))
            .await
            .unwrap();
        client.send(start_event()).await.unwrap();
        assert!(matches!(client.next().await, Some(Ok(WsMessage::Text(_)))));

        client.send(media_event()).await.unwrap();
        client.close(None).await.unwrap();

        assert!(call_completed(&sessions).await);
        let session = sessions.peek(PHONE).await.unwrap().unwrap();
        assert!(session.call_completed_time.is_some());
    }

    #[tokio::test]
    async fn test_stop_before_start_leaves_session_alone() {
        let (addr, sessions) = serve().await;
        let (mut client, _) = connect_async(format!("ws://{addr}/ws/realtime-bridge"))
            .await
            .unwrap();
        client
            .send(text(json!({ "event": "stop", "streamSid": "MZ1" })))
            .await
            .unwrap();

        let next = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .expect("server should hang up");
        assert!(!matches!(next, Some(Ok(WsMessage::Text(_)))));
        assert!(sessions.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stream_without_start_times_out() {
        let (addr, sessions) = serve().await;
        let (mut client, _) = connect_async(format!("ws://{addr}/ws/realtime-bridge"))
            .await
            .unwrap();

        let next = tokio::time::timeout(START_TIMEOUT + Duration::from_secs(3), client.next())
            .await
            .expect("server should hang up after the start timeout");
        assert!(!matches!(next, Some(Ok(WsMessage::Text(_)))));
        assert!(sessions.list().await.unwrap().is_empty());
    }
}
