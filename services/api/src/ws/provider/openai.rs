//! Bridges a Twilio media stream to the OpenAI Realtime API.

use super::{BridgeContext, RealtimeClientEvent};
use crate::{
    audio_utils::{self, StreamResampler, TWILIO_FRAME_BYTES},
    ws::{
        protocol::TwilioOutbound,
        session::{TwilioSink, send_msg},
    },
};
use anyhow::{Context, Result, anyhow};
use async_openai::types::realtime::{
    self as oai_realtime, ClientEvent as OAIClientEvent, ServerEvent as OAIServerEvent,
};
use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use superconnector_core::assistant::{realtime_greeting, realtime_instructions};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message as WsMessage},
};
use tracing::{debug, info, warn};

const REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";

/// Splits μ-law audio into fixed 20 ms media frames.
#[derive(Debug, Default)]
pub struct MulawFramer {
    pending: Vec<u8>,
}

impl MulawFramer {
    /// Returns every complete frame; a short tail waits for the next push.
    pub fn push(&mut self, mulaw: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(mulaw);
        let complete = self.pending.len() / TWILIO_FRAME_BYTES * TWILIO_FRAME_BYTES;
        let frames = self.pending[..complete]
            .chunks(TWILIO_FRAME_BYTES)
            .map(<[u8]>::to_vec)
            .collect();
        self.pending.drain(..complete);
        frames
    }

    /// Emits the short tail, if any, at the end of a response.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        (!self.pending.is_empty()).then(|| std::mem::take(&mut self.pending))
    }

    pub fn reset(&mut self) {
        self.pending.clear();
    }
}

fn session_config(context: &BridgeContext) -> oai_realtime::SessionResource {
    oai_realtime::SessionResource {
        modalities: Some(vec!["text".to_string(), "audio".to_string()]),
        instructions: Some(realtime_instructions(
            context.user_name.as_deref(),
            context.user_email.as_deref(),
        )),
        voice: Some(oai_realtime::RealtimeVoice::Alloy),
        input_audio_format: Some(oai_realtime::AudioFormat::PCM16),
        output_audio_format: Some(oai_realtime::AudioFormat::PCM16),
        input_audio_transcription: Some(oai_realtime::AudioTranscription {
            model: Some("whisper-1".to_string()),
            ..Default::default()
        }),
        turn_detection: Some(oai_realtime::TurnDetection::ServerVAD {
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 800,
            interrupt_response: Some(true),
            create_response: Some(true),
        }),
        temperature: Some(0.8),
        ..Default::default()
    }
}

fn greeting_item(text: String) -> oai_realtime::Item {
    oai_realtime::Item {
        r#type: Some(oai_realtime::ItemType::Message),
        role: Some(oai_realtime::ItemRole::User),
        content: Some(vec![oai_realtime::ItemContent {
            r#type: oai_realtime::ItemContentType::InputText,
            text: Some(text),
            audio: None,
            transcript: None,
        }]),
        id: None,
        status: None,
        call_id: None,
        name: None,
        arguments: None,
        output: None,
    }
}

fn to_ws(event: &OAIClientEvent) -> Result<WsMessage> {
    Ok(WsMessage::Text(serde_json::to_string(event)?.into()))
}

/// Runs the OpenAI side of one bridged call until either end hangs up.
pub async fn run(
    api_key: &SecretString,
    model: &str,
    context: &BridgeContext,
    mut rx: mpsc::Receiver<RealtimeClientEvent>,
    socket_tx: TwilioSink,
) -> Result<()> {
    let mut request = format!("{REALTIME_URL}?model={model}").into_client_request()?;
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {}", api_key.expose_secret()).parse()?,
    );
    request
        .headers_mut()
        .insert("OpenAI-Beta", "realtime=v1".parse()?);

    let (ws_stream, _) = connect_async(request)
        .await
        .context("Failed to connect to OpenAI Realtime WebSocket")?;
    let (mut openai_tx, mut openai_rx) = ws_stream.split();
    info!(stream_sid = %context.stream_sid, "Connected to OpenAI Realtime API.");

    openai_tx
        .send(to_ws(&OAIClientEvent::SessionUpdate(
            oai_realtime::SessionUpdateEvent {
                session: session_config(context),
                event_id: None,
            },
        ))?)
        .await?;

    // Open the conversation instead of waiting for the caller to speak.
    let greeting = realtime_greeting(context.user_name.as_deref());
    openai_tx
        .send(to_ws(&OAIClientEvent::ConversationItemCreate(
            oai_realtime::ConversationItemCreateEvent {
                item: greeting_item(greeting),
                event_id: None,
                previous_item_id: None,
            },
        ))?)
        .await?;
    openai_tx
        .send(to_ws(&OAIClientEvent::ResponseCreate(
            oai_realtime::ResponseCreateEvent {
                response: None,
                event_id: None,
            },
        ))?)
        .await?;

    let mut inbound = StreamResampler::twilio_to_openai()?;
    let mut outbound = StreamResampler::openai_to_twilio()?;
    let mut framer = MulawFramer::default();

    loop {
        tokio::select! {
            biased;
            event = rx.recv() => {
                let Some(RealtimeClientEvent::Audio(samples)) = event else {
                    debug!("Media stream closed; ending realtime session.");
                    break;
                };
                let upsampled = inbound.push(&samples)?;
                if upsampled.is_empty() {
                    continue;
                }
                let append = oai_realtime::InputAudioBufferAppendEvent {
                    audio: audio_utils::encode_i16(&upsampled),
                    event_id: None,
                };
                openai_tx.send(to_ws(&OAIClientEvent::InputAudioBufferAppend(append))?).await?;
            },
            msg = openai_rx.next() => {
                let text = match msg {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Close(frame))) => {
                        return Err(anyhow!("OpenAI closed the realtime socket: {frame:?}"));
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(anyhow!("OpenAI realtime socket ended")),
                };
                let Ok(server_event) = serde_json::from_str::<OAIServerEvent>(&text) else {
                    continue;
                };
                match server_event {
                    OAIServerEvent::ResponseAudioDelta(e) => {
                        let pcm = outbound.push(&audio_utils::decode_i16(&e.delta))?;
                        let mut sink = socket_tx.lock().await;
                        for frame in framer.push(&audio_utils::pcm16_to_mulaw(&pcm)) {
                            let payload = audio_utils::encode_mulaw_payload(&frame);
                            send_msg(&mut sink, &TwilioOutbound::media(&context.stream_sid, payload)).await?;
                        }
                    }
                    OAIServerEvent::ResponseAudioDone(_) => {
                        if let Some(tail) = framer.flush() {
                            let payload = audio_utils::encode_mulaw_payload(&tail);
                            send_msg(&mut *socket_tx.lock().await, &TwilioOutbound::media(&context.stream_sid, payload)).await?;
                        }
                    }
                    OAIServerEvent::InputAudioBufferSpeechStarted(_) => {
                        // Barge-in: stop playback of the current reply.
                        framer.reset();
                        outbound.reset();
                        send_msg(&mut *socket_tx.lock().await, &TwilioOutbound::clear(&context.stream_sid)).await?;
                    }
                    OAIServerEvent::ConversationItemInputAudioTranscriptionCompleted(e) => {
                        info!(stream_sid = %context.stream_sid, transcript = %e.transcript, "Caller said");
                    }
                    OAIServerEvent::Error(e) => {
                        warn!(stream_sid = %context.stream_sid, message = %e.error.message, "OpenAI realtime error");
                    }
                    _ => {}
                }
            },
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framer_emits_whole_frames() {
        let mut framer = MulawFramer::default();
        assert!(framer.push(&[0xFF; 100]).is_empty());

        let frames = framer.push(&[0xFF; 300]);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.len() == TWILIO_FRAME_BYTES));

        assert_eq!(framer.flush().map(|f| f.len()), Some(80));
        assert_eq!(framer.flush(), None);
    }

    #[test]
    fn test_framer_reset_drops_tail() {
        let mut framer = MulawFramer::default();
        framer.push(&[0x7F; 50]);
        framer.reset();
        assert_eq!(framer.flush(), None);
    }

    #[test]
    fn test_session_config_uses_caller_details() {
        let context = BridgeContext {
            stream_sid: "MZ1".into(),
            user_name: Some("Alex".into()),
            user_email: Some("alex@example.com".into()),
            ..Default::default()
        };
        let config = session_config(&context);
        assert!(config.instructions.unwrap().contains("Alex"));
        assert!(matches!(
            config.turn_detection,
            Some(oai_realtime::TurnDetection::ServerVAD { silence_duration_ms: 800, .. })
        ));

        let event = serde_json::to_value(OAIClientEvent::ConversationItemCreate(
            oai_realtime::ConversationItemCreateEvent {
                item: greeting_item(realtime_greeting(Some("Alex"))),
                event_id: None,
                previous_item_id: None,
            },
        ))
        .unwrap();
        assert_eq!(event["type"], "conversation.item.create");
        assert_eq!(event["item"]["role"], "user");
    }
}
