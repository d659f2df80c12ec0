//! Manages the realtime voice-model connection behind a media stream.

pub mod openai;

use super::{protocol::TwilioOutbound, session::TwilioSink};
use secrecy::SecretString;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::error;

/// An internal event passed to the realtime provider task.
#[derive(Debug)]
pub enum RealtimeClientEvent {
    /// Caller audio, PCM16 at the Twilio sample rate.
    Audio(Vec<i16>),
}

/// What we know about the call when the stream starts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BridgeContext {
    pub stream_sid: String,
    pub call_sid: Option<String>,
    pub user_name: Option<String>,
    pub user_email: Option<String>,
    pub phone_number: Option<String>,
}

/// Spawns the OpenAI realtime task for one media stream.
///
/// # Returns
/// A tuple containing:
/// 1. A `mpsc::Sender` to send `RealtimeClientEvent`s to the provider task.
/// 2. A `JoinHandle` for the spawned task.
pub fn start_realtime_provider(
    api_key: SecretString,
    model: String,
    context: BridgeContext,
    socket_tx: TwilioSink,
) -> (mpsc::Sender<RealtimeClientEvent>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(256);

    let handle = tokio::spawn(async move {
        if let Err(e) = openai::run(&api_key, &model, &context, rx, socket_tx.clone()).await {
            error!(stream_sid = %context.stream_sid, error = ?e, "Realtime provider task failed");
            // Drop any half-played reply.
            let _ = super::session::send_msg(
                &mut *socket_tx.lock().await,
                &TwilioOutbound::clear(&context.stream_sid),
            )
            .await;
        }
    });

    (tx, handle)
}
