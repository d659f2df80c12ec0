//! Twilio Media Streams bridge
//!
//! - `protocol`: the JSON messages Twilio exchanges over the media socket.
//! - `session`: the socket lifecycle, from `start` to `stop`.
//! - `provider`: the OpenAI realtime connection that voices the call.

pub mod protocol;
mod provider;
pub mod session;

pub use session::ws_handler;
