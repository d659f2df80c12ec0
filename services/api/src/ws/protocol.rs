//! Defines the Twilio Media Streams message protocol.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Messages Twilio sends over the media-stream socket.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TwilioInbound {
    Connected {
        #[serde(default)]
        protocol: Option<String>,
    },
    Start {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        start: StreamStart,
    },
    Media {
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
        media: MediaPayload,
    },
    Mark {
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
    },
    Stop {
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StreamStart {
    #[serde(default)]
    pub call_sid: Option<String>,
    #[serde(default)]
    pub tracks: Vec<String>,
    #[serde(default)]
    pub custom_parameters: HashMap<String, String>,
    #[serde(default)]
    pub media_format: Option<MediaFormat>,
}

impl StreamStart {
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.custom_parameters
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MediaFormat {
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u32,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct MediaPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<String>,
    pub payload: String,
}

/// Messages we send back to Twilio.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TwilioOutbound {
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: MediaPayload,
    },
    /// Drops any audio Twilio has buffered but not yet played.
    Clear {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
}

impl TwilioOutbound {
    pub fn media(stream_sid: &str, payload: String) -> Self {
        TwilioOutbound::Media {
            stream_sid: stream_sid.to_string(),
            media: MediaPayload {
                track: None,
                payload,
            },
        }
    }

    pub fn clear(stream_sid: &str) -> Self {
        TwilioOutbound::Clear {
            stream_sid: stream_sid.to_string(),
        }
    }
}
