//! TwiML documents returned to Twilio webhooks.
//!
//! Responses are built as a list of verbs and rendered with `quick-xml`, which
//! escapes all text and attribute values.

use anyhow::Result;
use quick_xml::{
    Writer,
    events::{BytesDecl, BytesStart, BytesText, Event},
};
use std::io::Cursor;

/// Amazon Polly neural voice used for conversational prompts.
pub const NEURAL_VOICE: &str = "Polly.Matthew-Neural";
/// Twilio's basic voice, used for menus and fallback flows.
pub const BASIC_VOICE: &str = "alice";
pub const LANGUAGE: &str = "en-US";

#[derive(Debug, Clone, PartialEq)]
pub struct Say {
    pub text: String,
    pub voice: Option<String>,
    pub language: Option<String>,
}

impl Say {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            voice: None,
            language: None,
        }
    }

    pub fn voice(mut self, voice: &str) -> Self {
        self.voice = Some(voice.to_string());
        self
    }

    pub fn language(mut self, language: &str) -> Self {
        self.language = Some(language.to_string());
        self
    }

    /// The neural voice in US English.
    pub fn neural(text: impl Into<String>) -> Self {
        Self::new(text).voice(NEURAL_VOICE).language(LANGUAGE)
    }

    pub fn basic(text: impl Into<String>) -> Self {
        Self::new(text).voice(BASIC_VOICE)
    }
}

/// `<Gather>` collecting speech, with nested prompts.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Gather {
    pub input: String,
    pub action: String,
    pub timeout: Option<u32>,
    pub speech_timeout: Option<String>,
    pub language: Option<String>,
    pub enhanced: bool,
    pub speech_model: Option<String>,
    pub prompts: Vec<Say>,
}

impl Gather {
    /// A speech gather posting to `action`, tuned for phone calls.
    pub fn speech(action: impl Into<String>) -> Self {
        Self {
            input: "speech".to_string(),
            action: action.into(),
            timeout: Some(10),
            speech_timeout: Some("3".to_string()),
            language: Some(LANGUAGE.to_string()),
            ..Default::default()
        }
    }

    pub fn timeout(mut self, secs: u32) -> Self {
        self.timeout = Some(secs);
        self
    }

    pub fn enhanced(mut self) -> Self {
        self.enhanced = true;
        self.speech_model = Some("phone_call".to_string());
        self
    }

    pub fn say(mut self, say: Say) -> Self {
        self.prompts.push(say);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub max_length: u32,
    pub finish_on_key: String,
    pub transcribe_callback: Option<String>,
}

/// `<Connect><Stream>` opening a bidirectional media stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Stream {
    pub url: String,
    pub parameters: Vec<(String, String)>,
}

impl Stream {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            parameters: Vec::new(),
        }
    }

    /// Adds a custom parameter; empty values are skipped.
    pub fn parameter(mut self, name: &str, value: &str) -> Self {
        if !value.is_empty() {
            self.parameters.push((name.to_string(), value.to_string()));
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Verb {
    Say(Say),
    Play(String),
    Pause(u32),
    Gather(Gather),
    Record(Record),
    Redirect(String),
    Connect(Stream),
    Hangup,
}

/// A `<Response>` for voice webhooks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VoiceResponse {
    verbs: Vec<Verb>,
}

impl VoiceResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn say(mut self, say: Say) -> Self {
        self.verbs.push(Verb::Say(say));
        self
    }

    pub fn play(mut self, url: impl Into<String>) -> Self {
        self.verbs.push(Verb::Play(url.into()));
        self
    }

    pub fn pause(mut self, secs: u32) -> Self {
        self.verbs.push(Verb::Pause(secs));
        self
    }

    pub fn gather(mut self, gather: Gather) -> Self {
        self.verbs.push(Verb::Gather(gather));
        self
    }

    pub fn record(mut self, record: Record) -> Self {
        self.verbs.push(Verb::Record(record));
        self
    }

    pub fn redirect(mut self, url: impl Into<String>) -> Self {
        self.verbs.push(Verb::Redirect(url.into()));
        self
    }

    pub fn connect(mut self, stream: Stream) -> Self {
        self.verbs.push(Verb::Connect(stream));
        self
    }

    pub fn hangup(mut self) -> Self {
        self.verbs.push(Verb::Hangup);
        self
    }

    pub fn render(&self) -> Result<String> {
        let mut writer = start_document()?;
        for verb in &self.verbs {
            write_verb(&mut writer, verb)?;
        }
        finish_document(writer)
    }
}

/// A `<Response>` for messaging webhooks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagingResponse {
    messages: Vec<String>,
}

impl MessagingResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message(mut self, body: impl Into<String>) -> Self {
        self.messages.push(body.into());
        self
    }

    pub fn render(&self) -> Result<String> {
        let mut writer = start_document()?;
        for body in &self.messages {
            write_text_element(&mut writer, BytesStart::new("Message"), body)?;
        }
        finish_document(writer)
    }
}

type XmlWriter = Writer<Cursor<Vec<u8>>>;

fn start_document() -> Result<XmlWriter> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    writer.write_event(Event::Start(BytesStart::new("Response")))?;
    Ok(writer)
}

fn finish_document(mut writer: XmlWriter) -> Result<String> {
    writer.write_event(Event::End(BytesStart::new("Response").to_end()))?;
    Ok(String::from_utf8(writer.into_inner().into_inner())?)
}

fn write_text_element(writer: &mut XmlWriter, elem: BytesStart<'_>, text: &str) -> Result<()> {
    let end = elem.to_end().into_owned();
    writer.write_event(Event::Start(elem))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(end))?;
    Ok(())
}

fn write_say(writer: &mut XmlWriter, say: &Say) -> Result<()> {
    let mut elem = BytesStart::new("Say");
    if let Some(voice) = &say.voice {
        elem.push_attribute(("voice", voice.as_str()));
    }
    if let Some(language) = &say.language {
        elem.push_attribute(("language", language.as_str()));
    }
    write_text_element(writer, elem, &say.text)
}

fn write_verb(writer: &mut XmlWriter, verb: &Verb) -> Result<()> {
    match verb {
        Verb::Say(say) => write_say(writer, say)?,
        Verb::Play(url) => write_text_element(writer, BytesStart::new("Play"), url)?,
        Verb::Pause(secs) => {
            let mut elem = BytesStart::new("Pause");
            elem.push_attribute(("length", secs.to_string().as_str()));
            writer.write_event(Event::Empty(elem))?;
        }
        Verb::Gather(gather) => {
            let mut elem = BytesStart::new("Gather");
            elem.push_attribute(("input", gather.input.as_str()));
            elem.push_attribute(("action", gather.action.as_str()));
            elem.push_attribute(("method", "POST"));
            if let Some(timeout) = gather.timeout {
                elem.push_attribute(("timeout", timeout.to_string().as_str()));
            }
            if let Some(speech_timeout) = &gather.speech_timeout {
                elem.push_attribute(("speechTimeout", speech_timeout.as_str()));
            }
            if let Some(language) = &gather.language {
                elem.push_attribute(("language", language.as_str()));
            }
            if gather.enhanced {
                elem.push_attribute(("enhanced", "true"));
                elem.push_attribute(("profanityFilter", "false"));
            }
            if let Some(model) = &gather.speech_model {
                elem.push_attribute(("speechModel", model.as_str()));
            }
            if gather.prompts.is_empty() {
                writer.write_event(Event::Empty(elem))?;
            } else {
                writer.write_event(Event::Start(elem))?;
                for say in &gather.prompts {
                    write_say(writer, say)?;
                }
                writer.write_event(Event::End(BytesStart::new("Gather").to_end()))?;
            }
        }
        Verb::Record(record) => {
            let mut elem = BytesStart::new("Record");
            elem.push_attribute(("maxLength", record.max_length.to_string().as_str()));
            elem.push_attribute(("finishOnKey", record.finish_on_key.as_str()));
            if let Some(callback) = &record.transcribe_callback {
                elem.push_attribute(("transcribe", "true"));
                elem.push_attribute(("transcribeCallback", callback.as_str()));
            }
            writer.write_event(Event::Empty(elem))?;
        }
        Verb::Redirect(url) => {
            let mut elem = BytesStart::new("Redirect");
            elem.push_attribute(("method", "POST"));
            write_text_element(writer, elem, url)?;
        }
        Verb::Connect(stream) => {
            writer.write_event(Event::Start(BytesStart::new("Connect")))?;
            let mut elem = BytesStart::new("Stream");
            elem.push_attribute(("url", stream.url.as_str()));
            if stream.parameters.is_empty() {
                writer.write_event(Event::Empty(elem))?;
            } else {
                writer.write_event(Event::Start(elem))?;
                for (name, value) in &stream.parameters {
                    let mut param = BytesStart::new("Parameter");
                    param.push_attribute(("name", name.as_str()));
                    param.push_attribute(("value", value.as_str()));
                    writer.write_event(Event::Empty(param))?;
                }
                writer.write_event(Event::End(BytesStart::new("Stream").to_end()))?;
            }
            writer.write_event(Event::End(BytesStart::new("Connect").to_end()))?;
        }
        Verb::Hangup => writer.write_event(Event::Empty(BytesStart::new("Hangup")))?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DECL: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

    #[test]
    fn test_empty_responses() {
        assert_eq!(
            VoiceResponse::new().render().unwrap(),
            format!("{DECL}<Response></Response>")
        );
        assert_eq!(
            MessagingResponse::new().render().unwrap(),
            format!("{DECL}<Response></Response>")
        );
    }

    #[test]
    fn test_message_is_escaped() {
        let xml = MessagingResponse::new()
            .message("Tom & Jerry <3")
            .render()
            .unwrap();
        assert_eq!(
            xml,
            format!("{DECL}<Response><Message>Tom &amp; Jerry &lt;3</Message></Response>")
        );
    }

    #[test]
    fn test_say_pause_hangup() {
        let xml = VoiceResponse::new()
            .say(Say::neural("Hi!"))
            .pause(1)
            .hangup()
            .render()
            .unwrap();
        assert_eq!(
            xml,
            format!(
                r#"{DECL}<Response><Say voice="Polly.Matthew-Neural" language="en-US">Hi!</Say><Pause length="1"/><Hangup/></Response>"#
            )
        );
    }

    #[test]
    fn test_gather_with_prompt() {
        let xml = VoiceResponse::new()
            .gather(
                Gather::speech("https://x.test/next?a=1&b=2")
                    .enhanced()
                    .say(Say::basic("Tell me more")),
            )
            .render()
            .unwrap();
        assert!(xml.contains(r#"<Gather input="speech" action="https://x.test/next?a=1&amp;b=2" method="POST" timeout="10" speechTimeout="3" language="en-US" enhanced="true" profanityFilter="false" speechModel="phone_call">"#));
        assert!(xml.contains(r#"<Say voice="alice">Tell me more</Say></Gather>"#));
    }

    #[test]
    fn test_connect_stream_parameters() {
        let xml = VoiceResponse::new()
            .connect(
                Stream::new("wss://x.test/ws/realtime-bridge")
                    .parameter("callSid", "CA1")
                    .parameter("userName", "")
                    .parameter("userEmail", "a@b.io"),
            )
            .render()
            .unwrap();
        assert!(xml.contains(
            r#"<Connect><Stream url="wss://x.test/ws/realtime-bridge"><Parameter name="callSid" value="CA1"/><Parameter name="userEmail" value="a@b.io"/></Stream></Connect>"#
        ));
        assert!(!xml.contains("userName"));
    }

    #[test]
    fn test_record_and_redirect() {
        let xml = VoiceResponse::new()
            .record(Record {
                max_length: 120,
                finish_on_key: "#".to_string(),
                transcribe_callback: Some("/twilio/webhook/voice/transcription".to_string()),
            })
            .redirect("https://x.test/twilio/webhook/voice")
            .render()
            .unwrap();
        assert!(xml.contains(r##"<Record maxLength="120" finishOnKey="#" transcribe="true" transcribeCallback="/twilio/webhook/voice/transcription"/>"##));
        assert!(xml.contains(r#"<Redirect method="POST">https://x.test/twilio/webhook/voice</Redirect>"#));
    }
}
