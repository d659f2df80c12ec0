//! Twilio REST client for WhatsApp messages and voice calls.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use utoipa::ToSchema;

use crate::{config::TwilioConfig, twiml::{Say, VoiceResponse}};

const API_VERSION: &str = "2010-04-01";

#[derive(Debug, thiserror::Error)]
pub enum TwilioError {
    #[error("Twilio is missing a sender number: {0}")]
    MissingSender(&'static str),
    #[error("Twilio request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Twilio API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("Failed to render TwiML: {0}")]
    Twiml(String),
}

/// What Twilio should do once the callee picks up.
#[derive(Debug, Clone, PartialEq)]
pub enum CallInstructions {
    /// Fetch TwiML from this webhook URL.
    Url(String),
    /// Speak this text and hang up.
    Say(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    pub instructions: CallInstructions,
    pub status_callback: Option<String>,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct MessageReceipt {
    pub sid: String,
    pub status: String,
    pub to: String,
    pub from: String,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct CallReceipt {
    pub sid: String,
    pub status: String,
    pub to: String,
    pub from: String,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub sid: String,
    pub from: String,
    pub to: String,
    pub body: Option<String>,
    pub status: String,
    pub direction: Option<String>,
    pub date_sent: Option<String>,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub sid: String,
    pub from: String,
    pub to: String,
    pub status: String,
    pub direction: Option<String>,
    pub duration: Option<String>,
    pub start_time: Option<String>,
}

/// Configured sender identities.
#[derive(Serialize, ToSchema, Debug, Clone, Default, PartialEq)]
pub struct SenderNumbers {
    pub whatsapp_number: Option<String>,
    pub phone_number: Option<String>,
}

/// Outbound messaging and calling. Implemented by `TwilioClient`; tests
/// substitute an in-memory recorder.
#[async_trait]
pub trait TelephonyClient: Send + Sync {
    fn numbers(&self) -> SenderNumbers;

    async fn send_whatsapp(
        &self,
        to: &str,
        body: &str,
        media_url: Option<&str>,
    ) -> Result<MessageReceipt, TwilioError>;

    async fn place_call(&self, to: &str, call: &CallRequest) -> Result<CallReceipt, TwilioError>;

    async fn message_history(
        &self,
        limit: u32,
        from: Option<&str>,
    ) -> Result<Vec<MessageRecord>, TwilioError>;

    async fn call_history(
        &self,
        limit: u32,
        status: Option<&str>,
    ) -> Result<Vec<CallRecord>, TwilioError>;
}

/// Adds the `whatsapp:` channel prefix when it is missing.
pub fn whatsapp_address(number: &str) -> String {
    let number = number.trim();
    if number.starts_with("whatsapp:") {
        number.to_string()
    } else {
        format!("whatsapp:{number}")
    }
}

#[derive(Deserialize)]
struct ApiErrorBody {
    message: Option<String>,
}

#[derive(Deserialize)]
struct MessagePage {
    #[serde(default)]
    messages: Vec<MessageRecord>,
}

#[derive(Deserialize)]
struct CallPage {
    #[serde(default)]
    calls: Vec<CallRecord>,
}

pub struct TwilioClient {
    http: reqwest::Client,
    account_sid: String,
    auth_token: SecretString,
    whatsapp_number: Option<String>,
    phone_number: Option<String>,
    api_base: String,
}

impl TwilioClient {
    pub fn new(config: &TwilioConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            account_sid: config.account_sid.clone(),
            auth_token: SecretString::from(config.auth_token.expose_secret().to_string()),
            whatsapp_number: config.whatsapp_number.clone(),
            phone_number: config.phone_number.clone(),
            api_base: config.api_base.clone(),
        }
    }

    fn url(&self, resource: &str) -> String {
        format!(
            "{}/{API_VERSION}/Accounts/{}/{resource}.json",
            self.api_base, self.account_sid
        )
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, TwilioError> {
        let response = request
            .basic_auth(&self.account_sid, Some(self.auth_token.expose_secret()))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorBody>(&text)
                .ok()
                .and_then(|b| b.message)
                .unwrap_or(text);
            return Err(TwilioError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl TelephonyClient for TwilioClient {
    fn numbers(&self) -> SenderNumbers {
        SenderNumbers {
            whatsapp_number: self.whatsapp_number.clone(),
            phone_number: self.phone_number.clone(),
        }
    }

    async fn send_whatsapp(
        &self,
        to: &str,
        body: &str,
        media_url: Option<&str>,
    ) -> Result<MessageReceipt, TwilioError> {
        let from = self
            .whatsapp_number
            .as_deref()
            .ok_or(TwilioError::MissingSender("TWILIO_WHATSAPP_NUMBER"))?;
        let mut form = vec![
            ("To", whatsapp_address(to)),
            ("From", whatsapp_address(from)),
            ("Body", body.to_string()),
        ];
        if let Some(media_url) = media_url {
            form.push(("MediaUrl", media_url.to_string()));
        }

        let receipt: MessageReceipt = self
            .send(self.http.post(self.url("Messages")).form(&form))
            .await?;
        info!(sid = %receipt.sid, to = %receipt.to, status = %receipt.status, "WhatsApp message sent");
        Ok(receipt)
    }

    async fn place_call(&self, to: &str, call: &CallRequest) -> Result<CallReceipt, TwilioError> {
        let from = self
            .phone_number
            .as_deref()
            .ok_or(TwilioError::MissingSender("TWILIO_PHONE_NUMBER"))?;
        let to = to.trim().trim_start_matches("whatsapp:");
        let mut form = vec![("To", to.to_string()), ("From", from.to_string())];
        match &call.instructions {
            CallInstructions::Url(url) => form.push(("Url", url.clone())),
            CallInstructions::Say(text) => {
                let twiml = VoiceResponse::new()
                    .say(Say::basic(text.clone()).language(crate::twiml::LANGUAGE))
                    .render()
                    .map_err(|e| TwilioError::Twiml(e.to_string()))?;
                form.push(("Twiml", twiml));
            }
        }
        if let Some(callback) = &call.status_callback {
            form.push(("StatusCallback", callback.clone()));
            form.push(("StatusCallbackMethod", "POST".to_string()));
            for event in ["initiated", "ringing", "answered", "completed"] {
                form.push(("StatusCallbackEvent", event.to_string()));
            }
        }

        let receipt: CallReceipt = self
            .send(self.http.post(self.url("Calls")).form(&form))
            .await?;
        info!(sid = %receipt.sid, to = %receipt.to, status = %receipt.status, "Call placed");
        Ok(receipt)
    }

    async fn message_history(
        &self,
        limit: u32,
        from: Option<&str>,
    ) -> Result<Vec<MessageRecord>, TwilioError> {
        let mut query = vec![("PageSize", limit.to_string())];
        if let Some(from) = from {
            query.push(("From", whatsapp_address(from)));
        }
        let page: MessagePage = self
            .send(self.http.get(self.url("Messages")).query(&query))
            .await?;
        debug!(count = page.messages.len(), "Fetched message history");
        Ok(page.messages)
    }

    async fn call_history(
        &self,
        limit: u32,
        status: Option<&str>,
    ) -> Result<Vec<CallRecord>, TwilioError> {
        let mut query = vec![("PageSize", limit.to_string())];
        if let Some(status) = status {
            query.push(("Status", status.to_string()));
        }
        let page: CallPage = self
            .send(self.http.get(self.url("Calls")).query(&query))
            .await?;
        debug!(count = page.calls.len(), "Fetched call history");
        Ok(page.calls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{basic_auth, body_string_contains, method, path, query_param},
    };

    fn client(server: &MockServer) -> TwilioClient {
        TwilioClient::new(&TwilioConfig {
            account_sid: "AC123".to_string(),
            auth_token: SecretString::from("token".to_string()),
            whatsapp_number: Some("+14155238886".to_string()),
            phone_number: Some("+15005550006".to_string()),
            api_base: server.uri(),
        })
    }

    #[test]
    fn test_whatsapp_address() {
        assert_eq!(whatsapp_address("+1555"), "whatsapp:+1555");
        assert_eq!(whatsapp_address("whatsapp:+1555"), "whatsapp:+1555");
    }

    #[tokio::test]
    async fn test_send_whatsapp_posts_form() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2010-04-01/Accounts/AC123/Messages.json"))
            .and(basic_auth("AC123", "token"))
            .and(body_string_contains("To=whatsapp%3A%2B15551234567"))
            .and(body_string_contains("From=whatsapp%3A%2B14155238886"))
            .and(body_string_contains("Body=Hello+there"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "sid": "SM1",
                "status": "queued",
                "to": "whatsapp:+15551234567",
                "from": "whatsapp:+14155238886",
                "body": "Hello there"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let receipt = client(&server)
            .send_whatsapp("+15551234567", "Hello there", None)
            .await
            .unwrap();
        assert_eq!(receipt.sid, "SM1");
        assert_eq!(receipt.status, "queued");
    }

    #[tokio::test]
    async fn test_place_call_with_spoken_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2010-04-01/Accounts/AC123/Calls.json"))
            .and(body_string_contains("To=%2B15551234567"))
            .and(body_string_contains("Twiml="))
            .and(body_string_contains("StatusCallback=https"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "sid": "CA1",
                "status": "queued",
                "to": "+15551234567",
                "from": "+15005550006"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let receipt = client(&server)
            .place_call(
                "whatsapp:+15551234567",
                &CallRequest {
                    instructions: CallInstructions::Say("Hello from Eli".into()),
                    status_callback: Some("https://x.test/twilio/webhook/voice/status".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(receipt.sid, "CA1");
    }

    #[tokio::test]
    async fn test_api_error_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "code": 21211,
                "message": "The 'To' number is not a valid phone number.",
                "status": 400
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .send_whatsapp("nope", "hi", None)
            .await
            .unwrap_err();
        match err {
            TwilioError::Api { status, message } => {
                assert_eq!(status, 400);
                assert!(message.contains("not a valid phone number"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_history_queries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/2010-04-01/Accounts/AC123/Messages.json"))
            .and(query_param("PageSize", "5"))
            .and(query_param("From", "whatsapp:+1555"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "messages": [{
                    "sid": "SM9", "from": "whatsapp:+1555", "to": "whatsapp:+1415",
                    "body": "hey", "status": "received", "direction": "inbound",
                    "date_sent": "Sat, 01 Mar 2025 10:00:00 +0000"
                }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/2010-04-01/Accounts/AC123/Calls.json"))
            .and(query_param("Status", "completed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "calls": [] })))
            .mount(&server)
            .await;

        let twilio = client(&server);
        let messages = twilio.message_history(5, Some("+1555")).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body.as_deref(), Some("hey"));

        let calls = twilio.call_history(20, Some("completed")).await.unwrap();
        assert!(calls.is_empty());
    }

    #[tokio::test]
    async fn test_missing_sender_number() {
        let server = MockServer::start().await;
        let twilio = TwilioClient::new(&TwilioConfig {
            account_sid: "AC123".to_string(),
            auth_token: SecretString::from("token".to_string()),
            whatsapp_number: None,
            phone_number: None,
            api_base: server.uri(),
        });
        assert!(matches!(
            twilio.send_whatsapp("+1", "hi", None).await,
            Err(TwilioError::MissingSender(_))
        ));
    }
}
