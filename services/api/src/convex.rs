//! Session store backed by a Convex deployment.
//!
//! Talks to the deployment's HTTP API: every call is a `POST` to
//! `/api/query` or `/api/mutation` naming one of the functions in
//! `convex/sessions.ts`. Timestamps travel as epoch milliseconds.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use superconnector_core::{Session, SessionPatch, SessionStore};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ConvexError {
    #[error("Convex request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Convex function {function} failed: {message}")]
    Function { function: String, message: String },
    #[error("Unexpected Convex response from {function}: {source}")]
    Decode {
        function: String,
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FunctionResponse {
    status: String,
    #[serde(default)]
    value: Value,
    error_message: Option<String>,
}

/// A session document as stored in the `sessions` table.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
struct SessionDoc {
    phone_number: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
    call_initiated: bool,
    call_completed: bool,
    info_provided: bool,
    last_activity: i64,
    created_at: i64,
    #[serde(default)]
    call_time: Option<i64>,
    #[serde(default)]
    call_completed_time: Option<i64>,
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

impl From<SessionDoc> for Session {
    fn from(doc: SessionDoc) -> Self {
        Session {
            phone_number: doc.phone_number,
            name: doc.name,
            email: doc.email,
            call_initiated: doc.call_initiated,
            call_completed: doc.call_completed,
            info_provided: doc.info_provided,
            last_activity: from_millis(doc.last_activity),
            created_at: from_millis(doc.created_at),
            call_time: doc.call_time.map(from_millis),
            call_completed_time: doc.call_completed_time.map(from_millis),
        }
    }
}

/// Arguments to `sessions:upsert`. Unset patch fields are omitted.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct UpsertArgs<'a> {
    phone_number: &'a str,
    now: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    call_initiated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    call_completed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    info_provided: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    call_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    call_completed_time: Option<i64>,
}

pub struct ConvexSessionStore {
    http: reqwest::Client,
    url: String,
    deploy_key: SecretString,
}

impl ConvexSessionStore {
    pub fn new(url: impl Into<String>, deploy_key: SecretString) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into().trim_end_matches('/').to_string(),
            deploy_key,
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        kind: &str,
        function: &str,
        args: Value,
    ) -> Result<T, ConvexError> {
        let response = self
            .http
            .post(format!("{}/api/{kind}", self.url))
            .bearer_auth(self.deploy_key.expose_secret())
            .json(&json!({ "path": function, "args": args, "format": "json" }))
            .send()
            .await?;

        let http_status = response.status();
        if !http_status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<FunctionResponse>(&text)
                .ok()
                .and_then(|body| body.error_message)
                .unwrap_or_else(|| format!("HTTP {http_status}: {}", text.trim()));
            return Err(ConvexError::Function {
                function: function.to_string(),
                message,
            });
        }

        let body: FunctionResponse = response.json().await?;
        if body.status != "success" {
            return Err(ConvexError::Function {
                function: function.to_string(),
                message: body
                    .error_message
                    .unwrap_or_else(|| format!("status {}", body.status)),
            });
        }
        debug!(function, "Convex call succeeded");
        serde_json::from_value(body.value).map_err(|source| ConvexError::Decode {
            function: function.to_string(),
            source,
        })
    }

    async fn query<T: DeserializeOwned>(&self, function: &str, args: Value) -> Result<T, ConvexError> {
        self.call("query", function, args).await
    }

    async fn mutation<T: DeserializeOwned>(
        &self,
        function: &str,
        args: Value,
    ) -> Result<T, ConvexError> {
        self.call("mutation", function, args).await
    }
}

#[async_trait]
impl SessionStore for ConvexSessionStore {
    async fn get(&self, phone: &str) -> Result<Option<Session>> {
        let doc: Option<SessionDoc> = self
            .query("sessions:get", json!({ "phoneNumber": phone }))
            .await?;
        Ok(doc.map(Session::from))
    }

    async fn upsert(&self, phone: &str, patch: &SessionPatch, now: DateTime<Utc>) -> Result<Session> {
        let args = UpsertArgs {
            phone_number: phone,
            now: now.timestamp_millis(),
            name: patch.name.as_deref(),
            email: patch.email.as_deref(),
            call_initiated: patch.call_initiated,
            call_completed: patch.call_completed,
            info_provided: patch.info_provided,
            call_time: patch.call_time.map(|t| t.timestamp_millis()),
            call_completed_time: patch.call_completed_time.map(|t| t.timestamp_millis()),
        };
        let doc: SessionDoc = self
            .mutation("sessions:upsert", serde_json::to_value(&args)?)
            .await?;
        Ok(doc.into())
    }

    async fn touch(&self, phone: &str, now: DateTime<Utc>) -> Result<Option<Session>> {
        let doc: Option<SessionDoc> = self
            .mutation(
                "sessions:updateActivity",
                json!({ "phoneNumber": phone, "now": now.timestamp_millis() }),
            )
            .await?;
        Ok(doc.map(Session::from))
    }

    async fn delete(&self, phone: &str) -> Result<bool> {
        Ok(self
            .mutation("sessions:deleteSession", json!({ "phoneNumber": phone }))
            .await?)
    }

    async fn delete_if_idle(&self, phone: &str, cutoff: DateTime<Utc>) -> Result<bool> {
        Ok(self
            .mutation(
                "sessions:deleteSession",
                json!({ "phoneNumber": phone, "idleBefore": cutoff.timestamp_millis() }),
            )
            .await?)
    }

    async fn sweep_expired(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        Ok(self
            .mutation(
                "sessions:sweepExpired",
                json!({ "cutoff": cutoff.timestamp_millis() }),
            )
            .await?)
    }

    async fn list(&self) -> Result<Vec<Session>> {
        let mut docs: Vec<SessionDoc> = self.query("sessions:list", json!({})).await?;
        docs.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(docs.into_iter().map(Session::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_partial_json, header, method, path},
    };

    const T0: i64 = 1_740_823_200_000;

    fn doc(phone: &str, last_activity: i64) -> Value {
        json!({
            "_id": "k1",
            "_creationTime": 1.0,
            "phoneNumber": phone,
            "name": "Alex",
            "email": "alex@example.com",
            "callInitiated": false,
            "callCompleted": false,
            "infoProvided": true,
            "lastActivity": last_activity,
            "createdAt": T0
        })
    }

    fn store(server: &MockServer) -> ConvexSessionStore {
        ConvexSessionStore::new(server.uri(), SecretString::from("prod:key".to_string()))
    }

    #[tokio::test]
    async fn test_get_decodes_document() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/query"))
            .and(header("authorization", "Bearer prod:key"))
            .and(body_partial_json(json!({
                "path": "sessions:get",
                "args": { "phoneNumber": "+1555" },
                "format": "json"
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "status": "success", "value": doc("+1555", T0) })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let session = store(&server).get("+1555").await.unwrap().unwrap();
        assert_eq!(session.phone_number, "+1555");
        assert_eq!(session.name.as_deref(), Some("Alex"));
        assert!(session.info_provided);
        assert_eq!(session.created_at.timestamp_millis(), T0);
        assert!(session.call_time.is_none());
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/query"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "status": "success", "value": null })),
            )
            .mount(&server)
            .await;

        assert!(store(&server).get("+1555").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_sends_only_patched_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/mutation"))
            .and(body_partial_json(json!({
                "path": "sessions:upsert",
                "args": { "phoneNumber": "+1555", "callCompleted": true, "now": T0 + 1000 }
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "status": "success", "value": doc("+1555", T0 + 1000) })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let patch = SessionPatch {
            call_completed: Some(true),
            ..Default::default()
        };
        let session = store(&server)
            .upsert("+1555", &patch, from_millis(T0 + 1000))
            .await
            .unwrap();
        assert_eq!(session.last_activity.timestamp_millis(), T0 + 1000);

        let args = serde_json::to_value(UpsertArgs {
            phone_number: "+1555",
            now: 0,
            name: None,
            email: None,
            call_initiated: None,
            call_completed: Some(true),
            info_provided: None,
            call_time: None,
            call_completed_time: None,
        })
        .unwrap();
        assert_eq!(args, json!({ "phoneNumber": "+1555", "now": 0, "callCompleted": true }));
    }

    #[tokio::test]
    async fn test_function_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/mutation"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "status": "error",
                "errorMessage": "Server Error: Could not find function"
            })))
            .mount(&server)
            .await;

        let err = store(&server).delete("+1555").await.unwrap_err();
        assert!(err.to_string().contains("Could not find function"));
    }

    #[tokio::test]
    async fn test_non_json_error_keeps_http_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/query"))
            .respond_with(
                ResponseTemplate::new(502).set_body_string("<html><body>Bad Gateway</body></html>"),
            )
            .mount(&server)
            .await;

        let err = store(&server).get("+1555").await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("502"), "{message}");
        assert!(message.contains("Bad Gateway"), "{message}");
    }

    #[tokio::test]
    async fn test_delete_if_idle_passes_cutoff() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/mutation"))
            .and(body_partial_json(json!({
                "path": "sessions:deleteSession",
                "args": { "phoneNumber": "+1555", "idleBefore": T0 }
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "status": "success", "value": false })),
            )
            .expect(1)
            .mount(&server)
            .await;

        assert!(!store(&server).delete_if_idle("+1555", from_millis(T0)).await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_and_list() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/mutation"))
            .and(body_partial_json(json!({ "path": "sessions:sweepExpired", "args": { "cutoff": T0 } })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "status": "success", "value": 3 })),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/query"))
            .and(body_partial_json(json!({ "path": "sessions:list" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "value": [doc("+1", T0), doc("+2", T0 + 5000)]
            })))
            .mount(&server)
            .await;

        let convex = store(&server);
        assert_eq!(convex.sweep_expired(from_millis(T0)).await.unwrap(), 3);
        let phones: Vec<String> = convex
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.phone_number)
            .collect();
        assert_eq!(phones, vec!["+2", "+1"]);
    }
}
