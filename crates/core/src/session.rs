//! The per-phone-number session record and its merge-patch semantics.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Contact and call-progress state for a single phone number.
///
/// The phone number is the unique key: a store never holds more than one
/// `Session` for the same normalized number.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Session {
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

/// A partial update to a `Session`. Only the fields that are `Some` are written.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SessionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_initiated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_completed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info_provided: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_completed_time: Option<DateTime<Utc>>,
}

impl SessionPatch {
    /// A patch carrying the contact details a user shared.
    pub fn contact(name: Option<String>, email: String) -> Self {
        Self {
            name,
            email: Some(email),
            info_provided: Some(true),
            ..Default::default()
        }
    }

    pub fn call_initiated(at: DateTime<Utc>) -> Self {
        Self {
            call_initiated: Some(true),
            call_time: Some(at),
            ..Default::default()
        }
    }

    pub fn call_completed(at: DateTime<Utc>) -> Self {
        Self {
            call_completed: Some(true),
            call_completed_time: Some(at),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl Session {
    /// Creates the record for a first contact, with `patch` already applied.
    pub fn new(phone_number: impl Into<String>, patch: &SessionPatch, now: DateTime<Utc>) -> Self {
        let mut session = Self {
            phone_number: phone_number.into(),
            name: None,
            email: None,
            call_initiated: false,
            call_completed: false,
            info_provided: false,
            last_activity: now,
            created_at: now,
            call_time: None,
            call_completed_time: None,
        };
        session.apply(patch, now);
        session
    }

    /// Merges `patch` into the record and refreshes `last_activity`.
    ///
    /// `phone_number` and `created_at` are never changed by a patch.
    pub fn apply(&mut self, patch: &SessionPatch, now: DateTime<Utc>) {
        if let Some(name) = &patch.name {
            self.name = Some(name.clone());
        }
        if let Some(email) = &patch.email {
            self.email = Some(email.clone());
        }
        if let Some(flag) = patch.call_initiated {
            self.call_initiated = flag;
        }
        if let Some(flag) = patch.call_completed {
            self.call_completed = flag;
        }
        if let Some(flag) = patch.info_provided {
            self.info_provided = flag;
        }
        if let Some(at) = patch.call_time {
            self.call_time = Some(at);
        }
        if let Some(at) = patch.call_completed_time {
            self.call_completed_time = Some(at);
        }
        self.last_activity = now;
    }

    /// True when the record has been idle for longer than `retention`.
    pub fn is_expired(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        self.last_activity < now - retention
    }

    /// True once both a name and an email are on file.
    pub fn has_contact_info(&self) -> bool {
        let filled = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        filled(&self.name) && filled(&self.email)
    }
}

/// Strips the `whatsapp:` channel prefix and surrounding whitespace.
///
/// Returns `None` for input that is empty once normalized.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let number = trimmed.strip_prefix("whatsapp:").unwrap_or(trimmed).trim();
    if number.is_empty() {
        None
    } else {
        Some(number.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_normalize_phone() {
        assert_eq!(normalize_phone("whatsapp:+15551234567").as_deref(), Some("+15551234567"));
        assert_eq!(normalize_phone("  +15551234567 ").as_deref(), Some("+15551234567"));
        assert_eq!(normalize_phone("whatsapp: +1555 ").as_deref(), Some("+1555"));
        assert_eq!(normalize_phone("whatsapp:"), None);
        assert_eq!(normalize_phone("   "), None);
    }

    #[test]
    fn test_new_session_applies_patch() {
        let patch = SessionPatch::contact(Some("Alex".into()), "alex@example.com".into());
        let session = Session::new("+1555", &patch, at(9));

        assert_eq!(session.name.as_deref(), Some("Alex"));
        assert_eq!(session.email.as_deref(), Some("alex@example.com"));
        assert!(session.info_provided);
        assert!(!session.call_initiated);
        assert_eq!(session.created_at, at(9));
        assert_eq!(session.last_activity, at(9));
    }

    #[test]
    fn test_apply_only_touches_supplied_fields() {
        let mut session = Session::new(
            "+1555",
            &SessionPatch::contact(Some("Alex".into()), "alex@example.com".into()),
            at(9),
        );

        session.apply(&SessionPatch::call_initiated(at(10)), at(10));

        assert_eq!(session.name.as_deref(), Some("Alex"));
        assert_eq!(session.email.as_deref(), Some("alex@example.com"));
        assert!(session.info_provided);
        assert!(session.call_initiated);
        assert_eq!(session.call_time, Some(at(10)));
        assert_eq!(session.created_at, at(9));
        assert_eq!(session.last_activity, at(10));
    }

    #[test]
    fn test_is_expired_uses_strict_cutoff() {
        let session = Session::new("+1555", &SessionPatch::default(), at(0));
        let retention = Duration::hours(24);

        assert!(!session.is_expired(at(0) + Duration::hours(24), retention));
        assert!(session.is_expired(at(0) + Duration::hours(24) + Duration::seconds(1), retention));
    }

    #[test]
    fn test_has_contact_info() {
        let mut session = Session::new("+1555", &SessionPatch::default(), at(0));
        assert!(!session.has_contact_info());

        session.name = Some("Alex".into());
        session.email = Some("  ".into());
        assert!(!session.has_contact_info());

        session.email = Some("alex@example.com".into());
        assert!(session.has_contact_info());
    }

    #[test]
    fn test_patch_serialization_skips_unset_fields() {
        let patch = SessionPatch {
            call_completed: Some(true),
            ..Default::default()
        };
        let json = serde_json::to_string(&patch).unwrap();
        assert_eq!(json, r#"{"call_completed":true}"#);

        let parsed: SessionPatch = serde_json::from_str("{}").unwrap();
        assert!(parsed.is_empty());
    }
}
