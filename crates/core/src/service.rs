//! Session lifecycle on top of a `SessionStore`.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::info;

use crate::{
    session::{Session, SessionPatch, normalize_phone},
    store::SessionStore,
};

/// Sessions expire after a day without activity unless configured otherwise.
pub const DEFAULT_RETENTION_HOURS: i64 = 24;

/// Applies phone normalization and the retention window to every store access.
#[derive(Clone)]
pub struct SessionService {
    store: Arc<dyn SessionStore>,
    retention: Duration,
}

impl SessionService {
    pub fn new(store: Arc<dyn SessionStore>, retention: Duration) -> Self {
        Self { store, retention }
    }

    fn key(phone: &str) -> Result<String> {
        normalize_phone(phone).ok_or_else(|| anyhow!("phone number must not be empty"))
    }

    /// Returns the live session for `phone`.
    ///
    /// An expired record is deleted on the spot and reported as absent; a live
    /// one has its activity timestamp refreshed. A write that lands between the
    /// expiry check and the delete keeps the record alive.
    pub async fn active_session(&self, phone: &str) -> Result<Option<Session>> {
        let key = Self::key(phone)?;
        let now = Utc::now();
        match self.store.get(&key).await? {
            Some(session) if session.is_expired(now, self.retention) => {
                if self.store.delete_if_idle(&key, now - self.retention).await? {
                    info!(phone = %key, "Session expired");
                    Ok(None)
                } else {
                    self.store.touch(&key, now).await
                }
            }
            Some(_) => self.store.touch(&key, now).await,
            None => Ok(None),
        }
    }

    /// Looks a session up without side effects.
    pub async fn peek(&self, phone: &str) -> Result<Option<Session>> {
        let key = Self::key(phone)?;
        self.store.get(&key).await
    }

    /// Creates or merge-updates the session for `phone`.
    pub async fn record(&self, phone: &str, patch: &SessionPatch) -> Result<Session> {
        self.record_at(phone, patch, Utc::now()).await
    }

    pub async fn record_at(
        &self,
        phone: &str,
        patch: &SessionPatch,
        now: DateTime<Utc>,
    ) -> Result<Session> {
        let key = Self::key(phone)?;
        let session = self.store.upsert(&key, patch, now).await?;
        info!(phone = %key, ?patch, "Session updated");
        Ok(session)
    }

    /// Registers inbound contact: creates the session or bumps its activity.
    pub async fn touch(&self, phone: &str) -> Result<Session> {
        self.record(phone, &SessionPatch::default()).await
    }

    pub async fn has_provided_info(&self, phone: &str) -> Result<bool> {
        Ok(self
            .active_session(phone)
            .await?
            .is_some_and(|s| s.has_contact_info()))
    }

    pub async fn mark_call_initiated(&self, phone: &str) -> Result<Session> {
        let now = Utc::now();
        self.record_at(phone, &SessionPatch::call_initiated(now), now).await
    }

    pub async fn mark_call_completed(&self, phone: &str) -> Result<Session> {
        let now = Utc::now();
        self.record_at(phone, &SessionPatch::call_completed(now), now).await
    }

    /// Deletes the session. Returns whether one existed.
    pub async fn clear(&self, phone: &str) -> Result<bool> {
        let key = Self::key(phone)?;
        let removed = self.store.delete(&key).await?;
        if removed {
            info!(phone = %key, "Session cleared");
        }
        Ok(removed)
    }

    pub async fn list(&self) -> Result<Vec<Session>> {
        self.store.list().await
    }

    /// Deletes every session idle for longer than the retention window.
    pub async fn sweep(&self) -> Result<u64> {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<u64> {
        self.store.sweep_expired(now - self.retention).await
    }
}
