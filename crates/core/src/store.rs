//! Session persistence.
//!
//! `SessionStore` is the seam between the session service and the backing
//! database. Every implementation keys records by normalized phone number and
//! treats writes as last-write-wins merge patches.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::session::{Session, SessionPatch};

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fetches the session for `phone`, if any.
    async fn get(&self, phone: &str) -> Result<Option<Session>>;

    /// Creates the session on first contact or merges `patch` into the existing one.
    async fn upsert(&self, phone: &str, patch: &SessionPatch, now: DateTime<Utc>) -> Result<Session>;

    /// Refreshes `last_activity` without changing anything else.
    async fn touch(&self, phone: &str, now: DateTime<Utc>) -> Result<Option<Session>>;

    /// Removes the session. Returns whether a record existed.
    async fn delete(&self, phone: &str) -> Result<bool>;

    /// Removes the session only if its `last_activity` is still strictly
    /// before `cutoff`. Returns whether it was removed.
    async fn delete_if_idle(&self, phone: &str, cutoff: DateTime<Utc>) -> Result<bool>;

    /// Deletes every session whose `last_activity` is strictly before `cutoff`.
    async fn sweep_expired(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// All sessions, most recently active first.
    async fn list(&self) -> Result<Vec<Session>>;
}

/// A process-local store, optionally mirrored to a JSON file so that local
/// development keeps sessions across restarts.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    snapshot: Option<PathBuf>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a store backed by the JSON snapshot at `path`, loading it if present.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let sessions = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<HashMap<String, Session>>(&bytes)
                .with_context(|| format!("Invalid session snapshot at {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e).context("Failed to read session snapshot"),
        };
        info!(count = sessions.len(), path = %path.display(), "Loaded session snapshot");
        Ok(Self {
            sessions: RwLock::new(sessions),
            snapshot: Some(path),
        })
    }

    async fn persist(&self, sessions: &HashMap<String, Session>) -> Result<()> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let json = serde_json::to_vec_pretty(sessions)?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write session snapshot {}", path.display()))?;
        debug!(count = sessions.len(), "Saved session snapshot");
        Ok(())
    }

    /// Saves the snapshot, or puts back the `undo` entries when the write
    /// fails so memory never runs ahead of disk.
    async fn commit(
        &self,
        sessions: &mut HashMap<String, Session>,
        undo: Vec<(String, Option<Session>)>,
    ) -> Result<()> {
        if let Err(e) = self.persist(sessions).await {
            for (phone, previous) in undo {
                match previous {
                    Some(session) => sessions.insert(phone, session),
                    None => sessions.remove(&phone),
                };
            }
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, phone: &str) -> Result<Option<Session>> {
        Ok(self.sessions.read().await.get(phone).cloned())
    }

    async fn upsert(&self, phone: &str, patch: &SessionPatch, now: DateTime<Utc>) -> Result<Session> {
        let mut sessions = self.sessions.write().await;
        let previous = sessions.get(phone).cloned();
        let session = sessions
            .entry(phone.to_string())
            .and_modify(|s| s.apply(patch, now))
            .or_insert_with(|| Session::new(phone, patch, now))
            .clone();
        self.commit(&mut sessions, vec![(phone.to_string(), previous)])
            .await?;
        Ok(session)
    }

    async fn touch(&self, phone: &str, now: DateTime<Utc>) -> Result<Option<Session>> {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(phone) else {
            return Ok(None);
        };
        let previous = session.clone();
        session.last_activity = now;
        let touched = session.clone();
        self.commit(&mut sessions, vec![(phone.to_string(), Some(previous))])
            .await?;
        Ok(Some(touched))
    }

    async fn delete(&self, phone: &str) -> Result<bool> {
        let mut sessions = self.sessions.write().await;
        let Some(removed) = sessions.remove(phone) else {
            return Ok(false);
        };
        self.commit(&mut sessions, vec![(phone.to_string(), Some(removed))])
            .await?;
        Ok(true)
    }

    async fn delete_if_idle(&self, phone: &str, cutoff: DateTime<Utc>) -> Result<bool> {
        let mut sessions = self.sessions.write().await;
        if !sessions.get(phone).is_some_and(|s| s.last_activity < cutoff) {
            return Ok(false);
        }
        let removed = sessions.remove(phone);
        self.commit(&mut sessions, vec![(phone.to_string(), removed)])
            .await?;
        Ok(true)
    }

    async fn sweep_expired(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut sessions = self.sessions.write().await;
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| s.last_activity < cutoff)
            .map(|(phone, _)| phone.clone())
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }
        let undo: Vec<(String, Option<Session>)> = expired
            .into_iter()
            .map(|phone| {
                let removed = sessions.remove(&phone);
                (phone, removed)
            })
            .collect();
        let removed = undo.len() as u64;
        self.commit(&mut sessions, undo).await?;
        Ok(removed)
    }

    async fn list(&self) -> Result<Vec<Session>> {
        let mut all: Vec<Session> = self.sessions.read().await.values().cloned().collect();
        all.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, hour, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_beyond_timestamp() {
        let store = InMemorySessionStore::new();
        let patch = SessionPatch::contact(Some("Alex".into()), "alex@example.com".into());

        let first = store.upsert("+1555", &patch, at(1)).await.unwrap();
        let second = store.upsert("+1555", &patch, at(2)).await.unwrap();

        assert_eq!(second.last_activity, at(2));
        let normalized = Session {
            last_activity: first.last_activity,
            ..second
        };
        assert_eq!(normalized, first);
    }

    #[tokio::test]
    async fn test_at_most_one_session_per_phone() {
        let store = InMemorySessionStore::new();
        let patches = [
            SessionPatch::default(),
            SessionPatch::contact(None, "a@example.com".into()),
            SessionPatch::call_initiated(at(3)),
            SessionPatch::call_completed(at(4)),
        ];
        for (i, patch) in patches.iter().enumerate() {
            store.upsert("+1555", patch, at(i as u32)).await.unwrap();
            store.upsert("+1666", patch, at(i as u32)).await.unwrap();
        }

        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 2);
        let session = store.get("+1555").await.unwrap().unwrap();
        assert_eq!(session.created_at, at(0));
        assert!(session.call_initiated && session.call_completed);
        assert_eq!(session.email.as_deref(), Some("a@example.com"));
    }

    #[tokio::test]
    async fn test_sweep_removes_exactly_expired_sessions() {
        let store = InMemorySessionStore::new();
        store.upsert("+1", &SessionPatch::default(), at(1)).await.unwrap();
        store.upsert("+2", &SessionPatch::default(), at(5)).await.unwrap();
        store.upsert("+3", &SessionPatch::default(), at(10)).await.unwrap();

        let removed = store.sweep_expired(at(5)).await.unwrap();

        assert_eq!(removed, 1);
        assert!(store.get("+1").await.unwrap().is_none());
        // A record exactly at the cutoff is kept.
        assert_eq!(store.get("+2").await.unwrap().unwrap().last_activity, at(5));
        assert_eq!(store.get("+3").await.unwrap().unwrap().last_activity, at(10));
    }

    #[tokio::test]
    async fn test_touch_and_delete() {
        let store = InMemorySessionStore::new();
        assert!(store.touch("+1", at(1)).await.unwrap().is_none());

        let created = store.upsert("+1", &SessionPatch::default(), at(1)).await.unwrap();
        let touched = store.touch("+1", at(3)).await.unwrap().unwrap();
        assert_eq!(touched.last_activity, at(3));
        assert_eq!(touched.created_at, created.created_at);

        assert!(store.delete("+1").await.unwrap());
        assert!(!store.delete("+1").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_orders_by_recent_activity() {
        let store = InMemorySessionStore::new();
        store.upsert("+1", &SessionPatch::default(), at(1)).await.unwrap();
        store.upsert("+2", &SessionPatch::default(), at(7)).await.unwrap();
        store.upsert("+3", &SessionPatch::default(), at(4)).await.unwrap();

        let phones: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.phone_number)
            .collect();
        assert_eq!(phones, vec!["+2", "+3", "+1"]);
    }

    #[tokio::test]
    async fn test_snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions").join("user_sessions.json");

        {
            let store = InMemorySessionStore::open(&path).await.unwrap();
            store
                .upsert("+1555", &SessionPatch::contact(Some("Alex".into()), "alex@example.com".into()), at(2))
                .await
                .unwrap();
            store.upsert("+1666", &SessionPatch::default(), at(2)).await.unwrap();
            store.delete("+1666").await.unwrap();
        }

        let reopened = InMemorySessionStore::open(&path).await.unwrap();
        let all = reopened.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name.as_deref(), Some("Alex"));
        assert_eq!(all[0].last_activity, at(2));

        let removed = reopened.sweep_expired(at(2) + Duration::seconds(1)).await.unwrap();
        assert_eq!(removed, 1);
        let again = InMemorySessionStore::open(&path).await.unwrap();
        assert!(again.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_rejects_corrupt_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        tokio::fs::write(&path, b"not json").await.unwrap();

        assert!(InMemorySessionStore::open(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_if_idle_keeps_fresh_record() {
        let store = InMemorySessionStore::new();
        store.upsert("+1", &SessionPatch::default(), at(1)).await.unwrap();
        store.upsert("+2", &SessionPatch::default(), at(5)).await.unwrap();

        assert!(store.delete_if_idle("+1", at(5)).await.unwrap());
        // Activity exactly at the cutoff counts as fresh.
        assert!(!store.delete_if_idle("+2", at(5)).await.unwrap());
        assert!(!store.delete_if_idle("+3", at(5)).await.unwrap());

        assert!(store.get("+1").await.unwrap().is_none());
        assert!(store.get("+2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_snapshot_write_leaves_memory_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let sessions_dir = dir.path().join("sessions");
        let path = sessions_dir.join("user_sessions.json");
        let store = InMemorySessionStore::open(&path).await.unwrap();
        store.upsert("+1", &SessionPatch::default(), at(1)).await.unwrap();

        // A plain file where the directory should be makes every write fail.
        tokio::fs::remove_dir_all(&sessions_dir).await.unwrap();
        tokio::fs::write(&sessions_dir, b"").await.unwrap();

        let patch = SessionPatch::contact(None, "a@example.com".into());
        assert!(store.upsert("+1", &patch, at(2)).await.is_err());
        assert!(store.upsert("+2", &SessionPatch::default(), at(2)).await.is_err());
        assert!(store.touch("+1", at(3)).await.is_err());
        assert!(store.delete("+1").await.is_err());
        assert!(store.delete_if_idle("+1", at(9)).await.is_err());
        assert!(store.sweep_expired(at(9)).await.is_err());

        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].last_activity, at(1));
        assert!(all[0].email.is_none());
    }
}
