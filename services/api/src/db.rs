//! Data Access Layer
//!
//! PostgreSQL-backed `SessionStore`. Queries are built at runtime with
//! `sqlx::query_as` and mapped through `FromRow`, so the crate builds without a
//! live database.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use superconnector_core::{Session, SessionPatch, SessionStore};

const COLUMNS: &str = "phone_number, name, email, call_initiated, call_completed, info_provided, \
                       last_activity, created_at, call_time, call_completed_time";

#[derive(FromRow, Debug)]
struct SessionRow {
    phone_number: String,
    name: Option<String>,
    email: Option<String>,
    call_initiated: bool,
    call_completed: bool,
    info_provided: bool,
    last_activity: DateTime<Utc>,
    created_at: DateTime<Utc>,
    call_time: Option<DateTime<Utc>>,
    call_completed_time: Option<DateTime<Utc>>,
}

impl From<SessionRow> for Session {
    fn from(row: SessionRow) -> Self {
        Session {
            phone_number: row.phone_number,
            name: row.name,
            email: row.email,
            call_initiated: row.call_initiated,
            call_completed: row.call_completed,
            info_provided: row.info_provided,
            last_activity: row.last_activity,
            created_at: row.created_at,
            call_time: row.call_time,
            call_completed_time: row.call_completed_time,
        }
    }
}

/// A wrapper around the `PgPool` implementing `SessionStore`.
#[derive(Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    /// Creates a new `PgSessionStore` instance.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs all pending `sqlx` migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn get(&self, phone: &str) -> Result<Option<Session>> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {COLUMNS} FROM sessions WHERE phone_number = $1"
        ))
        .bind(phone)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Session::from))
    }

    /// Inserts the first-contact record or merges the patch: every column whose
    /// parameter is NULL keeps its stored value.
    async fn upsert(&self, phone: &str, patch: &SessionPatch, now: DateTime<Utc>) -> Result<Session> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            r#"
            INSERT INTO sessions (
                phone_number, name, email, call_initiated, call_completed, info_provided,
                last_activity, created_at, call_time, call_completed_time
            )
            VALUES (
                $1, $2, $3, COALESCE($4, FALSE), COALESCE($5, FALSE), COALESCE($6, FALSE),
                $7, $7, $8, $9
            )
            ON CONFLICT (phone_number) DO UPDATE SET
                name = COALESCE($2, sessions.name),
                email = COALESCE($3, sessions.email),
                call_initiated = COALESCE($4, sessions.call_initiated),
                call_completed = COALESCE($5, sessions.call_completed),
                info_provided = COALESCE($6, sessions.info_provided),
                last_activity = $7,
                call_time = COALESCE($8, sessions.call_time),
                call_completed_time = COALESCE($9, sessions.call_completed_time)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(phone)
        .bind(patch.name.as_deref())
        .bind(patch.email.as_deref())
        .bind(patch.call_initiated)
        .bind(patch.call_completed)
        .bind(patch.info_provided)
        .bind(now)
        .bind(patch.call_time)
        .bind(patch.call_completed_time)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn touch(&self, phone: &str, now: DateTime<Utc>) -> Result<Option<Session>> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "UPDATE sessions SET last_activity = $2 WHERE phone_number = $1 RETURNING {COLUMNS}"
        ))
        .bind(phone)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Session::from))
    }

    async fn delete(&self, phone: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sessions WHERE phone_number = $1")
            .bind(phone)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_if_idle(&self, phone: &str, cutoff: DateTime<Utc>) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM sessions WHERE phone_number = $1 AND last_activity < $2")
                .bind(phone)
                .bind(cutoff)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn sweep_expired(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE last_activity < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn list(&self) -> Result<Vec<Session>> {
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {COLUMNS} FROM sessions ORDER BY last_activity DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Session::from).collect())
    }
}
