//! Postgres-backed registration store (feature `postgres`).
//!
//! Admission is one `UPDATE ... WHERE id = $1 AND state = $2`; the row lock
//! Postgres takes for the update is what serializes concurrent scans.

use crate::store::{RegistrationStore, StorageError, TicketRow};
use crate::types::{AttendeeId, EventId, Registration, RegistrationId, RegistrationState, Tag, Timestamp};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;

/// Tables this store expects, one statement each. Applied by
/// [`PgRegistrationStore::migrate`].
pub const SCHEMA: [&str; 2] = [
    r#"CREATE TABLE IF NOT EXISTS registrations (
    id           TEXT PRIMARY KEY,
    event_id     TEXT NOT NULL,
    attendee_id  TEXT NOT NULL,
    state        TEXT NOT NULL DEFAULT 'created'
                 CHECK (state IN ('created', 'ticket_issued', 'admitted')),
    admitted_at  BIGINT,
    CHECK (state <> 'admitted' OR admitted_at IS NOT NULL)
)"#,
    r#"CREATE TABLE IF NOT EXISTS tickets (
    registration_id   TEXT PRIMARY KEY REFERENCES registrations (id),
    canonical_claims  BYTEA NOT NULL,
    tag               BYTEA NOT NULL CHECK (octet_length(tag) = 32)
)"#,
];

#[derive(Debug, Clone)]
pub struct PgRegistrationStore {
    pool: PgPool,
}

impl PgRegistrationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let pool = PgPool::connect(url).await.map_err(map_err)?;
        Ok(Self::new(pool))
    }

    /// Create the tables if they do not exist yet.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await.map_err(map_err)?;
        }
        Ok(())
    }
}

fn map_err(err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StorageError::Conflict(db.to_string()),
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StorageError::Unavailable(err.to_string())
        }
        other => StorageError::Backend(other.to_string()),
    }
}

fn registration_from_row(row: &PgRow) -> Result<Registration, StorageError> {
    let state: String = row.try_get("state").map_err(map_err)?;
    let state = RegistrationState::parse(&state)
        .ok_or_else(|| StorageError::Backend(format!("unknown registration state {state:?}")))?;
    let admitted_at: Option<i64> = row.try_get("admitted_at").map_err(map_err)?;

    Ok(Registration {
        id: RegistrationId(row.try_get("id").map_err(map_err)?),
        event_id: EventId(row.try_get("event_id").map_err(map_err)?),
        attendee_id: AttendeeId(row.try_get("attendee_id").map_err(map_err)?),
        state,
        admitted_at: admitted_at.map(Timestamp),
    })
}

#[async_trait]
impl RegistrationStore for PgRegistrationStore {
    async fn get_registration(&self, id: &RegistrationId) -> Result<Option<Registration>, StorageError> {
        let row = sqlx::query(
            "SELECT id, event_id, attendee_id, state, admitted_at FROM registrations WHERE id = $1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?;

        row.as_ref().map(registration_from_row).transpose()
    }

    async fn conditional_set_admitted(
        &self,
        id: &RegistrationId,
        expected: RegistrationState,
        admitted_at: Timestamp,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE registrations SET state = 'admitted', admitted_at = $3 \
             WHERE id = $1 AND state = $2",
        )
        .bind(id.as_str())
        .bind(expected.as_str())
        .bind(admitted_at.as_millis())
        .execute(&self.pool)
        .await
        .map_err(map_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn insert_ticket(&self, row: TicketRow) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;

        let moved = sqlx::query(
            "UPDATE registrations SET state = 'ticket_issued' WHERE id = $1 AND state = 'created'",
        )
        .bind(row.registration_id.as_str())
        .execute(&mut *tx)
        .await
        .map_err(map_err)?;

        if moved.rows_affected() != 1 {
            let exists = sqlx::query("SELECT 1 FROM registrations WHERE id = $1")
                .bind(row.registration_id.as_str())
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_err)?
                .is_some();
            tx.rollback().await.map_err(map_err)?;
            return Err(if exists {
                StorageError::Conflict(format!("registration {} already has a ticket", row.registration_id))
            } else {
                StorageError::UnknownRegistration(row.registration_id)
            });
        }

        sqlx::query("INSERT INTO tickets (registration_id, canonical_claims, tag) VALUES ($1, $2, $3)")
            .bind(row.registration_id.as_str())
            .bind(row.canonical_claims.as_slice())
            .bind(row.tag.as_ref())
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;

        tx.commit().await.map_err(map_err)?;
        tracing::debug!(registration_id = %row.registration_id, "ticket row stored");
        Ok(())
    }

    async fn get_ticket(&self, id: &RegistrationId) -> Result<Option<TicketRow>, StorageError> {
        let row = sqlx::query("SELECT canonical_claims, tag FROM tickets WHERE registration_id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let canonical_claims: Vec<u8> = row.try_get("canonical_claims").map_err(map_err)?;
        let tag: Vec<u8> = row.try_get("tag").map_err(map_err)?;
        let tag = Tag::from_slice(&tag)
            .ok_or_else(|| StorageError::Backend(format!("ticket tag for {id} has wrong length")))?;

        Ok(Some(TicketRow {
            registration_id: id.clone(),
            canonical_claims,
            tag,
        }))
    }
}
