//! Registration store interface.
//!
//! The relational store that owns registrations and tickets lives outside
//! this crate. Implementations must provide `conditional_set_admitted` as a
//! single atomic compare-and-swap on the registration state.

use crate::types::{AttendeeId, EventId, Registration, RegistrationId, RegistrationState, Tag, Timestamp};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// Errors reported by a registration store. Callers may retry any of them.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("conflicting write: {0}")]
    Conflict(String),

    #[error("unknown registration: {0}")]
    UnknownRegistration(RegistrationId),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Persisted ticket: enough to rebuild the token, never the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketRow {
    pub registration_id: RegistrationId,
    /// Canonical CBOR claims exactly as signed.
    pub canonical_claims: Vec<u8>,
    pub tag: Tag,
}

/// Operations this crate needs from the data store.
#[async_trait]
pub trait RegistrationStore: Send + Sync {
    /// Fetch a registration by id.
    async fn get_registration(&self, id: &RegistrationId) -> Result<Option<Registration>, StorageError>;

    /// Atomically set the registration to `Admitted` iff its state is still
    /// `expected`. Returns `true` iff the write happened.
    ///
    /// This must be one conditional write, never a read followed by a write.
    async fn conditional_set_admitted(
        &self,
        id: &RegistrationId,
        expected: RegistrationState,
        admitted_at: Timestamp,
    ) -> Result<bool, StorageError>;

    /// Store the ticket row and move the registration `Created -> TicketIssued`
    /// in one step.
    ///
    /// # Errors
    /// * `UnknownRegistration` if the registration does not exist
    /// * `Conflict` if a ticket already exists or the registration is past `Created`
    async fn insert_ticket(&self, row: TicketRow) -> Result<(), StorageError>;

    /// Fetch the ticket row for a registration.
    async fn get_ticket(&self, id: &RegistrationId) -> Result<Option<TicketRow>, StorageError>;
}

#[derive(Debug, Default)]
struct Tables {
    registrations: HashMap<RegistrationId, Registration>,
    tickets: HashMap<RegistrationId, TicketRow>,
}

/// In-memory store for tests, demos and single-process deployments.
///
/// Every operation runs inside one short critical section, so the
/// conditional update is a true compare-and-swap. The lock is never held
/// across an `.await`.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        tracing::debug!("creating new in-memory registration store");
        Self::default()
    }

    /// Seed a registration in `Created` state, as the registration flow would.
    pub fn register(
        &self,
        id: impl Into<RegistrationId>,
        event_id: impl Into<EventId>,
        attendee_id: impl Into<AttendeeId>,
    ) -> Result<(), StorageError> {
        let id = id.into();
        let mut tables = self.lock()?;
        if tables.registrations.contains_key(&id) {
            return Err(StorageError::Conflict(format!("registration {id} already exists")));
        }
        tables.registrations.insert(
            id.clone(),
            Registration {
                id,
                event_id: event_id.into(),
                attendee_id: attendee_id.into(),
                state: RegistrationState::Created,
                admitted_at: None,
            },
        );
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StorageError> {
        self.tables
            .lock()
            .map_err(|_| StorageError::Unavailable("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl RegistrationStore for MemoryStore {
    async fn get_registration(&self, id: &RegistrationId) -> Result<Option<Registration>, StorageError> {
        Ok(self.lock()?.registrations.get(id).cloned())
    }

    async fn conditional_set_admitted(
        &self,
        id: &RegistrationId,
        expected: RegistrationState,
        admitted_at: Timestamp,
    ) -> Result<bool, StorageError> {
        let mut tables = self.lock()?;
        match tables.registrations.get_mut(id) {
            Some(reg) if reg.state == expected => {
                reg.state = RegistrationState::Admitted;
                reg.admitted_at = Some(admitted_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_ticket(&self, row: TicketRow) -> Result<(), StorageError> {
        let mut tables = self.lock()?;
        let Tables { registrations, tickets } = &mut *tables;

        let reg = registrations
            .get_mut(&row.registration_id)
            .ok_or_else(|| StorageError::UnknownRegistration(row.registration_id.clone()))?;
        if tickets.contains_key(&row.registration_id) || reg.state != RegistrationState::Created {
            return Err(StorageError::Conflict(format!(
                "registration {} already has a ticket",
                row.registration_id
            )));
        }

        reg.state = RegistrationState::TicketIssued;
        tickets.insert(row.registration_id.clone(), row);
        Ok(())
    }

    async fn get_ticket(&self, id: &RegistrationId) -> Result<Option<TicketRow>, StorageError> {
        Ok(self.lock()?.tickets.get(id).cloned())
    }
}
