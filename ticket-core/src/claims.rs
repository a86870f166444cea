//! Ticket claims: the signed payload binding an attendee to a registration.

use crate::types::{AttendeeId, EventId, RegistrationId, Timestamp};

/// The fields covered by a ticket's tag.
///
/// Claims are immutable once built. Two claims are the same ticket iff every
/// field is equal; there is no other notion of identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Claims {
    event_id: EventId,
    attendee_id: AttendeeId,
    registration_id: RegistrationId,
    issued_at: Timestamp,
}

impl Claims {
    pub fn new(
        event_id: EventId,
        attendee_id: AttendeeId,
        registration_id: RegistrationId,
        issued_at: Timestamp,
    ) -> Self {
        Self {
            event_id,
            attendee_id,
            registration_id,
            issued_at,
        }
    }

    pub fn event_id(&self) -> &EventId {
        &self.event_id
    }

    pub fn attendee_id(&self) -> &AttendeeId {
        &self.attendee_id
    }

    pub fn registration_id(&self) -> &RegistrationId {
        &self.registration_id
    }

    pub fn issued_at(&self) -> Timestamp {
        self.issued_at
    }
}

/// Builder for claims assembled field by field (e.g. from a form or a row).
#[derive(Debug, Default, Clone)]
pub struct ClaimsBuilder {
    event_id: Option<EventId>,
    attendee_id: Option<AttendeeId>,
    registration_id: Option<RegistrationId>,
    issued_at: Option<Timestamp>,
}

impl ClaimsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_id(mut self, id: impl Into<EventId>) -> Self {
        self.event_id = Some(id.into());
        self
    }

    pub fn attendee_id(mut self, id: impl Into<AttendeeId>) -> Self {
        self.attendee_id = Some(id.into());
        self
    }

    pub fn registration_id(mut self, id: impl Into<RegistrationId>) -> Self {
        self.registration_id = Some(id.into());
        self
    }

    pub fn issued_at(mut self, ts: impl Into<Timestamp>) -> Self {
        self.issued_at = Some(ts.into());
        self
    }

    pub fn build(self) -> Result<Claims, BuildError> {
        Ok(Claims {
            event_id: self.event_id.ok_or(BuildError::MissingField("event_id"))?,
            attendee_id: self.attendee_id.ok_or(BuildError::MissingField("attendee_id"))?,
            registration_id: self
                .registration_id
                .ok_or(BuildError::MissingField("registration_id"))?,
            issued_at: self.issued_at.ok_or(BuildError::MissingField("issued_at"))?,
        })
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
}
