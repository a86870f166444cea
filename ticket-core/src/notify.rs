//! Hand-off of issued tickets to an outbound sender (email, SMS).
//!
//! This crate only produces the signed artifact and its share link; message
//! formatting and delivery belong to the notifier. Delivery is
//! fire-and-forget: a failed notification never fails issuance.

use crate::token::Token;
use crate::types::{AttendeeId, EventId, RegistrationId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use thiserror::Error;

/// What a notifier receives for each issued ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketNotice {
    pub registration_id: RegistrationId,
    pub event_id: EventId,
    pub attendee_id: AttendeeId,
    pub token: Token,
    /// Human-readable link to the ticket page.
    pub share_link: String,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Outbound sender for ticket notices.
#[async_trait]
pub trait TicketNotifier: Send + Sync {
    /// Provider name for logs (e.g. "resend", "twilio").
    fn channel(&self) -> &str;

    async fn notify(&self, notice: &TicketNotice) -> Result<(), NotifyError>;
}

/// Notifier that records notices in memory. Useful in tests and demos.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<TicketNotice>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notices delivered so far, oldest first.
    pub fn sent(&self) -> Vec<TicketNotice> {
        match self.sent.lock() {
            Ok(sent) => sent.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl TicketNotifier for RecordingNotifier {
    fn channel(&self) -> &str {
        "recording"
    }

    async fn notify(&self, notice: &TicketNotice) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .map_err(|_| NotifyError::Delivery("recorder lock poisoned".to_string()))?
            .push(notice.clone());
        Ok(())
    }
}
