//! One-time admission of a registration.
//!
//! ## State Machine
//! ```text
//! Created --(ticket inserted)--> TicketIssued --(admit)--> Admitted
//! ```
//! `Admitted` is terminal. The `TicketIssued -> Admitted` edge is taken with
//! a single conditional write against the store, so concurrent scans of the
//! same ticket serialize at the storage layer: exactly one caller observes
//! [`AdmitResult::Admitted`], every other one observes
//! [`AdmitResult::AlreadyAdmitted`].

use crate::store::{RegistrationStore, StorageError};
use crate::types::{RegistrationId, RegistrationState, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Outcome of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AdmitResult {
    /// This call performed the transition.
    Admitted { admitted_at: Timestamp },
    /// The registration was already admitted; nothing changed.
    AlreadyAdmitted { admitted_at: Timestamp },
    /// No such registration, or no ticket was ever issued for it.
    NotFound,
}

/// Drives the `TicketIssued -> Admitted` transition.
#[derive(Clone)]
pub struct CheckInGate {
    store: Arc<dyn RegistrationStore>,
}

impl CheckInGate {
    pub fn new(store: Arc<dyn RegistrationStore>) -> Self {
        Self { store }
    }

    /// Admit a registration at most once.
    ///
    /// Idempotent: repeating the call for an admitted registration returns
    /// `AlreadyAdmitted` and never rewrites `admitted_at`. Storage errors are
    /// returned unchanged for the caller to retry.
    pub async fn admit(
        &self,
        registration_id: &RegistrationId,
        now: Timestamp,
    ) -> Result<AdmitResult, StorageError> {
        let written = self
            .store
            .conditional_set_admitted(registration_id, RegistrationState::TicketIssued, now)
            .await?;
        if written {
            tracing::info!(%registration_id, admitted_at = %now, "registration admitted");
            return Ok(AdmitResult::Admitted { admitted_at: now });
        }

        // The write lost or was not applicable; the read only classifies why.
        let result = match self.store.get_registration(registration_id).await? {
            Some(reg) if reg.state == RegistrationState::Admitted => {
                let admitted_at = reg.admitted_at.ok_or_else(|| {
                    StorageError::Backend(format!("registration {registration_id} admitted without a time"))
                })?;
                tracing::info!(%registration_id, "duplicate admission attempt");
                AdmitResult::AlreadyAdmitted { admitted_at }
            }
            Some(reg) => {
                tracing::warn!(%registration_id, state = %reg.state, "admit attempted before ticket issue");
                AdmitResult::NotFound
            }
            None => AdmitResult::NotFound,
        };
        Ok(result)
    }
}

impl std::fmt::Debug for CheckInGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckInGate").finish_non_exhaustive()
    }
}
