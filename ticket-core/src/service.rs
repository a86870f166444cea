//! Issuance and check-in entry points.
//!
//! ## Issuance
//! claims → canonical bytes → tag → token, then the ticket row is stored and
//! the notifier (if any) gets the token and share link.
//!
//! ## Check-in
//! raw scan → token → canonical bytes → tag check → one-time admission.
//! Scanners only ever learn "admitted", "already admitted", "invalid" or
//! "not found"; everything finer stays in the logs.

use crate::checkin::{AdmitResult, CheckInGate};
use crate::claims::Claims;
use crate::config::TicketConfig;
use crate::crypto::{InvalidCredential, Signer, Verifier};
use crate::notify::{TicketNotice, TicketNotifier};
use crate::serialization::{self, SerializationError};
use crate::store::{RegistrationStore, StorageError, TicketRow};
use crate::token::{Credential, Token};
use crate::types::{AttendeeId, EventId, RegistrationId, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IssueError {
    #[error("failed to encode ticket: {0}")]
    Encode(#[from] SerializationError),

    #[error("ticket ids do not match registration {0}")]
    Mismatch(RegistrationId),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum TicketLookupError {
    #[error("stored ticket for {0} does not verify")]
    Corrupt(RegistrationId),

    #[error("failed to encode ticket: {0}")]
    Encode(#[from] SerializationError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A freshly issued (or re-rendered) ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedTicket {
    pub credential: Credential,
    pub token: Token,
    pub share_link: String,
}

/// Why a scan was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    InvalidCredential,
    NotFound,
}

/// What the scanning front end is told.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckInOutcome {
    Accepted {
        attendee_id: AttendeeId,
        already_admitted: bool,
    },
    Rejected {
        reason: RejectReason,
    },
}

impl CheckInOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, CheckInOutcome::Accepted { .. })
    }
}

/// Wire shape: `{ok: true, attendee_id, already_admitted}` or
/// `{ok: false, reason}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckInResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attendee_id: Option<AttendeeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub already_admitted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
}

impl From<CheckInOutcome> for CheckInResponse {
    fn from(outcome: CheckInOutcome) -> Self {
        match outcome {
            CheckInOutcome::Accepted { attendee_id, already_admitted } => CheckInResponse {
                ok: true,
                attendee_id: Some(attendee_id),
                already_admitted: Some(already_admitted),
                reason: None,
            },
            CheckInOutcome::Rejected { reason } => CheckInResponse {
                ok: false,
                attendee_id: None,
                already_admitted: None,
                reason: Some(reason),
            },
        }
    }
}

impl Serialize for CheckInOutcome {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        CheckInResponse::from(self.clone()).serialize(serializer)
    }
}

/// Issues tickets and admits their holders.
pub struct TicketService {
    signer: Signer,
    verifier: Verifier,
    gate: CheckInGate,
    store: Arc<dyn RegistrationStore>,
    notifier: Option<Arc<dyn TicketNotifier>>,
    share_base_url: String,
}

impl TicketService {
    pub fn new(config: TicketConfig, store: Arc<dyn RegistrationStore>) -> Self {
        Self {
            signer: Signer::new(config.keys.clone()),
            verifier: Verifier::new(config.keys),
            gate: CheckInGate::new(store.clone()),
            store,
            notifier: None,
            share_base_url: config.share_base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn TicketNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn verifier(&self) -> &Verifier {
        &self.verifier
    }

    pub fn gate(&self) -> &CheckInGate {
        &self.gate
    }

    /// Link to the ticket page for a registration.
    pub fn share_link(&self, registration_id: &RegistrationId) -> String {
        format!("{}/ticket/{}", self.share_base_url, registration_id)
    }

    /// Sign a ticket for a registration, persist it and hand it to the
    /// notifier.
    ///
    /// The registration must exist, must belong to `event_id` and
    /// `attendee_id`, and must not have a ticket yet. Notification failures
    /// are logged and otherwise ignored.
    pub async fn issue(
        &self,
        event_id: EventId,
        attendee_id: AttendeeId,
        registration_id: RegistrationId,
        now: Timestamp,
    ) -> Result<IssuedTicket, IssueError> {
        let registration = self
            .store
            .get_registration(&registration_id)
            .await?
            .ok_or_else(|| StorageError::UnknownRegistration(registration_id.clone()))?;
        if registration.event_id != event_id || registration.attendee_id != attendee_id {
            tracing::warn!(%registration_id, "issue requested with ids that disagree with registration");
            return Err(IssueError::Mismatch(registration_id));
        }

        let claims = Claims::new(event_id, attendee_id, registration_id, now);
        let canonical_claims = serialization::encode(&claims)?;
        let credential = self.signer.sign(&claims)?;
        let token = credential.to_token()?;

        self.store
            .insert_ticket(TicketRow {
                registration_id: claims.registration_id().clone(),
                canonical_claims,
                tag: *credential.tag(),
            })
            .await?;

        let issued = IssuedTicket {
            share_link: self.share_link(claims.registration_id()),
            credential,
            token,
        };
        tracing::info!(
            registration_id = %claims.registration_id(),
            event_id = %claims.event_id(),
            key_id = %self.signer.key_id(),
            "ticket issued"
        );

        self.notify(&issued).await;
        Ok(issued)
    }

    async fn notify(&self, issued: &IssuedTicket) {
        let Some(notifier) = &self.notifier else {
            tracing::debug!("no notifier configured, skipping ticket notice");
            return;
        };
        let claims = issued.credential.claims();
        let notice = TicketNotice {
            registration_id: claims.registration_id().clone(),
            event_id: claims.event_id().clone(),
            attendee_id: claims.attendee_id().clone(),
            token: issued.token.clone(),
            share_link: issued.share_link.clone(),
        };
        if let Err(err) = notifier.notify(&notice).await {
            tracing::warn!(
                channel = notifier.channel(),
                registration_id = %notice.registration_id,
                error = %err,
                "ticket notice not delivered"
            );
        }
    }

    /// Verify a scanned ticket and admit its holder at most once.
    ///
    /// Only storage failures are errors; every verdict about the ticket
    /// itself is an `Ok` outcome.
    pub async fn check_in(&self, raw_scanned_bytes: &[u8]) -> Result<CheckInOutcome, StorageError> {
        self.check_in_at(raw_scanned_bytes, Timestamp::now()).await
    }

    /// [`check_in`](Self::check_in) with an explicit admission time.
    pub async fn check_in_at(
        &self,
        raw_scanned_bytes: &[u8],
        now: Timestamp,
    ) -> Result<CheckInOutcome, StorageError> {
        let credential = match self.verifier.verify_scanned(raw_scanned_bytes) {
            Ok(credential) => credential,
            Err(InvalidCredential) => {
                return Ok(CheckInOutcome::Rejected { reason: RejectReason::InvalidCredential })
            }
        };
        let (claims, _) = credential.into_parts();
        let registration_id = claims.registration_id();

        let Some(registration) = self.store.get_registration(registration_id).await? else {
            tracing::warn!(%registration_id, "valid ticket for unknown registration");
            return Ok(CheckInOutcome::Rejected { reason: RejectReason::NotFound });
        };
        if registration.event_id != *claims.event_id() || registration.attendee_id != *claims.attendee_id() {
            tracing::warn!(%registration_id, "ticket claims disagree with registration");
            return Ok(CheckInOutcome::Rejected { reason: RejectReason::InvalidCredential });
        }

        let outcome = match self.gate.admit(registration_id, now).await? {
            AdmitResult::Admitted { .. } => CheckInOutcome::Accepted {
                attendee_id: claims.attendee_id().clone(),
                already_admitted: false,
            },
            AdmitResult::AlreadyAdmitted { .. } => CheckInOutcome::Accepted {
                attendee_id: claims.attendee_id().clone(),
                already_admitted: true,
            },
            AdmitResult::NotFound => CheckInOutcome::Rejected { reason: RejectReason::NotFound },
        };
        Ok(outcome)
    }

    /// Re-render the ticket stored for a registration (the ticket page).
    pub async fn ticket(&self, registration_id: &RegistrationId) -> Result<Option<IssuedTicket>, TicketLookupError> {
        let Some(row) = self.store.get_ticket(registration_id).await? else {
            return Ok(None);
        };

        let claims = serialization::decode(&row.canonical_claims).map_err(|err| {
            tracing::error!(%registration_id, error = %err, "stored ticket claims do not decode");
            TicketLookupError::Corrupt(registration_id.clone())
        })?;
        if claims.registration_id() != registration_id || !self.verifier.verify(&claims, &row.tag) {
            tracing::error!(%registration_id, "stored ticket does not verify");
            return Err(TicketLookupError::Corrupt(registration_id.clone()));
        }

        let credential = Credential::new(claims, row.tag);
        Ok(Some(IssuedTicket {
            share_link: self.share_link(registration_id),
            token: credential.to_token()?,
            credential,
        }))
    }
}

impl std::fmt::Debug for TicketService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketService")
            .field("signer", &self.signer)
            .field("share_base_url", &self.share_base_url)
            .field("notifier", &self.notifier.as_ref().map(|n| n.channel().to_string()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KeyRing, SigningKey};
    use crate::notify::{NotifyError, RecordingNotifier};
    use crate::store::MemoryStore;
    use crate::types::{RegistrationState, Tag};
    use async_trait::async_trait;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    fn keys() -> KeyRing {
        KeyRing::new(SigningKey::new(vec![7u8; 32]).unwrap())
    }

    fn service(store: &MemoryStore) -> TicketService {
        TicketService::new(
            TicketConfig::new(keys()).with_share_base_url("https://tickets.example/"),
            Arc::new(store.clone()),
        )
    }

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store.register("reg1", "evt1", "att1").unwrap();
        store
    }

    async fn issue_reg1(svc: &TicketService) -> IssuedTicket {
        svc.issue("evt1".into(), "att1".into(), "reg1".into(), Timestamp(1000))
            .await
            .unwrap()
    }

    fn accepted(already_admitted: bool) -> CheckInOutcome {
        CheckInOutcome::Accepted { attendee_id: "att1".into(), already_admitted }
    }

    fn rejected(reason: RejectReason) -> CheckInOutcome {
        CheckInOutcome::Rejected { reason }
    }

    #[tokio::test]
    async fn test_issue_then_check_in_twice() {
        let store = seeded();
        let svc = service(&store);
        let ticket = issue_reg1(&svc).await;

        let token = ticket.token.as_str().as_bytes();
        assert_eq!(svc.check_in(token).await.unwrap(), accepted(false));
        assert_eq!(svc.check_in(token).await.unwrap(), accepted(true));

        let reg = store.get_registration(&"reg1".into()).await.unwrap().unwrap();
        assert_eq!(reg.state, RegistrationState::Admitted);
    }

    #[tokio::test]
    async fn test_issued_token_matches_credential() {
        let svc = service(&seeded());
        let ticket = issue_reg1(&svc).await;

        assert_eq!(ticket.credential.to_token().unwrap(), ticket.token);
        assert_eq!(ticket.share_link, "https://tickets.example/ticket/reg1");
        assert_eq!(ticket.credential.claims().issued_at(), Timestamp(1000));
    }

    #[tokio::test]
    async fn test_altered_tag_byte_is_invalid() {
        let svc = service(&seeded());
        let ticket = issue_reg1(&svc).await;

        let mut raw = URL_SAFE_NO_PAD.decode(ticket.token.as_str()).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let forged = URL_SAFE_NO_PAD.encode(raw);

        let outcome = svc.check_in(forged.as_bytes()).await.unwrap();
        assert_eq!(outcome, rejected(RejectReason::InvalidCredential));
    }

    #[tokio::test]
    async fn test_signed_ticket_for_unknown_registration() {
        let svc = service(&seeded());
        let claims = Claims::new("evt1".into(), "att9".into(), "reg9".into(), Timestamp(1000));
        let token = Signer::new(keys()).sign(&claims).unwrap().to_token().unwrap();

        let outcome = svc.check_in(token.as_str().as_bytes()).await.unwrap();
        assert_eq!(outcome, rejected(RejectReason::NotFound));
    }

    #[tokio::test]
    async fn test_garbage_scan_is_invalid() {
        let svc = service(&seeded());
        let scans: [&[u8]; 4] = [b"", b"hello", b"{\"event_id\":\"evt1\"}", &[0xff, 0x00]];
        for raw in scans {
            assert_eq!(svc.check_in(raw).await.unwrap(), rejected(RejectReason::InvalidCredential));
        }
    }

    #[tokio::test]
    async fn test_foreign_key_is_invalid() {
        let svc = service(&seeded());
        issue_reg1(&svc).await;

        let foreign = KeyRing::new(SigningKey::new(vec![8u8; 32]).unwrap());
        let claims = Claims::new("evt1".into(), "att1".into(), "reg1".into(), Timestamp(1000));
        let token = Signer::new(foreign).sign(&claims).unwrap().to_token().unwrap();

        let outcome = svc.check_in(token.as_str().as_bytes()).await.unwrap();
        assert_eq!(outcome, rejected(RejectReason::InvalidCredential));
    }

    #[tokio::test]
    async fn test_claims_mismatch_is_invalid() {
        let store = seeded();
        let svc = service(&store);
        issue_reg1(&svc).await;

        // Correctly signed, but for a different attendee than the registration holds.
        let claims = Claims::new("evt1".into(), "att2".into(), "reg1".into(), Timestamp(1000));
        let token = Signer::new(keys()).sign(&claims).unwrap().to_token().unwrap();

        let outcome = svc.check_in(token.as_str().as_bytes()).await.unwrap();
        assert_eq!(outcome, rejected(RejectReason::InvalidCredential));
        let reg = store.get_registration(&"reg1".into()).await.unwrap().unwrap();
        assert_eq!(reg.state, RegistrationState::TicketIssued);
    }

    #[tokio::test]
    async fn test_second_issue_conflicts() {
        let svc = service(&seeded());
        issue_reg1(&svc).await;

        let err = svc
            .issue("evt1".into(), "att1".into(), "reg1".into(), Timestamp(2000))
            .await
            .unwrap_err();
        assert!(matches!(err, IssueError::Storage(StorageError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_issue_with_wrong_ids_leaves_registration_untouched() {
        let store = seeded();
        let svc = service(&store);

        let err = svc
            .issue("evtX".into(), "attX".into(), "reg1".into(), Timestamp(1000))
            .await
            .unwrap_err();
        assert!(matches!(err, IssueError::Mismatch(ref id) if id.as_str() == "reg1"));

        let err = svc
            .issue("evt1".into(), "attX".into(), "reg1".into(), Timestamp(1000))
            .await
            .unwrap_err();
        assert!(matches!(err, IssueError::Mismatch(_)));

        let reg = store.get_registration(&"reg1".into()).await.unwrap().unwrap();
        assert_eq!(reg.state, RegistrationState::Created);
        assert!(store.get_ticket(&"reg1".into()).await.unwrap().is_none());

        let ticket = issue_reg1(&svc).await;
        let outcome = svc.check_in(ticket.token.as_str().as_bytes()).await.unwrap();
        assert_eq!(
            outcome,
            CheckInOutcome::Accepted { attendee_id: "att1".into(), already_admitted: false }
        );
    }

    #[tokio::test]
    async fn test_issue_for_unknown_registration() {
        let svc = service(&MemoryStore::new());
        let err = svc
            .issue("evt1".into(), "att1".into(), "reg1".into(), Timestamp(1000))
            .await
            .unwrap_err();
        assert!(matches!(err, IssueError::Storage(StorageError::UnknownRegistration(_))));
    }

    #[tokio::test]
    async fn test_notifier_receives_notice() {
        let notifier = Arc::new(RecordingNotifier::new());
        let svc = service(&seeded()).with_notifier(notifier.clone());
        let ticket = issue_reg1(&svc).await;

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].token, ticket.token);
        assert_eq!(sent[0].share_link, ticket.share_link);
        assert_eq!(sent[0].attendee_id, AttendeeId::from("att1"));
    }

    struct BrokenNotifier;

    #[async_trait]
    impl TicketNotifier for BrokenNotifier {
        fn channel(&self) -> &str {
            "broken"
        }

        async fn notify(&self, _notice: &TicketNotice) -> Result<(), NotifyError> {
            Err(NotifyError::Delivery("smtp timeout".to_string()))
        }
    }

    #[tokio::test]
    async fn test_notifier_failure_does_not_fail_issue() {
        let svc = service(&seeded()).with_notifier(Arc::new(BrokenNotifier));
        let ticket = issue_reg1(&svc).await;
        assert_eq!(svc.check_in(ticket.token.as_str().as_bytes()).await.unwrap(), accepted(false));
    }

    #[tokio::test]
    async fn test_ticket_page_lookup() {
        let svc = service(&seeded());
        let issued = issue_reg1(&svc).await;

        let rendered = svc.ticket(&"reg1".into()).await.unwrap().unwrap();
        assert_eq!(rendered, issued);
        assert!(svc.ticket(&"reg2".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ticket_page_rejects_tampered_row() {
        let store = MemoryStore::new();
        store.register("reg1", "evt1", "att1").unwrap();
        let claims = Claims::new("evt1".into(), "att1".into(), "reg1".into(), Timestamp(1000));
        store
            .insert_ticket(TicketRow {
                registration_id: "reg1".into(),
                canonical_claims: serialization::encode(&claims).unwrap(),
                tag: Tag([0u8; 32]),
            })
            .await
            .unwrap();

        let err = service(&store).ticket(&"reg1".into()).await.unwrap_err();
        assert!(matches!(err, TicketLookupError::Corrupt(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_scans_admit_once() {
        const N: usize = 32;
        let svc = Arc::new(service(&seeded()));
        let token = issue_reg1(&svc).await.token;

        let handles: Vec<_> = (0..N)
            .map(|_| {
                let svc = svc.clone();
                let token = token.clone();
                tokio::spawn(async move { svc.check_in(token.as_str().as_bytes()).await })
            })
            .collect();

        let mut first = 0;
        let mut repeat = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                CheckInOutcome::Accepted { already_admitted: false, .. } => first += 1,
                CheckInOutcome::Accepted { already_admitted: true, .. } => repeat += 1,
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!((first, repeat), (1, N - 1));
    }

    #[test]
    fn test_response_wire_shape() {
        let ok = serde_json::to_value(accepted(true)).unwrap();
        assert_eq!(
            ok,
            serde_json::json!({"ok": true, "attendee_id": "att1", "already_admitted": true})
        );

        let bad = serde_json::to_value(rejected(RejectReason::InvalidCredential)).unwrap();
        assert_eq!(bad, serde_json::json!({"ok": false, "reason": "invalid_credential"}));

        let missing = serde_json::to_value(rejected(RejectReason::NotFound)).unwrap();
        assert_eq!(missing, serde_json::json!({"ok": false, "reason": "not_found"}));
    }
}
