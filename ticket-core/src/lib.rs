//! # Ticket Core
//!
//! Signed event tickets: canonical claims encoding, keyed-MAC credentials
//! and one-time check-in.
//!
//! ## Key Features
//! - **Canonical CBOR claims**: one byte string per claim set, strict decode
//! - **HMAC-SHA256 credentials**: constant-time verification, key rotation
//! - **URL-safe tokens**: versioned frame, base64url without padding
//! - **Atomic admission**: conditional write, so one scan wins per ticket

pub mod checkin;
pub mod claims;
pub mod config;
pub mod crypto;
pub mod notify;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod serialization;
pub mod service;
pub mod store;
pub mod token;
pub mod types;

pub use checkin::{AdmitResult, CheckInGate};
pub use claims::{Claims, ClaimsBuilder};
pub use config::{ConfigError, TicketConfig};
pub use crypto::{InvalidCredential, KeyError, KeyRing, Signer, SigningKey, Verifier};
pub use notify::{RecordingNotifier, TicketNotice, TicketNotifier};
pub use serialization::{DecodeError, SerializationError};
pub use service::{
    CheckInOutcome, CheckInResponse, IssueError, IssuedTicket, RejectReason, TicketLookupError, TicketService,
};
pub use store::{MemoryStore, RegistrationStore, StorageError};
pub use token::{Credential, Token};
pub use types::*;

#[cfg(feature = "postgres")]
pub use postgres::PgRegistrationStore;
