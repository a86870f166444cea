//! Canonical CBOR encoding of ticket claims.
//!
//! Signing and verification must hash byte-identical input, so claims always
//! serialize to exactly one byte sequence.
//!
//! ## Canonicalization Rules
//! 1. A single definite-length CBOR map with exactly the declared claim keys
//! 2. Keys are text strings sorted lexicographically
//! 3. Identifiers are CBOR text strings (length-prefixed, no escaping needed)
//! 4. `issued_at` is an integer in minimal form
//! 5. No indefinite-length encoding, no trailing bytes
//!
//! Decoding accepts only bytes that re-encode to themselves.

use crate::claims::Claims;
use crate::types::{AttendeeId, EventId, RegistrationId, Timestamp};
use ciborium::value::Value;
use std::io::Read;
use thiserror::Error;

const ATTENDEE_ID: &str = "attendee_id";
const EVENT_ID: &str = "event_id";
const ISSUED_AT: &str = "issued_at";
const REGISTRATION_ID: &str = "registration_id";

/// The declared claim shape, in canonical (sorted) key order.
pub const CLAIM_FIELDS: [&str; 4] = [ATTENDEE_ID, EVENT_ID, ISSUED_AT, REGISTRATION_ID];

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("CBOR encoding error: {0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("Non-canonical CBOR: {0}")]
    NonCanonical(&'static str),

    #[error("Claims too large to frame: {0} bytes")]
    TooLarge(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure to parse claims or a token. Always a caller-input problem.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed input")]
    Malformed,

    #[error("input truncated")]
    Truncated,

    #[error("unknown claim field: {0}")]
    UnknownField(String),

    #[error("missing claim field: {0}")]
    MissingField(&'static str),
}

pub type Result<T> = std::result::Result<T, SerializationError>;

/// Serialize claims to canonical CBOR bytes.
pub fn encode(claims: &Claims) -> Result<Vec<u8>> {
    let mut entries: Vec<(&str, Value)> = vec![
        (EVENT_ID, Value::Text(claims.event_id().as_str().to_owned())),
        (ATTENDEE_ID, Value::Text(claims.attendee_id().as_str().to_owned())),
        (REGISTRATION_ID, Value::Text(claims.registration_id().as_str().to_owned())),
        (ISSUED_AT, Value::Integer(claims.issued_at().as_millis().into())),
    ];
    entries.sort_by(|a, b| a.0.cmp(b.0));

    let map = Value::Map(
        entries
            .into_iter()
            .map(|(key, value)| (Value::Text(key.to_owned()), value))
            .collect(),
    );

    let mut buf = Vec::new();
    ciborium::into_writer(&map, &mut buf)?;
    verify_canonical(&buf)?;

    Ok(buf)
}

/// Parse canonical CBOR bytes back into claims.
pub fn decode(bytes: &[u8]) -> std::result::Result<Claims, DecodeError> {
    let mut reader = bytes;
    let value: Value = ciborium::from_reader(&mut reader).map_err(|_| DecodeError::Malformed)?;
    let Value::Map(entries) = value else {
        return Err(DecodeError::Malformed);
    };

    let mut event_id = None;
    let mut attendee_id = None;
    let mut registration_id = None;
    let mut issued_at = None;

    for (key, value) in entries {
        let Value::Text(key) = key else {
            return Err(DecodeError::Malformed);
        };
        let slot_taken = match key.as_str() {
            EVENT_ID => event_id.replace(EventId(into_text(value)?)).is_some(),
            ATTENDEE_ID => attendee_id.replace(AttendeeId(into_text(value)?)).is_some(),
            REGISTRATION_ID => registration_id
                .replace(RegistrationId(into_text(value)?))
                .is_some(),
            ISSUED_AT => issued_at.replace(into_timestamp(value)?).is_some(),
            _ => return Err(DecodeError::UnknownField(key)),
        };
        if slot_taken {
            return Err(DecodeError::Malformed);
        }
    }

    let claims = Claims::new(
        event_id.ok_or(DecodeError::MissingField(EVENT_ID))?,
        attendee_id.ok_or(DecodeError::MissingField(ATTENDEE_ID))?,
        registration_id.ok_or(DecodeError::MissingField(REGISTRATION_ID))?,
        issued_at.ok_or(DecodeError::MissingField(ISSUED_AT))?,
    );

    // Key order, integer width and trailing bytes are all pinned by requiring
    // the input to be exactly the canonical encoding.
    match encode(&claims) {
        Ok(canonical) if canonical == bytes => Ok(claims),
        _ => Err(DecodeError::Malformed),
    }
}

fn into_text(value: Value) -> std::result::Result<String, DecodeError> {
    match value {
        Value::Text(s) => Ok(s),
        _ => Err(DecodeError::Malformed),
    }
}

fn into_timestamp(value: Value) -> std::result::Result<Timestamp, DecodeError> {
    let Value::Integer(int) = value else {
        return Err(DecodeError::Malformed);
    };
    i64::try_from(i128::from(int))
        .map(Timestamp)
        .map_err(|_| DecodeError::Malformed)
}

/// Verify that CBOR bytes are in canonical form.
///
/// Checks for:
/// - No indefinite-length encoding (major type with additional info 31)
/// - No reserved additional-info values (28..=30)
fn verify_canonical(bytes: &[u8]) -> Result<()> {
    let mut cursor = std::io::Cursor::new(bytes);
    verify_canonical_item(&mut cursor)?;
    if cursor.position() as usize != bytes.len() {
        return Err(SerializationError::NonCanonical("trailing bytes after item"));
    }
    Ok(())
}

fn verify_canonical_item<R: Read>(reader: &mut R) -> Result<()> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;

    let major_type = (buf[0] & 0xE0) >> 5;
    let additional_info = buf[0] & 0x1F;

    let length = match additional_info {
        0..=23 => additional_info as u64,
        24 => {
            let mut buf = [0u8; 1];
            reader.read_exact(&mut buf)?;
            buf[0] as u64
        }
        25 => {
            let mut buf = [0u8; 2];
            reader.read_exact(&mut buf)?;
            u16::from_be_bytes(buf) as u64
        }
        26 => {
            let mut buf = [0u8; 4];
            reader.read_exact(&mut buf)?;
            u32::from_be_bytes(buf) as u64
        }
        27 => {
            let mut buf = [0u8; 8];
            reader.read_exact(&mut buf)?;
            u64::from_be_bytes(buf)
        }
        31 => return Err(SerializationError::NonCanonical("indefinite-length item")),
        _ => return Err(SerializationError::NonCanonical("reserved additional info")),
    };

    match major_type {
        0 | 1 | 7 => {}
        2 | 3 => {
            let mut sink = std::io::sink();
            let copied = std::io::copy(&mut reader.by_ref().take(length), &mut sink)?;
            if copied != length {
                return Err(SerializationError::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
        }
        4 => {
            for _ in 0..length {
                verify_canonical_item(reader)?;
            }
        }
        5 => {
            for _ in 0..length {
                verify_canonical_item(reader)?; // Key
                verify_canonical_item(reader)?; // Value
            }
        }
        6 => verify_canonical_item(reader)?,
        _ => {}
    }

    Ok(())
}
