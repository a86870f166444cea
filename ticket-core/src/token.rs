//! Credentials and their transport encoding.
//!
//! ## Token Layout
//! ```text
//! +---------+----------------+------------------------+-----------+
//! | version | claims_len     | canonical claims (CBOR)| tag       |
//! | 1 byte  | u16 big-endian | claims_len bytes       | 32 bytes  |
//! +---------+----------------+------------------------+-----------+
//! ```
//! The frame is then base64url-encoded without padding, which keeps it safe
//! for URLs and QR payloads.

use crate::claims::Claims;
use crate::serialization::{self, DecodeError, SerializationError};
use crate::types::{Tag, TAG_LEN};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Current token frame version.
pub const TOKEN_VERSION: u8 = 1;

const HEADER_LEN: usize = 3;

/// Claims plus the tag that authenticates them.
///
/// Holding a `Credential` says nothing about validity; only
/// [`Verifier`](crate::crypto::Verifier) establishes that.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    claims: Claims,
    tag: Tag,
}

impl Credential {
    pub fn new(claims: Claims, tag: Tag) -> Self {
        Self { claims, tag }
    }

    pub fn claims(&self) -> &Claims {
        &self.claims
    }

    pub fn tag(&self) -> &Tag {
        &self.tag
    }

    pub fn into_parts(self) -> (Claims, Tag) {
        (self.claims, self.tag)
    }

    pub fn to_token(&self) -> Result<Token, SerializationError> {
        encode_token(self)
    }
}

/// Transport form of a credential (QR payload, URL segment).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn decode(&self) -> Result<Credential, DecodeError> {
        decode_token(&self.0)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Token {
    fn from(s: String) -> Self {
        Token(s)
    }
}

/// Build the binary frame for a claims/tag pair.
fn frame(canonical_claims: &[u8], tag: &Tag) -> Result<Vec<u8>, SerializationError> {
    let claims_len = u16::try_from(canonical_claims.len())
        .map_err(|_| SerializationError::TooLarge(canonical_claims.len()))?;

    let mut buf = Vec::with_capacity(HEADER_LEN + canonical_claims.len() + TAG_LEN);
    buf.push(TOKEN_VERSION);
    buf.extend_from_slice(&claims_len.to_be_bytes());
    buf.extend_from_slice(canonical_claims);
    buf.extend_from_slice(tag.as_ref());
    Ok(buf)
}

/// Pack a credential into a token string.
pub fn encode_token(credential: &Credential) -> Result<Token, SerializationError> {
    let claims = serialization::encode(&credential.claims)?;
    let buf = frame(&claims, &credential.tag)?;
    Ok(Token(URL_SAFE_NO_PAD.encode(buf)))
}

/// Unpack a token string. Never returns a partially-populated credential.
pub fn decode_token(token: &str) -> Result<Credential, DecodeError> {
    let buf = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|_| DecodeError::Malformed)?;

    if buf.len() < HEADER_LEN {
        return Err(DecodeError::Truncated);
    }
    if buf[0] != TOKEN_VERSION {
        return Err(DecodeError::Malformed);
    }

    let claims_len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
    let body = &buf[HEADER_LEN..];
    let expected = claims_len + TAG_LEN;
    if body.len() < expected {
        return Err(DecodeError::Truncated);
    }
    if body.len() > expected {
        return Err(DecodeError::Malformed);
    }

    let (claims_bytes, tag_bytes) = body.split_at(claims_len);
    let claims = serialization::decode(claims_bytes)?;
    let tag = Tag::from_slice(tag_bytes).ok_or(DecodeError::Truncated)?;

    Ok(Credential { claims, tag })
}
