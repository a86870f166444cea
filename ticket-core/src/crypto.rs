//! Keyed tags over canonical claims.
//!
//! Tags are HMAC-SHA256 over [`serialization::encode`](crate::serialization::encode).
//! Keys are always passed in explicitly through a [`KeyRing`]; nothing here
//! reads process-wide configuration.

use crate::claims::Claims;
use crate::serialization::{self, SerializationError};
use crate::token::{decode_token, Credential};
use crate::types::{Tag, TAG_LEN};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use subtle::{Choice, ConstantTimeEq};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Minimum accepted key length in bytes.
pub const MIN_KEY_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("signing key must be at least {MIN_KEY_LEN} bytes, got {0}")]
    TooShort(usize),

    #[error("signing key is not valid base64url")]
    Encoding,
}

/// A ticket was rejected. Deliberately carries no detail.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("invalid credential")]
pub struct InvalidCredential;

/// Secret HMAC key. The material is never printed.
#[derive(Clone)]
pub struct SigningKey {
    secret: Vec<u8>,
    mac: HmacSha256,
    key_id: [u8; 4],
}

impl SigningKey {
    pub fn new(secret: impl Into<Vec<u8>>) -> Result<Self, KeyError> {
        let secret = secret.into();
        if secret.len() < MIN_KEY_LEN {
            return Err(KeyError::TooShort(secret.len()));
        }
        let mac = HmacSha256::new_from_slice(&secret).map_err(|_| KeyError::TooShort(secret.len()))?;
        let digest = Sha256::digest(&secret);
        let key_id = [digest[0], digest[1], digest[2], digest[3]];
        Ok(Self { secret, mac, key_id })
    }

    /// Generate a new random 256-bit key.
    pub fn generate() -> Self {
        use rand::rngs::OsRng;
        let mut secret = vec![0u8; MIN_KEY_LEN];
        OsRng.fill_bytes(&mut secret);
        match Self::new(secret) {
            Ok(key) => key,
            Err(_) => unreachable!("generated key has the minimum length"),
        }
    }

    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        let secret = URL_SAFE_NO_PAD
            .decode(encoded.trim().trim_end_matches('='))
            .map_err(|_| KeyError::Encoding)?;
        Self::new(secret)
    }

    pub fn to_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.secret)
    }

    /// Short public fingerprint (first 4 bytes of SHA-256 of the key), for logs.
    pub fn key_id(&self) -> String {
        self.key_id.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn tag(&self, message: &[u8]) -> Tag {
        let mut mac = self.mac.clone();
        mac.update(message);
        let out: [u8; TAG_LEN] = mac.finalize().into_bytes().into();
        Tag(out)
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("key_id", &self.key_id())
            .finish_non_exhaustive()
    }
}

/// Ordered set of currently-trusted keys. The first key signs; all verify.
#[derive(Debug, Clone)]
pub struct KeyRing {
    active: SigningKey,
    retired: Vec<SigningKey>,
}

impl KeyRing {
    pub fn new(active: SigningKey) -> Self {
        Self { active, retired: Vec::new() }
    }

    /// Add a verification-only key (e.g. the previous key during rotation).
    pub fn with_trusted(mut self, key: SigningKey) -> Self {
        self.retired.push(key);
        self
    }

    pub fn active(&self) -> &SigningKey {
        &self.active
    }

    pub fn iter(&self) -> impl Iterator<Item = &SigningKey> {
        std::iter::once(&self.active).chain(self.retired.iter())
    }
}

/// Compute the tag for `claims` under `key`.
pub fn sign(claims: &Claims, key: &SigningKey) -> Result<Tag, SerializationError> {
    let message = serialization::encode(claims)?;
    Ok(key.tag(&message))
}

/// Check `tag` against every trusted key in constant time.
///
/// All keys are always tried; the comparison never stops at the first
/// differing byte or the first matching key.
pub fn verify(claims: &Claims, tag: &Tag, keys: &KeyRing) -> bool {
    let message = match serialization::encode(claims) {
        Ok(message) => message,
        Err(err) => {
            tracing::warn!(error = %err, "failed to encode claims for verification");
            return false;
        }
    };

    let mut matched = Choice::from(0);
    for key in keys.iter() {
        let expected = key.tag(&message);
        matched |= expected.0.ct_eq(&tag.0);
    }
    bool::from(matched)
}

/// Signs claims with the active key of a [`KeyRing`].
#[derive(Debug, Clone)]
pub struct Signer {
    keys: KeyRing,
}

impl Signer {
    pub fn new(keys: KeyRing) -> Self {
        Self { keys }
    }

    pub fn sign(&self, claims: &Claims) -> Result<Credential, SerializationError> {
        let tag = sign(claims, self.keys.active())?;
        Ok(Credential::new(claims.clone(), tag))
    }

    pub fn key_id(&self) -> String {
        self.keys.active().key_id()
    }
}

/// Stateless credential verifier. Safe to share across any number of scans.
#[derive(Debug, Clone)]
pub struct Verifier {
    keys: KeyRing,
}

impl Verifier {
    pub fn new(keys: KeyRing) -> Self {
        Self { keys }
    }

    pub fn verify(&self, claims: &Claims, tag: &Tag) -> bool {
        verify(claims, tag, &self.keys)
    }

    /// Decode and authenticate a token.
    ///
    /// Decode failures and tag mismatches are indistinguishable to the
    /// caller; the reason only goes to the log.
    pub fn verify_token(&self, token: &str) -> Result<Credential, InvalidCredential> {
        let credential = decode_token(token).map_err(|err| {
            tracing::warn!(error = %err, "rejected ticket: undecodable token");
            InvalidCredential
        })?;

        if !self.verify(credential.claims(), credential.tag()) {
            tracing::warn!(
                registration_id = %credential.claims().registration_id(),
                "rejected ticket: tag mismatch"
            );
            return Err(InvalidCredential);
        }

        Ok(credential)
    }

    /// Verify the raw bytes handed over by a scanner.
    ///
    /// Scanners commonly append a newline; surrounding ASCII whitespace is
    /// ignored. Non-UTF-8 input is rejected.
    pub fn verify_scanned(&self, raw: &[u8]) -> Result<Credential, InvalidCredential> {
        let text = std::str::from_utf8(raw).map_err(|_| {
            tracing::warn!(len = raw.len(), "rejected ticket: scan is not UTF-8");
            InvalidCredential
        })?;
        self.verify_token(text.trim_matches(|c: char| c.is_ascii_whitespace()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timestamp;

    fn key(byte: u8) -> SigningKey {
        SigningKey::new(vec![byte; 32]).unwrap()
    }

    fn claims() -> Claims {
        Claims::new("evt1".into(), "att1".into(), "reg1".into(), Timestamp(1000))
    }

    #[test]
    fn test_rejects_short_key() {
        assert_eq!(SigningKey::new(vec![1u8; 31]).unwrap_err(), KeyError::TooShort(31));
    }

    #[test]
    fn test_known_answer() {
        // HMAC-SHA256(key = 0x07 * 32, encode(claims)) computed independently.
        let message = serialization::encode(&claims()).unwrap();
        let mut mac = HmacSha256::new_from_slice(&[7u8; 32]).unwrap();
        mac.update(&message);
        let expected = mac.finalize().into_bytes();
        assert_eq!(sign(&claims(), &key(7)).unwrap().0.as_slice(), expected.as_slice());
    }

    #[test]
    fn test_sign_verify() {
        let ring = KeyRing::new(key(7));
        let tag = sign(&claims(), ring.active()).unwrap();
        assert!(verify(&claims(), &tag, &ring));
    }

    #[test]
    fn test_wrong_key_fails() {
        let tag = sign(&claims(), &key(7)).unwrap();
        assert!(!verify(&claims(), &tag, &KeyRing::new(key(8))));
    }

    #[test]
    fn test_altered_claims_fail() {
        let ring = KeyRing::new(key(7));
        let tag = sign(&claims(), ring.active()).unwrap();
        let altered = Claims::new("evt1".into(), "att2".into(), "reg1".into(), Timestamp(1000));
        assert!(!verify(&altered, &tag, &ring));
    }

    #[test]
    fn test_retired_key_still_verifies() {
        let old = key(1);
        let tag = sign(&claims(), &old).unwrap();
        let ring = KeyRing::new(key(2)).with_trusted(old);
        assert_eq!(ring.iter().count(), 2);
        assert!(verify(&claims(), &tag, &ring));
    }

    #[test]
    fn test_base64_key_roundtrip() {
        let generated = SigningKey::generate();
        let parsed = SigningKey::from_base64(&generated.to_base64()).unwrap();
        assert_eq!(parsed.key_id(), generated.key_id());
        assert_eq!(SigningKey::from_base64("***").unwrap_err(), KeyError::Encoding);
    }

    #[test]
    fn test_debug_redacts_secret() {
        let secret = key(0xab);
        let rendered = format!("{secret:?}");
        assert!(!rendered.contains(&secret.to_base64()));
        assert!(rendered.contains("key_id"));
    }

    #[test]
    fn test_verify_scanned_trims_whitespace() {
        let ring = KeyRing::new(key(7));
        let credential = Signer::new(ring.clone()).sign(&claims()).unwrap();
        let token = credential.to_token().unwrap();
        let scanned = format!("{}\r\n", token.as_str());

        let verified = Verifier::new(ring).verify_scanned(scanned.as_bytes()).unwrap();
        assert_eq!(verified, credential);
    }

    #[test]
    fn test_verify_scanned_rejects_non_utf8() {
        let verifier = Verifier::new(KeyRing::new(key(7)));
        assert_eq!(verifier.verify_scanned(&[0xff, 0xfe]), Err(InvalidCredential));
    }
}
