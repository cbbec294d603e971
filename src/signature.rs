//! Content-bound signature hashes for legally significant actions.
//!
//! A signature hash is a keyed BLAKE3 digest over the canonical CBOR
//! encoding of the record's identifying fields, binding signer, document,
//! content, and context (time/ip/agent) together. Altering any of them
//! after signing makes verification fail. Records are immutable: re-signing
//! a document produces a fresh, independent record.

use chrono::Utc;

use crate::error::{JourneyError, Result};
use crate::time::TimeStamp;

/// Inputs captured at the moment of signing.
#[derive(Debug, Clone)]
pub struct SignRequest {
    pub signer_id: String,
    pub document_id: String,
    pub document_version: String,
    pub content: String,
    pub signed_at: TimeStamp<Utc>,
    pub ip: String,
    pub user_agent: String,
}

/// Immutable, self-verifying record of one signature event.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct SignatureRecord {
    #[n(0)]
    pub signer_id: String,
    #[n(1)]
    pub document_id: String,
    #[n(2)]
    pub document_version: String,
    /// SHA-256 of the signed content; the keyed hash covers this digest,
    /// binding the record to the content without storing it.
    #[n(3)]
    pub content_hash: String,
    #[n(4)]
    pub signed_at: TimeStamp<Utc>,
    #[n(5)]
    pub ip: String,
    #[n(6)]
    pub user_agent: String,
    /// Hex-encoded keyed BLAKE3 digest over the canonical payload.
    #[n(7)]
    pub signature_hash: String,
}

/// Canonical byte layout hashed by sign/verify. Field order is fixed by the
/// CBOR indices, so both sides always serialize identically.
#[derive(minicbor::Encode)]
struct SignaturePayload<'a> {
    #[n(0)]
    signer_id: &'a str,
    #[n(1)]
    document_id: &'a str,
    #[n(2)]
    document_version: &'a str,
    #[n(3)]
    content_hash: &'a str,
    #[n(4)]
    signed_at: TimeStamp<Utc>,
    #[n(5)]
    ip: &'a str,
    #[n(6)]
    user_agent: &'a str,
}

/// Pad or truncate key material to exactly 32 bytes for BLAKE3 keyed mode.
fn padded_key(key: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    let n = key.len().min(32);
    out[..n].copy_from_slice(&key[..n]);
    out
}

pub struct SignatureVerifier {
    secret: [u8; 32],
}

impl SignatureVerifier {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            secret: padded_key(secret),
        }
    }

    fn keyed_digest(&self, record: &SignatureRecord) -> Result<blake3::Hash> {
        let payload = SignaturePayload {
            signer_id: &record.signer_id,
            document_id: &record.document_id,
            document_version: &record.document_version,
            content_hash: &record.content_hash,
            signed_at: record.signed_at.clone(),
            ip: &record.ip,
            user_agent: &record.user_agent,
        };
        let cbor = minicbor::to_vec(&payload).map_err(|e| JourneyError::Encoding(e.to_string()))?;
        Ok(blake3::keyed_hash(&self.secret, &cbor))
    }

    /// Produce a signature record for `request`.
    pub fn sign(&self, request: SignRequest) -> Result<SignatureRecord> {
        if request.signer_id.is_empty() {
            return Err(JourneyError::Validation("signer_id is empty".into()));
        }
        if request.document_id.is_empty() {
            return Err(JourneyError::Validation("document_id is empty".into()));
        }
        if request.content.is_empty() {
            return Err(JourneyError::Validation("content is empty".into()));
        }

        let mut record = SignatureRecord {
            signer_id: request.signer_id,
            document_id: request.document_id,
            document_version: request.document_version,
            content_hash: sha256::digest(request.content.as_bytes()),
            signed_at: request.signed_at,
            ip: request.ip,
            user_agent: request.user_agent,
            signature_hash: String::new(),
        };
        record.signature_hash = hex::encode(self.keyed_digest(&record)?.as_bytes());

        Ok(record)
    }

    /// Recompute the keyed hash from the record's own fields and compare it
    /// to the stored one in constant time. A malformed stored hash verifies
    /// as `false` rather than erroring: either way the record cannot be
    /// trusted.
    pub fn verify(&self, record: &SignatureRecord) -> Result<bool> {
        let computed = self.keyed_digest(record)?;

        let stored: [u8; 32] = match hex::decode(&record.signature_hash) {
            Ok(bytes) => match bytes.try_into() {
                Ok(arr) => arr,
                Err(_) => return Ok(false),
            },
            Err(_) => return Ok(false),
        };

        // blake3::Hash equality is constant-time
        Ok(computed == blake3::Hash::from_bytes(stored))
    }
}
