//! Verification of signed webhook calls and push messages.
//!
//! Both call shapes reduce to `(payload bytes, SignatureEnvelope)`:
//! - webhooks carry the envelope in `digest`, `x-identity`, `x-signature`
//!   and `x-signature-type` headers over the raw request body;
//! - push messages embed `digest`, `identity`, `signature` and
//!   `signatureType` in the message object, and the payload is the object
//!   re-serialized without those fields.
//!
//! The digest is the SHA-256 of the payload and the signature is a secp256k1
//! ECDSA signature over that digest by one of the identity's trusted keys.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1, VerifyOnly, ecdsa::Signature};
use chrono::Utc;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{InvoiceError, Result};
use crate::events::EventKind;
use crate::keystore::KeyStore;

pub const SUPPORTED_SIGNATURE_TYPE: &str = "ECC";

pub const DIGEST_HEADER: &str = "digest";
pub const IDENTITY_HEADER: &str = "x-identity";
pub const SIGNATURE_HEADER: &str = "x-signature";
pub const SIGNATURE_TYPE_HEADER: &str = "x-signature-type";

const ENVELOPE_FIELDS: [&str; 4] = ["digest", "identity", "signature", "signatureType"];

/// Envelope bytes as received: transport-encoded or already raw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodedBytes {
    Base64(String),
    Raw(Vec<u8>),
}

impl EncodedBytes {
    pub fn decode(&self, field: &str) -> Result<Vec<u8>> {
        match self {
            Self::Raw(bytes) => Ok(bytes.clone()),
            Self::Base64(encoded) => BASE64.decode(encoded.trim()).map_err(|error| {
                InvoiceError::MalformedEnvelope(format!("{field} is not valid base64: {error}"))
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureEnvelope {
    pub digest: EncodedBytes,
    pub identity: String,
    pub signature: EncodedBytes,
    pub signature_type: String,
}

impl SignatureEnvelope {
    /// Read the envelope from webhook request headers.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self> {
        let digest = header_value(headers, DIGEST_HEADER)?;
        let digest = strip_digest_algorithm(&digest).to_string();
        Ok(Self {
            digest: EncodedBytes::Base64(digest),
            identity: header_value(headers, IDENTITY_HEADER)?,
            signature: EncodedBytes::Base64(header_value(headers, SIGNATURE_HEADER)?),
            signature_type: header_value(headers, SIGNATURE_TYPE_HEADER)?,
        })
    }

    /// Remove embedded envelope fields from a push message object.
    ///
    /// Returns `None` when the object carries none of them; a partial
    /// envelope is an error.
    pub fn take_from_object(object: &mut Map<String, Value>) -> Result<Option<Self>> {
        let present = ENVELOPE_FIELDS
            .iter()
            .filter(|field| object.contains_key(**field))
            .count();
        if present == 0 {
            return Ok(None);
        }

        let mut take = |field: &str| -> Result<String> {
            match object.remove(field) {
                Some(Value::String(value)) => Ok(value),
                Some(_) => Err(InvoiceError::MalformedEnvelope(format!(
                    "{field} must be a string"
                ))),
                None => Err(InvoiceError::MalformedEnvelope(format!("missing {field}"))),
            }
        };
        let digest = take("digest");
        let identity = take("identity");
        let signature = take("signature");
        let signature_type = take("signatureType");

        Ok(Some(Self {
            digest: EncodedBytes::Base64(digest?),
            identity: identity?,
            signature: EncodedBytes::Base64(signature?),
            signature_type: signature_type?,
        }))
    }
}

/// Which trusted key accepted a signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedSignature {
    pub identity: String,
    pub public_key: String,
}

/// Parsed webhook body, only handed out after verification succeeds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookNotification {
    pub event: String,
    pub invoice_id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WebhookNotification {
    #[must_use]
    pub fn kind(&self) -> Option<EventKind> {
        self.event.parse().ok()
    }
}

pub struct SignatureVerifier {
    keystore: Arc<KeyStore>,
    secp: Secp256k1<VerifyOnly>,
}

impl SignatureVerifier {
    #[must_use]
    pub fn new(keystore: Arc<KeyStore>) -> Self {
        Self {
            keystore,
            secp: Secp256k1::verification_only(),
        }
    }

    #[must_use]
    pub fn keystore(&self) -> &Arc<KeyStore> {
        &self.keystore
    }

    /// Verify `payload` against `envelope`.
    ///
    /// The digest must equal `sha256(payload)` before any signature is
    /// checked; then any one trusted key of the identity may have signed it.
    pub async fn verify(
        &self,
        payload: &[u8],
        envelope: &SignatureEnvelope,
    ) -> Result<VerifiedSignature> {
        if envelope.signature_type != SUPPORTED_SIGNATURE_TYPE {
            return Err(InvoiceError::UnsupportedSignatureType(
                envelope.signature_type.clone(),
            ));
        }

        let digest = envelope.digest.decode("digest")?;
        let signature_bytes = envelope.signature.decode("signature")?;

        let key_set = self
            .keystore
            .resolve(&envelope.identity, Utc::now())
            .await?;

        let computed = Sha256::digest(payload);
        if computed.as_slice() != digest.as_slice() {
            debug!("digest mismatch for payload from {}", envelope.identity);
            return Err(InvoiceError::DigestMismatch);
        }

        let invalid = || InvoiceError::SignatureInvalid {
            identity: envelope.identity.clone(),
        };
        let signature = parse_signature(&signature_bytes).ok_or_else(invalid)?;
        let message = Message::from_digest_slice(&digest).map_err(|_| invalid())?;

        for key_hex in &key_set.public_keys {
            let Some(public_key) = parse_public_key(key_hex) else {
                warn!(
                    "skipping unparseable trusted key {} for {}",
                    key_hex, key_set.identity
                );
                continue;
            };
            if self
                .secp
                .verify_ecdsa(&message, &signature, &public_key)
                .is_ok()
            {
                return Ok(VerifiedSignature {
                    identity: key_set.identity.clone(),
                    public_key: key_hex.clone(),
                });
            }
        }

        Err(invalid())
    }

    /// Verify a structured payload serialized to its canonical bytes.
    pub async fn verify_json(
        &self,
        payload: &Value,
        envelope: &SignatureEnvelope,
    ) -> Result<VerifiedSignature> {
        let bytes = serde_json::to_vec(payload)?;
        self.verify(&bytes, envelope).await
    }

    /// Verify an inbound webhook and parse its body.
    pub async fn verify_webhook(
        &self,
        body: &[u8],
        headers: &HeaderMap,
    ) -> Result<WebhookNotification> {
        let envelope = SignatureEnvelope::from_headers(headers)?;
        self.verify(body, &envelope).await?;
        Ok(serde_json::from_slice(body)?)
    }

    /// Verify and strip the envelope embedded in a push message.
    ///
    /// Unsigned messages pass through as `Ok(None)` unless `require_signed`.
    pub async fn verify_push_payload(
        &self,
        data: &mut Value,
        require_signed: bool,
    ) -> Result<Option<VerifiedSignature>> {
        let envelope = match data.as_object_mut() {
            Some(object) => SignatureEnvelope::take_from_object(object)?,
            None => None,
        };
        match envelope {
            Some(envelope) => self.verify_json(data, &envelope).await.map(Some),
            None if require_signed => Err(InvoiceError::MalformedEnvelope(
                "push message is not signed".to_string(),
            )),
            None => Ok(None),
        }
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Result<String> {
    let value = headers
        .get(name)
        .ok_or_else(|| InvoiceError::MalformedEnvelope(format!("missing {name} header")))?
        .to_str()
        .map_err(|_| InvoiceError::MalformedEnvelope(format!("{name} header is not ASCII")))?
        .trim();
    if value.is_empty() {
        return Err(InvoiceError::MalformedEnvelope(format!("empty {name} header")));
    }
    Ok(value.to_string())
}

/// Accept both a bare digest and the `SHA-256=<base64>` form.
fn strip_digest_algorithm(value: &str) -> &str {
    match value.split_once('=') {
        Some((algorithm, rest)) if algorithm.eq_ignore_ascii_case("sha-256") => rest,
        _ => value,
    }
}

fn parse_signature(bytes: &[u8]) -> Option<Signature> {
    let mut signature = Signature::from_der(bytes)
        .or_else(|_| Signature::from_compact(bytes))
        .ok()?;
    signature.normalize_s();
    Some(signature)
}

fn parse_public_key(key_hex: &str) -> Option<PublicKey> {
    let bytes = hex::decode(key_hex.trim()).ok()?;
    PublicKey::from_slice(&bytes).ok()
}
