//! Invoice client error types.

use thiserror::Error;

use crate::service::ServiceError;

/// Invoice client error type.
#[derive(Debug, Error)]
pub enum InvoiceError {
    #[error("invoice creation failed: {0}")]
    Creation(#[source] ServiceError),

    #[error("failed to fetch signing keys from {endpoint}: {message}")]
    KeyFetch { endpoint: String, message: String },

    #[error("no trusted endpoint registered for identity {0}")]
    Trust(String),

    #[error("unsupported signature type: {0}")]
    UnsupportedSignatureType(String),

    #[error("payload digest does not match envelope digest")]
    DigestMismatch,

    #[error("signature does not verify against any trusted key of {identity}")]
    SignatureInvalid { identity: String },

    #[error("malformed signature envelope: {0}")]
    MalformedEnvelope(String),

    #[error("push channel error: {0}")]
    Channel(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invoice has been destroyed")]
    Destroyed,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl InvoiceError {
    /// Whether the error came out of signature verification.
    ///
    /// Callers handling webhooks must reject the payload whenever this is
    /// `true`; there is no "unverified but proceed" outcome.
    #[must_use]
    pub fn is_verification_failure(&self) -> bool {
        matches!(
            self,
            Self::KeyFetch { .. }
                | Self::Trust(_)
                | Self::UnsupportedSignatureType(_)
                | Self::DigestMismatch
                | Self::SignatureInvalid { .. }
                | Self::MalformedEnvelope(_)
        )
    }
}

/// Invoice client result type.
pub type Result<T> = std::result::Result<T, InvoiceError>;
