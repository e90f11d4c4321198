//! HTTP collaborator: invoice creation and signing-key retrieval.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::invoice::{InvoiceParams, ServerInvoiceSnapshot};

pub const CREATE_INVOICE_PATH: &str = "/invoice/create";
pub const SIGNING_KEYS_PATH: &str = "/signingKeys/paymentProtocol.json";

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invoice_service_base_url_missing")]
    BaseUrlMissing,
    #[error("invoice_service_invalid_path")]
    InvalidPath,
    #[error("invoice_request_failed:{message}")]
    Request { message: String },
    #[error("invoice_read_failed:{message}")]
    Read { message: String },
    #[error("invoice_http_{status}:{body}")]
    Http { status: StatusCode, body: String },
    #[error("invoice_json_decode_failed:{message}")]
    Decode { message: String },
}

/// Body served at `{endpoint}/signingKeys/paymentProtocol.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigningKeysDocument {
    pub owner: String,
    pub expiration_date: DateTime<Utc>,
    pub public_keys: Vec<String>,
}

#[async_trait]
pub trait InvoiceService: Send + Sync {
    /// `POST {endpoint}/invoice/create`. Never retried.
    async fn create_invoice(
        &self,
        params: &InvoiceParams,
    ) -> Result<ServerInvoiceSnapshot, ServiceError>;

    /// POST caller parameters to a merchant-side URL that performs creation
    /// and returns the resulting invoice.
    async fn fetch_from_endpoint(
        &self,
        url: &str,
        params: &Value,
    ) -> Result<ServerInvoiceSnapshot, ServiceError>;
}

#[async_trait]
pub trait SigningKeySource: Send + Sync {
    async fn fetch_signing_keys(&self, endpoint: &str)
    -> Result<SigningKeysDocument, ServiceError>;
}

#[derive(Debug, Clone)]
pub struct HttpInvoiceService {
    base_url: String,
    timeout: Duration,
    key_fetch_attempts: usize,
    http: reqwest::Client,
}

impl HttpInvoiceService {
    pub fn new(config: &ClientConfig) -> Result<Self, ServiceError> {
        Ok(Self {
            base_url: service_url(&config.endpoint, "")?,
            timeout: Duration::from_millis(config.timeout_ms.max(250)),
            key_fetch_attempts: config.key_fetch_attempts.max(1),
            http: reqwest::Client::new(),
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub fn create_url(&self) -> String {
        format!("{}{CREATE_INVOICE_PATH}", self.base_url)
    }

    pub fn signing_keys_url(endpoint: &str) -> Result<String, ServiceError> {
        service_url(endpoint, SIGNING_KEYS_PATH)
    }

    /// Send one request and decode a successful JSON body.
    async fn exchange<T>(&self, request: reqwest::RequestBuilder) -> Result<T, ServiceError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let response = request
            .header("x-request-id", request_id())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|error| ServiceError::Request {
                message: error.to_string(),
            })?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(|error| ServiceError::Read {
            message: error.to_string(),
        })?;
        if !status.is_success() {
            return Err(ServiceError::from_response(status, &bytes));
        }
        serde_json::from_slice(&bytes).map_err(|error| ServiceError::Decode {
            message: error.to_string(),
        })
    }

    async fn post_invoice<Req>(
        &self,
        url: &str,
        payload: &Req,
    ) -> Result<ServerInvoiceSnapshot, ServiceError>
    where
        Req: Serialize + ?Sized,
    {
        debug!("POST {}", url);
        self.exchange(self.http.post(url).json(payload)).await
    }
}

#[async_trait]
impl InvoiceService for HttpInvoiceService {
    async fn create_invoice(
        &self,
        params: &InvoiceParams,
    ) -> Result<ServerInvoiceSnapshot, ServiceError> {
        self.post_invoice(&self.create_url(), params).await
    }

    async fn fetch_from_endpoint(
        &self,
        url: &str,
        params: &Value,
    ) -> Result<ServerInvoiceSnapshot, ServiceError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(ServiceError::InvalidPath);
        }
        self.post_invoice(url, params).await
    }
}

#[async_trait]
impl SigningKeySource for HttpInvoiceService {
    /// Transport failures are retried up to `key_fetch_attempts` times; an
    /// HTTP or decode error ends the fetch at once.
    async fn fetch_signing_keys(
        &self,
        endpoint: &str,
    ) -> Result<SigningKeysDocument, ServiceError> {
        let url = Self::signing_keys_url(endpoint)?;
        let mut attempt = 1;
        loop {
            match self.exchange(self.http.get(url.as_str())).await {
                Err(ServiceError::Request { message }) if attempt < self.key_fetch_attempts => {
                    debug!("signing key fetch attempt {} failed: {}", attempt, message);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

impl ServiceError {
    fn from_response(status: StatusCode, body: &[u8]) -> Self {
        let body = String::from_utf8_lossy(body);
        let body = match body.trim() {
            "" => "<empty>".to_string(),
            trimmed => trimmed.to_string(),
        };
        Self::Http { status, body }
    }
}

fn request_id() -> String {
    format!("req_{}", Uuid::new_v4().simple())
}

/// `endpoint` without trailing slashes, followed by `path`.
fn service_url(endpoint: &str, path: &str) -> Result<String, ServiceError> {
    let base = endpoint.trim().trim_end_matches('/');
    if base.is_empty() {
        return Err(ServiceError::BaseUrlMissing);
    }
    Ok(format!("{base}{path}"))
}
