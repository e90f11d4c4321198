//! Trusted signing keys per server identity, refreshed lazily on expiry.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::{InvoiceError, Result};
use crate::service::{SigningKeySource, SigningKeysDocument};

/// Keys published by one trusted server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedKeySet {
    pub identity: String,
    pub endpoint: String,
    pub expiration_date: DateTime<Utc>,
    /// Hex-encoded SEC1 public keys, in the order the server listed them.
    pub public_keys: Vec<String>,
}

impl TrustedKeySet {
    fn from_document(endpoint: &str, document: SigningKeysDocument) -> Self {
        Self {
            identity: document.owner,
            endpoint: endpoint.to_string(),
            expiration_date: document.expiration_date,
            public_keys: document.public_keys,
        }
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expiration_date
    }
}

/// Process-wide cache of trusted key sets, shared behind an `Arc`.
///
/// Entries are replaced wholesale. Fetches run without holding any lock, so
/// refreshing one identity never blocks readers of another.
pub struct KeyStore {
    source: Arc<dyn SigningKeySource>,
    entries: RwLock<HashMap<String, Arc<TrustedKeySet>>>,
    endpoints: RwLock<HashMap<String, String>>,
}

impl KeyStore {
    #[must_use]
    pub fn new(source: Arc<dyn SigningKeySource>) -> Self {
        Self {
            source,
            entries: RwLock::new(HashMap::new()),
            endpoints: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch keys from `endpoint` now and trust the identity that owns them.
    pub async fn register_trusted(&self, endpoint: &str) -> Result<Arc<TrustedKeySet>> {
        let endpoint = normalize_endpoint(endpoint)?;
        let document = self.fetch(&endpoint).await?;
        let key_set = Arc::new(TrustedKeySet::from_document(&endpoint, document));
        self.endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key_set.identity.clone(), endpoint.clone());
        self.store(Arc::clone(&key_set));
        info!(
            "trusted {} via {} ({} keys)",
            key_set.identity,
            endpoint,
            key_set.public_keys.len()
        );
        Ok(key_set)
    }

    /// Trust `identity` without fetching; keys load on first use.
    pub fn trust_endpoint(&self, identity: &str, endpoint: &str) -> Result<()> {
        let endpoint = normalize_endpoint(endpoint)?;
        self.endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(identity.trim().to_string(), endpoint);
        Ok(())
    }

    #[must_use]
    pub fn is_trusted(&self, identity: &str) -> bool {
        self.endpoint_for(identity).is_some()
    }

    /// Current entry for `identity`, expired or not, without any I/O.
    #[must_use]
    pub fn cached(&self, identity: &str) -> Option<Arc<TrustedKeySet>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity)
            .cloned()
    }

    /// Re-fetch keys for a trusted identity and replace its entry.
    ///
    /// On failure the previous entry, if any, stays in place.
    pub async fn refresh(&self, identity: &str) -> Result<Arc<TrustedKeySet>> {
        let endpoint = self
            .endpoint_for(identity)
            .ok_or_else(|| InvoiceError::Trust(identity.to_string()))?;
        let document = self.fetch(&endpoint).await?;
        if document.owner != identity {
            return Err(InvoiceError::KeyFetch {
                endpoint,
                message: format!(
                    "key document owner {} does not match identity {}",
                    document.owner, identity
                ),
            });
        }
        let key_set = Arc::new(TrustedKeySet::from_document(&endpoint, document));
        self.store(Arc::clone(&key_set));
        Ok(key_set)
    }

    /// Keys for `identity`, refreshing when absent or expired.
    ///
    /// When a refresh fails but an older entry exists, the stale entry is
    /// returned so callers that only inspect keys keep working.
    pub async fn get(&self, identity: &str) -> Result<Arc<TrustedKeySet>> {
        match self.resolve(identity, Utc::now()).await {
            Ok(key_set) => Ok(key_set),
            Err(error @ InvoiceError::KeyFetch { .. }) => match self.cached(identity) {
                Some(stale) => {
                    warn!("using stale signing keys for {}: {}", identity, error);
                    Ok(stale)
                }
                None => Err(error),
            },
            Err(error) => Err(error),
        }
    }

    /// Keys for `identity` for a verification attempt. A failed refresh is
    /// reported rather than papered over with stale keys.
    pub(crate) async fn resolve(
        &self,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<Arc<TrustedKeySet>> {
        if let Some(key_set) = self.cached(identity)
            && !key_set.is_expired(now)
        {
            return Ok(key_set);
        }
        self.refresh(identity).await
    }

    fn endpoint_for(&self, identity: &str) -> Option<String> {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity)
            .cloned()
    }

    fn store(&self, key_set: Arc<TrustedKeySet>) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key_set.identity.clone(), key_set);
    }

    async fn fetch(&self, endpoint: &str) -> Result<SigningKeysDocument> {
        self.source
            .fetch_signing_keys(endpoint)
            .await
            .map_err(|error| InvoiceError::KeyFetch {
                endpoint: endpoint.to_string(),
                message: error.to_string(),
            })
    }
}

fn normalize_endpoint(endpoint: &str) -> Result<String> {
    let trimmed = endpoint.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(InvoiceError::InvalidRequest(
            "trusted endpoint must not be empty".to_string(),
        ));
    }
    Ok(trimmed.to_string())
}
