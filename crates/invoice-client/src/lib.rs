//! Client for a hosted invoice payment service.
//!
//! The crate covers two concerns:
//! - invoice lifecycle: create once, count down to expiry, follow push
//!   updates and tear down on `broadcasted`/`expired`
//! - verification of signed webhook calls and push messages against keys
//!   published by trusted servers

pub mod channel;
pub mod config;
pub mod countdown;
pub mod error;
pub mod events;
pub mod invoice;
pub mod keystore;
pub mod lifecycle;
pub mod service;
pub mod signatures;

pub use channel::{
    ControlMessage, MemoryPushConnector, PushChannel, PushConnector, PushMessage,
    WebSocketConnector,
};
pub use config::{ClientConfig, ConfigError};
pub use error::{InvoiceError, Result};
pub use events::{EventBus, EventCallback, EventKind, EventPayload, InvoiceEvent};
pub use invoice::{
    InvoiceBehavior, InvoiceDetails, InvoiceOutput, InvoiceParams, InvoiceState, InvoiceStatus,
    ServerInvoiceSnapshot, ServiceLocators, StaticOptions, WebhookEvent,
};
pub use keystore::{KeyStore, TrustedKeySet};
pub use lifecycle::{LifecycleCoordinator, LifecycleDeps};
pub use service::{
    HttpInvoiceService, InvoiceService, ServiceError, SigningKeySource, SigningKeysDocument,
};
pub use signatures::{
    EncodedBytes, SignatureEnvelope, SignatureVerifier, VerifiedSignature, WebhookNotification,
};
