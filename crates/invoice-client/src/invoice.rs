//! Invoice parameters, server-assigned facts and derived status.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{InvoiceError, Result};
use crate::events::EventKind;

/// A single payment output: pay `amount` native units to an address or script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    pub amount: u64,
}

/// Lifecycle events a webhook endpoint can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEvent {
    Requested,
    Broadcasting,
    Broadcasted,
    Confirmed,
}

impl WebhookEvent {
    /// Events registered when `set_webhook` is called without an explicit list.
    pub const DEFAULT: [Self; 3] = [Self::Broadcasting, Self::Broadcasted, Self::Confirmed];
}

/// Reuse settings for a static invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<u64>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_seconds_option"
    )]
    pub valid_until: Option<DateTime<Utc>>,
}

/// Caller-set invoice parameters, posted verbatim to `/invoice/create`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceParams {
    #[serde(default)]
    pub outputs: Vec<InvoiceOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo_paid: Option<String>,
    /// Seconds until a normal invoice expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merchant_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_data: Option<Value>,
    #[serde(default, rename = "webhook", skip_serializing_if = "BTreeMap::is_empty")]
    pub webhooks: BTreeMap<WebhookEvent, String>,
    #[serde(default, rename = "static", skip_serializing_if = "Option::is_none")]
    pub static_invoice: Option<StaticOptions>,
}

impl InvoiceParams {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_address(mut self, address: impl Into<String>, amount: u64) -> Self {
        self.outputs.push(InvoiceOutput {
            address: Some(address.into()),
            script: None,
            amount,
        });
        self
    }

    pub fn add_script(mut self, script: impl Into<String>, amount: u64) -> Self {
        self.outputs.push(InvoiceOutput {
            address: None,
            script: Some(script.into()),
            amount,
        });
        self
    }

    pub fn set_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }

    /// Memo shown to the payer once the invoice has been paid.
    pub fn set_memo_paid(mut self, memo: impl Into<String>) -> Self {
        self.memo_paid = Some(memo.into());
        self
    }

    pub fn set_expires(mut self, seconds: u64) -> Self {
        self.expires = Some(seconds);
        self
    }

    pub fn set_user_currency(mut self, currency: impl Into<String>) -> Self {
        self.user_currency = Some(currency.into().to_ascii_uppercase());
        self
    }

    pub fn set_merchant_data(mut self, data: impl Into<String>) -> Self {
        self.merchant_data = Some(data.into());
        self
    }

    pub fn set_private_data(mut self, data: Value) -> Self {
        self.private_data = Some(data);
        self
    }

    /// Register `url` for each of `events`; an empty list means [`WebhookEvent::DEFAULT`].
    pub fn set_webhook(mut self, url: impl Into<String>, events: &[WebhookEvent]) -> Self {
        let url = url.into();
        let events: &[WebhookEvent] = if events.is_empty() {
            &WebhookEvent::DEFAULT
        } else {
            events
        };
        for event in events {
            self.webhooks.insert(*event, url.clone());
        }
        self
    }

    pub fn set_static(mut self, quantity: Option<u64>, valid_until: Option<DateTime<Utc>>) -> Self {
        self.static_invoice = Some(StaticOptions {
            quantity,
            valid_until,
        });
        self
    }

    #[must_use]
    pub fn is_static(&self) -> bool {
        self.static_invoice.is_some()
    }

    /// Reject parameters the service could never accept.
    pub fn validate(&self) -> Result<()> {
        if self.outputs.is_empty() {
            return Err(InvoiceError::InvalidRequest(
                "invoice requires at least one output".to_string(),
            ));
        }
        for output in &self.outputs {
            if output.address.is_none() == output.script.is_none() {
                return Err(InvoiceError::InvalidRequest(
                    "each output needs exactly one of address or script".to_string(),
                ));
            }
            if output.amount == 0 {
                return Err(InvoiceError::InvalidRequest(
                    "output amount must be positive".to_string(),
                ));
            }
        }
        if self.is_static() && self.expires.is_some() {
            return Err(InvoiceError::InvalidRequest(
                "static invoices do not take an expiry".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceBehavior {
    #[default]
    Normal,
    Static,
}

/// Server-assigned invoice facts.
///
/// Push messages usually carry only part of this block, so every field is
/// optional on the wire and later reports are merged with [`Self::merge`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceDetails {
    #[serde(default)]
    pub behavior: Option<InvoiceBehavior>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub time: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default)]
    pub memo: Option<String>,
    #[serde(default)]
    pub total_native: Option<u64>,
    #[serde(default)]
    pub total_fiat: Option<f64>,
    #[serde(default)]
    pub fiat_currency: Option<String>,
    #[serde(default)]
    pub tx_ids: Option<Vec<String>>,
    /// Times a static invoice has been paid.
    #[serde(default)]
    pub uses: Option<u64>,
}

impl InvoiceDetails {
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.behavior == Some(InvoiceBehavior::Static)
    }

    /// Fold a later report into these details.
    ///
    /// `behavior`, `time` and `expires` are fixed once known. Every other
    /// field changes only when the report carries it.
    pub fn merge(&mut self, update: Self) {
        keep_first(&mut self.behavior, update.behavior);
        keep_first(&mut self.time, update.time);
        keep_first(&mut self.expires, update.expires);
        take_reported(&mut self.memo, update.memo);
        take_reported(&mut self.total_native, update.total_native);
        take_reported(&mut self.total_fiat, update.total_fiat);
        take_reported(&mut self.fiat_currency, update.fiat_currency);
        take_reported(&mut self.tx_ids, update.tx_ids);
        take_reported(&mut self.uses, update.uses);
    }
}

fn keep_first<T>(slot: &mut Option<T>, reported: Option<T>) {
    if slot.is_none() {
        *slot = reported;
    }
}

fn take_reported<T>(slot: &mut Option<T>, reported: Option<T>) {
    if reported.is_some() {
        *slot = reported;
    }
}

/// Server-issued URIs for a live invoice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceLocators {
    #[serde(default, rename = "walletURI")]
    pub wallet_uri: Option<String>,
    #[serde(default, rename = "paymentURI")]
    pub payment_uri: Option<String>,
    #[serde(default, rename = "stateURI")]
    pub state_uri: Option<String>,
    #[serde(default, rename = "webSocketURI")]
    pub web_socket_uri: Option<String>,
}

impl ServiceLocators {
    /// Take every locator the report carries; keep the rest.
    pub fn merge(&mut self, update: Self) {
        take_reported(&mut self.wallet_uri, update.wallet_uri);
        take_reported(&mut self.payment_uri, update.payment_uri);
        take_reported(&mut self.state_uri, update.state_uri);
        take_reported(&mut self.web_socket_uri, update.web_socket_uri);
    }
}

/// The mergeable subset of an invoice as reported by the service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerInvoiceSnapshot {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub details: Option<InvoiceDetails>,
    #[serde(default)]
    pub service: Option<ServiceLocators>,
}

impl ServerInvoiceSnapshot {
    /// Lenient parse of an invoice object embedded in a push message.
    ///
    /// Fields that do not match the expected shape are dropped rather than
    /// failing the whole message.
    #[must_use]
    pub fn from_message(data: &Value) -> Self {
        let id = data
            .get("id")
            .or_else(|| data.get("invoiceId"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let details = data
            .get("details")
            .and_then(|value| serde_json::from_value(value.clone()).ok());
        let service = data
            .get("service")
            .and_then(|value| serde_json::from_value(value.clone()).ok());
        Self {
            id,
            details,
            service,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceStatus {
    PendingCreation,
    AwaitingPayment,
    Requested,
    Broadcasting,
    Broadcasted,
    Confirmed,
    Expired,
    Failed,
}

impl InvoiceStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PendingCreation => "pending-creation",
            Self::AwaitingPayment => "awaiting-payment",
            Self::Requested => "requested",
            Self::Broadcasting => "broadcasting",
            Self::Broadcasted => "broadcasted",
            Self::Confirmed => "confirmed",
            Self::Expired => "expired",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Broadcasted | Self::Confirmed | Self::Expired | Self::Failed
        )
    }
}

/// Payment progress reported by lifecycle events, ordered by how far along it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Stage {
    Requested,
    Broadcasting,
    Expired,
    Broadcasted,
    Confirmed,
}

/// In-memory state of one invoice.
#[derive(Debug, Clone, Default)]
pub struct InvoiceState {
    id: Option<String>,
    params: InvoiceParams,
    details: Option<InvoiceDetails>,
    service: Option<ServiceLocators>,
    stage: Option<Stage>,
    creation_failed: bool,
}

impl InvoiceState {
    #[must_use]
    pub fn new(params: InvoiceParams) -> Self {
        Self {
            params,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    #[must_use]
    pub fn params(&self) -> &InvoiceParams {
        &self.params
    }

    #[must_use]
    pub fn details(&self) -> Option<&InvoiceDetails> {
        self.details.as_ref()
    }

    #[must_use]
    pub fn service(&self) -> Option<&ServiceLocators> {
        self.service.as_ref()
    }

    /// A static invoice per the server, or per the caller before creation.
    #[must_use]
    pub fn is_static(&self) -> bool {
        match self.details.as_ref().and_then(|details| details.behavior) {
            Some(behavior) => behavior == InvoiceBehavior::Static,
            None => self.params.is_static(),
        }
    }

    /// Expiry instant of a normal invoice; `None` for static invoices.
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        if self.is_static() {
            return None;
        }
        self.details.as_ref().and_then(|details| details.expires)
    }

    /// Merge a server report. The id is write-once; details and locators
    /// merge field by field.
    pub fn apply_server_update(&mut self, snapshot: ServerInvoiceSnapshot) {
        match (&self.id, snapshot.id) {
            (None, Some(id)) => self.id = Some(id),
            (Some(current), Some(reported)) if *current != reported => {
                warn!(
                    "ignoring server attempt to reassign invoice id {} -> {}",
                    current, reported
                );
            }
            _ => {}
        }
        if let Some(details) = snapshot.details {
            match &mut self.details {
                Some(current) => current.merge(details),
                None => self.details = Some(details),
            }
        }
        if let Some(service) = snapshot.service {
            match &mut self.service {
                Some(current) => current.merge(service),
                None => self.service = Some(service),
            }
        }
    }

    /// Fold a dispatched lifecycle event into the derived status.
    ///
    /// Progress never moves backwards, so a late `requested` after
    /// `broadcasted` is ignored. `failed` is observational once the invoice
    /// exists.
    pub fn record_event(&mut self, kind: EventKind) {
        let stage = match kind {
            EventKind::Requested => Stage::Requested,
            EventKind::Broadcasting => Stage::Broadcasting,
            EventKind::Broadcasted => Stage::Broadcasted,
            EventKind::Confirmed => Stage::Confirmed,
            EventKind::Expired => Stage::Expired,
            EventKind::Failed => {
                if self.id.is_none() {
                    self.creation_failed = true;
                }
                return;
            }
            EventKind::Created | EventKind::Subscribed | EventKind::Timer => return,
        };
        if self.stage.is_none_or(|current| stage > current) {
            self.stage = Some(stage);
        }
    }

    #[must_use]
    pub fn status(&self, now: DateTime<Utc>) -> InvoiceStatus {
        if self.id.is_none() {
            return if self.creation_failed {
                InvoiceStatus::Failed
            } else {
                InvoiceStatus::PendingCreation
            };
        }
        match self.stage {
            Some(Stage::Confirmed) => InvoiceStatus::Confirmed,
            Some(Stage::Broadcasted) => InvoiceStatus::Broadcasted,
            Some(Stage::Expired) => InvoiceStatus::Expired,
            Some(Stage::Broadcasting) => InvoiceStatus::Broadcasting,
            Some(Stage::Requested) | None => {
                if self.expires_at().is_some_and(|expires| now > expires) {
                    InvoiceStatus::Expired
                } else if self.stage.is_some() {
                    InvoiceStatus::Requested
                } else {
                    InvoiceStatus::AwaitingPayment
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;

    use super::*;

    fn live_snapshot(id: &str, expires_in: i64) -> ServerInvoiceSnapshot {
        let now = Utc::now();
        ServerInvoiceSnapshot {
            id: Some(id.to_string()),
            details: Some(InvoiceDetails {
                time: Some(now),
                expires: Some(now + Duration::seconds(expires_in)),
                ..InvoiceDetails::default()
            }),
            service: Some(ServiceLocators {
                web_socket_uri: Some("wss://pay.example.com/ws".to_string()),
                ..ServiceLocators::default()
            }),
        }
    }

    #[test]
    fn params_serialize_with_wire_names() {
        let params = InvoiceParams::new()
            .add_address("bitcoincash:qpm2qsznhks23z7629mms6s4cwef74vcwvy22gdx6a", 100_000)
            .set_expires(900)
            .set_memo("order 42")
            .set_user_currency("usd")
            .set_webhook("https://shop.example.com/hook", &[])
            .set_private_data(json!({"order": 42}));

        let value = serde_json::to_value(&params).expect("serialize params");
        assert_eq!(value["outputs"][0]["amount"], json!(100_000));
        assert!(value["outputs"][0].get("script").is_none());
        assert_eq!(value["expires"], json!(900));
        assert_eq!(value["userCurrency"], json!("USD"));
        assert_eq!(value["privateData"]["order"], json!(42));
        assert_eq!(
            value["webhook"],
            json!({
                "broadcasting": "https://shop.example.com/hook",
                "broadcasted": "https://shop.example.com/hook",
                "confirmed": "https://shop.example.com/hook"
            })
        );
        assert!(value.get("static").is_none());
    }

    #[test]
    fn validation_rejects_unusable_params() {
        assert!(InvoiceParams::new().validate().is_err());
        assert!(InvoiceParams::new().add_address("addr", 0).validate().is_err());
        assert!(
            InvoiceParams::new()
                .add_script("76a914", 10)
                .set_static(Some(5), None)
                .set_expires(60)
                .validate()
                .is_err()
        );
        assert!(InvoiceParams::new().add_script("76a914", 10).validate().is_ok());
    }

    #[test]
    fn id_is_write_once() {
        let mut state = InvoiceState::new(InvoiceParams::new().add_address("addr", 1));
        state.apply_server_update(live_snapshot("inv_1", 900));
        state.apply_server_update(ServerInvoiceSnapshot {
            id: Some("inv_2".to_string()),
            details: Some(InvoiceDetails {
                memo: Some("updated".to_string()),
                ..InvoiceDetails::default()
            }),
            service: None,
        });

        assert_eq!(state.id(), Some("inv_1"));
        // The rest of the second snapshot still merges.
        assert_eq!(
            state.details().and_then(|details| details.memo.as_deref()),
            Some("updated")
        );
    }

    #[test]
    fn partial_push_update_keeps_creation_details() {
        let mut state = InvoiceState::new(InvoiceParams::new().add_address("addr", 100_000));
        let mut created = live_snapshot("inv_1", 900);
        if let Some(details) = created.details.as_mut() {
            details.behavior = Some(InvoiceBehavior::Normal);
            details.total_native = Some(100_000);
        }
        state.apply_server_update(created);
        let expires = state.expires_at();
        assert!(expires.is_some());

        state.apply_server_update(ServerInvoiceSnapshot::from_message(&json!({
            "id": "inv_1",
            "details": {"txIds": ["ff"]},
            "service": {"paymentURI": "https://pay.example.com/invoice/pay/inv_1"}
        })));

        assert_eq!(state.expires_at(), expires);
        assert!(!state.is_static());
        let details = state.details().expect("details");
        assert_eq!(details.total_native, Some(100_000));
        assert_eq!(details.tx_ids, Some(vec!["ff".to_string()]));
        let service = state.service().expect("service");
        assert_eq!(service.web_socket_uri.as_deref(), Some("wss://pay.example.com/ws"));
        assert!(service.payment_uri.is_some());
    }

    #[test]
    fn behavior_and_expiry_are_fixed_once_known() {
        let mut state = InvoiceState::default();
        let mut created = live_snapshot("inv_static", 900);
        if let Some(details) = created.details.as_mut() {
            details.behavior = Some(InvoiceBehavior::Static);
            details.uses = Some(1);
        }
        state.apply_server_update(created);
        let time = state.details().and_then(|details| details.time);

        state.apply_server_update(ServerInvoiceSnapshot::from_message(&json!({
            "id": "inv_static",
            "details": {"behavior": "normal", "time": 1, "expires": 2, "uses": 2}
        })));

        assert!(state.is_static());
        assert!(state.expires_at().is_none());
        let details = state.details().expect("details");
        assert_eq!(details.time, time);
        assert_eq!(details.uses, Some(2));
    }

    #[test]
    fn partial_snapshot_keeps_existing_fields() {
        let mut state = InvoiceState::default();
        state.apply_server_update(live_snapshot("inv_1", 900));
        state.apply_server_update(ServerInvoiceSnapshot {
            id: None,
            details: None,
            service: None,
        });
        assert!(state.details().is_some());
        assert!(state.service().is_some());
    }

    #[test]
    fn status_follows_creation_and_events() {
        let now = Utc::now();
        let mut state = InvoiceState::new(InvoiceParams::new().add_address("addr", 1));
        assert_eq!(state.status(now), InvoiceStatus::PendingCreation);

        state.record_event(EventKind::Failed);
        assert_eq!(state.status(now), InvoiceStatus::Failed);

        state.apply_server_update(live_snapshot("inv_1", 900));
        assert_eq!(state.status(now), InvoiceStatus::AwaitingPayment);

        state.record_event(EventKind::Requested);
        assert_eq!(state.status(now), InvoiceStatus::Requested);

        state.record_event(EventKind::Failed);
        assert_eq!(state.status(now), InvoiceStatus::Requested);

        state.record_event(EventKind::Broadcasted);
        state.record_event(EventKind::Requested);
        assert_eq!(state.status(now), InvoiceStatus::Broadcasted);
        assert!(state.status(now).is_terminal());

        state.record_event(EventKind::Confirmed);
        assert_eq!(state.status(now).as_str(), "confirmed");
    }

    #[test]
    fn status_derives_expiry_from_details() {
        let mut state = InvoiceState::default();
        state.apply_server_update(live_snapshot("inv_1", 30));
        assert_eq!(
            state.status(Utc::now() + Duration::seconds(31)),
            InvoiceStatus::Expired
        );

        let mut static_state = InvoiceState::default();
        let mut snapshot = live_snapshot("inv_static", 30);
        if let Some(details) = snapshot.details.as_mut() {
            details.behavior = Some(InvoiceBehavior::Static);
        }
        static_state.apply_server_update(snapshot);
        assert!(static_state.expires_at().is_none());
        assert_eq!(
            static_state.status(Utc::now() + Duration::days(30)),
            InvoiceStatus::AwaitingPayment
        );
    }

    #[test]
    fn snapshot_from_message_is_lenient() {
        let snapshot = ServerInvoiceSnapshot::from_message(&json!({
            "invoiceId": "inv_9",
            "details": {"behavior": "static", "uses": 3, "txIds": ["aa"]},
            "service": "not-an-object"
        }));
        assert_eq!(snapshot.id.as_deref(), Some("inv_9"));
        let details = snapshot.details.expect("details");
        assert!(details.is_static());
        assert_eq!(details.uses, Some(3));
        assert_eq!(details.tx_ids, Some(vec!["aa".to_string()]));
        assert!(details.expires.is_none());
        assert!(snapshot.service.is_none());
    }
}
