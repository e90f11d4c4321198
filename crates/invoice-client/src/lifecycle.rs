//! Invoice lifecycle coordination.
//!
//! A [`LifecycleCoordinator`] owns one invoice. `create()` posts it (once),
//! then a driver task runs the expiry countdown and the push-channel
//! subscription until the invoice reaches `broadcasted`/`expired` or the
//! caller calls `destroy()`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::channel::{
    ControlMessage, PushChannel, PushConnector, PushMessage, WebSocketConnector,
};
use crate::config::ClientConfig;
use crate::countdown::{Countdown, CountdownTick, TICK_INTERVAL};
use crate::error::{InvoiceError, Result};
use crate::events::{EventBus, EventKind, EventPayload, InvoiceEvent};
use crate::invoice::{InvoiceParams, InvoiceState, InvoiceStatus, ServerInvoiceSnapshot};
use crate::keystore::KeyStore;
use crate::service::{HttpInvoiceService, InvoiceService, ServiceError};
use crate::signatures::{SignatureVerifier, WebhookNotification};

/// Collaborators shared by coordinators.
#[derive(Clone)]
pub struct LifecycleDeps {
    pub config: ClientConfig,
    pub service: Arc<dyn InvoiceService>,
    pub connector: Arc<dyn PushConnector>,
    pub verifier: Option<Arc<SignatureVerifier>>,
}

impl LifecycleDeps {
    #[must_use]
    pub fn new(
        config: ClientConfig,
        service: Arc<dyn InvoiceService>,
        connector: Arc<dyn PushConnector>,
    ) -> Self {
        Self {
            config,
            service,
            connector,
            verifier: None,
        }
    }

    #[must_use]
    pub fn with_verifier(mut self, verifier: Arc<SignatureVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// HTTP service, websocket push channel and, when the config lists
    /// trusted endpoints, a verifier whose keys are fetched up front.
    pub async fn from_config(config: ClientConfig) -> Result<Self> {
        let service = Arc::new(
            HttpInvoiceService::new(&config)
                .map_err(|error| InvoiceError::InvalidRequest(error.to_string()))?,
        );
        let connector = Arc::new(WebSocketConnector::from_config(&config));

        let verifier = if config.trusted_endpoints.is_empty() {
            None
        } else {
            let keystore = Arc::new(KeyStore::new(service.clone()));
            for endpoint in &config.trusted_endpoints {
                keystore.register_trusted(endpoint).await?;
            }
            Some(Arc::new(SignatureVerifier::new(keystore)))
        };

        Ok(Self {
            config,
            service,
            connector,
            verifier,
        })
    }
}

#[derive(Default)]
struct Teardown {
    requested: AtomicBool,
    notify: Notify,
}

impl Teardown {
    fn trigger(&self) {
        if !self.requested.swap(true, Ordering::SeqCst) {
            self.notify.notify_one();
        }
    }

    fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

struct Shared {
    config: ClientConfig,
    service: Arc<dyn InvoiceService>,
    connector: Arc<dyn PushConnector>,
    verifier: Option<Arc<SignatureVerifier>>,
    state: Mutex<InvoiceState>,
    bus: EventBus,
    teardown: Arc<Teardown>,
    /// Serializes state mutation with the event dispatch that follows it.
    dispatch: tokio::sync::Mutex<()>,
}

impl Shared {
    fn state(&self) -> std::sync::MutexGuard<'_, InvoiceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn report_failure(&self, message: String) {
        let _dispatch = self.dispatch.lock().await;
        self.emit_failure(message);
    }

    /// Caller holds `dispatch`.
    fn emit_failure(&self, message: String) {
        self.state().record_event(EventKind::Failed);
        self.bus
            .emit(&InvoiceEvent::new(EventKind::Failed, EventPayload::Error(message)));
    }

    /// Merge a lifecycle message into the state and fire its event.
    ///
    /// The dispatch lock is held from the id check through the emit, so
    /// concurrent callers are handled in the order they reach it, however
    /// long each verification takes. Returns `false` when the message was
    /// dropped.
    async fn apply_message(&self, kind: EventKind, mut data: Value) -> bool {
        let _dispatch = self.dispatch.lock().await;
        let reported = ServerInvoiceSnapshot::from_message(&data).id;
        let current = self.state().id().map(str::to_string);
        if let (Some(current), Some(reported)) = (current, reported)
            && current != reported
        {
            debug!(
                "ignoring '{}' message for invoice {} (tracking {})",
                kind.as_str(),
                reported,
                current
            );
            return false;
        }

        if let Some(verifier) = &self.verifier {
            if let Err(error) = verifier
                .verify_push_payload(&mut data, self.config.require_signed_messages)
                .await
            {
                warn!("rejected '{}' message: {}", kind.as_str(), error);
                self.emit_failure(error.to_string());
                return false;
            }
        } else if self.config.require_signed_messages {
            warn!("rejected '{}' message: no verifier configured", kind.as_str());
            self.emit_failure("signed messages required but no verifier configured".to_string());
            return false;
        }

        {
            let mut state = self.state();
            state.apply_server_update(ServerInvoiceSnapshot::from_message(&data));
            state.record_event(kind);
        }
        self.bus
            .emit(&InvoiceEvent::new(kind, EventPayload::Message(data)));
        true
    }

    async fn handle_push(&self, message: PushMessage) {
        match message.kind() {
            Some(kind) if kind.is_push_event() => {
                self.apply_message(kind, message.data).await;
            }
            _ => debug!("ignoring push event '{}'", message.event),
        }
    }

    async fn handle_tick(&self, countdown: &mut Countdown) {
        let Some(tick) = countdown.tick(Instant::now()) else {
            return;
        };
        let _dispatch = self.dispatch.lock().await;
        let event = match tick {
            CountdownTick::Remaining(seconds) => {
                InvoiceEvent::new(EventKind::Timer, EventPayload::SecondsRemaining(seconds))
            }
            CountdownTick::Expired => {
                self.state().record_event(EventKind::Expired);
                InvoiceEvent::new(EventKind::Expired, EventPayload::Empty)
            }
        };
        self.bus.emit(&event);
    }

    async fn open_channel(&self, url: &str, invoice_id: &str) -> Option<Box<dyn PushChannel>> {
        let mut channel = match self.connector.connect(url).await {
            Ok(channel) => channel,
            Err(error) => {
                warn!("push channel connect to {} failed: {}", url, error);
                self.report_failure(error.to_string()).await;
                return None;
            }
        };
        let subscribe = ControlMessage::Subscribe {
            invoice_id: invoice_id.to_string(),
        };
        if let Err(error) = channel.send(&subscribe).await {
            warn!("subscribe for {} failed: {}", invoice_id, error);
            self.report_failure(error.to_string()).await;
            let _ = channel.close().await;
            return None;
        }
        Some(channel)
    }
}

async fn next_message(channel: &mut Option<Box<dyn PushChannel>>) -> Option<PushMessage> {
    match channel {
        Some(channel) => channel.recv().await,
        None => std::future::pending().await,
    }
}

/// Countdown and push subscription for a live invoice.
async fn drive(
    shared: Arc<Shared>,
    invoice_id: String,
    push_url: Option<String>,
    expires: Option<DateTime<Utc>>,
) {
    let mut channel = match (shared.config.listen, push_url) {
        (true, Some(url)) => shared.open_channel(&url, &invoice_id).await,
        (true, None) => {
            warn!("invoice {} has no push-channel locator", invoice_id);
            None
        }
        (false, _) => None,
    };

    let mut countdown = expires.map(Countdown::until);
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if shared.teardown.is_requested() {
            break;
        }
        let counting = countdown
            .as_ref()
            .is_some_and(|countdown| !countdown.is_finished());
        if channel.is_none() && !counting {
            break;
        }

        tokio::select! {
            () = shared.teardown.notify.notified() => break,
            _ = ticker.tick(), if counting => {
                if let Some(countdown) = countdown.as_mut() {
                    shared.handle_tick(countdown).await;
                }
            }
            message = next_message(&mut channel), if channel.is_some() => match message {
                Some(message) => shared.handle_push(message).await,
                None => {
                    debug!("push channel for {} closed by server", invoice_id);
                    channel = None;
                }
            },
        }
    }

    if let Some(mut channel) = channel
        && let Err(error) = channel.close().await
    {
        debug!("closing push channel for {}: {}", invoice_id, error);
    }
    debug!("lifecycle driver for {} stopped", invoice_id);
}

/// Drives one invoice from creation to a terminal state.
pub struct LifecycleCoordinator {
    shared: Arc<Shared>,
    creating: tokio::sync::Mutex<()>,
    live: AtomicBool,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl LifecycleCoordinator {
    #[must_use]
    pub fn new(params: InvoiceParams, deps: LifecycleDeps) -> Self {
        Self::with_state(InvoiceState::new(params), deps)
    }

    /// Adopt an invoice created elsewhere without resuming it yet, so
    /// callbacks can be registered before `create()`.
    pub fn adopt(snapshot: ServerInvoiceSnapshot, deps: LifecycleDeps) -> Result<Self> {
        if snapshot.id.is_none() {
            return Err(InvoiceError::InvalidRequest(
                "adopted invoice has no id".to_string(),
            ));
        }
        let mut state = InvoiceState::default();
        state.apply_server_update(snapshot);
        Ok(Self::with_state(state, deps))
    }

    /// Adopt an existing invoice and resume tracking it.
    pub async fn from_existing(snapshot: ServerInvoiceSnapshot, deps: LifecycleDeps) -> Result<Self> {
        let coordinator = Self::adopt(snapshot, deps)?;
        coordinator.create().await?;
        Ok(coordinator)
    }

    /// Have a merchant endpoint create the invoice, then resume it.
    pub async fn from_server_endpoint(
        url: &str,
        params: &Value,
        deps: LifecycleDeps,
    ) -> Result<Self> {
        let snapshot = deps
            .service
            .fetch_from_endpoint(url, params)
            .await
            .map_err(InvoiceError::Creation)?;
        Self::from_existing(snapshot, deps).await
    }

    fn with_state(state: InvoiceState, deps: LifecycleDeps) -> Self {
        let teardown = Arc::new(Teardown::default());
        let bus = EventBus::new();
        {
            let teardown = Arc::clone(&teardown);
            bus.on_each(&[EventKind::Broadcasted, EventKind::Expired], move |_| {
                teardown.trigger();
            });
        }

        Self {
            shared: Arc::new(Shared {
                config: deps.config,
                service: deps.service,
                connector: deps.connector,
                verifier: deps.verifier,
                state: Mutex::new(state),
                bus,
                teardown,
                dispatch: tokio::sync::Mutex::new(()),
            }),
            creating: tokio::sync::Mutex::new(()),
            live: AtomicBool::new(false),
            driver: Mutex::new(None),
        }
    }

    pub fn on<F>(&self, kind: EventKind, callback: F)
    where
        F: Fn(&InvoiceEvent) + Send + Sync + 'static,
    {
        self.shared.bus.on(kind, callback);
    }

    pub fn on_each<F>(&self, kinds: &[EventKind], callback: F)
    where
        F: Fn(&InvoiceEvent) + Send + Sync + 'static,
    {
        self.shared.bus.on_each(kinds, callback);
    }

    /// Create the invoice if it has no id yet, then go live.
    ///
    /// Repeated calls are no-ops once live. A failed POST fires `failed`,
    /// is returned to the caller and is never retried here.
    pub async fn create(&self) -> Result<()> {
        let _creating = self.creating.lock().await;
        if self.shared.teardown.is_requested() {
            return Err(InvoiceError::Destroyed);
        }
        if self.live.load(Ordering::SeqCst) {
            return Ok(());
        }

        let (has_id, params) = {
            let state = self.shared.state();
            (state.id().is_some(), state.params().clone())
        };

        if !has_id {
            if let Err(error) = params.validate() {
                self.shared.report_failure(error.to_string()).await;
                return Err(error);
            }
            let snapshot = match self.shared.service.create_invoice(&params).await {
                Ok(snapshot) if snapshot.id.is_some() => snapshot,
                Ok(_) => {
                    let error = ServiceError::Decode {
                        message: "response carries no invoice id".to_string(),
                    };
                    self.shared.report_failure(error.to_string()).await;
                    return Err(InvoiceError::Creation(error));
                }
                Err(error) => {
                    warn!("invoice creation failed: {}", error);
                    self.shared.report_failure(error.to_string()).await;
                    return Err(InvoiceError::Creation(error));
                }
            };
            self.shared.state().apply_server_update(snapshot);
        }

        let (invoice_id, push_url, expires, snapshot) = {
            let state = self.shared.state();
            let snapshot = ServerInvoiceSnapshot {
                id: state.id().map(str::to_string),
                details: state.details().cloned(),
                service: state.service().cloned(),
            };
            (
                state.id().unwrap_or_default().to_string(),
                state
                    .service()
                    .and_then(|service| service.web_socket_uri.clone()),
                state.expires_at(),
                snapshot,
            )
        };
        info!("invoice {} is live", invoice_id);

        {
            let payload = EventPayload::Message(serde_json::to_value(&snapshot)?);
            let _dispatch = self.shared.dispatch.lock().await;
            self.shared
                .bus
                .emit(&InvoiceEvent::new(EventKind::Created, payload));
        }

        self.live.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(drive(
            Arc::clone(&self.shared),
            invoice_id,
            push_url,
            expires,
        ));
        *self.driver.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Feed a message received outside the coordinator's own channel.
    ///
    /// Returns `false` if the message was ignored or rejected.
    pub async fn deliver(&self, message: PushMessage) -> bool {
        match message.kind() {
            Some(kind) if kind.is_push_event() => {
                self.shared.apply_message(kind, message.data).await
            }
            _ => false,
        }
    }

    /// Apply a webhook that already passed `SignatureVerifier::verify_webhook`.
    pub async fn apply_webhook(&self, notification: &WebhookNotification) -> bool {
        let Some(kind) = notification.kind().filter(|kind| kind.is_push_event()) else {
            debug!("ignoring webhook event '{}'", notification.event);
            return false;
        };
        let current = self.shared.state().id().map(str::to_string);
        if current.as_deref() != Some(notification.invoice_id.as_str()) {
            debug!("ignoring webhook for invoice {}", notification.invoice_id);
            return false;
        }

        let _dispatch = self.shared.dispatch.lock().await;
        self.shared.state().record_event(kind);
        let mut data = notification.extra.clone();
        data.insert("event".to_string(), Value::String(notification.event.clone()));
        data.insert(
            "invoiceId".to_string(),
            Value::String(notification.invoice_id.clone()),
        );
        self.shared
            .bus
            .emit(&InvoiceEvent::new(kind, EventPayload::Message(Value::Object(data))));
        true
    }

    /// Stop the countdown and push channel without a terminal status.
    pub fn destroy(&self) {
        self.shared.teardown.trigger();
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.shared.teardown.is_requested()
    }

    /// Wait for the driver task to finish tearing down.
    pub async fn closed(&self) {
        let handle = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && let Err(error) = handle.await
        {
            warn!("lifecycle driver ended abnormally: {}", error);
        }
    }

    #[must_use]
    pub fn id(&self) -> Option<String> {
        self.shared.state().id().map(str::to_string)
    }

    #[must_use]
    pub fn status(&self) -> InvoiceStatus {
        self.shared.state().status(Utc::now())
    }

    /// Snapshot of the current state.
    #[must_use]
    pub fn state(&self) -> InvoiceState {
        self.shared.state().clone()
    }
}

impl Drop for LifecycleCoordinator {
    fn drop(&mut self) {
        self.shared.teardown.trigger();
    }
}
