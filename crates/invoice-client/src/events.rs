//! Named lifecycle events and the per-invoice subscriber registry.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Created,
    Subscribed,
    Requested,
    Broadcasting,
    Broadcasted,
    Confirmed,
    Failed,
    Timer,
    Expired,
}

impl EventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Subscribed => "subscribed",
            Self::Requested => "requested",
            Self::Broadcasting => "broadcasting",
            Self::Broadcasted => "broadcasted",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
            Self::Timer => "timer",
            Self::Expired => "expired",
        }
    }

    /// Events the service delivers over the push channel.
    #[must_use]
    pub fn is_push_event(self) -> bool {
        matches!(
            self,
            Self::Subscribed
                | Self::Requested
                | Self::Broadcasting
                | Self::Broadcasted
                | Self::Confirmed
                | Self::Failed
        )
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "created" => Ok(Self::Created),
            "subscribed" => Ok(Self::Subscribed),
            "requested" => Ok(Self::Requested),
            "broadcasting" => Ok(Self::Broadcasting),
            "broadcasted" => Ok(Self::Broadcasted),
            "confirmed" => Ok(Self::Confirmed),
            "failed" => Ok(Self::Failed),
            "timer" => Ok(Self::Timer),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown event: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    /// Raw message or snapshot from the service.
    Message(Value),
    SecondsRemaining(u64),
    Error(String),
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceEvent {
    pub kind: EventKind,
    pub payload: EventPayload,
}

impl InvoiceEvent {
    #[must_use]
    pub fn new(kind: EventKind, payload: EventPayload) -> Self {
        Self { kind, payload }
    }

    #[must_use]
    pub fn message(&self) -> Option<&Value> {
        match &self.payload {
            EventPayload::Message(value) => Some(value),
            _ => None,
        }
    }
}

pub type EventCallback = Arc<dyn Fn(&InvoiceEvent) + Send + Sync>;

/// Register-only callback lists keyed by event kind.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<Mutex<HashMap<EventKind, Vec<EventCallback>>>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, kind: EventKind, callback: F)
    where
        F: Fn(&InvoiceEvent) + Send + Sync + 'static,
    {
        self.on_each(&[kind], callback);
    }

    /// Register one callback for several events.
    pub fn on_each<F>(&self, kinds: &[EventKind], callback: F)
    where
        F: Fn(&InvoiceEvent) + Send + Sync + 'static,
    {
        let callback: EventCallback = Arc::new(callback);
        let mut listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for kind in kinds {
            listeners
                .entry(*kind)
                .or_default()
                .push(Arc::clone(&callback));
        }
    }

    #[cfg(test)]
    fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Deliver `event` to every callback of its kind in registration order.
    ///
    /// The registry lock is released before callbacks run, so callbacks may
    /// register further listeners; those apply from the next emit. A
    /// panicking callback is logged and skipped. Returns the number of
    /// callbacks that completed.
    pub fn emit(&self, event: &InvoiceEvent) -> usize {
        let callbacks = {
            let listeners = self
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            listeners.get(&event.kind).cloned().unwrap_or_default()
        };

        let mut delivered = 0usize;
        for (index, callback) in callbacks.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(()) => delivered += 1,
                Err(_) => error!(
                    "callback #{} for '{}' event panicked; continuing",
                    index,
                    event.kind.as_str()
                ),
            }
        }
        delivered
    }
}
