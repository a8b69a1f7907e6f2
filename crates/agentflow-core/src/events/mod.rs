//! Event Bus - in-process publish/subscribe and request/response messaging.
//!
//! Features:
//!   - Named events delivered synchronously to every subscriber, in
//!     subscription order
//!   - Handler isolation: a failing handler is reported on the `error`
//!     event and stays subscribed
//!   - Request/response: single-shot, correlation-id based, first response
//!     wins, late responses are dropped
//!   - Bounded history ring with filtered queries
//!
//! Dispatch never holds the internal lock while a handler runs, so handlers
//! may publish, subscribe or unsubscribe re-entrantly.

use std::collections::{BTreeMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::config::EventBusConfig;
use crate::error::BusError;
use crate::health::{ComponentHealth, HealthStatus};

/// Name of the event that carries isolated handler failures.
pub const ERROR_EVENT: &str = "error";

/// Metadata attached to every published event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    /// Response event name for request events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

/// A published event. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub name: String,
    pub payload: Value,
    pub metadata: EventMetadata,
}

/// Caller-supplied metadata for `publish`.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub sender_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

impl PublishOptions {
    pub fn from_sender(sender_id: impl Into<String>) -> Self {
        Self {
            sender_id: Some(sender_id.into()),
            ..Default::default()
        }
    }
}

/// Metadata recorded with a subscription.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

impl SubscriptionMetadata {
    pub fn for_agent(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: Some(agent_id.into()),
        }
    }
}

/// Public view of a subscription (the handler itself stays private).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInfo {
    pub id: String,
    pub event_name: String,
    pub metadata: SubscriptionMetadata,
    pub subscribed_at: DateTime<Utc>,
}

pub type HandlerResult = Result<(), BusError>;

type EventHandler = Arc<dyn Fn(&Event) -> HandlerResult + Send + Sync>;

struct Subscription {
    info: SubscriptionInfo,
    handler: EventHandler,
}

/// Filter for `get_event_history`.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_name: Option<String>,
    /// Matches the event's sender id
    pub agent_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    /// Most recent N matches (default 100)
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn by_name(event_name: impl Into<String>) -> Self {
        Self {
            event_name: Some(event_name.into()),
            ..Default::default()
        }
    }

    fn matches(&self, event: &Event) -> bool {
        if let Some(ref name) = self.event_name {
            if &event.name != name {
                return false;
            }
        }
        if let Some(ref agent_id) = self.agent_id {
            if event.metadata.sender_id.as_ref() != Some(agent_id) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.metadata.timestamp < since {
                return false;
            }
        }
        true
    }
}

const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Read-only bus statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusMetrics {
    pub total_subscriptions: usize,
    pub subscribed_event_names: usize,
    pub event_counts: BTreeMap<String, u64>,
    pub agent_event_counts: BTreeMap<String, u64>,
    pub history_size: usize,
    pub max_history: usize,
    pub total_published: u64,
}

struct EventBusInner {
    /// Subscriptions in subscription order
    subscriptions: Vec<Subscription>,
    history: VecDeque<Event>,
    event_counts: BTreeMap<String, u64>,
    agent_event_counts: BTreeMap<String, u64>,
    total_published: u64,
}

/// Thread-safe, cloneable event bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<EventBusInner>>,
    config: EventBusConfig,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_config(EventBusConfig::default())
    }

    pub fn with_config(config: EventBusConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(EventBusInner {
                subscriptions: Vec::new(),
                history: VecDeque::with_capacity(config.max_history.min(1024)),
                event_counts: BTreeMap::new(),
                agent_event_counts: BTreeMap::new(),
                total_published: 0,
            })),
            config,
        }
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }

    // ─── Subscriptions ──────────────────────────────────────────────────

    /// Register a handler for `event_name`. Returns the subscription id.
    pub fn subscribe<F>(&self, event_name: &str, handler: F, metadata: SubscriptionMetadata) -> String
    where
        F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
    {
        let id = uuid::Uuid::new_v4().to_string();
        let subscription = Subscription {
            info: SubscriptionInfo {
                id: id.clone(),
                event_name: event_name.to_string(),
                metadata,
                subscribed_at: Utc::now(),
            },
            handler: Arc::new(handler),
        };
        self.inner.lock().subscriptions.push(subscription);
        tracing::debug!("[EventBus] Subscribed {} to '{}'", id, event_name);
        id
    }

    /// Remove a subscription. Unknown ids are a no-op.
    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.subscriptions.len();
        inner.subscriptions.retain(|s| s.info.id != subscription_id);
        before != inner.subscriptions.len()
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.inner
            .lock()
            .subscriptions
            .iter()
            .map(|s| s.info.clone())
            .collect()
    }

    // ─── Publish ────────────────────────────────────────────────────────

    /// Record an event and deliver it to every current subscriber.
    pub fn publish(&self, event_name: &str, data: Value, options: PublishOptions) -> String {
        let event = Event {
            id: uuid::Uuid::new_v4().to_string(),
            name: event_name.to_string(),
            payload: data,
            metadata: EventMetadata {
                timestamp: Utc::now(),
                correlation_id: options
                    .correlation_id
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                sender_id: options.sender_id,
                reply_to: options.reply_to,
            },
        };

        let handlers: Vec<(String, EventHandler)> = {
            let mut inner = self.inner.lock();
            inner.history.push_back(event.clone());
            while inner.history.len() > self.config.max_history {
                inner.history.pop_front();
            }
            *inner.event_counts.entry(event.name.clone()).or_default() += 1;
            if let Some(ref sender) = event.metadata.sender_id {
                *inner.agent_event_counts.entry(sender.clone()).or_default() += 1;
            }
            inner.total_published += 1;

            inner
                .subscriptions
                .iter()
                .filter(|s| s.info.event_name == event.name)
                .map(|s| (s.info.id.clone(), s.handler.clone()))
                .collect()
        };

        for (subscription_id, handler) in handlers {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(&event)))
                .unwrap_or_else(|_| Err(BusError::Handler("handler panicked".to_string())));
            if let Err(e) = outcome {
                self.report_handler_error(&event.name, &subscription_id, &e);
            }
        }

        event.id
    }

    fn report_handler_error(&self, event_name: &str, subscription_id: &str, error: &BusError) {
        if event_name == ERROR_EVENT {
            tracing::error!(
                "[EventBus] Handler {} failed while handling an error event: {}",
                subscription_id,
                error
            );
            return;
        }
        tracing::warn!(
            "[EventBus] Handler {} for '{}' failed: {}",
            subscription_id,
            event_name,
            error
        );
        self.publish(
            ERROR_EVENT,
            serde_json::json!({
                "eventName": event_name,
                "subscriptionId": subscription_id,
                "error": error.to_string(),
            }),
            PublishOptions::from_sender("event-bus"),
        );
    }

    // ─── Request / response ─────────────────────────────────────────────

    /// Publish `event_name` and wait for exactly one correlated response.
    pub async fn request(
        &self,
        event_name: &str,
        data: Value,
        timeout_ms: Option<u64>,
    ) -> Result<Value, BusError> {
        self.request_with(event_name, data, timeout_ms, PublishOptions::default())
            .await
    }

    /// Like `request`, with explicit sender metadata.
    pub async fn request_with(
        &self,
        event_name: &str,
        data: Value,
        timeout_ms: Option<u64>,
        options: PublishOptions,
    ) -> Result<Value, BusError> {
        let timeout_ms = timeout_ms.unwrap_or(self.config.default_timeout_ms);
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let response_event = response_event_name(event_name, &correlation_id);

        let (tx, rx) = oneshot::channel::<Value>();
        let slot = Mutex::new(Some(tx));
        let id = self.subscribe(
            &response_event,
            move |event: &Event| {
                if let Some(tx) = slot.lock().take() {
                    let _ = tx.send(event.payload.clone());
                }
                Ok(())
            },
            SubscriptionMetadata::default(),
        );
        let listener = ListenerGuard {
            bus: self.clone(),
            id,
        };

        self.publish(
            event_name,
            data,
            PublishOptions {
                correlation_id: Some(correlation_id),
                reply_to: Some(response_event),
                ..options
            },
        );

        let outcome = tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await;
        drop(listener);

        match outcome {
            Ok(Ok(payload)) => unwrap_response(payload),
            Ok(Err(_)) => Err(BusError::Handler(format!(
                "response listener for '{}' dropped",
                event_name
            ))),
            Err(_) => Err(BusError::Timeout {
                event: event_name.to_string(),
                timeout_ms,
            }),
        }
    }

    /// Publish the correlated response for a request.
    pub fn respond(&self, response_event: &str, outcome: Result<Value, Value>) -> String {
        let payload = match outcome {
            Ok(result) => serde_json::json!({ "result": result }),
            Err(error) => serde_json::json!({ "error": error }),
        };
        let correlation_id = response_event
            .rsplit_once(RESPONSE_INFIX)
            .map(|(_, id)| id.to_string());
        self.publish(
            response_event,
            payload,
            PublishOptions {
                correlation_id,
                ..Default::default()
            },
        )
    }

    // ─── History ────────────────────────────────────────────────────────

    /// Most recent matching events, oldest first.
    pub fn get_event_history(&self, filter: &EventFilter) -> Vec<Event> {
        let limit = filter.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
        let inner = self.inner.lock();
        let mut matched: Vec<Event> = inner
            .history
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .take(limit)
            .cloned()
            .collect();
        matched.reverse();
        matched
    }

    /// Drop history records older than `cutoff`. Returns how many were removed.
    pub fn prune_history(&self, cutoff: DateTime<Utc>) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.history.len();
        inner.history.retain(|e| e.metadata.timestamp >= cutoff);
        before - inner.history.len()
    }

    pub fn clear_history(&self) {
        self.inner.lock().history.clear();
    }

    // ─── Introspection ──────────────────────────────────────────────────

    pub fn get_metrics(&self) -> BusMetrics {
        let inner = self.inner.lock();
        let mut names: Vec<&str> = inner
            .subscriptions
            .iter()
            .map(|s| s.info.event_name.as_str())
            .collect();
        names.sort_unstable();
        names.dedup();

        BusMetrics {
            total_subscriptions: inner.subscriptions.len(),
            subscribed_event_names: names.len(),
            event_counts: inner.event_counts.clone(),
            agent_event_counts: inner.agent_event_counts.clone(),
            history_size: inner.history.len(),
            max_history: self.config.max_history,
            total_published: inner.total_published,
        }
    }

    /// The bus has no failure mode of its own; always healthy.
    pub fn health_check(&self) -> ComponentHealth {
        ComponentHealth {
            status: HealthStatus::Healthy,
            details: serde_json::to_value(self.get_metrics()).unwrap_or_default(),
        }
    }
}

const RESPONSE_INFIX: &str = ".response.";

/// Removes a request's response listener however the request ends,
/// including when the awaiting future is dropped.
struct ListenerGuard {
    bus: EventBus,
    id: String,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.id);
    }
}

/// Derived event name on which the response to a request is published.
pub fn response_event_name(event_name: &str, correlation_id: &str) -> String {
    format!("{}{}{}", event_name, RESPONSE_INFIX, correlation_id)
}

fn unwrap_response(payload: Value) -> Result<Value, BusError> {
    match payload.get("error") {
        Some(err) if !err.is_null() => Err(BusError::Responder(err.clone())),
        _ => Ok(payload.get("result").cloned().unwrap_or(Value::Null)),
    }
}
