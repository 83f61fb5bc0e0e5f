//! Subscriber Registry
//!
//! Owns the live set of downstream connections and fans messages out to
//! them.
//!
//! The connection set is an arena keyed by [`ConnectionId`]. A broadcast
//! snapshots the matching sinks under the lock, releases it, and then
//! delivers to every sink concurrently. A sink that fails or times out is
//! removed; the others still receive the message.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};

use crate::application::ports::{ConsumerSink, DownstreamSendError};
use crate::domain::streaming::{MessageKind, RelayMessage, Topic};
use crate::domain::subscription::{
    ConnectionId, SubscriptionManager, SubscriptionStats, TopicFilter,
};
use crate::infrastructure::metrics;

/// WebSocket close code for a policy violation.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// WebSocket close code for a server going away.
pub const CLOSE_GOING_AWAY: u16 = 1001;

// =============================================================================
// Configuration
// =============================================================================

/// Origin allow-list for new connections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OriginPolicy {
    allowed: HashSet<String>,
}

impl OriginPolicy {
    /// Accept any origin, including none.
    #[must_use]
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Accept only the listed origins. An empty list accepts everything.
    #[must_use]
    pub fn allow_only<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed: origins
                .into_iter()
                .map(|origin| normalize_origin(origin.as_ref()))
                .filter(|origin| !origin.is_empty())
                .collect(),
        }
    }

    /// Whether a connection presenting `origin` may join.
    #[must_use]
    pub fn is_allowed(&self, origin: Option<&str>) -> bool {
        if self.allowed.is_empty() {
            return true;
        }
        origin.is_some_and(|origin| self.allowed.contains(&normalize_origin(origin)))
    }
}

fn normalize_origin(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_ascii_lowercase()
}

/// Registry settings.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Longest a single delivery may take before the consumer is dropped.
    pub send_timeout: Duration,
    /// Origin allow-list.
    pub origins: OriginPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(1),
            origins: OriginPolicy::allow_all(),
        }
    }
}

// =============================================================================
// Broadcast Report
// =============================================================================

/// Outcome of one broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Consumers that accepted the message.
    pub delivered: usize,
    /// Consumers removed because delivery failed.
    pub pruned: Vec<ConnectionId>,
}

// =============================================================================
// Registry
// =============================================================================

/// Live set of downstream consumers.
pub struct SubscriberRegistry {
    config: RegistryConfig,
    connections: Mutex<HashMap<ConnectionId, Arc<dyn ConsumerSink>>>,
    subscriptions: SubscriptionManager,
    unavailable: RwLock<Option<String>>,
}

impl SubscriberRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            connections: Mutex::new(HashMap::new()),
            subscriptions: SubscriptionManager::new(),
            unavailable: RwLock::new(None),
        }
    }

    /// Admit a new consumer.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::OriginRejected` when the origin is not allowed
    /// and `RegistryError::Unavailable` while the relay refuses connections.
    pub fn connect(
        &self,
        origin: Option<&str>,
        sink: Arc<dyn ConsumerSink>,
        filter: TopicFilter,
    ) -> Result<ConnectionId, RegistryError> {
        if !self.config.origins.is_allowed(origin) {
            tracing::warn!(origin = ?origin, "Rejected downstream connection from disallowed origin");
            return Err(RegistryError::OriginRejected(
                origin.unwrap_or("<none>").to_string(),
            ));
        }
        if let Some(reason) = self.unavailable.read().clone() {
            return Err(RegistryError::Unavailable(reason));
        }

        let id = ConnectionId::new();
        // Filter first so a broadcast never sees a connection without one.
        self.subscriptions.register(id, filter);
        let count = {
            let mut connections = self.connections.lock();
            connections.insert(id, sink);
            connections.len()
        };
        metrics::set_downstream_clients(count);
        tracing::info!(connection_id = %id, clients = count, "Downstream consumer connected");
        Ok(id)
    }

    /// Remove a consumer. Returns `false` if it was already gone.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        let (removed, count) = {
            let mut connections = self.connections.lock();
            let removed = connections.remove(&id).is_some();
            (removed, connections.len())
        };
        if removed {
            self.subscriptions.remove_connection(id);
            metrics::set_downstream_clients(count);
            tracing::info!(connection_id = %id, clients = count, "Downstream consumer disconnected");
        }
        removed
    }

    /// Serialize `message` once and deliver it to every matching consumer.
    pub async fn broadcast(&self, topic: Option<&Topic>, message: &RelayMessage) -> BroadcastReport {
        let payload: Arc<str> = match serde_json::to_string(message) {
            Ok(json) => json.into(),
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize relay message");
                return BroadcastReport::default();
            }
        };
        self.broadcast_payload(topic, payload, message.kind()).await
    }

    /// Deliver an already serialized payload to every matching consumer.
    pub async fn broadcast_payload(
        &self,
        topic: Option<&Topic>,
        payload: Arc<str>,
        kind: MessageKind,
    ) -> BroadcastReport {
        let started = Instant::now();
        let targets: Vec<(ConnectionId, Arc<dyn ConsumerSink>)> = {
            let connections = self.connections.lock();
            connections
                .iter()
                .filter(|(id, _)| self.subscriptions.matches(**id, topic))
                .map(|(id, sink)| (*id, Arc::clone(sink)))
                .collect()
        };
        if targets.is_empty() {
            return BroadcastReport::default();
        }

        let timeout = self.config.send_timeout;
        let deliveries = targets.into_iter().map(|(id, sink)| {
            let payload = Arc::clone(&payload);
            async move {
                let result = match tokio::time::timeout(timeout, sink.send(payload)).await {
                    Ok(result) => result,
                    Err(_) => Err(DownstreamSendError::Timeout(timeout)),
                };
                (id, result)
            }
        });

        let mut report = BroadcastReport::default();
        for (id, result) in join_all(deliveries).await {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::warn!(connection_id = %id, error = %e, "Dropping downstream consumer");
                    report.pruned.push(id);
                }
            }
        }
        for id in &report.pruned {
            self.disconnect(*id);
        }

        metrics::record_messages_sent(kind, report.delivered);
        metrics::record_consumers_pruned(report.pruned.len());
        metrics::record_broadcast_duration(kind, started.elapsed());
        report
    }

    /// Add topics to a consumer's filter.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::UnknownConnection` if the consumer is gone.
    pub fn subscribe(&self, id: ConnectionId, topics: &[Topic]) -> Result<(), RegistryError> {
        self.subscriptions
            .add_topics(id, topics)
            .map(|_| ())
            .ok_or(RegistryError::UnknownConnection(id))
    }

    /// Remove topics from a consumer's filter.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::UnknownConnection` if the consumer is gone.
    pub fn unsubscribe(&self, id: ConnectionId, topics: &[Topic]) -> Result<(), RegistryError> {
        self.subscriptions
            .remove_topics(id, topics)
            .map(|_| ())
            .ok_or(RegistryError::UnknownConnection(id))
    }

    /// Refuse new connections with `reason` (or accept again with `None`).
    pub fn set_unavailable(&self, reason: Option<String>) {
        *self.unavailable.write() = reason;
    }

    /// Reason new connections are refused, if any.
    #[must_use]
    pub fn unavailable_reason(&self) -> Option<String> {
        self.unavailable.read().clone()
    }

    /// Close and remove every consumer. Returns how many were closed.
    pub async fn close_all(&self, code: u16, reason: &str) -> usize {
        let drained: Vec<(ConnectionId, Arc<dyn ConsumerSink>)> =
            self.connections.lock().drain().collect();
        for (id, _) in &drained {
            self.subscriptions.remove_connection(*id);
        }
        metrics::set_downstream_clients(0);

        join_all(drained.iter().map(|(_, sink)| sink.close(code, reason))).await;
        if !drained.is_empty() {
            tracing::info!(closed = drained.len(), code, "Closed all downstream consumers");
        }
        drained.len()
    }

    /// Number of connected consumers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    /// Whether no consumer is connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    /// Whether `id` is connected.
    #[must_use]
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.lock().contains_key(&id)
    }

    /// All connected handles.
    #[must_use]
    pub fn connection_ids(&self) -> HashSet<ConnectionId> {
        self.connections.lock().keys().copied().collect()
    }

    /// Subscription statistics.
    #[must_use]
    pub fn subscription_stats(&self) -> SubscriptionStats {
        self.subscriptions.stats()
    }
}

impl std::fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("config", &self.config)
            .field("connections", &self.len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Origin is not on the allow-list.
    #[error("origin {0} is not allowed")]
    OriginRejected(String),

    /// The relay is not accepting consumers.
    #[error("{0}")]
    Unavailable(String),

    /// The consumer is not connected.
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use proptest::prelude::*;

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        received: Mutex<Vec<String>>,
        closed: Mutex<Option<(u16, String)>>,
        fail: AtomicBool,
        stall: AtomicBool,
    }

    impl RecordingSink {
        fn failing() -> Self {
            let sink = Self::default();
            sink.fail.store(true, Ordering::SeqCst);
            sink
        }

        fn received(&self) -> Vec<String> {
            self.received.lock().clone()
        }
    }

    #[async_trait]
    impl ConsumerSink for RecordingSink {
        async fn send(&self, payload: Arc<str>) -> Result<(), DownstreamSendError> {
            if self.stall.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(DownstreamSendError::Closed);
            }
            self.received.lock().push(payload.to_string());
            Ok(())
        }

        async fn close(&self, code: u16, reason: &str) {
            *self.closed.lock() = Some((code, reason.to_string()));
        }
    }

    fn tick(raw: &str) -> RelayMessage {
        RelayMessage::Tick(raw.to_string())
    }

    fn tick_json(raw: &str) -> String {
        serde_json::to_string(&tick(raw)).unwrap()
    }

    fn registry() -> SubscriberRegistry {
        SubscriberRegistry::new(RegistryConfig::default())
    }

    #[tokio::test]
    async fn broadcast_reaches_all_connected() {
        let registry = registry();
        let a = Arc::new(RecordingSink::default());
        let b = Arc::new(RecordingSink::default());
        registry.connect(None, a.clone(), TopicFilter::All).unwrap();
        registry.connect(None, b.clone(), TopicFilter::All).unwrap();

        let report = registry.broadcast(None, &tick("T1")).await;

        assert_eq!(report.delivered, 2);
        assert_eq!(a.received(), vec![tick_json("T1")]);
        assert_eq!(b.received(), vec![tick_json("T1")]);
    }

    #[tokio::test]
    async fn failing_consumer_is_pruned_without_affecting_others() {
        let registry = registry();
        let first = Arc::new(RecordingSink::default());
        let second = Arc::new(RecordingSink::failing());
        let third = Arc::new(RecordingSink::default());
        registry.connect(None, first.clone(), TopicFilter::All).unwrap();
        let failing_id = registry.connect(None, second.clone(), TopicFilter::All).unwrap();
        registry.connect(None, third.clone(), TopicFilter::All).unwrap();

        let report = registry.broadcast(None, &tick("T1")).await;

        assert_eq!(report.delivered, 2);
        assert_eq!(report.pruned, vec![failing_id]);
        assert_eq!(first.received(), vec![tick_json("T1")]);
        assert_eq!(third.received(), vec![tick_json("T1")]);
        assert!(!registry.contains(failing_id));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn stalled_consumer_times_out() {
        let registry = SubscriberRegistry::new(RegistryConfig {
            send_timeout: Duration::from_millis(20),
            ..RegistryConfig::default()
        });
        let healthy = Arc::new(RecordingSink::default());
        let stalled = Arc::new(RecordingSink::default());
        stalled.stall.store(true, Ordering::SeqCst);
        registry.connect(None, healthy.clone(), TopicFilter::All).unwrap();
        let stalled_id = registry.connect(None, stalled, TopicFilter::All).unwrap();

        let report = registry.broadcast(None, &tick("T1")).await;

        assert_eq!(report.delivered, 1);
        assert_eq!(report.pruned, vec![stalled_id]);
        assert_eq!(healthy.received().len(), 1);
    }

    #[tokio::test]
    async fn topic_filter_limits_delivery() {
        let registry = registry();
        let nav = Topic::new("H0STNAV0", "102110");
        let other = Topic::new("H0STCNT0", "005930");
        let nav_only = Arc::new(RecordingSink::default());
        let everything = Arc::new(RecordingSink::default());
        registry
            .connect(None, nav_only.clone(), TopicFilter::from_topics([nav.clone()]))
            .unwrap();
        registry.connect(None, everything.clone(), TopicFilter::All).unwrap();

        registry.broadcast(Some(&other), &tick("other")).await;
        registry.broadcast(Some(&nav), &tick("nav")).await;
        registry.broadcast(None, &tick("untagged")).await;

        assert_eq!(nav_only.received(), vec![tick_json("nav"), tick_json("untagged")]);
        assert_eq!(everything.received().len(), 3);
    }

    #[tokio::test]
    async fn subscribe_and_unsubscribe_change_delivery() {
        let registry = registry();
        let nav = Topic::new("H0STNAV0", "102110");
        let sink = Arc::new(RecordingSink::default());
        let id = registry.connect(None, sink.clone(), TopicFilter::All).unwrap();

        registry.subscribe(id, &[Topic::new("H0STCNT0", "005930")]).unwrap();
        registry.broadcast(Some(&nav), &tick("skipped")).await;
        registry.subscribe(id, &[nav.clone()]).unwrap();
        registry.broadcast(Some(&nav), &tick("delivered")).await;
        registry.unsubscribe(id, &[nav.clone()]).unwrap();
        registry.broadcast(Some(&nav), &tick("skipped again")).await;

        assert_eq!(sink.received(), vec![tick_json("delivered")]);
    }

    #[tokio::test]
    async fn subscribe_unknown_connection_fails() {
        let registry = registry();
        let id = ConnectionId::new();
        assert_eq!(
            registry.subscribe(id, &[]),
            Err(RegistryError::UnknownConnection(id))
        );
    }

    #[tokio::test]
    async fn per_consumer_order_matches_broadcast_order() {
        let registry = registry();
        let sink = Arc::new(RecordingSink::default());
        registry.connect(None, sink.clone(), TopicFilter::All).unwrap();

        for i in 0..50 {
            registry.broadcast(None, &tick(&format!("T{i}"))).await;
        }

        let expected: Vec<String> = (0..50).map(|i| tick_json(&format!("T{i}"))).collect();
        assert_eq!(sink.received(), expected);
    }

    #[test]
    fn disconnect_is_idempotent() {
        let registry = registry();
        let id = registry
            .connect(None, Arc::new(RecordingSink::default()), TopicFilter::All)
            .unwrap();

        assert!(registry.disconnect(id));
        assert!(!registry.disconnect(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn origin_allow_list() {
        let registry = SubscriberRegistry::new(RegistryConfig {
            origins: OriginPolicy::allow_only(["http://localhost:5173/"]),
            ..RegistryConfig::default()
        });
        let sink = || Arc::new(RecordingSink::default()) as Arc<dyn ConsumerSink>;

        assert!(registry.connect(Some("http://localhost:5173"), sink(), TopicFilter::All).is_ok());
        assert!(registry.connect(Some("HTTP://LOCALHOST:5173"), sink(), TopicFilter::All).is_ok());
        assert!(matches!(
            registry.connect(Some("http://evil.example"), sink(), TopicFilter::All),
            Err(RegistryError::OriginRejected(_))
        ));
        assert!(matches!(
            registry.connect(None, sink(), TopicFilter::All),
            Err(RegistryError::OriginRejected(_))
        ));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn unavailable_registry_refuses_connections() {
        let registry = registry();
        registry.set_unavailable(Some("credentials missing".to_string()));

        let err = registry
            .connect(None, Arc::new(RecordingSink::default()), TopicFilter::All)
            .unwrap_err();

        assert_eq!(err, RegistryError::Unavailable("credentials missing".to_string()));
        assert!(registry.is_empty());

        registry.set_unavailable(None);
        assert!(registry
            .connect(None, Arc::new(RecordingSink::default()), TopicFilter::All)
            .is_ok());
    }

    #[tokio::test]
    async fn close_all_closes_and_empties() {
        let registry = registry();
        let a = Arc::new(RecordingSink::default());
        let b = Arc::new(RecordingSink::default());
        registry.connect(None, a.clone(), TopicFilter::All).unwrap();
        registry.connect(None, b.clone(), TopicFilter::All).unwrap();

        let closed = registry.close_all(CLOSE_GOING_AWAY, "shutdown").await;

        assert_eq!(closed, 2);
        assert!(registry.is_empty());
        assert_eq!(*a.closed.lock(), Some((CLOSE_GOING_AWAY, "shutdown".to_string())));
        assert_eq!(registry.subscription_stats().connection_count, 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Connect,
        Disconnect(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::Connect), (0usize..16).prop_map(Op::Disconnect)]
    }

    proptest! {
        #[test]
        fn connection_set_is_connected_minus_disconnected(ops in prop::collection::vec(op(), 0..64)) {
            let registry = registry();
            let mut connected: Vec<ConnectionId> = Vec::new();
            let mut expected: HashSet<ConnectionId> = HashSet::new();

            for op in ops {
                match op {
                    Op::Connect => {
                        let id = registry
                            .connect(None, Arc::new(RecordingSink::default()), TopicFilter::All)
                            .unwrap();
                        connected.push(id);
                        expected.insert(id);
                    }
                    Op::Disconnect(index) => {
                        if let Some(id) = connected.get(index % connected.len().max(1)) {
                            registry.disconnect(*id);
                            expected.remove(id);
                        }
                    }
                }
            }

            prop_assert_eq!(registry.connection_ids(), expected);
            prop_assert_eq!(registry.subscription_stats().connection_count, registry.len());
        }
    }
}
