//! Subscription Management Types
//!
//! Tracks which topics each downstream connection wants.
//!
//! # Design
//!
//! Every connection has a [`TopicFilter`]:
//! - `All` receives every frame (the default when nothing is requested)
//! - `Only(set)` receives frames for the listed topics, plus frames whose
//!   topic cannot be determined and snapshots
//!
//! Explicitly requested topics are reference counted so the relay can
//! report how many consumers share each upstream topic.

use std::collections::{HashMap, HashSet};
use std::fmt;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::domain::streaming::Topic;

// =============================================================================
// Types
// =============================================================================

/// Opaque handle for one downstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Allocate a fresh, random handle.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Which topics a connection receives.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TopicFilter {
    /// Every topic.
    #[default]
    All,
    /// Only the listed topics.
    Only(HashSet<Topic>),
}

impl TopicFilter {
    /// Build a filter from requested topics; an empty request means `All`.
    #[must_use]
    pub fn from_topics(topics: impl IntoIterator<Item = Topic>) -> Self {
        let set: HashSet<Topic> = topics.into_iter().collect();
        if set.is_empty() {
            Self::All
        } else {
            Self::Only(set)
        }
    }

    /// Whether a message for `topic` passes this filter.
    ///
    /// Messages without a topic reach everyone.
    #[must_use]
    pub fn matches(&self, topic: Option<&Topic>) -> bool {
        match (self, topic) {
            (Self::All, _) | (_, None) => true,
            (Self::Only(set), Some(topic)) => set.contains(topic),
        }
    }

    fn explicit_topics(&self) -> impl Iterator<Item = &Topic> {
        let set = match self {
            Self::All => None,
            Self::Only(set) => Some(set),
        };
        set.into_iter().flatten()
    }
}

// =============================================================================
// Subscription State
// =============================================================================

#[derive(Debug, Default)]
struct SubscriptionState {
    filters: HashMap<ConnectionId, TopicFilter>,
    topic_refcount: HashMap<Topic, usize>,
}

impl SubscriptionState {
    fn acquire(&mut self, topic: &Topic) -> bool {
        let refcount = self.topic_refcount.entry(topic.clone()).or_insert(0);
        *refcount += 1;
        *refcount == 1
    }

    fn release(&mut self, topic: &Topic) -> bool {
        let Some(refcount) = self.topic_refcount.get_mut(topic) else {
            return false;
        };
        *refcount = refcount.saturating_sub(1);
        if *refcount == 0 {
            self.topic_refcount.remove(topic);
            return true;
        }
        false
    }
}

// =============================================================================
// Subscription Manager
// =============================================================================

/// Thread-safe per-connection topic filters with shared topic refcounts.
///
/// # Example
///
/// ```rust
/// use kis_stream_relay::domain::streaming::Topic;
/// use kis_stream_relay::domain::subscription::{ConnectionId, SubscriptionManager, TopicFilter};
///
/// let manager = SubscriptionManager::new();
/// let nav = Topic::new("H0STNAV0", "102110");
///
/// let a = ConnectionId::new();
/// let b = ConnectionId::new();
/// manager.register(a, TopicFilter::from_topics([nav.clone()]));
/// manager.register(b, TopicFilter::All);
///
/// assert_eq!(manager.subscriber_count(&nav), 1);
/// assert!(manager.matches(a, Some(&nav)));
///
/// // Last explicit subscriber leaves
/// assert_eq!(manager.remove_connection(a), vec![nav.clone()]);
/// assert_eq!(manager.subscriber_count(&nav), 0);
/// ```
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    state: RwLock<SubscriptionState>,
}

impl SubscriptionManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection with its initial filter.
    ///
    /// Returns topics whose first explicit subscriber this is.
    pub fn register(&self, connection: ConnectionId, filter: TopicFilter) -> Vec<Topic> {
        let mut state = self.state.write();
        let mut first = Vec::new();
        if let Some(previous) = state.filters.remove(&connection) {
            for topic in previous.explicit_topics() {
                state.release(topic);
            }
        }
        for topic in filter.explicit_topics() {
            if state.acquire(topic) {
                first.push(topic.clone());
            }
        }
        state.filters.insert(connection, filter);
        first
    }

    /// Add topics to a connection's filter.
    ///
    /// A connection receiving everything narrows to exactly these topics.
    /// Returns topics whose first explicit subscriber this is, or `None` if
    /// the connection is unknown.
    pub fn add_topics(&self, connection: ConnectionId, topics: &[Topic]) -> Option<Vec<Topic>> {
        let mut state = self.state.write();
        let mut current = state.filters.remove(&connection)?;
        if current == TopicFilter::All {
            current = TopicFilter::Only(HashSet::new());
        }

        let mut first = Vec::new();
        if let TopicFilter::Only(set) = &mut current {
            for topic in topics {
                if set.insert(topic.clone()) && state.acquire(topic) {
                    first.push(topic.clone());
                }
            }
        }
        state.filters.insert(connection, current);
        Some(first)
    }

    /// Remove topics from a connection's filter.
    ///
    /// Has no effect on a connection receiving everything. Returns topics
    /// that lost their last explicit subscriber, or `None` if the connection
    /// is unknown.
    pub fn remove_topics(&self, connection: ConnectionId, topics: &[Topic]) -> Option<Vec<Topic>> {
        let mut state = self.state.write();
        let mut current = state.filters.remove(&connection)?;

        let mut last = Vec::new();
        if let TopicFilter::Only(set) = &mut current {
            for topic in topics {
                if set.remove(topic) && state.release(topic) {
                    last.push(topic.clone());
                }
            }
        }
        state.filters.insert(connection, current);
        Some(last)
    }

    /// Forget a connection entirely.
    ///
    /// Returns topics that lost their last explicit subscriber.
    pub fn remove_connection(&self, connection: ConnectionId) -> Vec<Topic> {
        let mut state = self.state.write();
        let Some(filter) = state.filters.remove(&connection) else {
            return vec![];
        };
        let mut last: Vec<Topic> = filter
            .explicit_topics()
            .filter(|topic| state.release(topic))
            .cloned()
            .collect();
        last.sort();
        last
    }

    /// Whether a message for `topic` should reach `connection`.
    #[must_use]
    pub fn matches(&self, connection: ConnectionId, topic: Option<&Topic>) -> bool {
        self.state
            .read()
            .filters
            .get(&connection)
            .is_some_and(|filter| filter.matches(topic))
    }

    /// Current filter for a connection.
    #[must_use]
    pub fn filter(&self, connection: ConnectionId) -> Option<TopicFilter> {
        self.state.read().filters.get(&connection).cloned()
    }

    /// Number of connections explicitly subscribed to `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.state
            .read()
            .topic_refcount
            .get(topic)
            .copied()
            .unwrap_or(0)
    }

    /// Aggregate statistics.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        let state = self.state.read();
        SubscriptionStats {
            connection_count: state.filters.len(),
            wildcard_count: state
                .filters
                .values()
                .filter(|filter| **filter == TopicFilter::All)
                .count(),
            topic_count: state.topic_refcount.len(),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Subscription statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Registered connections.
    pub connection_count: usize,
    /// Connections receiving every topic.
    pub wildcard_count: usize,
    /// Distinct explicitly requested topics.
    pub topic_count: usize,
}

// =============================================================================
// Tests
// =============================================================================
