//! Subscription registry
//!
//! A many-to-many index of `(topic, connection, qos)` triples. Topics are
//! matched by exact string equality. The registry is indexed both by topic
//! (for routing) and by connection (for teardown), so each lookup costs
//! O(matches) rather than a scan of every subscription.
//!
//! The registry itself is not synchronized; `BrokerState` owns it behind
//! the same lock as the connection set.

use std::sync::Arc;

use ahash::AHashMap;
use serde::Deserialize;
use smallvec::SmallVec;

use crate::broker::ConnectionId;
use crate::protocol::QoS;

#[cfg(test)]
mod tests;

/// What `insert` does when the connection already subscribes to the topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResubscribePolicy {
    /// Overwrite the QoS of the existing entry
    #[default]
    Replace,
    /// Keep the existing entry and add another one
    Append,
}

/// A subscription as seen by callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic: Arc<str>,
    pub connection: ConnectionId,
    pub qos: QoS,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    connection: ConnectionId,
    qos: QoS,
}

/// Exact-topic subscription index
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    policy: ResubscribePolicy,
    /// Most topics have only a handful of subscribers
    by_topic: AHashMap<Arc<str>, SmallVec<[Entry; 4]>>,
    /// Per-connection topic multiset; counts exceed 1 only under `Append`
    by_connection: AHashMap<ConnectionId, AHashMap<Arc<str>, usize>>,
    len: usize,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::with_policy(ResubscribePolicy::default())
    }

    pub fn with_policy(policy: ResubscribePolicy) -> Self {
        Self {
            policy,
            by_topic: AHashMap::new(),
            by_connection: AHashMap::new(),
            len: 0,
        }
    }

    pub fn policy(&self) -> ResubscribePolicy {
        self.policy
    }

    /// Add a subscription.
    ///
    /// Returns `true` if a new entry was created, `false` if an existing
    /// entry had its QoS replaced.
    pub fn insert(&mut self, topic: &str, connection: ConnectionId, qos: QoS) -> bool {
        // Share one Arc<str> between both indexes
        let key: Arc<str> = match self.by_topic.get_key_value(topic) {
            Some((key, _)) => key.clone(),
            None => Arc::from(topic),
        };

        let entries = self.by_topic.entry(key.clone()).or_default();

        if self.policy == ResubscribePolicy::Replace {
            if let Some(existing) = entries.iter_mut().find(|e| e.connection == connection) {
                existing.qos = qos;
                return false;
            }
        }

        entries.push(Entry { connection, qos });
        *self
            .by_connection
            .entry(connection)
            .or_default()
            .entry(key)
            .or_insert(0) += 1;
        self.len += 1;
        true
    }

    /// All subscriptions whose topic equals `topic`, in no particular order
    pub fn lookup_by_topic(&self, topic: &str) -> Vec<Subscription> {
        match self.by_topic.get_key_value(topic) {
            Some((key, entries)) => entries
                .iter()
                .map(|e| Subscription {
                    topic: key.clone(),
                    connection: e.connection,
                    qos: e.qos,
                })
                .collect(),
            None => Vec::new(),
        }
    }

    /// Visit every subscription on `topic` without allocating
    pub fn for_each_match<F>(&self, topic: &str, mut callback: F)
    where
        F: FnMut(ConnectionId, QoS),
    {
        if let Some(entries) = self.by_topic.get(topic) {
            for e in entries {
                callback(e.connection, e.qos);
            }
        }
    }

    /// Remove every subscription on `topic`, whoever owns it
    pub fn remove_by_topic(&mut self, topic: &str) -> usize {
        let Some(entries) = self.by_topic.remove(topic) else {
            return 0;
        };

        for e in &entries {
            self.forget(e.connection, topic);
        }
        self.len -= entries.len();
        entries.len()
    }

    /// Remove the subscriptions `connection` holds on `topic`
    pub fn remove(&mut self, topic: &str, connection: ConnectionId) -> usize {
        let Some(entries) = self.by_topic.get_mut(topic) else {
            return 0;
        };

        let before = entries.len();
        entries.retain(|e| e.connection != connection);
        let removed = before - entries.len();
        if entries.is_empty() {
            self.by_topic.remove(topic);
        }

        if removed > 0 {
            if let Some(topics) = self.by_connection.get_mut(&connection) {
                topics.remove(topic);
                if topics.is_empty() {
                    self.by_connection.remove(&connection);
                }
            }
            self.len -= removed;
        }
        removed
    }

    /// Remove every subscription held by `connection`
    pub fn remove_by_connection(&mut self, connection: ConnectionId) -> usize {
        let Some(topics) = self.by_connection.remove(&connection) else {
            return 0;
        };

        let mut removed = 0;
        for topic in topics.keys() {
            if let Some(entries) = self.by_topic.get_mut(topic) {
                let before = entries.len();
                entries.retain(|e| e.connection != connection);
                removed += before - entries.len();
                if entries.is_empty() {
                    self.by_topic.remove(topic);
                }
            }
        }
        self.len -= removed;
        removed
    }

    /// Total number of subscriptions
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of distinct topics with at least one subscriber
    pub fn topic_count(&self) -> usize {
        self.by_topic.len()
    }

    /// Distinct topics `connection` is subscribed to
    pub fn topics_for(&self, connection: ConnectionId) -> Vec<Arc<str>> {
        self.by_connection
            .get(&connection)
            .map(|topics| topics.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop one occurrence of `topic` from the connection index
    fn forget(&mut self, connection: ConnectionId, topic: &str) {
        if let Some(topics) = self.by_connection.get_mut(&connection) {
            if let Some(count) = topics.get_mut(topic) {
                *count -= 1;
                if *count == 0 {
                    topics.remove(topic);
                }
            }
            if topics.is_empty() {
                self.by_connection.remove(&connection);
            }
        }
    }
}
