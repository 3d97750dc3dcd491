//! Shared broker state
//!
//! The connection set and the subscription registry live behind a single
//! lock so that teardown (leave the set, drop every subscription) is one
//! atomic step with respect to routing lookups. No I/O happens while the
//! lock is held; callers get cloned handles back and deliver afterwards.

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;
use serde::Deserialize;
use smallvec::SmallVec;

use super::handle::{ConnectionHandle, ConnectionId};
use crate::protocol::QoS;
use crate::topic::{ResubscribePolicy, Subscription, SubscriptionRegistry};

/// Which subscriptions an UNSUBSCRIBE removes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnsubscribeScope {
    /// Only the requesting connection's subscription
    #[default]
    Session,
    /// Every subscription on the topic, whoever holds it
    Topic,
}

/// Subscription behaviour knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscriptionPolicy {
    pub resubscribe: ResubscribePolicy,
    pub unsubscribe_scope: UnsubscribeScope,
}

/// Route fan-out captured under the read lock
pub type RouteTargets = SmallVec<[(Arc<dyn ConnectionHandle>, QoS); 16]>;

/// Connections that completed the CONNECT handshake
#[derive(Default)]
pub struct ConnectionSet {
    handles: AHashMap<ConnectionId, Arc<dyn ConnectionHandle>>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the id is already present
    pub fn add(&mut self, id: ConnectionId, handle: Arc<dyn ConnectionHandle>) -> bool {
        if self.handles.contains_key(&id) {
            return false;
        }
        self.handles.insert(id, handle);
        true
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<Arc<dyn ConnectionHandle>> {
        self.handles.remove(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.handles.contains_key(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Arc<dyn ConnectionHandle>> {
        self.handles.get(&id)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

/// Error from a state mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    /// The connection is not (or no longer) in the connection set
    NotConnected(ConnectionId),
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateError::NotConnected(id) => write!(f, "{} is not connected", id),
        }
    }
}

impl std::error::Error for StateError {}

struct Inner {
    connections: ConnectionSet,
    registry: SubscriptionRegistry,
}

/// Registry and connection set under one lock
pub struct BrokerState {
    inner: RwLock<Inner>,
    policy: SubscriptionPolicy,
}

impl BrokerState {
    pub fn new(policy: SubscriptionPolicy) -> Self {
        Self {
            inner: RwLock::new(Inner {
                connections: ConnectionSet::new(),
                registry: SubscriptionRegistry::with_policy(policy.resubscribe),
            }),
            policy,
        }
    }

    pub fn policy(&self) -> SubscriptionPolicy {
        self.policy
    }

    /// Admit a connection after a successful handshake
    pub fn connect(&self, handle: Arc<dyn ConnectionHandle>) -> bool {
        let id = handle.id();
        self.inner.write().connections.add(id, handle)
    }

    pub fn is_connected(&self, id: ConnectionId) -> bool {
        self.inner.read().connections.contains(id)
    }

    /// Insert every entry for `id`; returns the granted QoS per entry.
    ///
    /// Fails without touching the registry if `id` has already been torn
    /// down, so no subscription can outlive its connection.
    pub fn subscribe(
        &self,
        id: ConnectionId,
        entries: &[(String, QoS)],
    ) -> Result<Vec<QoS>, StateError> {
        let mut inner = self.inner.write();
        if !inner.connections.contains(id) {
            return Err(StateError::NotConnected(id));
        }

        Ok(entries
            .iter()
            .map(|(topic, qos)| {
                inner.registry.insert(topic, id, *qos);
                *qos
            })
            .collect())
    }

    /// Remove subscriptions per the configured scope; returns how many went
    pub fn unsubscribe(&self, id: ConnectionId, topics: &[String]) -> usize {
        let mut inner = self.inner.write();
        topics
            .iter()
            .map(|topic| match self.policy.unsubscribe_scope {
                UnsubscribeScope::Session => inner.registry.remove(topic, id),
                UnsubscribeScope::Topic => inner.registry.remove_by_topic(topic),
            })
            .sum()
    }

    /// Leave the connection set and drop all subscriptions in one step.
    ///
    /// Returns the number of subscriptions removed, or `None` if the
    /// connection was not present (never admitted, or already torn down).
    pub fn teardown(&self, id: ConnectionId) -> Option<usize> {
        let mut inner = self.inner.write();
        let member = inner.connections.remove(id).is_some();
        // Sweep the registry even for non-members; it must be empty for them
        let removed = inner.registry.remove_by_connection(id);
        if member {
            Some(removed)
        } else {
            None
        }
    }

    /// Resolve deliveries for `topic` with the effective QoS per subscriber
    pub fn route_targets(&self, topic: &str, publish_qos: QoS) -> RouteTargets {
        let inner = self.inner.read();
        let mut targets = RouteTargets::new();
        inner.registry.for_each_match(topic, |conn, sub_qos| {
            if let Some(handle) = inner.connections.get(conn) {
                targets.push((handle.clone(), sub_qos.min(publish_qos)));
            }
        });
        targets
    }

    pub fn lookup_by_topic(&self, topic: &str) -> Vec<Subscription> {
        self.inner.read().registry.lookup_by_topic(topic)
    }

    pub fn topics_for(&self, id: ConnectionId) -> Vec<Arc<str>> {
        self.inner.read().registry.topics_for(id)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.read().connections.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.read().registry.len()
    }

    pub fn topic_count(&self) -> usize {
        self.inner.read().registry.topic_count()
    }
}

impl Default for BrokerState {
    fn default() -> Self {
        Self::new(SubscriptionPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::handle::ChannelHandle;
    use pretty_assertions::assert_eq;

    fn handle() -> Arc<dyn ConnectionHandle> {
        let (handle, _rx) = ChannelHandle::new(4);
        Arc::new(handle)
    }

    #[test]
    fn test_connection_set() {
        let mut set = ConnectionSet::new();
        let h = handle();
        let id = h.id();

        assert!(set.is_empty());
        assert!(set.add(id, h.clone()));
        assert!(!set.add(id, h));
        assert!(set.contains(id));
        assert_eq!(set.get(id).map(|h| h.id()), Some(id));
        assert_eq!(set.len(), 1);

        assert!(set.remove(id).is_some());
        assert!(set.remove(id).is_none());
        assert!(!set.contains(id));
        assert!(set.get(id).is_none());
    }

    #[test]
    fn test_subscribe_requires_membership() {
        let state = BrokerState::default();
        let h = handle();
        let id = h.id();
        let entries = vec![("a".to_string(), QoS::AtLeastOnce)];

        assert_eq!(
            state.subscribe(id, &entries),
            Err(StateError::NotConnected(id))
        );
        assert!(state.connect(h));
        assert_eq!(state.subscribe(id, &entries), Ok(vec![QoS::AtLeastOnce]));
        assert_eq!(state.subscription_count(), 1);
    }

    #[test]
    fn test_teardown_is_atomic_and_idempotent() {
        let state = BrokerState::default();
        let h = handle();
        let id = h.id();
        state.connect(h);
        state
            .subscribe(
                id,
                &[
                    ("a".to_string(), QoS::AtMostOnce),
                    ("b".to_string(), QoS::ExactlyOnce),
                ],
            )
            .unwrap();

        assert_eq!(state.teardown(id), Some(2));
        assert!(!state.is_connected(id));
        assert_eq!(state.subscription_count(), 0);
        assert_eq!(state.topic_count(), 0);
        assert_eq!(state.teardown(id), None);
    }

    #[test]
    fn test_route_targets_use_min_qos() {
        let state = BrokerState::default();
        let h = handle();
        let id = h.id();
        state.connect(h);
        state
            .subscribe(id, &[("t".to_string(), QoS::ExactlyOnce)])
            .unwrap();

        let targets = state.route_targets("t", QoS::AtLeastOnce);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].0.id(), id);
        assert_eq!(targets[0].1, QoS::AtLeastOnce);
        assert!(state.route_targets("other", QoS::AtLeastOnce).is_empty());
    }
}
