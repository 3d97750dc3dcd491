//! Message Router
//!
//! Distributes a published message to every exact-topic subscriber at
//! `min(subscription QoS, publish QoS)`.

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use super::state::BrokerState;
use crate::protocol::QoS;

/// Outcome of routing one message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteSummary {
    /// Subscribers resolved for the topic
    pub matched: usize,
    /// Deliveries accepted by the subscriber's handle
    pub delivered: usize,
    /// Deliveries refused (closed or full queue)
    pub failed: usize,
}

/// Message router for distributing messages to subscribers
#[derive(Clone)]
pub struct MessageRouter {
    state: Arc<BrokerState>,
}

impl MessageRouter {
    pub fn new(state: Arc<BrokerState>) -> Self {
        Self { state }
    }

    /// Deliver to every subscriber of `topic`.
    ///
    /// Targets are captured under the state's read lock; delivery happens
    /// after it is released. A failed delivery affects only that subscriber.
    pub fn route(&self, topic: &Arc<str>, payload: &Bytes, qos: QoS, retain: bool) -> RouteSummary {
        let targets = self.state.route_targets(topic, qos);

        let mut summary = RouteSummary {
            matched: targets.len(),
            ..Default::default()
        };

        for (handle, effective_qos) in targets {
            match handle.deliver_publish(topic, payload, effective_qos, retain) {
                Ok(()) => summary.delivered += 1,
                Err(e) => {
                    debug!("Delivery of {} to {} failed: {}", topic, handle.id(), e);
                    summary.failed += 1;
                }
            }
        }

        summary
    }
}
