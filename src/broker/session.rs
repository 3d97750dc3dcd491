//! Session Controller
//!
//! Event-driven state machine for one connection. The transport feeds it
//! decoded protocol events; it mutates shared broker state and issues
//! outbound commands through the connection's handle. Every handler
//! returns `false` when the transport should close the connection.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::handle::{ConnectionHandle, ConnectionId};
use super::router::MessageRouter;
use super::state::BrokerState;
use crate::hooks::Hooks;
use crate::protocol::{Connect, ConnectReturnCode, Publish, QoS};

/// Lifecycle of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport accepted, controller not started
    Accepted,
    /// Waiting for CONNECT
    AwaitingConnect,
    /// CONNECT accepted, member of the connection set
    Active,
    /// Torn down; terminal
    Closed,
}

/// CONNECT fields the controller acts on
#[derive(Debug, Clone, Default)]
pub struct ConnectRequest {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub clean_session: bool,
    pub keep_alive: u16,
}

impl From<Connect> for ConnectRequest {
    fn from(connect: Connect) -> Self {
        Self {
            client_id: connect.client_id,
            username: connect.username,
            password: connect.password,
            clean_session: connect.clean_session,
            keep_alive: connect.keep_alive,
        }
    }
}

/// An inbound PUBLISH
#[derive(Debug, Clone)]
pub struct PublishEvent {
    pub qos: QoS,
    pub dup: bool,
    pub retain: bool,
    pub packet_id: Option<u16>,
    pub topic: Arc<str>,
    pub payload: Bytes,
}

impl From<Publish> for PublishEvent {
    fn from(publish: Publish) -> Self {
        Self {
            qos: publish.qos,
            dup: publish.dup,
            retain: publish.retain,
            packet_id: publish.packet_id,
            topic: publish.topic,
            payload: publish.payload,
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    Disconnect,
    Close,
    Error,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Disconnect => write!(f, "disconnect"),
            CloseReason::Close => write!(f, "close"),
            CloseReason::Error => write!(f, "error"),
        }
    }
}

/// Per-connection protocol state machine
pub struct SessionController {
    state: SessionState,
    broker: Arc<BrokerState>,
    router: MessageRouter,
    handle: Arc<dyn ConnectionHandle>,
    hooks: Arc<dyn Hooks>,
    client_id: Option<String>,
    keep_alive: u16,
}

impl SessionController {
    pub fn new(
        broker: Arc<BrokerState>,
        handle: Arc<dyn ConnectionHandle>,
        hooks: Arc<dyn Hooks>,
    ) -> Self {
        let router = MessageRouter::new(broker.clone());
        Self {
            state: SessionState::Accepted,
            broker,
            router,
            handle,
            hooks,
            client_id: None,
            keep_alive: 0,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Keep-alive negotiated by CONNECT, in seconds (0 = disabled)
    pub fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    pub fn on_accept(&mut self) {
        if self.state == SessionState::Accepted {
            debug!("Accepted {}", self.id());
            self.state = SessionState::AwaitingConnect;
        }
    }

    pub async fn on_connect(&mut self, request: ConnectRequest) -> bool {
        info!(
            "CONNECT {} from {} (username: {:?}, clean_session: {}, keep_alive: {})",
            request.client_id,
            self.id(),
            request.username,
            request.clean_session,
            request.keep_alive
        );

        if self.state != SessionState::AwaitingConnect {
            warn!("Unexpected CONNECT on {} in state {:?}", self.id(), self.state);
            return false;
        }

        let verdict = self
            .hooks
            .on_authenticate(
                &request.client_id,
                request.username.as_deref(),
                request.password.as_deref(),
            )
            .await;

        let rejection = match verdict {
            Ok(true) => None,
            Ok(false) if request.username.is_some() => {
                Some(ConnectReturnCode::BadUsernameOrPassword)
            }
            Ok(false) => Some(ConnectReturnCode::NotAuthorized),
            Err(e) => {
                warn!("Authentication hook failed for {}: {}", request.client_id, e);
                Some(e.connack_code())
            }
        };

        if let Some(code) = rejection {
            info!("Rejecting {} ({:?})", request.client_id, code);
            if let Err(e) = self.handle.send_connack(false, code) {
                debug!("CONNACK to {} not queued: {}", self.id(), e);
            }
            return false;
        }

        if !self.broker.connect(self.handle.clone()) {
            warn!("{} is already in the connection set", self.id());
            return false;
        }

        self.state = SessionState::Active;
        self.keep_alive = request.keep_alive;

        if let Err(e) = self.handle.send_connack(false, ConnectReturnCode::Accepted) {
            debug!("CONNACK to {} not queued: {}", self.id(), e);
        }

        self.hooks
            .on_client_connected(&request.client_id, request.username.as_deref())
            .await;
        self.client_id = Some(request.client_id);
        true
    }

    pub async fn on_publish(&mut self, event: PublishEvent) -> bool {
        debug!(
            "PUBLISH to {} (dup: {}, qos: {:?}, retain: {}, packet_id: {:?}, {} bytes)",
            event.topic,
            event.dup,
            event.qos,
            event.retain,
            event.packet_id,
            event.payload.len()
        );

        if !self.require_active("PUBLISH") {
            return false;
        }

        let summary = self
            .router
            .route(&event.topic, &event.payload, event.qos, event.retain);
        debug!(
            "Routed {} to {} of {} subscribers",
            event.topic, summary.delivered, summary.matched
        );

        self.hooks
            .on_message_published(&event.topic, &event.payload, event.qos)
            .await;
        true
    }

    pub fn on_subscribe(&mut self, packet_id: u16, entries: &[(String, QoS)]) -> bool {
        for (topic, qos) in entries {
            debug!("SUBSCRIBE {} to {} (QoS {:?})", self.id(), topic, qos);
        }

        if !self.require_active("SUBSCRIBE") {
            return false;
        }

        let granted = match self.broker.subscribe(self.id(), entries) {
            Ok(granted) => granted,
            Err(e) => {
                warn!("SUBSCRIBE rejected: {}", e);
                return false;
            }
        };

        // Acks are never dropped; a failed one closes the session
        if let Err(e) = self.handle.send_suback(packet_id, &granted) {
            warn!("SUBACK to {} not queued: {}", self.id(), e);
            return false;
        }
        true
    }

    pub fn on_unsubscribe(&mut self, packet_id: u16, topics: &[String]) -> bool {
        for topic in topics {
            debug!("UNSUBSCRIBE {} from {}", self.id(), topic);
        }

        if !self.require_active("UNSUBSCRIBE") {
            return false;
        }

        let removed = self.broker.unsubscribe(self.id(), topics);
        debug!("Removed {} subscriptions for {}", removed, self.id());

        if let Err(e) = self.handle.send_unsuback(packet_id) {
            warn!("UNSUBACK to {} not queued: {}", self.id(), e);
            return false;
        }
        true
    }

    pub fn on_puback(&mut self, packet_id: u16) -> bool {
        debug!("PUBACK {} from {}", packet_id, self.id());
        true
    }

    pub fn on_pubrec(&mut self, packet_id: u16) -> bool {
        debug!("PUBREC {} from {}", packet_id, self.id());
        true
    }

    pub fn on_pubrel(&mut self, packet_id: u16) -> bool {
        debug!("PUBREL {} from {}", packet_id, self.id());
        true
    }

    pub fn on_pubcomp(&mut self, packet_id: u16) -> bool {
        debug!("PUBCOMP {} from {}", packet_id, self.id());
        true
    }

    /// Client sent DISCONNECT
    pub async fn on_disconnect(&mut self) {
        self.teardown(CloseReason::Disconnect).await;
    }

    /// Transport closed
    pub async fn on_close(&mut self) {
        self.teardown(CloseReason::Close).await;
    }

    /// Transport or protocol error
    pub async fn on_error(&mut self, error: &(dyn std::error::Error + Send + Sync)) {
        debug!("Error on {}: {}", self.id(), error);
        self.teardown(CloseReason::Error).await;
    }

    async fn teardown(&mut self, reason: CloseReason) {
        if self.state == SessionState::Closed {
            return;
        }
        let was_active = self.state == SessionState::Active;
        self.state = SessionState::Closed;

        match self.broker.teardown(self.id()) {
            Some(removed) => debug!(
                "Closed {} ({}), removed {} subscriptions",
                self.id(),
                reason,
                removed
            ),
            None => debug!("Closed {} ({}) before CONNECT", self.id(), reason),
        }

        if was_active {
            if let Some(ref client_id) = self.client_id {
                info!("Client {} disconnected ({})", client_id, reason);
                self.hooks
                    .on_client_disconnected(client_id, reason == CloseReason::Disconnect)
                    .await;
            }
        }
    }

    fn require_active(&self, packet: &str) -> bool {
        if self.state == SessionState::Active {
            return true;
        }
        warn!("{} on {} in state {:?}", packet, self.id(), self.state);
        false
    }
}
