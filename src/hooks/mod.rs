//! Hooks Module
//!
//! Extension points for credential validation and lifecycle events.
//! The broker core only ever talks to `dyn Hooks`; the default
//! implementation accepts every client.

use std::fmt;

use async_trait::async_trait;

use crate::protocol::{ConnectReturnCode, QoS};

#[cfg(test)]
mod tests;

/// Hook error types
#[derive(Debug)]
pub enum HookError {
    /// Internal error
    Internal(String),
    /// Credentials were checked and are wrong
    AuthenticationFailed,
    /// Client is known but not allowed to connect
    AuthorizationDenied,
}

impl HookError {
    /// CONNACK return code reported to a client rejected with this error
    pub fn connack_code(&self) -> ConnectReturnCode {
        match self {
            HookError::Internal(_) => ConnectReturnCode::ServerUnavailable,
            HookError::AuthenticationFailed => ConnectReturnCode::BadUsernameOrPassword,
            HookError::AuthorizationDenied => ConnectReturnCode::NotAuthorized,
        }
    }
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookError::Internal(msg) => write!(f, "Internal error: {}", msg),
            HookError::AuthenticationFailed => write!(f, "Authentication failed"),
            HookError::AuthorizationDenied => write!(f, "Authorization denied"),
        }
    }
}

impl std::error::Error for HookError {}

/// Hook result type
pub type HookResult<T> = Result<T, HookError>;

/// Broker hooks trait
///
/// All methods have default implementations that accept everything and
/// ignore events.
#[async_trait]
pub trait Hooks: Send + Sync {
    /// Called when a client sends CONNECT
    ///
    /// # Returns
    /// * `Ok(true)` - accept the client
    /// * `Ok(false)` - reject; CONNACK carries `BadUsernameOrPassword` when a
    ///   username was supplied and `NotAuthorized` otherwise
    /// * `Err(e)` - reject with `e.connack_code()`
    async fn on_authenticate(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _password: Option<&[u8]>,
    ) -> HookResult<bool> {
        Ok(true)
    }

    /// Called after CONNACK(Accepted) has been queued
    async fn on_client_connected(&self, _client_id: &str, _username: Option<&str>) {}

    /// Called once when an accepted client goes away
    ///
    /// `graceful` is true when the client sent DISCONNECT.
    async fn on_client_disconnected(&self, _client_id: &str, _graceful: bool) {}

    /// Called after a message has been routed to subscribers
    async fn on_message_published(&self, _topic: &str, _payload: &[u8], _qos: QoS) {}
}

/// Default hooks implementation that allows everything
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

#[async_trait]
impl Hooks for DefaultHooks {}

/// Implement Hooks for `Arc<T>` so a shared hooks value can be composed
#[async_trait]
impl<T: Hooks + ?Sized> Hooks for std::sync::Arc<T> {
    async fn on_authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> HookResult<bool> {
        (**self)
            .on_authenticate(client_id, username, password)
            .await
    }

    async fn on_client_connected(&self, client_id: &str, username: Option<&str>) {
        (**self).on_client_connected(client_id, username).await;
    }

    async fn on_client_disconnected(&self, client_id: &str, graceful: bool) {
        (**self).on_client_disconnected(client_id, graceful).await;
    }

    async fn on_message_published(&self, topic: &str, payload: &[u8], qos: QoS) {
        (**self).on_message_published(topic, payload, qos).await;
    }
}

/// Chains several hook implementations
///
/// Authentication succeeds only if every hook accepts; the first
/// rejection or error wins. Events are delivered to all hooks in order.
#[derive(Default)]
pub struct CompositeHooks {
    hooks: Vec<Box<dyn Hooks>>,
}

impl CompositeHooks {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn add<H: Hooks + 'static>(&mut self, hooks: H) {
        self.hooks.push(Box::new(hooks));
    }

    /// Add a hooks implementation and return self for chaining
    pub fn with<H: Hooks + 'static>(mut self, hooks: H) -> Self {
        self.add(hooks);
        self
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

#[async_trait]
impl Hooks for CompositeHooks {
    async fn on_authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> HookResult<bool> {
        for hooks in &self.hooks {
            if !hooks.on_authenticate(client_id, username, password).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn on_client_connected(&self, client_id: &str, username: Option<&str>) {
        for hooks in &self.hooks {
            hooks.on_client_connected(client_id, username).await;
        }
    }

    async fn on_client_disconnected(&self, client_id: &str, graceful: bool) {
        for hooks in &self.hooks {
            hooks.on_client_disconnected(client_id, graceful).await;
        }
    }

    async fn on_message_published(&self, topic: &str, payload: &[u8], qos: QoS) {
        for hooks in &self.hooks {
            hooks.on_message_published(topic, payload, qos).await;
        }
    }
}
