//! Hooks module tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::*;

#[tokio::test]
async fn test_default_hooks_allow_all() {
    let hooks = DefaultHooks;

    let result = hooks
        .on_authenticate("client1", Some("user"), Some(b"pass"))
        .await
        .unwrap();
    assert!(result, "DefaultHooks should allow authentication");

    let result = hooks.on_authenticate("client1", None, None).await.unwrap();
    assert!(result, "DefaultHooks should allow anonymous clients");
}

struct AllowHooks;
struct DenyHooks;
struct FailingHooks;

#[async_trait]
impl Hooks for AllowHooks {}

#[async_trait]
impl Hooks for DenyHooks {
    async fn on_authenticate(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _password: Option<&[u8]>,
    ) -> HookResult<bool> {
        Ok(false)
    }
}

#[async_trait]
impl Hooks for FailingHooks {
    async fn on_authenticate(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _password: Option<&[u8]>,
    ) -> HookResult<bool> {
        Err(HookError::Internal("backend down".to_string()))
    }
}

/// Counts lifecycle events
#[derive(Default)]
struct CountingHooks {
    connected: AtomicUsize,
    disconnected: AtomicUsize,
    published: AtomicUsize,
}

#[async_trait]
impl Hooks for CountingHooks {
    async fn on_client_connected(&self, _client_id: &str, _username: Option<&str>) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_client_disconnected(&self, _client_id: &str, _graceful: bool) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_message_published(&self, _topic: &str, _payload: &[u8], _qos: QoS) {
        self.published.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_composite_hooks_all_must_allow() {
    let hooks = CompositeHooks::new().with(AllowHooks).with(AllowHooks);

    let result = hooks
        .on_authenticate("client1", Some("user"), Some(b"pass"))
        .await
        .unwrap();
    assert!(result, "Both hooks allow, should be allowed");
}

#[tokio::test]
async fn test_composite_hooks_one_deny_fails() {
    let hooks = CompositeHooks::new().with(AllowHooks).with(DenyHooks);

    let result = hooks
        .on_authenticate("client1", Some("user"), Some(b"pass"))
        .await
        .unwrap();
    assert!(!result, "One hook denies, should be denied");
}

#[tokio::test]
async fn test_composite_hooks_error_propagates() {
    let hooks = CompositeHooks::new().with(AllowHooks).with(FailingHooks);

    let err = hooks
        .on_authenticate("client1", None, None)
        .await
        .unwrap_err();
    assert_eq!(err.connack_code(), ConnectReturnCode::ServerUnavailable);
}

#[tokio::test]
async fn test_composite_hooks_fan_out_events() {
    let counter = Arc::new(CountingHooks::default());
    let hooks = CompositeHooks::new()
        .with(counter.clone())
        .with(counter.clone());
    assert_eq!(hooks.len(), 2);

    hooks.on_client_connected("client1", None).await;
    hooks.on_client_disconnected("client1", true).await;
    hooks
        .on_message_published("t", b"payload", QoS::AtLeastOnce)
        .await;

    assert_eq!(counter.connected.load(Ordering::SeqCst), 2);
    assert_eq!(counter.disconnected.load(Ordering::SeqCst), 2);
    assert_eq!(counter.published.load(Ordering::SeqCst), 2);
}

#[test]
fn test_hook_error_connack_codes() {
    assert_eq!(
        HookError::AuthenticationFailed.connack_code(),
        ConnectReturnCode::BadUsernameOrPassword
    );
    assert_eq!(
        HookError::AuthorizationDenied.connack_code(),
        ConnectReturnCode::NotAuthorized
    );
    assert_eq!(
        HookError::Internal(String::new()).connack_code(),
        ConnectReturnCode::ServerUnavailable
    );
}

#[test]
fn test_hook_error_display() {
    let internal = HookError::Internal("test error".to_string());
    assert_eq!(format!("{}", internal), "Internal error: test error");

    let auth_failed = HookError::AuthenticationFailed;
    assert_eq!(format!("{}", auth_failed), "Authentication failed");

    let auth_denied = HookError::AuthorizationDenied;
    assert_eq!(format!("{}", auth_denied), "Authorization denied");
}
