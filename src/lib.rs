//! TideMQ - exact-topic MQTT v3.1.1 broker
//!
//! Clients connect over TCP, TLS or WebSocket, subscribe to literal topic
//! names and receive every message published to those names at the lower
//! of the publish and subscription QoS.

pub mod broker;
pub mod codec;
pub mod config;
pub mod hooks;
pub mod protocol;
pub mod topic;
pub mod transport;

pub use broker::{Broker, BrokerConfig, BrokerState};
pub use config::Config;
pub use hooks::{CompositeHooks, DefaultHooks, Hooks};
pub use protocol::QoS;
pub use topic::SubscriptionRegistry;
