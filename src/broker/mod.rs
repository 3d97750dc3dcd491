//! MQTT Broker Core
//!
//! Owns the shared broker state, runs the listeners and spawns one
//! connection task per accepted socket.

mod connection;
mod handle;
mod router;
mod session;
mod state;
pub mod tls;


pub use connection::{Connection, ConnectionError, ConnectionSettings};
pub use handle::{ChannelHandle, ConnectionHandle, ConnectionId, OutboundQueue, SendError};
pub use router::{MessageRouter, RouteSummary};
pub use session::{ConnectRequest, PublishEvent, SessionController, SessionState};
pub use state::{
    BrokerState, ConnectionSet, RouteTargets, StateError, SubscriptionPolicy, UnsubscribeScope,
};

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::codec::DEFAULT_MAX_PACKET_SIZE;
use crate::config::Config;
use crate::hooks::{DefaultHooks, Hooks};
use crate::protocol::QoS;
use crate::transport::{configure_stream, TransportConfig, WsStream};

/// TLS listener configuration
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Certificate chain (PEM)
    pub cert_path: String,
    /// Private key (PEM)
    pub key_path: String,
    /// CA bundle for client certificates (PEM)
    pub ca_cert_path: Option<String>,
    /// Reject clients without a certificate signed by `ca_cert_path`
    pub require_client_cert: bool,
}

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// TCP bind address
    pub bind_addr: SocketAddr,
    /// MQTT over TLS bind address
    pub tls_bind_addr: Option<SocketAddr>,
    /// WebSocket bind address
    pub ws_bind_addr: Option<SocketAddr>,
    /// WebSocket over TLS bind address
    pub wss_bind_addr: Option<SocketAddr>,
    /// WebSocket path (default: "/mqtt")
    pub ws_path: String,
    /// Certificates shared by the TLS and WSS listeners
    pub tls: Option<TlsConfig>,
    /// Maximum open sockets (0 = unbounded)
    pub max_connections: usize,
    /// Maximum packet size
    pub max_packet_size: usize,
    /// Per-connection outbound queue length
    pub outbound_channel_capacity: usize,
    /// Time allowed for the transport handshake and CONNECT
    pub connect_timeout: Duration,
    /// Re-subscribe and unsubscribe behaviour
    pub subscription_policy: SubscriptionPolicy,
    /// Socket options for accepted streams
    pub transport: TransportConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 1883)),
            tls_bind_addr: None,
            ws_bind_addr: None,
            wss_bind_addr: None,
            ws_path: "/mqtt".to_string(),
            tls: None,
            max_connections: 100_000,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            outbound_channel_capacity: 1024,
            connect_timeout: Duration::from_secs(30),
            subscription_policy: SubscriptionPolicy::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Build the runtime configuration from a loaded config file
    pub fn from_config(config: &Config) -> Self {
        Self {
            bind_addr: config.server.bind,
            tls_bind_addr: config.server.tls_bind,
            ws_bind_addr: config.server.ws_bind,
            wss_bind_addr: config.server.wss_bind,
            ws_path: config.server.ws_path.clone(),
            tls: config.server.tls.as_ref().map(|tls| TlsConfig {
                cert_path: tls.cert.clone(),
                key_path: tls.key.clone(),
                ca_cert_path: tls.ca_cert.clone(),
                require_client_cert: tls.require_client_cert,
            }),
            max_connections: config.limits.max_connections,
            max_packet_size: config.limits.max_packet_size,
            outbound_channel_capacity: config.limits.outbound_channel_capacity,
            connect_timeout: config.limits.connect_timeout,
            subscription_policy: SubscriptionPolicy {
                resubscribe: config.subscriptions.resubscribe,
                unsubscribe_scope: config.subscriptions.unsubscribe_scope,
            },
            transport: TransportConfig {
                tcp_nodelay: config.server.tcp_nodelay,
                tcp_keepalive: (!config.server.tcp_keepalive.is_zero())
                    .then_some(config.server.tcp_keepalive),
                linger: config.server.linger,
            },
        }
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            max_packet_size: self.max_packet_size,
            outbound_channel_capacity: self.outbound_channel_capacity,
            connect_timeout: self.connect_timeout,
        }
    }
}

/// How sockets accepted by a listener are turned into MQTT streams
#[derive(Clone)]
enum Transport {
    Tcp,
    Tls(TlsAcceptor),
    Ws(Arc<str>),
    Wss(TlsAcceptor, Arc<str>),
}

impl Transport {
    fn name(&self) -> &'static str {
        match self {
            Transport::Tcp => "TCP",
            Transport::Tls(_) => "TLS",
            Transport::Ws(_) => "WebSocket",
            Transport::Wss(..) => "WebSocket/TLS",
        }
    }
}

/// Holds one of the `max_connections` slots until dropped
struct ConnectionSlot {
    open: Arc<AtomicUsize>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Everything a listener needs to start connection tasks
#[derive(Clone)]
struct Acceptor {
    state: Arc<BrokerState>,
    hooks: Arc<dyn Hooks>,
    settings: ConnectionSettings,
    transport_config: TransportConfig,
    shutdown: broadcast::Sender<()>,
    open: Arc<AtomicUsize>,
    max_connections: usize,
}

impl Acceptor {
    fn reserve(&self) -> Option<ConnectionSlot> {
        let reserved = self
            .open
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                if self.max_connections == 0 || open < self.max_connections {
                    Some(open + 1)
                } else {
                    None
                }
            });
        reserved.ok().map(|_| ConnectionSlot {
            open: self.open.clone(),
        })
    }

    async fn accept_loop(
        self,
        listener: TcpListener,
        transport: Transport,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let Some(slot) = self.reserve() else {
                            warn!("Connection limit reached, dropping {}", addr);
                            continue;
                        };
                        debug!("New {} connection from {}", transport.name(), addr);
                        if let Err(e) = configure_stream(&stream, &self.transport_config) {
                            debug!("Failed to configure socket for {}: {}", addr, e);
                        }
                        // Subscribe before spawning so a shutdown sent during
                        // the handshake is not missed
                        let shutdown_rx = self.shutdown.subscribe();
                        let acceptor = self.clone();
                        let transport = transport.clone();
                        tokio::spawn(async move {
                            acceptor.open(stream, addr, transport, shutdown_rx).await;
                            drop(slot);
                        });
                    }
                    Err(e) => error!("Failed to accept {} connection: {}", transport.name(), e),
                },
                _ = shutdown.recv() => {
                    debug!("{} listener stopping", transport.name());
                    break;
                }
            }
        }
    }

    async fn open(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        transport: Transport,
        shutdown: broadcast::Receiver<()>,
    ) {
        let handshake_timeout = self.settings.connect_timeout;

        match transport {
            Transport::Tcp => self.serve(stream, addr, shutdown).await,
            Transport::Tls(tls) => match timeout(handshake_timeout, tls.accept(stream)).await {
                Ok(Ok(stream)) => self.serve(stream, addr, shutdown).await,
                Ok(Err(e)) => debug!("TLS handshake failed for {}: {}", addr, e),
                Err(_) => debug!("TLS handshake timed out for {}", addr),
            },
            Transport::Ws(path) => {
                let handshake = WsStream::accept_with_path(stream, &path);
                match timeout(handshake_timeout, handshake).await {
                    Ok(Ok(stream)) => self.serve(stream, addr, shutdown).await,
                    Ok(Err(e)) => debug!("WebSocket handshake failed for {}: {}", addr, e),
                    Err(_) => debug!("WebSocket handshake timed out for {}", addr),
                }
            }
            Transport::Wss(tls, path) => {
                let handshake = async {
                    let stream = tls.accept(stream).await?;
                    WsStream::accept_with_path(stream, &path).await
                };
                match timeout(handshake_timeout, handshake).await {
                    Ok(Ok(stream)) => self.serve(stream, addr, shutdown).await,
                    Ok(Err(e)) => debug!("WebSocket/TLS handshake failed for {}: {}", addr, e),
                    Err(_) => debug!("WebSocket/TLS handshake timed out for {}", addr),
                }
            }
        }
    }

    async fn serve<S>(&self, stream: S, addr: SocketAddr, shutdown: broadcast::Receiver<()>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut conn = Connection::new(
            stream,
            addr,
            self.state.clone(),
            self.hooks.clone(),
            self.settings,
            shutdown,
        );
        if let Err(e) = conn.run().await {
            debug!("Connection error from {}: {}", addr, e);
        }
    }
}

/// The MQTT Broker
pub struct Broker {
    config: BrokerConfig,
    state: Arc<BrokerState>,
    router: MessageRouter,
    hooks: Arc<dyn Hooks>,
    shutdown: broadcast::Sender<()>,
    /// Open sockets, including ones still handshaking
    open: Arc<AtomicUsize>,
}

impl Broker {
    /// Create a new broker with default hooks (allows everything)
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_hooks(config, Arc::new(DefaultHooks))
    }

    /// Create a new broker with custom hooks
    pub fn with_hooks(config: BrokerConfig, hooks: Arc<dyn Hooks>) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let state = Arc::new(BrokerState::new(config.subscription_policy));

        Self {
            router: MessageRouter::new(state.clone()),
            config,
            state,
            hooks,
            shutdown,
            open: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Shared state, for embedding and tests
    pub fn state(&self) -> &Arc<BrokerState> {
        &self.state
    }

    /// Run every configured listener until `shutdown` is called.
    ///
    /// Each open connection receives the shutdown signal too and tears its
    /// session down before its task ends.
    pub async fn run(&self) -> io::Result<()> {
        let tls = match &self.config.tls {
            Some(config) => Some(tls::load_tls_config(config).map_err(io::Error::other)?),
            None => None,
        };
        let needs_tls =
            self.config.tls_bind_addr.is_some() || self.config.wss_bind_addr.is_some();
        if needs_tls && tls.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "TLS listener configured without certificates",
            ));
        }

        let acceptor = Acceptor {
            state: self.state.clone(),
            hooks: self.hooks.clone(),
            settings: self.config.connection_settings(),
            transport_config: self.config.transport.clone(),
            shutdown: self.shutdown.clone(),
            open: self.open.clone(),
            max_connections: self.config.max_connections,
        };
        let ws_path: Arc<str> = Arc::from(self.config.ws_path.as_str());

        let mut listeners = vec![(self.config.bind_addr, Transport::Tcp)];
        if let (Some(addr), Some(tls)) = (self.config.tls_bind_addr, &tls) {
            listeners.push((addr, Transport::Tls(tls.clone())));
        }
        if let Some(addr) = self.config.ws_bind_addr {
            listeners.push((addr, Transport::Ws(ws_path.clone())));
        }
        if let (Some(addr), Some(tls)) = (self.config.wss_bind_addr, &tls) {
            listeners.push((addr, Transport::Wss(tls.clone(), ws_path.clone())));
        }

        // Bind everything before accepting anything so a bad address fails fast
        let mut bound = Vec::with_capacity(listeners.len());
        for (addr, transport) in listeners {
            let listener = TcpListener::bind(addr).await?;
            match &transport {
                Transport::Ws(path) | Transport::Wss(_, path) => info!(
                    "MQTT/{} listening on {} (path: {})",
                    transport.name(),
                    addr,
                    path
                ),
                _ => info!("MQTT/{} listening on {}", transport.name(), addr),
            }
            bound.push((listener, transport));
        }

        let tasks: Vec<_> = bound
            .into_iter()
            .map(|(listener, transport)| {
                // Subscribed here, not in the task, so an early shutdown is seen
                let shutdown = self.shutdown.subscribe();
                tokio::spawn(acceptor.clone().accept_loop(listener, transport, shutdown))
            })
            .collect();

        for task in tasks {
            if let Err(e) = task.await {
                error!("Listener task failed: {}", e);
            }
        }

        info!("Broker stopped");
        Ok(())
    }

    /// Stop the listeners and close every connection
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Sessions that completed CONNECT
    pub fn connection_count(&self) -> usize {
        self.state.connection_count()
    }

    /// Open sockets counted against `max_connections`
    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }

    pub fn subscription_count(&self) -> usize {
        self.state.subscription_count()
    }

    /// Publish a message from the server to every subscriber of `topic`
    pub fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> RouteSummary {
        let topic: Arc<str> = Arc::from(topic);
        self.router.route(&topic, &payload, qos, retain)
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}
