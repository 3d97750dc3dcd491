//! Transport Layer
//!
//! Socket tuning for accepted TCP streams and the WebSocket adapter that
//! lets MQTT run over binary frames.

mod websocket;

pub use websocket::WsStream;

use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

/// Socket options applied to every accepted stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Disable Nagle's algorithm
    pub tcp_nodelay: bool,
    /// Idle time before TCP keepalive probes start; `None` disables them
    pub tcp_keepalive: Option<Duration>,
    /// Linger on close; `None` keeps the OS default
    pub linger: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            tcp_keepalive: Some(Duration::from_secs(60)),
            linger: None,
        }
    }
}

/// Configure a TCP stream
pub fn configure_stream(stream: &TcpStream, config: &TransportConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;

    let socket = SockRef::from(stream);
    if let Some(idle) = config.tcp_keepalive {
        socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
    }
    if config.linger.is_some() {
        socket.set_linger(config.linger)?;
    }
    Ok(())
}
