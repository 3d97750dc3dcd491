//! MQTT Connection Handler
//!
//! Drives a `SessionController` from a byte stream: decodes packets,
//! answers the protocol-level acknowledgments, enforces the CONNECT and
//! keep-alive timers, and writes whatever the session queues on its
//! handle. Generic over the stream so TCP, TLS and WebSocket share it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace};

use super::handle::{ChannelHandle, OutboundQueue};
use super::session::{ConnectRequest, SessionController};
use super::state::BrokerState;
use crate::codec::{Decoder, Encoder, DEFAULT_MAX_PACKET_SIZE};
use crate::hooks::Hooks;
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, EncodeError, Packet, ProtocolError, PubAck,
    PubComp, PubRec, PubRel, QoS,
};

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Decode(DecodeError),
    Encode(EncodeError),
    Protocol(ProtocolError),
    Timeout,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::Decode(e) => write!(f, "Decode error: {}", e),
            ConnectionError::Encode(e) => write!(f, "Encode error: {}", e),
            ConnectionError::Protocol(e) => write!(f, "Protocol error: {}", e),
            ConnectionError::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<DecodeError> for ConnectionError {
    fn from(e: DecodeError) -> Self {
        ConnectionError::Decode(e)
    }
}

impl From<EncodeError> for ConnectionError {
    fn from(e: EncodeError) -> Self {
        ConnectionError::Encode(e)
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        ConnectionError::Protocol(e)
    }
}

/// Per-connection limits
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub max_packet_size: usize,
    pub outbound_channel_capacity: usize,
    pub connect_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            outbound_channel_capacity: 1024,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Connection handler - generic over the stream type
pub struct Connection<S> {
    stream: S,
    addr: SocketAddr,
    decoder: Decoder,
    encoder: Encoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
    session: SessionController,
    outbound: OutboundQueue,
    shutdown: broadcast::Receiver<()>,
    connect_timeout: Duration,
    /// 1.5 x the client's keep-alive; `None` when disabled
    keep_alive: Option<Duration>,
    last_activity: Instant,
    next_packet_id: u16,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        addr: SocketAddr,
        state: Arc<BrokerState>,
        hooks: Arc<dyn Hooks>,
        settings: ConnectionSettings,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let (handle, outbound) = ChannelHandle::new(settings.outbound_channel_capacity);

        Self {
            stream,
            addr,
            decoder: Decoder::new().with_max_packet_size(settings.max_packet_size),
            encoder: Encoder::new(),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            session: SessionController::new(state, Arc::new(handle), hooks),
            outbound,
            shutdown,
            connect_timeout: settings.connect_timeout,
            keep_alive: None,
            last_activity: Instant::now(),
            next_packet_id: 0,
        }
    }

    pub fn session(&self) -> &SessionController {
        &self.session
    }

    /// Run the connection until it closes.
    ///
    /// The session is always torn down before this returns: `on_close`
    /// for an orderly end, `on_error` otherwise.
    pub async fn run(&mut self) -> Result<(), ConnectionError> {
        self.session.on_accept();

        let result = self.serve().await;
        match &result {
            Ok(()) => self.session.on_close().await,
            Err(e) => self.session.on_error(e).await,
        }
        result
    }

    async fn serve(&mut self) -> Result<(), ConnectionError> {
        let connect = match timeout(self.connect_timeout, self.read_connect()).await {
            Ok(result) => result?,
            Err(_) => {
                debug!("Connect timeout from {}", self.addr);
                return Err(ConnectionError::Timeout);
            }
        };

        let Some(connect) = connect else {
            debug!("Connection from {} closed before CONNECT", self.addr);
            return Ok(());
        };

        let keep_alive = connect.keep_alive;
        let accepted = self
            .session
            .on_connect(ConnectRequest::from(connect))
            .await;

        // CONNACK, accepted or not
        self.flush_outbound().await?;
        if !accepted {
            return Ok(());
        }

        self.keep_alive =
            (keep_alive > 0).then(|| Duration::from_millis(u64::from(keep_alive) * 1500));
        self.last_activity = Instant::now();
        self.run_connected().await
    }

    /// Read until the first packet; it must be CONNECT.
    ///
    /// Returns `Ok(None)` if the peer hangs up or the broker shuts down
    /// first.
    async fn read_connect(&mut self) -> Result<Option<Connect>, ConnectionError> {
        loop {
            match self.decoder.decode(&self.read_buf) {
                Ok(Some((packet, consumed))) => {
                    self.read_buf.advance(consumed);
                    return match packet {
                        Packet::Connect(connect) => Ok(Some(*connect)),
                        other => {
                            debug!(
                                "First packet from {} was {:?}, not CONNECT",
                                self.addr,
                                other.packet_type()
                            );
                            Err(ProtocolError::ProtocolViolation("first packet must be CONNECT")
                                .into())
                        }
                    };
                }
                Ok(None) => {}
                Err(DecodeError::InvalidProtocolVersion(level)) => {
                    // [MQTT-3.1.2-2]
                    debug!("Unsupported protocol level {} from {}", level, self.addr);
                    self.encode(Packet::ConnAck(ConnAck {
                        session_present: false,
                        return_code: ConnectReturnCode::UnacceptableProtocolVersion,
                    }))?;
                    self.flush().await?;
                    return Err(DecodeError::InvalidProtocolVersion(level).into());
                }
                Err(e) => return Err(e.into()),
            }

            tokio::select! {
                result = self.stream.read_buf(&mut self.read_buf) => {
                    if result? == 0 {
                        return Ok(None);
                    }
                }
                _ = self.shutdown.recv() => {
                    return Ok(None);
                }
            }
        }
    }

    /// Main loop once the session is active
    async fn run_connected(&mut self) -> Result<(), ConnectionError> {
        loop {
            if !self.process_buffered().await? {
                self.flush_outbound().await?;
                return Ok(());
            }
            self.flush().await?;

            let deadline = self.keep_alive.map(|ka| self.last_activity + ka);

            tokio::select! {
                result = self.stream.read_buf(&mut self.read_buf) => {
                    if result? == 0 {
                        debug!("Connection closed from {}", self.addr);
                        return Ok(());
                    }
                    self.last_activity = Instant::now();
                }

                Some(packet) = self.outbound.recv() => {
                    self.encode(packet)?;
                    self.flush_outbound().await?;
                }

                _ = sleep_until(deadline) => {
                    debug!("Keep alive timeout for {}", self.session.id());
                    return Err(ConnectionError::Timeout);
                }

                _ = self.shutdown.recv() => {
                    debug!("Connection {} shutting down", self.addr);
                    self.flush_outbound().await?;
                    return Ok(());
                }
            }
        }
    }

    /// Handle every complete packet in the read buffer.
    ///
    /// Returns `false` once a handler asks for the connection to close.
    async fn process_buffered(&mut self) -> Result<bool, ConnectionError> {
        while let Some((packet, consumed)) = self.decoder.decode(&self.read_buf)? {
            self.read_buf.advance(consumed);
            if !self.handle_packet(packet).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<bool, ConnectionError> {
        trace!("{:?} from {}", packet.packet_type(), self.session.id());

        let keep_open = match packet {
            Packet::Publish(publish) => {
                let ack = match (publish.qos, publish.packet_id) {
                    (QoS::AtLeastOnce, Some(packet_id)) => {
                        Some(Packet::PubAck(PubAck { packet_id }))
                    }
                    (QoS::ExactlyOnce, Some(packet_id)) => {
                        Some(Packet::PubRec(PubRec { packet_id }))
                    }
                    _ => None,
                };
                let keep_open = self.session.on_publish(publish.into()).await;
                if let Some(ack) = ack {
                    self.encode(ack)?;
                }
                keep_open
            }
            Packet::PubAck(ack) => self.session.on_puback(ack.packet_id),
            Packet::PubRec(rec) => {
                self.encode(Packet::PubRel(PubRel {
                    packet_id: rec.packet_id,
                }))?;
                self.session.on_pubrec(rec.packet_id)
            }
            Packet::PubRel(rel) => {
                self.encode(Packet::PubComp(PubComp {
                    packet_id: rel.packet_id,
                }))?;
                self.session.on_pubrel(rel.packet_id)
            }
            Packet::PubComp(comp) => self.session.on_pubcomp(comp.packet_id),
            Packet::Subscribe(subscribe) => self
                .session
                .on_subscribe(subscribe.packet_id, &subscribe.topics),
            Packet::Unsubscribe(unsubscribe) => self
                .session
                .on_unsubscribe(unsubscribe.packet_id, &unsubscribe.topics),
            Packet::PingReq => {
                self.encode(Packet::PingResp)?;
                true
            }
            Packet::Disconnect => {
                self.session.on_disconnect().await;
                false
            }
            // [MQTT-3.1.0-2] second CONNECT; the session rejects it
            Packet::Connect(connect) => self.session.on_connect((*connect).into()).await,
            Packet::ConnAck(_)
            | Packet::SubAck(_)
            | Packet::UnsubAck(_)
            | Packet::PingResp => {
                let violation = ProtocolError::ProtocolViolation("server-bound packet expected");
                return Err(violation.into());
            }
        };

        Ok(keep_open)
    }

    /// Append a packet to the write buffer, assigning an id to outbound
    /// QoS > 0 publishes
    fn encode(&mut self, mut packet: Packet) -> Result<(), ConnectionError> {
        if let Packet::Publish(ref mut publish) = packet {
            if publish.qos != QoS::AtMostOnce && publish.packet_id.is_none() {
                publish.packet_id = Some(self.next_packet_id());
            }
        }
        self.encoder.encode(&packet, &mut self.write_buf)?;
        Ok(())
    }

    /// Encode everything queued on the session's handle, then flush
    async fn flush_outbound(&mut self) -> Result<(), ConnectionError> {
        while let Some(packet) = self.outbound.try_recv() {
            self.encode(packet)?;
        }
        self.flush().await
    }

    async fn flush(&mut self) -> Result<(), ConnectionError> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        self.write_buf.clear();
        Ok(())
    }

    /// 1..=65535, wrapping past zero
    fn next_packet_id(&mut self) -> u16 {
        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        if self.next_packet_id == 0 {
            self.next_packet_id = 1;
        }
        self.next_packet_id
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
