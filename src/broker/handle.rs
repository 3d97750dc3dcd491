//! Connection handles
//!
//! A `ConnectionHandle` is the outbound side of one client connection as
//! the broker core sees it: a stable identity plus the commands a session
//! or the router may issue. The core never touches sockets directly.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::protocol::{
    ConnAck, ConnectReturnCode, Packet, Publish, QoS, SubAck, SubAckReturnCode, UnsubAck,
};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate a fresh id
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Outbound command could not be queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The connection's writer has gone away
    Closed,
    /// The outbound queue is full
    QueueFull,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Closed => write!(f, "connection closed"),
            SendError::QueueFull => write!(f, "outbound queue full"),
        }
    }
}

impl std::error::Error for SendError {}

impl<T> From<mpsc::error::TrySendError<T>> for SendError {
    fn from(e: mpsc::error::TrySendError<T>) -> Self {
        match e {
            mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        }
    }
}

impl<T> From<mpsc::error::SendError<T>> for SendError {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        SendError::Closed
    }
}

/// Outbound commands for one connection.
///
/// Implementations must not block: they are called from the router for
/// every matching subscriber.
pub trait ConnectionHandle: Send + Sync {
    fn id(&self) -> ConnectionId;

    fn send_connack(
        &self,
        session_present: bool,
        return_code: ConnectReturnCode,
    ) -> Result<(), SendError>;

    /// Acknowledge a SUBSCRIBE; `granted` is in request order
    fn send_suback(&self, packet_id: u16, granted: &[QoS]) -> Result<(), SendError>;

    fn send_unsuback(&self, packet_id: u16) -> Result<(), SendError>;

    fn deliver_publish(
        &self,
        topic: &Arc<str>,
        payload: &Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), SendError>;
}

/// Handle backed by two channels drained by the connection's writer.
///
/// Acknowledgements travel on an unbounded control lane and are never
/// dropped. Routed publishes share a bounded lane; a full lane drops the
/// delivery for that subscriber only.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    id: ConnectionId,
    control: mpsc::UnboundedSender<Packet>,
    publish: mpsc::Sender<Packet>,
}

impl ChannelHandle {
    /// Create a handle with a fresh id and the receiving side of its lanes
    pub fn new(capacity: usize) -> (Self, OutboundQueue) {
        let (control, control_rx) = mpsc::unbounded_channel();
        let (publish, publish_rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                id: ConnectionId::next(),
                control,
                publish,
            },
            OutboundQueue {
                control: control_rx,
                publish: publish_rx,
            },
        )
    }

    fn send_control(&self, packet: Packet) -> Result<(), SendError> {
        self.control.send(packet).map_err(SendError::from)
    }
}

/// Receiving side of a [`ChannelHandle`]; control packets come out first
#[derive(Debug)]
pub struct OutboundQueue {
    control: mpsc::UnboundedReceiver<Packet>,
    publish: mpsc::Receiver<Packet>,
}

impl OutboundQueue {
    /// Wait for the next packet. `None` once every handle is gone.
    pub async fn recv(&mut self) -> Option<Packet> {
        tokio::select! {
            biased;
            Some(packet) = self.control.recv() => Some(packet),
            Some(packet) = self.publish.recv() => Some(packet),
            else => None,
        }
    }

    pub fn try_recv(&mut self) -> Option<Packet> {
        self.control
            .try_recv()
            .or_else(|_| self.publish.try_recv())
            .ok()
    }
}

impl ConnectionHandle for ChannelHandle {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send_connack(
        &self,
        session_present: bool,
        return_code: ConnectReturnCode,
    ) -> Result<(), SendError> {
        self.send_control(Packet::ConnAck(ConnAck {
            session_present,
            return_code,
        }))
    }

    fn send_suback(&self, packet_id: u16, granted: &[QoS]) -> Result<(), SendError> {
        self.send_control(Packet::SubAck(SubAck {
            packet_id,
            return_codes: granted.iter().copied().map(SubAckReturnCode::from).collect(),
        }))
    }

    fn send_unsuback(&self, packet_id: u16) -> Result<(), SendError> {
        self.send_control(Packet::UnsubAck(UnsubAck { packet_id }))
    }

    fn deliver_publish(
        &self,
        topic: &Arc<str>,
        payload: &Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), SendError> {
        // Packet id is assigned by the writer for QoS > 0
        self.publish
            .try_send(Packet::Publish(Publish {
                dup: false,
                qos,
                retain,
                topic: topic.clone(),
                packet_id: None,
                payload: payload.clone(),
            }))
            .map_err(SendError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_connection_ids_are_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
        assert!(b > a);
        assert_eq!(a.to_string(), format!("conn-{}", a.as_u64()));
    }

    #[test]
    fn test_control_packets_come_out_first() {
        let (handle, mut rx) = ChannelHandle::new(8);
        let topic: Arc<str> = Arc::from("sensors/temp");

        handle.send_connack(false, ConnectReturnCode::Accepted).unwrap();
        handle
            .deliver_publish(&topic, &Bytes::from_static(b"21.5"), QoS::AtLeastOnce, false)
            .unwrap();
        handle
            .send_suback(1, &[QoS::AtMostOnce, QoS::ExactlyOnce])
            .unwrap();
        handle.send_unsuback(2).unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            Packet::ConnAck(ConnAck {
                session_present: false,
                return_code: ConnectReturnCode::Accepted,
            })
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            Packet::SubAck(SubAck {
                packet_id: 1,
                return_codes: vec![
                    SubAckReturnCode::Granted(QoS::AtMostOnce),
                    SubAckReturnCode::Granted(QoS::ExactlyOnce),
                ],
            })
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            Packet::UnsubAck(UnsubAck { packet_id: 2 })
        );
        match rx.try_recv().unwrap() {
            Packet::Publish(publish) => {
                assert_eq!(&*publish.topic, "sensors/temp");
                assert_eq!(publish.payload, Bytes::from_static(b"21.5"));
                assert_eq!(publish.qos, QoS::AtLeastOnce);
                assert_eq!(publish.packet_id, None);
                assert!(!publish.retain);
            }
            other => panic!("expected PUBLISH, got {:?}", other),
        }
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_full_publish_lane_keeps_acks() {
        let (handle, mut rx) = ChannelHandle::new(1);
        let topic: Arc<str> = Arc::from("hot");
        let payload = Bytes::from_static(b"m");

        handle
            .deliver_publish(&topic, &payload, QoS::AtMostOnce, false)
            .unwrap();
        assert_eq!(
            handle.deliver_publish(&topic, &payload, QoS::AtMostOnce, false),
            Err(SendError::QueueFull)
        );
        handle.send_suback(7, &[QoS::AtLeastOnce]).unwrap();
        handle.send_unsuback(8).unwrap();

        assert!(matches!(
            rx.try_recv(),
            Some(Packet::SubAck(SubAck { packet_id: 7, .. }))
        ));
        assert_eq!(
            rx.try_recv(),
            Some(Packet::UnsubAck(UnsubAck { packet_id: 8 }))
        );
        assert!(matches!(rx.try_recv(), Some(Packet::Publish(_))));
    }

    #[tokio::test]
    async fn test_recv_prefers_control_lane() {
        let (handle, mut rx) = ChannelHandle::new(4);
        handle
            .deliver_publish(&Arc::from("t"), &Bytes::new(), QoS::AtMostOnce, false)
            .unwrap();
        handle.send_unsuback(3).unwrap();

        assert_eq!(
            rx.recv().await,
            Some(Packet::UnsubAck(UnsubAck { packet_id: 3 }))
        );
        assert!(matches!(rx.recv().await, Some(Packet::Publish(_))));

        drop(handle);
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn test_closed_queue() {
        let (handle, rx) = ChannelHandle::new(4);
        drop(rx);
        assert_eq!(handle.send_unsuback(1), Err(SendError::Closed));
        assert_eq!(
            handle.deliver_publish(&Arc::from("t"), &Bytes::new(), QoS::AtMostOnce, false),
            Err(SendError::Closed)
        );
        assert_eq!(SendError::Closed.to_string(), "connection closed");
    }
}
