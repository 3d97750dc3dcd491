//! WebSocket Transport
//!
//! Wraps a tokio-tungstenite WebSocket so the connection handler can read
//! and write MQTT bytes through `AsyncRead`/`AsyncWrite`. Packets travel
//! in binary frames; a frame may hold part of a packet or several.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;

/// Subprotocols an MQTT 3.1.1 client may offer
const MQTT_SUBPROTOCOLS: &[&str] = &["mqtt", "mqttv3.1"];

/// Byte-stream view of a WebSocket carrying MQTT
pub struct WsStream<S> {
    ws: WebSocketStream<S>,
    /// Unread remainder of the last binary frame
    pending: Bytes,
    closed: bool,
}

impl<S> WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(ws: WebSocketStream<S>) -> Self {
        Self {
            ws,
            pending: Bytes::new(),
            closed: false,
        }
    }

    /// Accept a WebSocket connection on `/mqtt`
    pub async fn accept(stream: S) -> io::Result<Self> {
        Self::accept_with_path(stream, "/mqtt").await
    }

    /// Accept a WebSocket connection, rejecting any other request path and
    /// echoing back the MQTT subprotocol the client asked for
    pub async fn accept_with_path(stream: S, expected_path: &str) -> io::Result<Self> {
        let callback = |req: &Request, mut response: Response| {
            let path = req.uri().path();
            if path != expected_path {
                return Err(ErrorResponse::new(Some(format!(
                    "invalid path: expected '{}', got '{}'",
                    expected_path, path
                ))));
            }

            let offered = req
                .headers()
                .get("sec-websocket-protocol")
                .and_then(|value| value.to_str().ok());
            if let Some(protocols) = offered {
                let chosen = protocols
                    .split(',')
                    .map(str::trim)
                    .find(|p| MQTT_SUBPROTOCOLS.contains(p));
                if let Some(protocol) = chosen {
                    if let Ok(value) = HeaderValue::from_str(protocol) {
                        response.headers_mut().insert("sec-websocket-protocol", value);
                    }
                }
            }
            Ok(response)
        };

        let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .map_err(io::Error::other)?;
        Ok(Self::new(ws))
    }
}

impl<S> AsyncRead for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.pending.is_empty() {
                let n = buf.remaining().min(self.pending.len());
                buf.put_slice(&self.pending[..n]);
                self.pending.advance(n);
                return Poll::Ready(Ok(()));
            }

            if self.closed {
                return Poll::Ready(Ok(()));
            }

            match Pin::new(&mut self.ws).poll_next(cx) {
                Poll::Ready(Some(Ok(Message::Binary(data)))) => {
                    self.pending = Bytes::from(data);
                }
                Poll::Ready(Some(Ok(Message::Close(_)))) | Poll::Ready(None) => {
                    self.closed = true;
                }
                // Pings are answered by tungstenite; text frames carry no MQTT
                Poll::Ready(Some(Ok(_))) => {}
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(io::Error::other(e))),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S> AsyncWrite for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match Pin::new(&mut self.ws).poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(io::Error::other(e))),
            Poll::Pending => return Poll::Pending,
        }

        match Pin::new(&mut self.ws).start_send(Message::binary(buf.to_vec())) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(e) => Poll::Ready(Err(io::Error::other(e))),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.ws)
            .poll_flush(cx)
            .map_err(io::Error::other)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.ws)
            .poll_close(cx)
            .map_err(io::Error::other)
    }
}
