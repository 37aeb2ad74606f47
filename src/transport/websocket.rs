//! WebSocket transport (`tokio-tungstenite`).
//!
//! Each protocol message travels as one binary WebSocket message. Text
//! messages are not part of the protocol: they are reported as
//! [`TransportEvent::Error`] and the connection is closed.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{endpoint, wait_closed, Endpoint, Transport, TransportEvent, DEFAULT_CHANNEL_CAPACITY};
use crate::error::Result;

/// Connect to a WebSocket server, e.g. `ws://127.0.0.1:9000`.
pub async fn connect(url: &str) -> Result<Transport> {
    let (ws, _response) = tokio_tungstenite::connect_async(url).await?;
    tracing::debug!("WebSocket connected to {}", url);
    Ok(from_websocket::<MaybeTlsStream<TcpStream>>(ws))
}

/// Complete the server-side handshake on an accepted stream.
pub async fn accept<S>(stream: S) -> Result<Transport>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ws = tokio_tungstenite::accept_async(stream).await?;
    Ok(from_websocket(ws))
}

/// Wrap an already established WebSocket.
pub fn from_websocket<S>(ws: WebSocketStream<S>) -> Transport
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (transport, endpoint) = endpoint(DEFAULT_CHANNEL_CAPACITY);
    let (mut sink, mut source) = ws.split();

    let Endpoint {
        mut outbound,
        events,
        closed,
    } = endpoint;

    let write_closed = closed.clone();
    let mut write_signal = write_closed.subscribe();
    tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                biased;
                message = outbound.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
                _ = wait_closed(&mut write_signal) => break,
            };
            if let Err(e) = sink.send(Message::Binary(message)).await {
                tracing::warn!("WebSocket write error: {}", e);
                break;
            }
        }
        let _ = sink.close().await;
        write_closed.send_replace(true);
    });

    let mut read_signal = closed.subscribe();
    tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                message = source.next() => message,
                _ = wait_closed(&mut read_signal) => break,
            };
            match message {
                Some(Ok(Message::Binary(data))) => {
                    if events.send(TransportEvent::Message(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Text(_))) => {
                    tracing::warn!("Unexpected text message on RPC WebSocket");
                    let _ = events
                        .send(TransportEvent::Error(
                            "text messages are not supported".to_string(),
                        ))
                        .await;
                    break;
                }
                // tungstenite answers pings on its own.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!("WebSocket read error: {}", e);
                    let _ = events.send(TransportEvent::Error(e.to_string())).await;
                    break;
                }
            }
        }
        closed.send_replace(true);
    });

    transport
}
