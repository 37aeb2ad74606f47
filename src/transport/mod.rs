//! Transport module - ordered, reliable message transports.
//!
//! A [`Transport`] is a connected message pipe split into two halves:
//! - [`TransportHandle`] - cloneable sender with `send`, `close` and a close signal
//! - an inbound event receiver yielding [`TransportEvent`]s; the channel ends
//!   when the connection closes (locally or by the peer)
//!
//! Implementations:
//! - [`memory`] - in-process connected pair
//! - [`stream`] - length-delimited frames over any `AsyncRead + AsyncWrite`
//! - [`websocket`] - binary WebSocket messages (`tokio-tungstenite`)
//!
//! A `Transport` value only exists once the connection is established, so
//! there is no separate "connect" event.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use crate::error::{Result, RpcError};

mod framing;
mod writer;

pub mod memory;
pub mod stream;
pub mod websocket;

pub use framing::{FrameBuffer, LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE};
pub use writer::{WriterConfig, DEFAULT_CHANNEL_CAPACITY};

/// Process-unique transport identity.
pub type TransportId = u64;

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// Inbound transport event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One complete message from the peer.
    Message(Bytes),
    /// Transport-level fault. The connection closes right after.
    Error(String),
}

/// Cloneable sending half of a transport.
#[derive(Clone, Debug)]
pub struct TransportHandle {
    id: TransportId,
    outbound: mpsc::Sender<Bytes>,
    closed: Arc<watch::Sender<bool>>,
}

impl TransportHandle {
    /// Transport identity, unique within the process.
    #[inline]
    pub fn id(&self) -> TransportId {
        self.id
    }

    /// Queue one message for sending.
    ///
    /// Fails with [`RpcError::ConnectionClosed`] once the transport is closed.
    pub async fn send(&self, data: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(RpcError::ConnectionClosed);
        }
        self.outbound
            .send(data)
            .await
            .map_err(|_| RpcError::ConnectionClosed)
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        self.closed.send_if_modified(|closed| !std::mem::replace(closed, true));
    }

    /// Whether the connection is closed.
    #[inline]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        wait_closed(&mut self.closed.subscribe()).await;
    }
}

/// A connected transport.
#[derive(Debug)]
pub struct Transport {
    handle: TransportHandle,
    events: mpsc::Receiver<TransportEvent>,
}

impl Transport {
    /// Get a sending handle.
    pub fn handle(&self) -> TransportHandle {
        self.handle.clone()
    }

    /// Split into the sending handle and the inbound event receiver.
    pub fn into_parts(self) -> (TransportHandle, mpsc::Receiver<TransportEvent>) {
        (self.handle, self.events)
    }
}

/// The implementation side of a transport, driven by its I/O tasks.
pub(crate) struct Endpoint {
    pub(crate) outbound: mpsc::Receiver<Bytes>,
    pub(crate) events: mpsc::Sender<TransportEvent>,
    closed: Arc<watch::Sender<bool>>,
}

/// Create a transport and the endpoint that feeds it.
pub(crate) fn endpoint(capacity: usize) -> (Transport, Endpoint) {
    endpoint_with_signal(capacity, Arc::new(watch::channel(false).0))
}

/// Like [`endpoint`], sharing an existing close signal.
pub(crate) fn endpoint_with_signal(
    capacity: usize,
    closed: Arc<watch::Sender<bool>>,
) -> (Transport, Endpoint) {
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
    let (events_tx, events_rx) = mpsc::channel(capacity);
    let handle = TransportHandle {
        id: NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed),
        outbound: outbound_tx,
        closed: closed.clone(),
    };
    (
        Transport {
            handle,
            events: events_rx,
        },
        Endpoint {
            outbound: outbound_rx,
            events: events_tx,
            closed,
        },
    )
}

/// Wait until the signal reports closed (or its sender is gone).
pub(crate) async fn wait_closed(signal: &mut watch::Receiver<bool>) {
    let _ = signal.wait_for(|closed| *closed).await;
}
