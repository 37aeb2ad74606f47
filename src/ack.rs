//! Ack channel - pairs outgoing stream chunks with their acknowledgments.
//!
//! The server sends every stream chunk through [`AckChannel::send_with_ack`]
//! and waits for the peer's answer before producing the next one. Waiters are
//! keyed by `(message number, sequence id)`.
//!
//! The peer answers with a `StreamAck` (keep going) or a `StreamMessage`
//! with `closed` set (consumer gave up). When the transport closes, every
//! waiter fails with [`RpcError::AckInterrupted`].

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{Result, RpcError};
use crate::protocol::{frame, StreamMessage};
use crate::transport::TransportHandle;

/// Peer answer to one stream chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Chunk consumed; the next one may be sent.
    Ack,
    /// The consumer closed the stream.
    Closed,
}

#[derive(Default)]
struct Waiters {
    pending: HashMap<(u32, u32), oneshot::Sender<AckOutcome>>,
    closed: bool,
}

/// Per-transport ack bookkeeping.
pub struct AckChannel {
    transport: TransportHandle,
    waiters: Mutex<Waiters>,
}

impl AckChannel {
    /// Create an ack channel sending over `transport`.
    pub fn new(transport: TransportHandle) -> Self {
        Self {
            transport,
            waiters: Mutex::new(Waiters::default()),
        }
    }

    /// Send one stream chunk and wait for the peer's ack or close.
    pub async fn send_with_ack(
        &self,
        message_number: u32,
        port_id: u32,
        sequence_id: u32,
        payload: Bytes,
    ) -> Result<AckOutcome> {
        let key = (message_number, sequence_id);
        let rx = {
            let mut waiters = self.waiters.lock();
            if waiters.closed {
                return Err(RpcError::AckInterrupted);
            }
            if waiters.pending.contains_key(&key) {
                return Err(RpcError::Protocol(format!(
                    "Already waiting ack for message {} chunk {}",
                    message_number, sequence_id
                )));
            }
            let (tx, rx) = oneshot::channel();
            waiters.pending.insert(key, tx);
            rx
        };

        let chunk = frame::stream_chunk(message_number, port_id, sequence_id, payload);
        if let Err(e) = self.transport.send(frame::encode(&chunk)).await {
            self.waiters.lock().pending.remove(&key);
            return Err(e);
        }

        rx.await.map_err(|_| RpcError::AckInterrupted)
    }

    /// Resolve the waiter matching an inbound ack or close frame.
    ///
    /// Frames with no matching waiter are ignored.
    pub fn receive_ack(&self, message: &StreamMessage, message_number: u32) {
        let outcome = if message.closed {
            AckOutcome::Closed
        } else {
            AckOutcome::Ack
        };
        let waiter = self
            .waiters
            .lock()
            .pending
            .remove(&(message_number, message.sequence_id));
        match waiter {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => tracing::debug!(
                "No ack waiter for message {} chunk {}",
                message_number,
                message.sequence_id
            ),
        }
    }

    /// Fail every waiter with [`RpcError::AckInterrupted`] and refuse new
    /// ones. Called when the transport closes.
    pub fn close(&self) {
        let pending = {
            let mut waiters = self.waiters.lock();
            waiters.closed = true;
            std::mem::take(&mut waiters.pending)
        };
        if !pending.is_empty() {
            tracing::debug!("Interrupting {} ack waits", pending.len());
        }
    }

    /// Number of chunks waiting for an ack.
    pub fn pending_count(&self) -> usize {
        self.waiters.lock().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{pack, parse_message, MessageKind, ProtocolMessage};
    use crate::transport::{memory, TransportEvent};
    use std::sync::Arc;

    fn ack_for(number: u32, sequence_id: u32, closed: bool) -> StreamMessage {
        StreamMessage {
            message_identifier: pack(MessageKind::StreamAck as u8, number),
            port_id: 1,
            sequence_id,
            payload: Bytes::new(),
            closed,
            ack: !closed,
        }
    }

    #[tokio::test]
    async fn test_send_with_ack_resolves_on_ack() {
        let (server, client) = memory::pair();
        let channel = Arc::new(AckChannel::new(server.handle()));
        let (_client, mut events) = client.into_parts();

        let sender = tokio::spawn({
            let channel = channel.clone();
            async move {
                channel
                    .send_with_ack(5, 1, 0, Bytes::from_static(b"chunk"))
                    .await
            }
        });

        let Some(TransportEvent::Message(data)) = events.recv().await else {
            panic!("expected chunk");
        };
        let frame = parse_message(data).unwrap();
        assert_eq!(frame.number(), 5);
        let ProtocolMessage::StreamMessage(chunk) = frame.message else {
            panic!("expected stream message");
        };
        assert_eq!(chunk.sequence_id, 0);
        assert_eq!(&chunk.payload[..], b"chunk");

        channel.receive_ack(&ack_for(5, 0, false), 5);
        assert_eq!(sender.await.unwrap().unwrap(), AckOutcome::Ack);
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_close_frame_resolves_closed() {
        let (server, _client) = memory::pair();
        let channel = Arc::new(AckChannel::new(server.handle()));

        let sender = tokio::spawn({
            let channel = channel.clone();
            async move { channel.send_with_ack(9, 1, 3, Bytes::new()).await }
        });
        while channel.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        channel.receive_ack(&ack_for(9, 2, true), 9);
        assert_eq!(channel.pending_count(), 1);

        channel.receive_ack(&ack_for(9, 3, true), 9);
        assert_eq!(sender.await.unwrap().unwrap(), AckOutcome::Closed);
    }

    #[tokio::test]
    async fn test_close_interrupts_waiters() {
        let (server, _client) = memory::pair();
        let channel = Arc::new(AckChannel::new(server.handle()));

        let sender = tokio::spawn({
            let channel = channel.clone();
            async move { channel.send_with_ack(2, 1, 0, Bytes::new()).await }
        });
        while channel.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        channel.close();
        assert!(matches!(
            sender.await.unwrap(),
            Err(RpcError::AckInterrupted)
        ));
        assert!(matches!(
            channel.send_with_ack(2, 1, 1, Bytes::new()).await,
            Err(RpcError::AckInterrupted)
        ));
    }
}
