//! Client side of a server stream.
//!
//! A pump task moves inbound chunks into a [`PushableQueue`] and acks each
//! chunk only after the consumer has moved past it, so the server never has
//! more than one unacknowledged chunk in flight:
//!
//! ```text
//! server ── chunk(n) ──► pump ── push ──► queue ──► next()
//!        ◄── ack(n) ──── pump ◄── Consumed ─────── next()
//! ```
//!
//! Stopping early (or dropping the stream) answers the pending chunk with a
//! close frame instead of an ack.

use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;

use crate::dispatcher::{Dispatcher, StreamFrames};
use crate::error::{Result, RpcError};
use crate::protocol::{frame, ProtocolMessage};
use crate::queue::{PushOutcome, PushableQueue};

/// Pull-based view of a server stream.
///
/// Dropping an unfinished stream behaves like [`stop`](Self::stop).
pub struct ClientStream {
    queue: PushableQueue<Bytes>,
    message_number: u32,
}

impl ClientStream {
    pub(crate) fn spawn(
        dispatcher: Arc<Dispatcher>,
        port_id: u32,
        message_number: u32,
        frames: StreamFrames,
    ) -> Self {
        let queue = PushableQueue::new();
        tokio::spawn(pump(
            dispatcher,
            port_id,
            message_number,
            frames,
            queue.clone(),
        ));
        Self {
            queue,
            message_number,
        }
    }

    /// Next chunk, `None` once the server closed the stream.
    ///
    /// A `RemoteError` from the server or a transport close surfaces here as
    /// an error.
    pub async fn next(&mut self) -> Option<Result<Bytes>> {
        self.queue.next().await
    }

    /// Stop consuming. The server is told to stop producing.
    pub fn stop(&self) {
        self.queue.stop();
    }

    /// Message number the stream is bound to.
    pub fn message_number(&self) -> u32 {
        self.message_number
    }

    /// Consume as a [`Stream`].
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes>> + Send + 'static {
        futures::stream::unfold(self, |mut stream| async move {
            let item = stream.next().await?;
            Some((item, stream))
        })
    }
}

impl Drop for ClientStream {
    fn drop(&mut self) {
        self.queue.stop();
    }
}

impl std::fmt::Debug for ClientStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientStream")
            .field("message_number", &self.message_number)
            .finish()
    }
}

async fn pump(
    dispatcher: Arc<Dispatcher>,
    port_id: u32,
    number: u32,
    mut frames: StreamFrames,
    queue: PushableQueue<Bytes>,
) {
    loop {
        let Some(inbound) = frames.recv().await else {
            // Listener dropped by the dispatcher: the transport is gone.
            queue.fail_and_close(RpcError::ConnectionClosed);
            break;
        };
        match inbound.message {
            ProtocolMessage::StreamMessage(message) if message.closed => {
                queue.close();
                break;
            }
            ProtocolMessage::StreamMessage(message) => {
                let sequence_id = message.sequence_id;
                let outcome = if queue.is_stopped() {
                    PushOutcome::Stopped
                } else {
                    queue.push(message.payload).await
                };

                let reply = match outcome {
                    PushOutcome::Consumed => frame::stream_ack(number, port_id, sequence_id),
                    PushOutcome::Stopped => frame::close_stream(number, port_id, sequence_id),
                    PushOutcome::Closed => break,
                };
                if let Err(e) = dispatcher.send(&reply).await {
                    queue.fail_and_close(e);
                    break;
                }
                if outcome == PushOutcome::Stopped {
                    tracing::debug!("Stream {} stopped by consumer at {}", number, sequence_id);
                    break;
                }
            }
            ProtocolMessage::RemoteError(error) => {
                queue.fail_and_close(RpcError::Remote {
                    code: error.error_code,
                    message: error.error_message,
                });
                break;
            }
            ProtocolMessage::Response(_) => {
                queue.fail_and_close(RpcError::Protocol(format!(
                    "unary Response on stream {number}; the procedure is not streaming"
                )));
                break;
            }
            _ => tracing::debug!("Ignoring {:?} frame on stream {}", inbound.id.kind, number),
        }
    }

    let _ = dispatcher.remove_listener(number);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatcherConfig;
    use crate::server::{ModuleDefinition, RpcServer, RpcServerPort};
    use crate::transport::memory;
    use crate::RpcClient;

    #[tokio::test]
    async fn test_missing_procedure_fails_stream() {
        let server: RpcServer<()> = RpcServer::builder()
            .handler(|port: RpcServerPort<()>, _transport, _ctx: ()| async move {
                port.register_module("empty", |_| async { Ok(ModuleDefinition::new()) })
            })
            .build();
        let (server_side, client_side) = memory::pair();
        server.attach_transport(server_side, ());

        let client = RpcClient::with_config(client_side, DispatcherConfig::default());
        let port = client.create_port("p").await.unwrap();
        let dispatcher = port.dispatcher().clone();

        let (number, frames) = dispatcher
            .request_stream(|n| frame::request(n, port.id(), 99, Bytes::new()))
            .await
            .unwrap();
        let mut stream = ClientStream::spawn(dispatcher.clone(), port.id(), number, frames);

        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "RemoteError: procedureId missing: 99");
        assert!(stream.next().await.is_none());

        // The pump removed its listener on the way out.
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while dispatcher.pending_count() != 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}
