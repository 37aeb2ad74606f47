//! RPC server - serves ports and modules over attached transports.
//!
//! Lifecycle of one attached transport:
//! 1. Send `SERVER_READY`
//! 2. Read frames and route them by kind
//! 3. On close: interrupt ack waits, close every port of the transport
//!
//! Requests run on their own tasks so that stream producers waiting for
//! acks never block the read loop. Any error from a request task is answered
//! with a `RemoteError` carrying the request's message number.
//!
//! # Example
//!
//! ```ignore
//! use portrpc::{ModuleDefinition, RpcServer};
//!
//! let server = RpcServer::builder()
//!     .handler(|port, _transport, _ctx: ()| async move {
//!         port.register_module("echo", |_| async {
//!             Ok(ModuleDefinition::new()
//!                 .unary_raw("echo", |payload, _| async move { Ok(Some(payload)) }))
//!         })
//!     })
//!     .build();
//!
//! server.attach_transport(transport, ());
//! ```

mod module;
mod port;

pub use module::{
    Handler, ModuleDefinition, ProcedureResult, RawStreamHandler, RawUnaryHandler,
    StreamHandler, UnaryHandler,
};
pub use port::{LoadedModule, RpcServerPort};

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use crate::ack::{AckChannel, AckOutcome};
use crate::error::{Result, RpcError};
use crate::protocol::{
    encode, frame, parse_message, CreatePort, Frame, ProtocolMessage, Request, RequestModule,
};
use crate::transport::{Transport, TransportEvent, TransportHandle, TransportId};

/// Default maximum number of requests served concurrently per server.
pub const DEFAULT_MAX_CONCURRENT_CALLS: usize = 256;

type ConnectionHandler<C> = Arc<
    dyn Fn(RpcServerPort<C>, TransportHandle, C) -> BoxFuture<'static, Result<()>> + Send + Sync,
>;

/// Builder for [`RpcServer`].
pub struct RpcServerBuilder<C> {
    handler: Option<ConnectionHandler<C>>,
    max_concurrent_calls: usize,
}

impl<C: Clone + Send + Sync + 'static> RpcServerBuilder<C> {
    /// Create a builder with defaults.
    pub fn new() -> Self {
        Self {
            handler: None,
            max_concurrent_calls: DEFAULT_MAX_CONCURRENT_CALLS,
        }
    }

    /// Set the connection handler.
    ///
    /// Runs for every `CreatePort`, before the port id is sent back; this is
    /// where modules are registered on the new port. A failing handler turns
    /// the `CreatePort` into a `RemoteError`.
    pub fn handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(RpcServerPort<C>, TransportHandle, C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.handler = Some(Arc::new(move |port, transport, context| {
            handler(port, transport, context).boxed()
        }));
        self
    }

    /// Maximum number of requests in flight across all transports.
    ///
    /// Requests beyond the limit are answered with a `RemoteError`.
    ///
    /// The limit is shared by every attached transport. A streaming call
    /// holds its slot until the stream ends, including while it waits for
    /// the consumer to ack a chunk, so consumers that stop pulling without
    /// closing keep their slots. Size the limit for the expected number of
    /// open streams.
    pub fn max_concurrent_calls(mut self, max: usize) -> Self {
        self.max_concurrent_calls = max.max(1);
        self
    }

    /// Build the server.
    pub fn build(self) -> RpcServer<C> {
        RpcServer {
            inner: Arc::new(ServerInner {
                handler: self.handler,
                semaphore: Arc::new(Semaphore::new(self.max_concurrent_calls)),
                next_port_id: AtomicU32::new(1),
                ports: Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl<C: Clone + Send + Sync + 'static> Default for RpcServerBuilder<C> {
    fn default() -> Self {
        Self::new()
    }
}

struct ServerInner<C> {
    handler: Option<ConnectionHandler<C>>,
    semaphore: Arc<Semaphore>,
    next_port_id: AtomicU32,
    ports: Mutex<HashMap<(TransportId, u32), RpcServerPort<C>>>,
}

/// RPC server. Cloning shares the server.
pub struct RpcServer<C> {
    inner: Arc<ServerInner<C>>,
}

impl<C> Clone for RpcServer<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Clone + Send + Sync + 'static> RpcServer<C> {
    /// Create a builder.
    pub fn builder() -> RpcServerBuilder<C> {
        RpcServerBuilder::new()
    }

    /// Serve a connected transport. `context` is passed to every procedure
    /// call made over it.
    ///
    /// The returned task finishes once the transport closes.
    pub fn attach_transport(&self, transport: Transport, context: C) -> JoinHandle<()> {
        let (handle, events) = transport.into_parts();
        let connection = Arc::new(Connection {
            server: self.inner.clone(),
            ack: AckChannel::new(handle.clone()),
            transport: handle,
            context,
        });
        tokio::spawn(connection.serve(events))
    }

    /// Number of open ports across all transports.
    pub fn port_count(&self) -> usize {
        self.inner.ports.lock().len()
    }
}

/// One attached transport.
struct Connection<C> {
    server: Arc<ServerInner<C>>,
    transport: TransportHandle,
    ack: AckChannel,
    context: C,
}

impl<C: Clone + Send + Sync + 'static> Connection<C> {
    async fn serve(self: Arc<Self>, mut events: mpsc::Receiver<TransportEvent>) {
        let transport_id = self.transport.id();
        if let Err(e) = self.transport.send(encode(&frame::server_ready())).await {
            tracing::debug!("Transport {} closed before SERVER_READY: {}", transport_id, e);
        }

        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Message(data) => match parse_message(data) {
                    Ok(frame) => self.route(frame),
                    Err(e) => {
                        tracing::warn!("Unparseable frame, closing transport: {}", e);
                        self.transport.close();
                    }
                },
                TransportEvent::Error(e) => {
                    tracing::warn!("Transport {} error: {}", transport_id, e);
                }
            }
        }

        self.ack.close();
        let ports: Vec<_> = {
            let mut ports = self.server.ports.lock();
            let keys: Vec<_> = ports
                .keys()
                .filter(|(transport, _)| *transport == transport_id)
                .copied()
                .collect();
            keys.into_iter().filter_map(|key| ports.remove(&key)).collect()
        };
        for port in ports {
            port.close();
        }
        tracing::debug!("Transport {} detached", transport_id);
    }

    fn route(self: &Arc<Self>, frame: Frame) {
        let number = frame.number();
        match frame.message {
            ProtocolMessage::Request(request) => self.spawn_request(number, request),
            ProtocolMessage::StreamAck(message) | ProtocolMessage::StreamMessage(message) => {
                self.ack.receive_ack(&message, number);
            }
            ProtocolMessage::CreatePort(message) => {
                let connection = self.clone();
                self.spawn_answering(number, async move {
                    connection.create_port(number, message).await
                });
            }
            ProtocolMessage::RequestModule(message) => {
                let connection = self.clone();
                self.spawn_answering(number, async move {
                    connection.request_module(number, message).await
                });
            }
            ProtocolMessage::DestroyPort(message) => {
                let key = (self.transport.id(), message.port_id);
                let removed = self.server.ports.lock().remove(&key);
                if let Some(port) = removed {
                    port.close();
                }
            }
            _ => tracing::debug!("Ignoring unexpected {:?} frame", frame.id.kind),
        }
    }

    fn spawn_request(self: &Arc<Self>, number: u32, request: Request) {
        let permit = match self.server.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::warn!("Call capacity reached, rejecting message {}", number);
                let transport = self.transport.clone();
                tokio::spawn(async move {
                    let reply = frame::remote_error(number, "Server is at call capacity");
                    let _ = transport.send(encode(&reply)).await;
                });
                return;
            }
        };

        let connection = self.clone();
        self.spawn_answering(number, async move {
            let _permit = permit;
            connection.call(number, request).await
        });
    }

    /// Run `task`; an error becomes a `RemoteError` for `number`.
    fn spawn_answering<F>(&self, number: u32, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let transport = self.transport.clone();
        tokio::spawn(async move {
            let Err(e) = task.await else { return };
            if e.is_closed() {
                tracing::debug!("Message {} interrupted: {}", number, e);
                return;
            }
            tracing::error!("Message {} failed: {}", number, e);
            let reply = frame::remote_error(number, e.to_string());
            if let Err(e) = transport.send(encode(&reply)).await {
                tracing::debug!("Could not send RemoteError for {}: {}", number, e);
            }
        });
    }

    fn port(&self, port_id: u32) -> Result<RpcServerPort<C>> {
        self.server
            .ports
            .lock()
            .get(&(self.transport.id(), port_id))
            .cloned()
            .ok_or(RpcError::PortClosed(port_id))
    }

    async fn create_port(&self, number: u32, message: CreatePort) -> Result<()> {
        let port_id = self.server.next_port_id.fetch_add(1, Ordering::Relaxed);
        let port = RpcServerPort::new(port_id, message.port_name);
        self.server
            .ports
            .lock()
            .insert((self.transport.id(), port_id), port.clone());
        tracing::debug!("Created port {} ({})", port_id, port.name());

        if let Some(handler) = &self.server.handler {
            let prepared = handler(port.clone(), self.transport.clone(), self.context.clone()).await;
            if let Err(e) = prepared {
                self.server
                    .ports
                    .lock()
                    .remove(&(self.transport.id(), port_id));
                port.close();
                return Err(e);
            }
        }

        let reply = frame::create_port_response(number, port_id);
        self.transport.send(encode(&reply)).await
    }

    async fn request_module(&self, number: u32, message: RequestModule) -> Result<()> {
        let port = self.port(message.port_id)?;
        let procedures = port.load_module(&message.module_name).await?;
        let reply = frame::request_module_response(number, message.port_id, procedures);
        self.transport.send(encode(&reply)).await
    }

    async fn call(&self, number: u32, request: Request) -> Result<()> {
        let port = self.port(request.port_id)?;
        let result = port
            .call_procedure(request.procedure_id, request.payload, self.context.clone())
            .await?;

        match result {
            ProcedureResult::Unary(Some(payload)) => {
                let reply = frame::response(number, payload);
                self.transport.send(encode(&reply)).await
            }
            ProcedureResult::Unary(None) => Err(RpcError::EmptyResponse),
            ProcedureResult::Stream(chunks) => {
                self.send_stream(number, request.port_id, chunks).await
            }
        }
    }

    /// Send chunks one at a time, each waiting for the consumer's ack.
    ///
    /// A close from the consumer stops the loop without pulling further
    /// chunks from the source.
    async fn send_stream(
        &self,
        number: u32,
        port_id: u32,
        mut chunks: BoxStream<'static, Result<bytes::Bytes>>,
    ) -> Result<()> {
        let mut sequence_id: u32 = 0;
        let mut sent = false;

        while let Some(chunk) = chunks.next().await {
            if sent {
                sequence_id += 1;
            }
            let outcome = self
                .ack
                .send_with_ack(number, port_id, sequence_id, chunk?)
                .await?;
            sent = true;
            if outcome == AckOutcome::Closed {
                tracing::debug!("Stream {} closed by consumer at {}", number, sequence_id);
                return Ok(());
            }
        }

        let close = frame::close_stream(number, port_id, sequence_id);
        self.transport.send(encode(&close)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageKind;
    use crate::transport::memory;
    use bytes::Bytes;

    async fn next_frame(events: &mut mpsc::Receiver<TransportEvent>) -> Frame {
        match events.recv().await {
            Some(TransportEvent::Message(data)) => parse_message(data).unwrap(),
            other => panic!("unexpected event {other:?}"),
        }
    }

    fn echo_server() -> RpcServer<()> {
        RpcServer::builder()
            .handler(|port: RpcServerPort<()>, _transport, _ctx: ()| async move {
                port.register_module("echo", |_| async {
                    Ok(ModuleDefinition::new().unary_raw(
                        "echo",
                        |payload: Bytes, _: ()| async move { Ok(Some(payload)) },
                    ))
                })
            })
            .build()
    }

    #[tokio::test]
    async fn test_server_ready_first() {
        let server = echo_server();
        let (server_side, client_side) = memory::pair();
        server.attach_transport(server_side, ());

        let (_client, mut events) = client_side.into_parts();
        let frame = next_frame(&mut events).await;
        assert_eq!(frame.kind(), MessageKind::ServerReady);
    }

    #[tokio::test]
    async fn test_create_port_and_call() {
        let server = echo_server();
        let (server_side, client_side) = memory::pair();
        server.attach_transport(server_side, ());
        let (client, mut events) = client_side.into_parts();
        next_frame(&mut events).await;

        client.send(encode(&frame::create_port(1, "p"))).await.unwrap();
        let frame = next_frame(&mut events).await;
        let ProtocolMessage::CreatePortResponse(created) = frame.message else {
            panic!("expected CreatePortResponse");
        };
        assert_eq!(frame.id.number, 1);
        assert_eq!(created.port_id, 1);
        assert_eq!(server.port_count(), 1);

        client
            .send(encode(&frame::request_module(2, created.port_id, "echo")))
            .await
            .unwrap();
        let frame = next_frame(&mut events).await;
        let ProtocolMessage::RequestModuleResponse(module) = frame.message else {
            panic!("expected RequestModuleResponse");
        };
        assert_eq!(module.procedures[0].procedure_name, "echo");

        let procedure_id = module.procedures[0].procedure_id;
        client
            .send(encode(&frame::request(
                3,
                created.port_id,
                procedure_id,
                Bytes::from_static(b"x"),
            )))
            .await
            .unwrap();
        let frame = next_frame(&mut events).await;
        assert!(matches!(frame.message, ProtocolMessage::Response(ref r) if &r.payload[..] == b"x"));

        client
            .send(encode(&frame::request(4, created.port_id, 99, Bytes::new())))
            .await
            .unwrap();
        let frame = next_frame(&mut events).await;
        assert_eq!(frame.number(), 4);
        assert!(matches!(
            frame.message,
            ProtocolMessage::RemoteError(ref e) if e.error_message == "procedureId missing: 99"
        ));
    }

    #[tokio::test]
    async fn test_transport_close_closes_ports() {
        let server = echo_server();
        let (server_side, client_side) = memory::pair();
        let task = server.attach_transport(server_side, ());
        let (client, mut events) = client_side.into_parts();
        next_frame(&mut events).await;

        client.send(encode(&frame::create_port(1, "a"))).await.unwrap();
        client.send(encode(&frame::create_port(2, "b"))).await.unwrap();
        next_frame(&mut events).await;
        next_frame(&mut events).await;
        assert_eq!(server.port_count(), 2);

        client.close();
        task.await.unwrap();
        assert_eq!(server.port_count(), 0);
    }

    #[tokio::test]
    async fn test_port_ids_are_per_server() {
        let first = echo_server();
        let second = echo_server();

        for server in [&first, &second] {
            let (server_side, client_side) = memory::pair();
            server.attach_transport(server_side, ());
            let (client, mut events) = client_side.into_parts();
            next_frame(&mut events).await;

            client.send(encode(&frame::create_port(1, "p"))).await.unwrap();
            let frame = next_frame(&mut events).await;
            assert!(matches!(
                frame.message,
                ProtocolMessage::CreatePortResponse(ref r) if r.port_id == 1
            ));
        }
    }

    #[tokio::test]
    async fn test_failing_handler_answers_remote_error() {
        let server: RpcServer<()> = RpcServer::builder()
            .handler(|_port, _transport, _ctx| async move { Err(RpcError::procedure("denied")) })
            .build();
        let (server_side, client_side) = memory::pair();
        server.attach_transport(server_side, ());
        let (client, mut events) = client_side.into_parts();
        next_frame(&mut events).await;

        client.send(encode(&frame::create_port(1, "p"))).await.unwrap();
        let frame = next_frame(&mut events).await;
        assert!(matches!(
            frame.message,
            ProtocolMessage::RemoteError(ref e) if e.error_message == "denied"
        ));
        assert_eq!(server.port_count(), 0);
    }
}
