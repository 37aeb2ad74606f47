//! RPC client - ports, modules and calls over one transport.
//!
//! # Example
//!
//! ```ignore
//! use portrpc::RpcClient;
//!
//! let client = RpcClient::new(transport);
//! let port = client.create_port("my-port").await?;
//! let books = port.load_module("BookService").await?;
//!
//! let book: Book = books.unary("getBook", &GetBookRequest { isbn: 19997 }).await?;
//!
//! let mut stream = books.call_stream("queryBooks", payload).await?;
//! while let Some(chunk) = stream.next().await {
//!     let chunk = chunk?;
//! }
//! ```

mod module;
mod port;
mod stream;

pub use module::ClientModule;
pub use port::RpcClientPort;
pub use stream::ClientStream;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OnceCell;

use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::error::{Result, RpcError};
use crate::protocol::{frame, ProtocolMessage};
use crate::transport::{Transport, TransportHandle};

struct ClientInner {
    dispatcher: Arc<Dispatcher>,
    ports: Mutex<HashMap<String, Arc<OnceCell<RpcClientPort>>>>,
}

/// RPC client bound to one transport. Cloning shares the client.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    /// Create a client with the default dispatcher configuration.
    pub fn new(transport: Transport) -> Self {
        Self::with_config(transport, DispatcherConfig::default())
    }

    /// Create a client.
    pub fn with_config(transport: Transport, config: DispatcherConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                dispatcher: Dispatcher::spawn(transport, config),
                ports: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Open a port, or return the one already opened under `name`.
    ///
    /// Concurrent calls for the same name share one `CreatePort` round
    /// trip. A closed port is replaced by a fresh one.
    pub async fn create_port(&self, name: &str) -> Result<RpcClientPort> {
        loop {
            let cell = self
                .inner
                .ports
                .lock()
                .entry(name.to_string())
                .or_default()
                .clone();

            let port = cell.get_or_try_init(|| self.open_port(name)).await?;
            if !port.is_closed() {
                return Ok(port.clone());
            }
            if self.inner.dispatcher.is_closed() {
                return Err(RpcError::ConnectionClosed);
            }

            let mut ports = self.inner.ports.lock();
            if ports.get(name).is_some_and(|cached| Arc::ptr_eq(cached, &cell)) {
                ports.remove(name);
            }
        }
    }

    async fn open_port(&self, name: &str) -> Result<RpcClientPort> {
        let answer = self
            .inner
            .dispatcher
            .request(|n| frame::create_port(n, name))
            .await?;
        match answer.message {
            ProtocolMessage::CreatePortResponse(response) => {
                tracing::debug!("Opened port {} ({})", response.port_id, name);
                Ok(RpcClientPort::new(
                    self.inner.dispatcher.clone(),
                    response.port_id,
                    name.to_string(),
                ))
            }
            _ => Err(RpcError::Protocol(format!(
                "unexpected {:?} answer to CreatePort",
                answer.id.kind
            ))),
        }
    }

    /// Sending half of the transport.
    pub fn transport(&self) -> &TransportHandle {
        self.inner.dispatcher.transport()
    }

    /// Close the transport. Pending calls fail and every port closes.
    pub fn close(&self) {
        self.inner.dispatcher.transport().close();
    }

    /// Whether the transport is closed.
    pub fn is_closed(&self) -> bool {
        self.inner.dispatcher.is_closed()
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("transport", &self.transport().id())
            .field("pending", &self.inner.dispatcher.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{ModuleDefinition, RpcServer, RpcServerPort};
    use crate::transport::memory;
    use bytes::Bytes;
    use std::time::Duration;

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
    async fn test_loaded_modules_do_not_pin_the_dispatcher() {
        let server = echo_server();
        let (server_side, client_side) = memory::pair();
        server.attach_transport(server_side, ());

        let client = RpcClient::new(client_side);
        let dispatcher = Arc::downgrade(&client.inner.dispatcher);
        let port = client.create_port("p").await.unwrap();
        let module = port.load_module("echo").await.unwrap();
        let answer = module.call_unary("echo", Bytes::from_static(b"x")).await;
        assert_eq!(answer.unwrap(), Some(Bytes::from_static(b"x")));

        client.close();
        drop(module);
        drop(port);
        drop(client);

        tokio::time::timeout(Duration::from_secs(5), async {
            while dispatcher.upgrade().is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("dispatcher still referenced");
    }
}
