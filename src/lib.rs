//! # portrpc
//!
//! Bidirectional, multiplexed RPC over one ordered, reliable transport.
//!
//! A client opens named **ports** on a server, loads **modules** through a
//! port and calls their **procedures**. Procedures answer with a single
//! payload (unary) or a sequence of payloads (server streaming). Many calls
//! share one connection, correlated by message number.
//!
//! ## Architecture
//!
//! - **Protocol**: protobuf messages whose first field packs a 4-bit kind and
//!   a 27-bit message number
//! - **Dispatcher**: per-transport number allocation and response routing
//! - **Streams**: one unacknowledged chunk in flight; the server waits on the
//!   [`AckChannel`], the client paces acks with a [`PushableQueue`]
//! - **Transports**: in-process pair, length-prefixed byte streams, WebSocket
//!
//! ## Example
//!
//! ```ignore
//! use portrpc::{transport::memory, ModuleDefinition, RpcClient, RpcServer};
//!
//! #[tokio::main]
//! async fn main() -> portrpc::Result<()> {
//!     let server = RpcServer::builder()
//!         .handler(|port, _transport, _ctx: ()| async move {
//!             port.register_module("echo", |_| async {
//!                 Ok(ModuleDefinition::new()
//!                     .unary_raw("echo", |payload, _| async move { Ok(Some(payload)) }))
//!             })
//!         })
//!         .build();
//!
//!     let (server_side, client_side) = memory::pair();
//!     server.attach_transport(server_side, ());
//!
//!     let client = RpcClient::new(client_side);
//!     let port = client.create_port("example").await?;
//!     let echo = port.load_module("echo").await?;
//!     let answer = echo.call_unary("echo", "hi".into()).await?;
//!     assert_eq!(answer.as_deref(), Some(&b"hi"[..]));
//!     Ok(())
//! }
//! ```

pub mod ack;
pub mod client;
pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod queue;
pub mod server;
pub mod transport;

pub use ack::{AckChannel, AckOutcome};
pub use client::{ClientModule, ClientStream, RpcClient, RpcClientPort};
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::{Result, RpcError};
pub use queue::{PushOutcome, PushableQueue};
pub use server::{ModuleDefinition, RpcServer, RpcServerBuilder, RpcServerPort};
pub use transport::{Transport, TransportEvent, TransportHandle};
