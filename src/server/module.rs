//! Module definitions - named procedures and their handlers.
//!
//! A [`ModuleDefinition`] is built with an explicit registration API. Each
//! procedure is unary (one response) or streaming (a sequence of chunks),
//! typed through [`ProstCodec`] or raw bytes:
//!
//! ```ignore
//! let module = ModuleDefinition::new()
//!     .unary("getBook", |req: GetBookRequest, ctx: AppContext| async move {
//!         ctx.catalogue.find(req.isbn).ok_or_else(|| RpcError::procedure("not found"))
//!     })
//!     .stream("queryBooks", |req: QueryBooksRequest, ctx: AppContext| {
//!         futures::stream::iter(ctx.catalogue.by_author(&req.author_prefix).map(Ok))
//!     });
//! ```
//!
//! Procedure ids are not part of the definition: the port assigns them when
//! the module is loaded.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use prost::Message;

use crate::codec::ProstCodec;
use crate::error::Result;

/// What a procedure produced.
pub enum ProcedureResult {
    /// Single response. `None` is rejected before it reaches the wire.
    Unary(Option<Bytes>),
    /// Sequence of encoded chunks.
    Stream(BoxStream<'static, Result<Bytes>>),
}

impl std::fmt::Debug for ProcedureResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unary(payload) => f.debug_tuple("Unary").field(payload).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// A callable procedure taking the raw request payload.
pub trait Handler<C>: Send + Sync + 'static {
    /// Invoke the procedure.
    fn call(&self, payload: Bytes, context: C) -> BoxFuture<'static, Result<ProcedureResult>>;
}

/// Unary procedure with protobuf request and response.
pub struct UnaryHandler<F, Req, Resp, Fut> {
    handler: F,
    _phantom: PhantomData<fn(Req) -> (Resp, Fut)>,
}

impl<C, F, Req, Resp, Fut> Handler<C> for UnaryHandler<F, Req, Resp, Fut>
where
    C: Send + 'static,
    F: Fn(Req, C) -> Fut + Send + Sync + 'static,
    Req: Message + Default + 'static,
    Resp: Message + 'static,
    Fut: Future<Output = Result<Resp>> + Send + 'static,
{
    fn call(&self, payload: Bytes, context: C) -> BoxFuture<'static, Result<ProcedureResult>> {
        let request: Req = match ProstCodec::decode(&payload) {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        let fut = (self.handler)(request, context);
        fut.map(|response: Result<Resp>| -> Result<ProcedureResult> {
            Ok(ProcedureResult::Unary(Some(ProstCodec::encode(&response?))))
        })
        .boxed()
    }
}

/// Streaming procedure with protobuf request and chunk types.
pub struct StreamHandler<F, Req, Resp, S> {
    handler: F,
    _phantom: PhantomData<fn(Req) -> (Resp, S)>,
}

impl<C, F, Req, Resp, S> Handler<C> for StreamHandler<F, Req, Resp, S>
where
    C: Send + 'static,
    F: Fn(Req, C) -> S + Send + Sync + 'static,
    Req: Message + Default + 'static,
    Resp: Message + 'static,
    S: Stream<Item = Result<Resp>> + Send + 'static,
{
    fn call(&self, payload: Bytes, context: C) -> BoxFuture<'static, Result<ProcedureResult>> {
        let result = ProstCodec::decode::<Req>(&payload).map(|request| {
            let chunks = (self.handler)(request, context)
                .map(|item| item.map(|chunk| ProstCodec::encode(&chunk)));
            ProcedureResult::Stream(chunks.boxed())
        });
        Box::pin(async move { result })
    }
}

/// Unary procedure on raw bytes.
pub struct RawUnaryHandler<F, Fut> {
    handler: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<C, F, Fut> Handler<C> for RawUnaryHandler<F, Fut>
where
    C: Send + 'static,
    F: Fn(Bytes, C) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Bytes>>> + Send + 'static,
{
    fn call(&self, payload: Bytes, context: C) -> BoxFuture<'static, Result<ProcedureResult>> {
        (self.handler)(payload, context)
            .map(|response| response.map(ProcedureResult::Unary))
            .boxed()
    }
}

/// Streaming procedure on raw bytes.
pub struct RawStreamHandler<F, S> {
    handler: F,
    _phantom: PhantomData<fn() -> S>,
}

impl<C, F, S> Handler<C> for RawStreamHandler<F, S>
where
    C: Send + 'static,
    F: Fn(Bytes, C) -> S + Send + Sync + 'static,
    S: Stream<Item = Result<Bytes>> + Send + 'static,
{
    fn call(&self, payload: Bytes, context: C) -> BoxFuture<'static, Result<ProcedureResult>> {
        let chunks = (self.handler)(payload, context).boxed();
        Box::pin(async move { Ok(ProcedureResult::Stream(chunks)) })
    }
}

/// Ordered list of named procedures exposed by one module.
pub struct ModuleDefinition<C> {
    procedures: Vec<(String, Arc<dyn Handler<C>>)>,
}

impl<C: Send + 'static> ModuleDefinition<C> {
    /// Create an empty module.
    pub fn new() -> Self {
        Self {
            procedures: Vec::new(),
        }
    }

    /// Add a unary procedure with protobuf request and response.
    pub fn unary<F, Req, Resp, Fut>(self, name: &str, handler: F) -> Self
    where
        F: Fn(Req, C) -> Fut + Send + Sync + 'static,
        Req: Message + Default + 'static,
        Resp: Message + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
    {
        self.with_handler(
            name,
            UnaryHandler {
                handler,
                _phantom: PhantomData,
            },
        )
    }

    /// Add a streaming procedure with protobuf request and chunks.
    pub fn stream<F, Req, Resp, S>(self, name: &str, handler: F) -> Self
    where
        F: Fn(Req, C) -> S + Send + Sync + 'static,
        Req: Message + Default + 'static,
        Resp: Message + 'static,
        S: Stream<Item = Result<Resp>> + Send + 'static,
    {
        self.with_handler(
            name,
            StreamHandler {
                handler,
                _phantom: PhantomData,
            },
        )
    }

    /// Add a unary procedure on raw bytes. Returning `None` fails the call.
    pub fn unary_raw<F, Fut>(self, name: &str, handler: F) -> Self
    where
        F: Fn(Bytes, C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Bytes>>> + Send + 'static,
    {
        self.with_handler(
            name,
            RawUnaryHandler {
                handler,
                _phantom: PhantomData,
            },
        )
    }

    /// Add a streaming procedure on raw bytes.
    pub fn stream_raw<F, S>(self, name: &str, handler: F) -> Self
    where
        F: Fn(Bytes, C) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Bytes>> + Send + 'static,
    {
        self.with_handler(
            name,
            RawStreamHandler {
                handler,
                _phantom: PhantomData,
            },
        )
    }

    /// Add a procedure from any [`Handler`].
    pub fn with_handler(mut self, name: &str, handler: impl Handler<C>) -> Self {
        let handler: Arc<dyn Handler<C>> = Arc::new(handler);
        self.procedures.push((name.to_string(), handler));
        self
    }

    /// Procedure names in registration order.
    pub fn procedure_names(&self) -> impl Iterator<Item = &str> {
        self.procedures.iter().map(|(name, _)| name.as_str())
    }

    /// Number of procedures.
    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    /// Whether the module has no procedures.
    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }

    pub(crate) fn into_procedures(self) -> Vec<(String, Arc<dyn Handler<C>>)> {
        self.procedures
    }
}

impl<C: Send + 'static> Default for ModuleDefinition<C> {
    fn default() -> Self {
        Self::new()
    }
}
