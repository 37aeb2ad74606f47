//! Loaded client module - procedure stubs by name.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use prost::Message;

use super::port::PortLink;
use super::stream::ClientStream;
use crate::codec::ProstCodec;
use crate::error::{Result, RpcError};
use crate::protocol::{frame, ProtocolMessage};

struct ModuleInner {
    port: PortLink,
    name: String,
    procedures: Vec<(u32, String)>,
    ids: HashMap<String, u32>,
}

/// A module loaded through a client port. Cloning shares the module.
///
/// Whether a procedure is called as unary or streaming is the caller's
/// choice; the wire descriptor only carries ids and names.
#[derive(Clone)]
pub struct ClientModule {
    inner: Arc<ModuleInner>,
}

impl ClientModule {
    pub(crate) fn new(port: PortLink, name: String, procedures: Vec<(u32, String)>) -> Self {
        let ids = procedures
            .iter()
            .map(|(id, name)| (name.clone(), *id))
            .collect();
        Self {
            inner: Arc::new(ModuleInner {
                port,
                name,
                procedures,
                ids,
            }),
        }
    }

    /// Module name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Discovered procedures as `(id, name)`.
    pub fn procedures(&self) -> &[(u32, String)] {
        &self.inner.procedures
    }

    /// Id of the procedure called `name`.
    pub fn procedure_id(&self, name: &str) -> Result<u32> {
        self.inner
            .ids
            .get(name)
            .copied()
            .ok_or_else(|| RpcError::UnknownProcedure(name.to_string()))
    }

    /// Call a procedure expecting a single response.
    ///
    /// An empty response payload is returned as `None`.
    pub async fn call_unary(&self, name: &str, payload: Bytes) -> Result<Option<Bytes>> {
        let procedure_id = self.procedure_id(name)?;
        let port = &self.inner.port;
        port.ensure_open()?;

        let answer = port
            .dispatcher()
            .request(|n| frame::request(n, port.id(), procedure_id, payload))
            .await?;
        match answer.message {
            ProtocolMessage::Response(response) if response.payload.is_empty() => Ok(None),
            ProtocolMessage::Response(response) => Ok(Some(response.payload)),
            ProtocolMessage::StreamMessage(chunk) => {
                // The procedure streams; decline the chunk so it stops waiting for an ack.
                let close = frame::close_stream(answer.id.number, port.id(), chunk.sequence_id);
                if let Err(e) = port.dispatcher().send(&close).await {
                    tracing::debug!("Could not decline stream {}: {}", answer.id.number, e);
                }
                Err(RpcError::Protocol(format!(
                    "{name} answered with a stream; use call_stream"
                )))
            }
            _ => Err(RpcError::Protocol(format!(
                "unexpected {:?} answer to {}",
                answer.id.kind, name
            ))),
        }
    }

    /// Call a streaming procedure.
    pub async fn call_stream(&self, name: &str, payload: Bytes) -> Result<ClientStream> {
        let procedure_id = self.procedure_id(name)?;
        let port = &self.inner.port;
        port.ensure_open()?;

        let dispatcher = port.dispatcher();
        let (number, frames) = dispatcher
            .request_stream(|n| frame::request(n, port.id(), procedure_id, payload))
            .await?;
        Ok(ClientStream::spawn(
            dispatcher.clone(),
            port.id(),
            number,
            frames,
        ))
    }

    /// Typed unary call through [`ProstCodec`].
    pub async fn unary<Req, Resp>(&self, name: &str, request: &Req) -> Result<Resp>
    where
        Req: Message,
        Resp: Message + Default,
    {
        let response = self
            .call_unary(name, ProstCodec::encode(request))
            .await?
            .unwrap_or_default();
        ProstCodec::decode(&response)
    }

    /// Typed streaming call through [`ProstCodec`].
    pub async fn stream<Req, Resp>(
        &self,
        name: &str,
        request: &Req,
    ) -> Result<BoxStream<'static, Result<Resp>>>
    where
        Req: Message,
        Resp: Message + Default + 'static,
    {
        let chunks = self.call_stream(name, ProstCodec::encode(request)).await?;
        Ok(chunks
            .into_stream()
            .map(|chunk| chunk.and_then(|chunk| ProstCodec::decode(&chunk)))
            .boxed())
    }
}

impl std::fmt::Debug for ClientModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientModule")
            .field("name", &self.inner.name)
            .field("procedures", &self.inner.procedures)
            .finish()
    }
}
