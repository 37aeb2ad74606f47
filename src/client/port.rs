//! Client-side port handle.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{watch, OnceCell};

use super::module::ClientModule;
use crate::dispatcher::Dispatcher;
use crate::error::{Result, RpcError};
use crate::protocol::{frame, ProtocolMessage};
use crate::transport::wait_closed;

/// What a loaded module needs from its port: where to send and whether the
/// port is still open. Holds no module cache, so modules never keep their
/// port alive.
#[derive(Clone)]
pub(crate) struct PortLink {
    dispatcher: Arc<Dispatcher>,
    id: u32,
    closed: Arc<watch::Sender<bool>>,
}

impl PortLink {
    pub(crate) fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.dispatcher.is_closed()
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(RpcError::PortClosed(self.id));
        }
        Ok(())
    }
}

struct PortInner {
    link: PortLink,
    name: String,
    modules: Mutex<HashMap<String, Arc<OnceCell<ClientModule>>>>,
}

/// A port opened by [`RpcClient::create_port`](super::RpcClient::create_port).
///
/// The port closes on [`close`](Self::close) or when the transport closes.
#[derive(Clone)]
pub struct RpcClientPort {
    inner: Arc<PortInner>,
}

impl RpcClientPort {
    pub(crate) fn new(dispatcher: Arc<Dispatcher>, id: u32, name: String) -> Self {
        Self {
            inner: Arc::new(PortInner {
                link: PortLink {
                    dispatcher,
                    id,
                    closed: Arc::new(watch::channel(false).0),
                },
                name,
                modules: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Port id assigned by the server.
    pub fn id(&self) -> u32 {
        self.inner.link.id
    }

    /// Port name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub(crate) fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner.link.dispatcher
    }

    /// Load a module by name.
    ///
    /// Concurrent loads of the same name share one `RequestModule` round
    /// trip. A failed load is not cached.
    pub async fn load_module(&self, name: &str) -> Result<ClientModule> {
        self.inner.link.ensure_open()?;
        let cell = self
            .inner
            .modules
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone();

        let module = cell.get_or_try_init(|| self.request_module(name)).await?;
        Ok(module.clone())
    }

    async fn request_module(&self, name: &str) -> Result<ClientModule> {
        let not_available = |reason: String| RpcError::ModuleNotAvailable {
            module: name.to_string(),
            port: self.inner.name.clone(),
            reason,
        };

        let port_id = self.id();
        let answer = self
            .dispatcher()
            .request(|n| frame::request_module(n, port_id, name))
            .await
            .map_err(|e| not_available(e.to_string()))?;

        match answer.message {
            ProtocolMessage::RequestModuleResponse(response) => {
                let procedures = response
                    .procedures
                    .into_iter()
                    .map(|p| (p.procedure_id, p.procedure_name))
                    .collect();
                Ok(ClientModule::new(
                    self.inner.link.clone(),
                    name.to_string(),
                    procedures,
                ))
            }
            _ => Err(not_available(format!(
                "unexpected {:?} answer",
                answer.id.kind
            ))),
        }
    }

    /// Destroy the port on the server and close it locally. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let was_open = !self.inner.link.closed.send_replace(true);
        if !was_open {
            return Ok(());
        }
        self.inner.modules.lock().clear();
        let port_id = self.id();
        tracing::debug!("Closing port {} ({})", port_id, self.inner.name);

        match self
            .dispatcher()
            .notify(|n| frame::destroy_port(n, port_id))
            .await
        {
            Err(e) if e.is_closed() => Ok(()),
            other => other,
        }
    }

    /// Whether the port (or its transport) is closed.
    pub fn is_closed(&self) -> bool {
        self.inner.link.is_closed()
    }

    /// Resolves once the port is closed, locally or by the transport.
    pub async fn closed(&self) {
        let mut signal = self.inner.link.closed.subscribe();
        tokio::select! {
            _ = wait_closed(&mut signal) => {}
            _ = self.dispatcher().transport().closed() => {}
        }
    }
}

impl std::fmt::Debug for RpcClientPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClientPort")
            .field("id", &self.id())
            .field("name", &self.inner.name)
            .finish()
    }
}
