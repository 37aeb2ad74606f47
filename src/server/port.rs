//! Server-side port - module registry and procedure table.
//!
//! Modules are registered as lazy factories. The first `RequestModule` for a
//! name runs the factory, assigns port-scoped procedure ids (1-based,
//! increasing across all modules of the port) and caches the result;
//! concurrent loads of the same module share one factory run.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{watch, OnceCell};

use super::module::{Handler, ModuleDefinition, ProcedureResult};
use crate::error::{Result, RpcError};
use crate::transport::wait_closed;

type ModuleFactory<C> =
    Arc<dyn Fn(RpcServerPort<C>) -> BoxFuture<'static, Result<ModuleDefinition<C>>> + Send + Sync>;

/// Procedures exposed by a loaded module, as `(id, name)`.
pub type LoadedModule = Vec<(u32, String)>;

struct PortState<C> {
    factories: HashMap<String, ModuleFactory<C>>,
    modules: HashMap<String, Arc<OnceCell<LoadedModule>>>,
    procedures: HashMap<u32, Arc<dyn Handler<C>>>,
    next_procedure_id: u32,
    closed: bool,
}

struct PortInner<C> {
    id: u32,
    name: String,
    state: Mutex<PortState<C>>,
    closed: watch::Sender<bool>,
}

/// Server half of a port. Cloning shares the port.
pub struct RpcServerPort<C> {
    inner: Arc<PortInner<C>>,
}

impl<C> Clone for RpcServerPort<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C> std::fmt::Debug for RpcServerPort<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServerPort")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

impl<C: Send + 'static> RpcServerPort<C> {
    pub(crate) fn new(id: u32, name: String) -> Self {
        Self {
            inner: Arc::new(PortInner {
                id,
                name,
                state: Mutex::new(PortState {
                    factories: HashMap::new(),
                    modules: HashMap::new(),
                    procedures: HashMap::new(),
                    next_procedure_id: 1,
                    closed: false,
                }),
                closed: watch::channel(false).0,
            }),
        }
    }

    /// Port id, unique within the server.
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Name requested by the client.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Register a lazy module factory under `name`.
    ///
    /// The factory runs once, on the first load request for the module.
    pub fn register_module<F, Fut>(&self, name: &str, factory: F) -> Result<()>
    where
        F: Fn(RpcServerPort<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ModuleDefinition<C>>> + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(RpcError::PortClosed(self.inner.id));
        }
        if state.factories.contains_key(name) {
            return Err(RpcError::DuplicateModule(name.to_string()));
        }
        let factory: ModuleFactory<C> =
            Arc::new(move |port: RpcServerPort<C>| factory(port).boxed());
        state.factories.insert(name.to_string(), factory);
        Ok(())
    }

    /// Load a module, running its factory on first use.
    pub async fn load_module(&self, name: &str) -> Result<LoadedModule> {
        let (cell, factory) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(RpcError::PortClosed(self.inner.id));
            }
            let factory = state.factories.get(name).cloned().ok_or_else(|| {
                RpcError::ModuleNotAvailable {
                    module: name.to_string(),
                    port: self.inner.name.clone(),
                    reason: "no such module".to_string(),
                }
            })?;
            let cell = state.modules.entry(name.to_string()).or_default().clone();
            (cell, factory)
        };

        let procedures = cell
            .get_or_try_init(|| async {
                let definition = factory(self.clone()).await?;
                self.install(definition)
            })
            .await?;
        Ok(procedures.clone())
    }

    fn install(&self, definition: ModuleDefinition<C>) -> Result<LoadedModule> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(RpcError::PortClosed(self.inner.id));
        }
        let mut loaded = Vec::with_capacity(definition.len());
        for (name, handler) in definition.into_procedures() {
            let id = state.next_procedure_id;
            state.next_procedure_id += 1;
            state.procedures.insert(id, handler);
            loaded.push((id, name));
        }
        tracing::debug!(
            "Port {} installed {} procedures",
            self.inner.id,
            loaded.len()
        );
        Ok(loaded)
    }

    /// Invoke a procedure by id.
    ///
    /// An unknown id fails with [`RpcError::ProcedureMissing`]; the caller
    /// turns it into a `RemoteError` answer.
    pub async fn call_procedure(
        &self,
        procedure_id: u32,
        payload: Bytes,
        context: C,
    ) -> Result<ProcedureResult> {
        let handler = {
            let state = self.inner.state.lock();
            if state.closed {
                return Err(RpcError::PortClosed(self.inner.id));
            }
            state
                .procedures
                .get(&procedure_id)
                .cloned()
                .ok_or(RpcError::ProcedureMissing(procedure_id))?
        };
        handler.call(payload, context).await
    }

    /// Close the port: drop every module and procedure, fire the close signal.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.factories.clear();
            state.modules.clear();
            state.procedures.clear();
        }
        tracing::debug!("Server port {} ({}) closed", self.inner.id, self.inner.name);
        self.inner.closed.send_replace(true);
    }

    /// Whether the port is closed.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Resolves once the port is closed.
    pub async fn closed(&self) {
        wait_closed(&mut self.inner.closed.subscribe()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn echo_module() -> ModuleDefinition<()> {
        ModuleDefinition::new()
            .unary_raw("echo", |payload: Bytes, _: ()| async move { Ok(Some(payload)) })
            .unary_raw("empty", |_: Bytes, _: ()| async move { Ok(None) })
    }

    #[tokio::test]
    async fn test_load_assigns_sequential_ids() {
        let port = RpcServerPort::new(1, "test".to_string());
        port.register_module("first", |_| async { Ok(echo_module()) })
            .unwrap();
        port.register_module("second", |_| async { Ok(echo_module()) })
            .unwrap();

        let first = port.load_module("first").await.unwrap();
        let second = port.load_module("second").await.unwrap();

        assert_eq!(first, vec![(1, "echo".to_string()), (2, "empty".to_string())]);
        assert_eq!(second, vec![(3, "echo".to_string()), (4, "empty".to_string())]);
    }

    #[tokio::test]
    async fn test_concurrent_loads_run_factory_once() {
        let port = RpcServerPort::new(1, "test".to_string());
        let runs = Arc::new(AtomicUsize::new(0));
        port.register_module("m", {
            let runs = runs.clone();
            move |_| {
                let runs = runs.clone();
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    Ok(echo_module())
                }
            }
        })
        .unwrap();

        let (a, b) = tokio::join!(port.load_module("m"), port.load_module("m"));
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_load_is_retried() {
        let port = RpcServerPort::new(1, "test".to_string());
        let attempts = Arc::new(AtomicUsize::new(0));
        port.register_module("flaky", {
            let attempts = attempts.clone();
            move |_| {
                let first = attempts.fetch_add(1, Ordering::SeqCst) == 0;
                async move {
                    if first {
                        Err(RpcError::procedure("not yet"))
                    } else {
                        Ok(echo_module())
                    }
                }
            }
        })
        .unwrap();

        assert!(port.load_module("flaky").await.is_err());
        assert_eq!(port.load_module("flaky").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_and_unknown_modules() {
        let port = RpcServerPort::new(1, "test".to_string());
        port.register_module("m", |_| async { Ok(echo_module()) })
            .unwrap();

        assert!(matches!(
            port.register_module("m", |_| async { Ok(echo_module()) }),
            Err(RpcError::DuplicateModule(_))
        ));
        assert!(matches!(
            port.load_module("missing").await,
            Err(RpcError::ModuleNotAvailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_call_procedure() {
        let port = RpcServerPort::new(1, "test".to_string());
        port.register_module("m", |_| async { Ok(echo_module()) })
            .unwrap();
        port.load_module("m").await.unwrap();

        let result = port
            .call_procedure(1, Bytes::from_static(b"hi"), ())
            .await
            .unwrap();
        assert!(matches!(result, ProcedureResult::Unary(Some(ref p)) if &p[..] == b"hi"));

        let missing = port.call_procedure(99, Bytes::new(), ()).await;
        assert_eq!(missing.unwrap_err().to_string(), "procedureId missing: 99");
    }

    #[tokio::test]
    async fn test_close_clears_tables_and_signals() {
        let port = RpcServerPort::new(7, "test".to_string());
        port.register_module("m", |_| async { Ok(echo_module()) })
            .unwrap();
        port.load_module("m").await.unwrap();

        let waiter = tokio::spawn({
            let port = port.clone();
            async move { port.closed().await }
        });
        port.close();
        waiter.await.unwrap();

        assert!(port.is_closed());
        assert!(matches!(
            port.call_procedure(1, Bytes::new(), ()).await,
            Err(RpcError::PortClosed(7))
        ));
        assert!(matches!(
            port.load_module("m").await,
            Err(RpcError::PortClosed(7))
        ));
    }
}
