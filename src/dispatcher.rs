//! Client-side dispatcher - message numbers and response routing.
//!
//! One dispatcher owns the message-number space of one transport. Every
//! outgoing request gets the next number; inbound frames are routed by the
//! number in their identifier to either a one-shot waiter or a persistent
//! stream listener:
//!
//! ```text
//!                ┌─► Pending::Unary(oneshot)  ── Response / RemoteError
//! read loop ─────┤
//!                └─► Pending::Stream(mpsc)    ── StreamMessage* / RemoteError
//! ```
//!
//! When the transport closes, unary waiters fail with
//! [`RpcError::ConnectionClosed`] and stream listeners see their channel end.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use prost::Message;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Result, RpcError};
use crate::protocol::{encode, parse_message, Frame, ProtocolMessage, MAX_MESSAGE_NUMBER};
use crate::transport::{Transport, TransportEvent, TransportHandle};

/// Default ceiling of the message-number counter.
pub const DEFAULT_MAX_MESSAGE_NUMBER: u32 = 0x0100_0000;

/// Receiver of the frames routed to a stream listener.
pub type StreamFrames = mpsc::UnboundedReceiver<Frame>;

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    max_message_number: u32,
}

impl DispatcherConfig {
    /// Set the counter ceiling, clamped to the 27-bit number space.
    pub fn with_max_message_number(mut self, max: u32) -> Self {
        self.max_message_number = max.clamp(1, MAX_MESSAGE_NUMBER);
        self
    }

    /// Highest message number handed out before the counter wraps to 1.
    pub fn max_message_number(&self) -> u32 {
        self.max_message_number
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_message_number: DEFAULT_MAX_MESSAGE_NUMBER,
        }
    }
}

enum Pending {
    Unary(oneshot::Sender<Result<Frame>>),
    Stream(mpsc::UnboundedSender<Frame>),
}

struct Table {
    next_number: u32,
    pending: HashMap<u32, Pending>,
    closed: bool,
}

impl Table {
    /// Next free number. 0 is never issued; numbers still pending are skipped.
    fn allocate(&mut self, max: u32) -> Result<u32> {
        for _ in 0..max {
            let number = self.next_number;
            self.next_number = if number >= max { 1 } else { number + 1 };
            if !self.pending.contains_key(&number) {
                return Ok(number);
            }
        }
        Err(RpcError::Protocol("message numbers exhausted".to_string()))
    }
}

/// Per-transport request/response correlator.
pub struct Dispatcher {
    transport: TransportHandle,
    config: DispatcherConfig,
    table: Mutex<Table>,
}

impl Dispatcher {
    /// Take over a transport and start routing its inbound frames.
    pub fn spawn(transport: Transport, config: DispatcherConfig) -> Arc<Self> {
        let (handle, events) = transport.into_parts();
        let dispatcher = Arc::new(Self {
            transport: handle,
            config,
            table: Mutex::new(Table {
                next_number: 1,
                pending: HashMap::new(),
                closed: false,
            }),
        });
        tokio::spawn(dispatcher.clone().read_loop(events));
        dispatcher
    }

    /// Sending half of the underlying transport.
    pub fn transport(&self) -> &TransportHandle {
        &self.transport
    }

    /// Send a request and wait for the frame answering it.
    ///
    /// `build` receives the allocated message number. A `RemoteError` answer
    /// resolves to [`RpcError::Remote`].
    pub async fn request<F, M>(&self, build: F) -> Result<Frame>
    where
        F: FnOnce(u32) -> M,
        M: Message,
    {
        let (tx, rx) = oneshot::channel();
        let number = self.register(Pending::Unary(tx))?;
        let mut reply = PendingReply {
            dispatcher: self,
            number,
            rx: Some(rx),
        };
        self.send_registered(number, build(number)).await?;
        match reply.rx.as_mut() {
            Some(rx) => rx.await.map_err(|_| RpcError::ConnectionClosed)?,
            None => Err(RpcError::ConnectionClosed),
        }
    }

    /// Send a request whose answers are a stream of frames.
    ///
    /// The listener is registered before the request leaves, so no answer
    /// can arrive unrouted.
    pub async fn request_stream<F, M>(&self, build: F) -> Result<(u32, StreamFrames)>
    where
        F: FnOnce(u32) -> M,
        M: Message,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let number = self.register(Pending::Stream(tx))?;
        self.send_registered(number, build(number)).await?;
        Ok((number, rx))
    }

    /// Send a message under a fresh number without waiting for an answer.
    pub async fn notify<F, M>(&self, build: F) -> Result<()>
    where
        F: FnOnce(u32) -> M,
        M: Message,
    {
        let number = {
            let mut table = self.table.lock();
            if table.closed {
                return Err(RpcError::ConnectionClosed);
            }
            table.allocate(self.config.max_message_number)?
        };
        self.transport.send(encode(&build(number))).await
    }

    /// Send a message that already carries its number.
    pub async fn send<M: Message>(&self, message: &M) -> Result<()> {
        self.transport.send(encode(message)).await
    }

    /// Register a persistent listener for `number`.
    ///
    /// Fails if anything is already registered for that number.
    pub fn add_listener(&self, number: u32, listener: mpsc::UnboundedSender<Frame>) -> Result<()> {
        let mut table = self.table.lock();
        if table.closed {
            return Err(RpcError::ConnectionClosed);
        }
        if table.pending.contains_key(&number) {
            return Err(RpcError::DuplicateListener(number));
        }
        table.pending.insert(number, Pending::Stream(listener));
        Ok(())
    }

    /// Remove the persistent listener for `number`.
    pub fn remove_listener(&self, number: u32) -> Result<()> {
        let mut table = self.table.lock();
        if !matches!(table.pending.get(&number), Some(Pending::Stream(_))) {
            return Err(RpcError::MissingListener(number));
        }
        table.pending.remove(&number);
        Ok(())
    }

    /// Number of outstanding calls and listeners.
    pub fn pending_count(&self) -> usize {
        self.table.lock().pending.len()
    }

    /// Whether the transport is closed.
    pub fn is_closed(&self) -> bool {
        self.table.lock().closed || self.transport.is_closed()
    }

    fn register(&self, pending: Pending) -> Result<u32> {
        let mut table = self.table.lock();
        if table.closed {
            return Err(RpcError::ConnectionClosed);
        }
        let number = table.allocate(self.config.max_message_number)?;
        table.pending.insert(number, pending);
        Ok(number)
    }

    async fn send_registered<M: Message>(&self, number: u32, message: M) -> Result<()> {
        if let Err(e) = self.transport.send(encode(&message)).await {
            self.table.lock().pending.remove(&number);
            return Err(e);
        }
        Ok(())
    }

    async fn read_loop(self: Arc<Self>, mut events: mpsc::Receiver<TransportEvent>) {
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
                    tracing::warn!("Transport error: {}", e);
                }
            }
        }
        tracing::debug!("Dispatcher read loop finished");
        self.close_all();
    }

    fn route(&self, frame: Frame) {
        if let ProtocolMessage::ServerReady(_) = frame.message {
            tracing::debug!("Server ready");
            return;
        }

        let number = frame.number();
        let mut table = self.table.lock();
        match table.pending.remove(&number) {
            Some(Pending::Unary(tx)) => {
                drop(table);
                let _ = tx.send(into_result(frame));
            }
            Some(Pending::Stream(listener)) => {
                if listener.send(frame).is_ok() {
                    table.pending.insert(number, Pending::Stream(listener));
                }
            }
            None => {
                tracing::debug!("Dropping frame for unknown message number {}", number);
            }
        }
    }

    fn close_all(&self) {
        let pending = {
            let mut table = self.table.lock();
            table.closed = true;
            std::mem::take(&mut table.pending)
        };
        for (_, entry) in pending {
            if let Pending::Unary(tx) = entry {
                let _ = tx.send(Err(RpcError::ConnectionClosed));
            }
        }
    }
}

/// Unary waiter owned by an in-progress `request`.
///
/// Dropping it before the answer arrives (a timed-out or cancelled call)
/// removes the table entry, so an answer that never comes does not pin it.
struct PendingReply<'a> {
    dispatcher: &'a Dispatcher,
    number: u32,
    rx: Option<oneshot::Receiver<Result<Frame>>>,
}

impl Drop for PendingReply<'_> {
    fn drop(&mut self) {
        drop(self.rx.take());
        let mut table = self.dispatcher.table.lock();
        // Only our own entry has a sender whose receiver is gone.
        if matches!(table.pending.get(&self.number), Some(Pending::Unary(tx)) if tx.is_closed()) {
            table.pending.remove(&self.number);
        }
    }
}

fn into_result(frame: Frame) -> Result<Frame> {
    match frame.message {
        ProtocolMessage::RemoteError(error) => Err(RpcError::Remote {
            code: error.error_code,
            message: error.error_message,
        }),
        _ => Ok(frame),
    }
}
