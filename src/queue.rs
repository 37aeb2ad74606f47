//! Pushable queue - push-driven producer, pull-driven consumer.
//!
//! The producer side calls [`PushableQueue::push`], which resolves only once
//! the consumer has pulled the item *and* asked for the next one. This gives
//! the stream pipeline a depth of exactly one item: a producer that waits on
//! `push` before accepting more input never runs ahead of its consumer.
//!
//! ```text
//! push(a) ──► [a] ──► next() = a
//!                     next() ──► push(a) resolves Consumed
//! ```
//!
//! Termination:
//! - [`close`](PushableQueue::close) - graceful end once buffered items drain
//! - [`fail_and_close`](PushableQueue::fail_and_close) - the consumer sees the
//!   error after buffered items, then the end
//! - [`stop`](PushableQueue::stop) - consumer-side early exit; every pending
//!   `push` resolves [`PushOutcome::Stopped`]

use std::collections::VecDeque;
use std::sync::Arc;

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};

use crate::error::{Result, RpcError};

/// How a pushed item left the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The consumer pulled the item and moved on to the next one.
    Consumed,
    /// The consumer stopped before moving past the item.
    Stopped,
    /// The queue was already closed; the item was dropped.
    Closed,
}

struct State<T> {
    items: VecDeque<(T, oneshot::Sender<PushOutcome>)>,
    /// Item handed to the consumer, waiting to be superseded by the next pull.
    in_flight: Option<oneshot::Sender<PushOutcome>>,
    error: Option<RpcError>,
    closed: bool,
    stopped: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    readable: Notify,
}

/// Async queue with one-item backpressure. Cloning shares the queue.
pub struct PushableQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for PushableQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Default for PushableQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PushableQueue<T> {
    /// Create an empty, open queue.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    items: VecDeque::new(),
                    in_flight: None,
                    error: None,
                    closed: false,
                    stopped: false,
                }),
                readable: Notify::new(),
            }),
        }
    }

    /// Push a value and wait until the consumer is done with it.
    pub async fn push(&self, value: T) -> PushOutcome {
        let rx = {
            let mut state = self.shared.state.lock();
            if state.stopped {
                return PushOutcome::Stopped;
            }
            if state.closed {
                return PushOutcome::Closed;
            }
            let (tx, rx) = oneshot::channel();
            state.items.push_back((value, tx));
            rx
        };
        self.shared.readable.notify_one();

        rx.await.unwrap_or(PushOutcome::Stopped)
    }

    /// Pull the next value.
    ///
    /// Returns `None` once the queue is closed (or stopped) and drained. A
    /// stored failure is yielded once, after the buffered items.
    pub async fn next(&self) -> Option<Result<T>> {
        loop {
            {
                let mut state = self.shared.state.lock();
                if let Some(previous) = state.in_flight.take() {
                    let _ = previous.send(PushOutcome::Consumed);
                }
                if state.stopped {
                    return None;
                }
                if let Some((value, consumed)) = state.items.pop_front() {
                    state.in_flight = Some(consumed);
                    return Some(Ok(value));
                }
                if let Some(error) = state.error.take() {
                    return Some(Err(error));
                }
                if state.closed {
                    return None;
                }
            }
            self.shared.readable.notified().await;
        }
    }

    /// End the queue after the buffered items.
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.readable.notify_one();
    }

    /// End the queue with an error delivered after the buffered items.
    pub fn fail_and_close(&self, error: RpcError) {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.error = Some(error);
            state.closed = true;
        }
        self.shared.readable.notify_one();
    }

    /// Whether the producer side ended the queue.
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Stop consuming. Buffered items are dropped and their pushes resolve
    /// [`PushOutcome::Stopped`]. Idempotent.
    pub fn stop(&self) {
        let (items, in_flight) = {
            let mut state = self.shared.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            (std::mem::take(&mut state.items), state.in_flight.take())
        };
        if let Some(tx) = in_flight {
            let _ = tx.send(PushOutcome::Stopped);
        }
        for (_, tx) in items {
            let _ = tx.send(PushOutcome::Stopped);
        }
        self.shared.readable.notify_one();
    }

    /// Whether the consumer stopped early.
    pub fn is_stopped(&self) -> bool {
        self.shared.state.lock().stopped
    }
}

impl<T: Send + 'static> PushableQueue<T> {
    /// Consume the queue as a [`Stream`].
    pub fn into_stream(self) -> impl Stream<Item = Result<T>> + Send + 'static {
        futures::stream::unfold(self, |queue| async move {
            let item = queue.next().await?;
            Some((item, queue))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn test_push_resolves_when_superseded() {
        let queue = PushableQueue::new();
        let producer = tokio::spawn({
            let queue = queue.clone();
            async move { queue.push(1).await }
        });

        assert_eq!(queue.next().await.unwrap().unwrap(), 1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!producer.is_finished());

        queue.close();
        assert!(queue.next().await.is_none());
        assert_eq!(producer.await.unwrap(), PushOutcome::Consumed);
    }

    #[tokio::test]
    async fn test_close_drains_buffered_items() {
        let queue = PushableQueue::new();
        let first = tokio::spawn({
            let queue = queue.clone();
            async move { queue.push("a").await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();

        assert_eq!(queue.next().await.unwrap().unwrap(), "a");
        assert!(queue.next().await.is_none());
        assert!(queue.is_closed());
        assert_eq!(first.await.unwrap(), PushOutcome::Consumed);
        assert_eq!(queue.push("late").await, PushOutcome::Closed);
    }

    #[tokio::test]
    async fn test_fail_and_close_yields_error_once() {
        let queue: PushableQueue<u8> = PushableQueue::new();
        queue.fail_and_close(RpcError::ConnectionClosed);

        assert!(matches!(
            queue.next().await,
            Some(Err(RpcError::ConnectionClosed))
        ));
        assert!(queue.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stop_releases_pending_pushes() {
        let queue = PushableQueue::new();
        let producer = tokio::spawn({
            let queue = queue.clone();
            async move { queue.push(7).await }
        });

        assert_eq!(queue.next().await.unwrap().unwrap(), 7);
        queue.stop();

        assert_eq!(producer.await.unwrap(), PushOutcome::Stopped);
        assert!(queue.is_stopped());
        assert!(queue.next().await.is_none());
        assert_eq!(queue.push(8).await, PushOutcome::Stopped);
    }

    #[tokio::test]
    async fn test_next_waits_for_push() {
        let queue = PushableQueue::new();
        let consumer = tokio::spawn({
            let queue = queue.clone();
            async move { queue.next().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let producer = tokio::spawn({
            let queue = queue.clone();
            async move { queue.push(42u32).await }
        });

        assert_eq!(consumer.await.unwrap().unwrap().unwrap(), 42);
        queue.stop();
        assert_eq!(producer.await.unwrap(), PushOutcome::Stopped);
    }

    #[tokio::test]
    async fn test_into_stream() {
        let queue = PushableQueue::new();
        let producer = tokio::spawn({
            let queue = queue.clone();
            async move {
                for i in 0..3 {
                    assert_eq!(queue.push(i).await, PushOutcome::Consumed);
                }
                queue.close();
            }
        });

        let items: Vec<_> = queue
            .into_stream()
            .map(|item| item.unwrap())
            .collect()
            .await;
        assert_eq!(items, vec![0, 1, 2]);
        producer.await.unwrap();
    }
}
