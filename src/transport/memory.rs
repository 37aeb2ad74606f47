//! In-process connected transport pair.
//!
//! Both ends share one close signal: closing either end (or dropping every
//! handle of one end) closes the connection for both.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use super::writer::DEFAULT_CHANNEL_CAPACITY;
use super::{endpoint_with_signal, wait_closed, Transport, TransportEvent};

/// Create a connected pair with the default channel capacity.
pub fn pair() -> (Transport, Transport) {
    pair_with_capacity(DEFAULT_CHANNEL_CAPACITY)
}

/// Create a connected pair.
pub fn pair_with_capacity(capacity: usize) -> (Transport, Transport) {
    let closed = Arc::new(watch::channel(false).0);
    let (left, left_end) = endpoint_with_signal(capacity, closed.clone());
    let (right, right_end) = endpoint_with_signal(capacity, closed.clone());

    tokio::spawn(forward(
        left_end.outbound,
        right_end.events,
        closed.clone(),
    ));
    tokio::spawn(forward(right_end.outbound, left_end.events, closed));

    (left, right)
}

/// Move messages from one end's outbound queue to the other end's events.
async fn forward(
    mut outbound: mpsc::Receiver<Bytes>,
    events: mpsc::Sender<TransportEvent>,
    closed: Arc<watch::Sender<bool>>,
) {
    let mut signal = closed.subscribe();
    loop {
        tokio::select! {
            biased;
            message = outbound.recv() => {
                let Some(message) = message else { break };
                tokio::select! {
                    sent = events.send(TransportEvent::Message(message)) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                    _ = wait_closed(&mut signal) => break,
                }
            }
            _ = wait_closed(&mut signal) => break,
        }
    }
    closed.send_replace(true);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_in_order() {
        let (a, b) = pair();
        let (a, _a_events) = a.into_parts();
        let (_b, mut b_events) = b.into_parts();

        for i in 0..10u8 {
            a.send(Bytes::copy_from_slice(&[i])).await.unwrap();
        }
        for i in 0..10u8 {
            assert_eq!(
                b_events.recv().await,
                Some(TransportEvent::Message(Bytes::copy_from_slice(&[i])))
            );
        }
    }

    #[tokio::test]
    async fn test_close_ends_both_event_streams() {
        let (a, b) = pair();
        let (a, mut a_events) = a.into_parts();
        let (b, mut b_events) = b.into_parts();

        b.close();

        assert_eq!(a_events.recv().await, None);
        assert_eq!(b_events.recv().await, None);
        assert!(a.is_closed());
    }

    #[tokio::test]
    async fn test_dropping_handles_closes_connection() {
        let (a, b) = pair();
        let (_, _a_events) = a.into_parts();
        let (b, mut b_events) = b.into_parts();

        assert_eq!(b_events.recv().await, None);
        assert!(b.is_closed());
    }
}
