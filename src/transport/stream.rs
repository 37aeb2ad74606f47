//! Length-delimited transport over any async byte stream.
//!
//! Works with TCP sockets, Unix domain sockets or `tokio::io::duplex`.
//!
//! # Example
//!
//! ```ignore
//! use portrpc::transport::stream;
//!
//! let socket = tokio::net::TcpStream::connect("127.0.0.1:7000").await?;
//! let transport = stream::from_io(socket);
//! ```

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::watch;

use super::framing::FrameBuffer;
use super::writer::{writer_loop, WriterConfig};
use super::{endpoint, wait_closed, Endpoint, Transport, TransportEvent};
use crate::error::Result;

/// Read buffer size for each `read` call.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Wrap a byte stream with default configuration.
pub fn from_io<S>(io: S) -> Transport
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    from_io_with_config(io, WriterConfig::default())
}

/// Wrap a byte stream.
///
/// Spawns a reader task and a writer task. Both stop once the transport
/// closes; EOF or an I/O error from the stream closes the transport.
pub fn from_io_with_config<S>(io: S, config: WriterConfig) -> Transport
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (transport, endpoint) = endpoint(config.channel_capacity);
    let (reader, writer) = tokio::io::split(io);

    let Endpoint {
        outbound,
        events,
        closed,
    } = endpoint;

    let write_closed = closed.clone();
    let write_signal = write_closed.subscribe();
    tokio::spawn(async move {
        if let Err(e) = writer_loop(outbound, writer, write_signal).await {
            tracing::warn!("Transport write error: {}", e);
        }
        write_closed.send_replace(true);
    });

    let read_signal = closed.subscribe();
    tokio::spawn(async move {
        if let Err(e) = read_loop(reader, &events, read_signal, config.max_frame_size).await {
            tracing::debug!("Transport read error: {}", e);
            let _ = events.send(TransportEvent::Error(e.to_string())).await;
        }
        closed.send_replace(true);
    });

    transport
}

async fn read_loop<R>(
    mut reader: R,
    events: &tokio::sync::mpsc::Sender<TransportEvent>,
    mut closed: watch::Receiver<bool>,
    max_frame_size: u32,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut frame_buffer = FrameBuffer::with_max_frame_size(max_frame_size);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = tokio::select! {
            read = reader.read(&mut buf) => read?,
            _ = wait_closed(&mut closed) => return Ok(()),
        };
        if n == 0 {
            return Ok(());
        }

        for message in frame_buffer.push(&buf[..n])? {
            if events.send(TransportEvent::Message(message)).await.is_err() {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_roundtrip_over_duplex() {
        let (left, right) = tokio::io::duplex(1024);
        let (a, _a_events) = from_io(left).into_parts();
        let (_b, mut b_events) = from_io(right).into_parts();

        a.send(Bytes::from_static(b"first")).await.unwrap();
        a.send(Bytes::from_static(b"second")).await.unwrap();

        assert_eq!(
            b_events.recv().await,
            Some(TransportEvent::Message(Bytes::from_static(b"first")))
        );
        assert_eq!(
            b_events.recv().await,
            Some(TransportEvent::Message(Bytes::from_static(b"second")))
        );
    }

    #[tokio::test]
    async fn test_local_close_reaches_peer() {
        let (left, right) = tokio::io::duplex(1024);
        let (a, mut a_events) = from_io(left).into_parts();
        let (b, mut b_events) = from_io(right).into_parts();

        a.close();

        assert_eq!(a_events.recv().await, None);
        assert_eq!(b_events.recv().await, None);
        b.closed().await;
        assert!(b.is_closed());
    }
}
