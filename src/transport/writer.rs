//! Dedicated writer task for byte-stream transports.
//!
//! Every `TransportHandle::send` lands in a bounded mpsc channel drained by a
//! single writer task, so concurrent senders never interleave partial frames.
//!
//! ```text
//! Dispatcher ───┐
//! Ack channel ──┼─► mpsc::Sender<Bytes> ─► Writer Task ─► AsyncWrite
//! Server calls ─┘
//! ```
//!
//! Frames that are already queued are batched into one vectored write.

use std::io::IoSlice;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

use super::framing::{length_prefix, LENGTH_PREFIX_SIZE};
use super::wait_closed;
use crate::error::{Result, RpcError};

/// Default outbound channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Configuration for byte-stream transports.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Capacity of the outbound and inbound channels.
    pub channel_capacity: usize,
    /// Largest accepted inbound frame.
    pub max_frame_size: u32,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_frame_size: super::MAX_FRAME_SIZE,
        }
    }
}

/// Drain the outbound channel into `writer` until the transport closes.
pub(crate) async fn writer_loop<W>(
    mut rx: mpsc::Receiver<Bytes>,
    mut writer: W,
    mut closed: watch::Receiver<bool>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = tokio::select! {
            biased;
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = wait_closed(&mut closed) => break,
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        write_batch(&mut writer, &batch).await?;
    }

    let _ = writer.shutdown().await;
    Ok(())
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[Bytes]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let prefixes: Vec<[u8; LENGTH_PREFIX_SIZE]> =
        batch.iter().map(|body| length_prefix(body.len())).collect();
    let total_size: usize = batch.iter().map(|body| LENGTH_PREFIX_SIZE + body.len()).sum();

    let mut total_written = 0;
    while total_written < total_size {
        let slices = build_remaining_slices(&prefixes, batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(RpcError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data not yet written.
fn build_remaining_slices<'a>(
    prefixes: &'a [[u8; LENGTH_PREFIX_SIZE]],
    batch: &'a [Bytes],
    skip_bytes: usize,
) -> Vec<IoSlice<'a>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for (prefix, body) in prefixes.iter().zip(batch) {
        for part in [&prefix[..], &body[..]] {
            let end = offset + part.len();
            if !part.is_empty() && skip_bytes < end {
                let start = skip_bytes.saturating_sub(offset);
                slices.push(IoSlice::new(&part[start..]));
            }
            offset = end;
        }
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_writer_config_default() {
        let config = WriterConfig::default();
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(config.max_frame_size, super::super::MAX_FRAME_SIZE);
    }

    #[test]
    fn test_build_remaining_slices_no_skip() {
        let batch = vec![Bytes::from_static(b"hello")];
        let prefixes = vec![length_prefix(5)];

        let slices = build_remaining_slices(&prefixes, &batch, 0);
        assert_eq!(slices.len(), 2);
    }

    #[test]
    fn test_build_remaining_slices_partial_prefix() {
        let batch = vec![Bytes::from_static(b"hello")];
        let prefixes = vec![length_prefix(5)];

        let slices = build_remaining_slices(&prefixes, &batch, 1);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), LENGTH_PREFIX_SIZE - 1);
        assert_eq!(slices[1].len(), 5);
    }

    #[test]
    fn test_build_remaining_slices_skips_empty_body() {
        let batch = vec![Bytes::new(), Bytes::from_static(b"abc")];
        let prefixes = vec![length_prefix(0), length_prefix(3)];

        let slices = build_remaining_slices(&prefixes, &batch, LENGTH_PREFIX_SIZE);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[1].len(), 3);
    }

    #[tokio::test]
    async fn test_write_batch_multiple() {
        let mut buf = Cursor::new(Vec::new());
        let batch: Vec<_> = (0..5).map(|_| Bytes::from_static(b"abc")).collect();

        write_batch(&mut buf, &batch).await.unwrap();

        let written = buf.into_inner();
        assert_eq!(written.len(), 5 * (LENGTH_PREFIX_SIZE + 3));
        assert_eq!(&written[..4], &[0, 0, 0, 3]);
    }

    #[tokio::test]
    async fn test_writer_loop_stops_on_close() {
        let (tx, rx) = mpsc::channel(4);
        let (closed_tx, closed_rx) = watch::channel(false);
        let task = tokio::spawn(writer_loop(rx, Cursor::new(Vec::new()), closed_rx));

        tx.send(Bytes::from_static(b"x")).await.unwrap();
        closed_tx.send_replace(true);

        assert!(task.await.unwrap().is_ok());
    }
}
