use crate::error::RelayError;
use async_channel::{Receiver, Sender};
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, trace};

/// Non-blocking handle to one encoder input pipe.
///
/// Writes land in a bounded queue drained by a dedicated writer task. When the queue is
/// full the oldest chunk is evicted, so a stalled encoder never blocks the pacing clock
/// or the decode threads.
#[derive(Clone, Debug)]
pub struct PipeWriter {
    name: &'static str,
    tx: Sender<Bytes>,
    written: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl PipeWriter {
    /// Spawns the writer task for `sink` on the current runtime.
    pub fn spawn<W>(name: &'static str, session_id: &str, sink: W, capacity: usize) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (writer, rx) = Self::channel(name, capacity);
        let written = writer.written.clone();
        let session_id = session_id.to_string();
        tokio::spawn(drain(name, session_id, rx, sink, written));
        writer
    }

    /// A writer whose queue is exposed directly instead of being drained into a pipe.
    pub fn channel(name: &'static str, capacity: usize) -> (Self, Receiver<Bytes>) {
        let (tx, rx) = async_channel::bounded(capacity.max(1));
        let writer = Self {
            name,
            tx,
            written: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (writer, rx)
    }

    /// Queues one chunk. Returns `false` once the pipe is closed.
    pub fn write(&self, chunk: Bytes) -> bool {
        match self.tx.force_send(chunk) {
            Ok(None) => true,
            Ok(Some(_evicted)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(pipe = self.name, "Pipe queue full, evicted oldest chunk");
                true
            }
            Err(_) => false,
        }
    }

    /// Stops accepting chunks. Queued chunks are still flushed before the pipe is
    /// dropped, which the encoder sees as end of input.
    pub fn close(&self) {
        if self.tx.close() {
            debug!(pipe = self.name, "Encoder pipe closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn bytes_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn drain<W>(
    name: &'static str,
    session_id: String,
    rx: Receiver<Bytes>,
    mut sink: W,
    written: Arc<AtomicU64>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    while let Ok(chunk) = rx.recv().await {
        if let Err(source) = sink.write_all(&chunk).await {
            let error = RelayError::pipe_write(name, source);
            if error.is_closed_pipe() {
                debug!(%session_id, pipe = name, "Encoder pipe closed by reader");
            } else {
                error!(%session_id, pipe = name, ?error, "Encoder pipe write failed");
            }
            rx.close();
            return;
        }
        written.fetch_add(chunk.len() as u64, Ordering::Relaxed);
    }

    if let Err(error) = sink.shutdown().await {
        trace!(%session_id, pipe = name, ?error, "Encoder pipe shutdown failed");
    }
    debug!(%session_id, pipe = name, "Encoder pipe writer finished");
}
