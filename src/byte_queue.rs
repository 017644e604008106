use std::sync::{Arc, OnceLock};

use bytes::{Buf, Bytes};
use tokio::sync::mpsc;

use crate::error::SudpError;

/// Creates the bounded chunk queue sitting between the dispatcher and the
/// user's read calls.
///
/// The writer closes the queue exactly once with a terminating error;
/// buffered chunks stay readable after that, and a drained reader keeps
/// getting the error.
pub(crate) fn byte_queue(capacity: usize) -> (ByteQueueWriter, ByteQueueReader) {
    let (tx, rx) = mpsc::channel(capacity);
    let err = Arc::new(OnceLock::new());
    (
        ByteQueueWriter {
            tx,
            err: err.clone(),
        },
        ByteQueueReader {
            rx,
            leftover: Bytes::new(),
            err,
        },
    )
}

pub(crate) struct ByteQueueWriter {
    tx: mpsc::Sender<Bytes>,
    err: Arc<OnceLock<SudpError>>,
}

impl ByteQueueWriter {
    /// Enqueues one chunk, waiting while the queue is full. Returns false
    /// if the reading side is gone.
    pub async fn write(&self, chunk: Bytes) -> bool {
        self.tx.send(chunk).await.is_ok()
    }

    /// Latches the terminating error and closes the queue. Consuming `self`
    /// makes writing or closing after close unrepresentable.
    pub fn close(self, err: SudpError) {
        self.err
            .set(err)
            .expect("byte queue closed with an error already latched");
        // dropping self.tx closes the channel
    }
}

pub(crate) struct ByteQueueReader {
    rx: mpsc::Receiver<Bytes>,
    /// unread tail of the last consumed chunk
    leftover: Bytes,
    err: Arc<OnceLock<SudpError>>,
}

impl ByteQueueReader {
    /// Fills `dst` from one or more buffered chunks, waiting only for the
    /// first one. Bytes come out exactly in the order they were written.
    pub async fn read(&mut self, dst: &mut [u8]) -> Result<usize, SudpError> {
        if dst.is_empty() {
            return Ok(0);
        }

        let mut chunk = if self.leftover.is_empty() {
            match self.rx.recv().await {
                Some(chunk) => chunk,
                None => return Err(self.terminating_error()),
            }
        } else {
            std::mem::take(&mut self.leftover)
        };

        let mut n = copy_prefix(dst, &mut chunk);
        // opportunistically top up from chunks that are already waiting
        while n < dst.len() && chunk.is_empty() {
            match self.rx.try_recv() {
                Ok(next) => {
                    chunk = next;
                    n += copy_prefix(&mut dst[n..], &mut chunk);
                }
                Err(_) => break,
            }
        }
        self.leftover = chunk;
        Ok(n)
    }

    fn terminating_error(&self) -> SudpError {
        self.err
            .get()
            .cloned()
            .expect("byte queue dropped without being closed")
    }
}

fn copy_prefix(dst: &mut [u8], chunk: &mut Bytes) -> usize {
    let n = dst.len().min(chunk.len());
    dst[..n].copy_from_slice(&chunk[..n]);
    chunk.advance(n);
    n
}
