use std::time::Duration;

use log::trace;
use tokio::sync::mpsc::{self, Receiver, Sender, error::SendTimeoutError};
use tokio_util::sync::CancellationToken;

use crate::core::error::QueueError;

/// Creates a bounded FIFO with a single writer and a single reader.
pub fn bounded<T>(capacity: usize, put_timeout: Duration) -> (QueueWriter<T>, QueueReader<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        QueueWriter {
            tx: Some(tx),
            put_timeout,
            blocked_puts: 0,
        },
        QueueReader { rx },
    )
}

/// Writing half. Completion is explicit: the reader drains whatever is
/// buffered and then observes end of stream.
pub struct QueueWriter<T> {
    tx: Option<Sender<T>>,
    put_timeout: Duration,
    blocked_puts: u64,
}

impl<T> QueueWriter<T> {
    /// Pushes one item, retrying on a full queue until it fits, the reader
    /// goes away or `cancel` fires.
    pub async fn put(&mut self, item: T, cancel: &CancellationToken) -> Result<(), QueueError> {
        let mut item = item;
        loop {
            if cancel.is_cancelled() {
                return Err(QueueError::Cancelled);
            }
            let tx = self.tx.as_ref().ok_or(QueueError::Closed)?;
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(QueueError::Cancelled),
                sent = tx.send_timeout(item, self.put_timeout) => sent,
            };
            match sent {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(returned)) => {
                    self.blocked_puts += 1;
                    trace!("[sync-queue] put blocked; retrying");
                    item = returned;
                    tokio::task::yield_now().await;
                }
                Err(SendTimeoutError::Closed(_)) => return Err(QueueError::Closed),
            }
        }
    }

    /// Marks the queue complete. Safe to call more than once.
    pub fn complete(&mut self) {
        self.tx.take();
    }

    pub fn is_complete(&self) -> bool {
        self.tx.is_none()
    }

    /// Puts that had to be retried because the queue was full.
    pub fn blocked_puts(&self) -> u64 {
        self.blocked_puts
    }
}

pub struct QueueReader<T> {
    rx: Receiver<T>,
}

impl<T> QueueReader<T> {
    /// Next item, or `None` once the writer completed and the buffer is empty.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Drains everything until completion.
    pub async fn collect(mut self) -> Vec<T> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item);
        }
        items
    }
}
