//! Bounded, lossy output queue.
//!
//! Background readers push onto the queue with `try_send` so they never wait
//! on the control loop. When the control loop falls behind and the channel is
//! full, the chunk is dropped and counted instead of blocking the reader.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

/// Default number of chunks held by a queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Largest chunk pushed onto a queue in one message.
pub const MAX_CHUNK_SIZE: usize = 4096;

/// Statistics about a queue's message handling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Total messages accepted by the channel.
    pub messages_sent: u64,
    /// Messages dropped because the channel was full.
    pub messages_dropped: u64,
    /// Whether the queue is currently dropping messages.
    pub is_backpressured: bool,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    dropped: AtomicU64,
    backpressured: AtomicBool,
}

/// Read-only view of a queue's counters, shared with the session handle.
#[derive(Debug, Clone, Default)]
pub struct QueueMonitor {
    counters: Arc<Counters>,
}

impl QueueMonitor {
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            messages_sent: self.counters.sent.load(Ordering::Relaxed),
            messages_dropped: self.counters.dropped.load(Ordering::Relaxed),
            is_backpressured: self.counters.backpressured.load(Ordering::Relaxed),
        }
    }
}

/// Sending half of a bounded output queue.
pub struct OutputQueue<T> {
    label: &'static str,
    tx: mpsc::Sender<T>,
    monitor: QueueMonitor,
}

impl<T> OutputQueue<T> {
    /// Creates a queue with [`DEFAULT_QUEUE_CAPACITY`].
    pub fn new(label: &'static str) -> (Self, mpsc::Receiver<T>) {
        Self::with_capacity(label, DEFAULT_QUEUE_CAPACITY)
    }

    /// Creates a queue with a specific channel capacity.
    pub fn with_capacity(label: &'static str, capacity: usize) -> (Self, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::from_sender(label, tx), rx)
    }

    /// Wraps an existing sender.
    pub fn from_sender(label: &'static str, tx: mpsc::Sender<T>) -> Self {
        Self {
            label,
            tx,
            monitor: QueueMonitor::default(),
        }
    }

    pub fn monitor(&self) -> QueueMonitor {
        self.monitor.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Attempts to enqueue without waiting.
    ///
    /// Returns true if the item was queued, false if it was dropped.
    pub fn offer(&self, item: T) -> bool {
        let counters = &self.monitor.counters;
        match self.tx.try_send(item) {
            Ok(()) => {
                counters.sent.fetch_add(1, Ordering::Relaxed);
                if counters.backpressured.swap(false, Ordering::Relaxed) {
                    tracing::debug!(queue = self.label, "Queue recovered from backpressure");
                }
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if !counters.backpressured.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        queue = self.label,
                        dropped,
                        "Output queue is full, dropping chunks"
                    );
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(queue = self.label, "Output queue closed");
                false
            }
        }
    }

    /// Enqueues an item that must not be dropped, waiting for capacity.
    ///
    /// Used for lifecycle events. Returns false if the receiver is gone.
    pub async fn deliver(&self, item: T) -> bool {
        match self.tx.send(item).await {
            Ok(()) => {
                self.monitor.counters.sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => false,
        }
    }

    /// Splits `data` into chunks of at most [`MAX_CHUNK_SIZE`], wraps and
    /// offers each.
    ///
    /// Returns the number of chunks dropped.
    pub fn offer_bytes(&self, data: &[u8], wrap: impl Fn(Vec<u8>) -> T) -> usize {
        data.chunks(MAX_CHUNK_SIZE)
            .filter(|chunk| !self.offer(wrap(chunk.to_vec())))
            .count()
    }
}

impl<T> Clone for OutputQueue<T> {
    fn clone(&self) -> Self {
        Self {
            label: self.label,
            tx: self.tx.clone(),
            monitor: self.monitor.clone(),
        }
    }
}
