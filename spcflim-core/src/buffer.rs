//! Recyclable raw-word buffers and the bounded producer/consumer stream.
//!
//! A fixed pool of pre-allocated word buffers moves raw device data from the
//! producer thread to the single consumer: the producer acquires a free
//! buffer (blocking when the pool is exhausted, so backpressure never drops
//! data), fills it, and sends it through a bounded FIFO channel; the consumer
//! drains it and drops it, which returns the storage to the pool.
//!
//! A buffer is owned by exactly one of {pool, producer, in-flight, consumer}
//! at any instant; ownership moves, contents are never shared across threads.

use crossbeam_channel::{bounded, Receiver, Sender};
use thiserror::Error;

/// Default number of words per buffer: ~5 ms of data at 10 M events/s.
pub const DEFAULT_BUFFER_CAPACITY_WORDS: usize = 48 * 1024;

/// Default number of buffers in the pool.
pub const DEFAULT_POOL_BUFFERS: usize = 8;

/// An owned, bounded block of raw device words.
///
/// Acquired from an [`EventBufferPool`]; dropping the buffer returns its
/// storage to the pool it came from.
pub struct EventBuffer {
    words: Vec<u32>,
    capacity: usize,
    pool: Option<Sender<Vec<u32>>>,
}

impl EventBuffer {
    /// Creates a standalone buffer not backed by a pool (tests, replay).
    pub fn with_capacity(capacity_words: usize) -> Self {
        Self {
            words: Vec::with_capacity(capacity_words),
            capacity: capacity_words,
            pool: None,
        }
    }

    /// The words currently held.
    #[inline]
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Number of words currently held.
    #[inline]
    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// True if no words are held.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Maximum number of words this buffer holds.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of additional words that fit (the producer's read budget).
    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity - self.words.len()
    }

    /// Appends one word.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is already full.
    #[inline]
    pub fn push(&mut self, word: u32) {
        assert!(self.words.len() < self.capacity, "event buffer overfilled");
        self.words.push(word);
    }

    /// Appends a run of words.
    ///
    /// # Panics
    ///
    /// Panics if the run does not fit in the remaining capacity.
    pub fn extend_from_slice(&mut self, words: &[u32]) {
        assert!(words.len() <= self.remaining(), "event buffer overfilled");
        self.words.extend_from_slice(words);
    }

    /// Discards all held words, keeping the allocation.
    pub fn clear(&mut self) {
        self.words.clear();
    }
}

impl Drop for EventBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            let mut words = std::mem::take(&mut self.words);
            words.clear();
            // The pool may already be gone during teardown; the storage is
            // then simply freed.
            let _ = pool.send(words);
        }
    }
}

/// Fixed-size pool of recyclable [`EventBuffer`]s.
///
/// All storage is allocated up front; `acquire` blocks while every buffer is
/// checked out, which backpressures the producer instead of dropping data.
pub struct EventBufferPool {
    free_rx: Receiver<Vec<u32>>,
    free_tx: Sender<Vec<u32>>,
    capacity_words: usize,
    pool_size: usize,
}

impl EventBufferPool {
    /// Creates a pool of `pool_size` buffers of `capacity_words` words each.
    ///
    /// # Panics
    ///
    /// Panics if either argument is zero.
    pub fn new(pool_size: usize, capacity_words: usize) -> Self {
        assert!(pool_size > 0, "pool_size must be > 0");
        assert!(capacity_words > 0, "capacity_words must be > 0");

        let (free_tx, free_rx) = bounded(pool_size);
        for _ in 0..pool_size {
            free_tx
                .send(Vec::with_capacity(capacity_words))
                .expect("fresh free-list has room for every buffer");
        }

        tracing::debug!(pool_size, capacity_words, "event buffer pool created");

        Self {
            free_rx,
            free_tx,
            capacity_words,
            pool_size,
        }
    }

    /// Takes a free buffer, blocking until one is returned if none is free.
    pub fn acquire(&self) -> EventBuffer {
        let words = self
            .free_rx
            .recv()
            .expect("pool owns a sender, free-list cannot disconnect");
        EventBuffer {
            words,
            capacity: self.capacity_words,
            pool: Some(self.free_tx.clone()),
        }
    }

    /// Takes a free buffer if one is available right now.
    pub fn try_acquire(&self) -> Option<EventBuffer> {
        let words = self.free_rx.try_recv().ok()?;
        Some(EventBuffer {
            words,
            capacity: self.capacity_words,
            pool: Some(self.free_tx.clone()),
        })
    }

    /// Number of buffers currently in the free list.
    pub fn available(&self) -> usize {
        self.free_rx.len()
    }

    /// Total number of buffers owned by the pool.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Capacity of each buffer in words.
    pub fn buffer_capacity(&self) -> usize {
        self.capacity_words
    }
}

/// Error returned when sending into a stream whose consumer is gone.
#[derive(Error, Debug)]
#[error("event stream disconnected")]
pub struct StreamDisconnected;

/// Producer half of the event stream.
pub struct EventStreamSender {
    tx: Option<Sender<EventBuffer>>,
}

impl EventStreamSender {
    /// Transfers ownership of a filled buffer to the consumer.
    ///
    /// Buffers are delivered in send order. Fails if the stream was closed
    /// or the consumer dropped its half.
    pub fn send(&self, buffer: EventBuffer) -> Result<(), StreamDisconnected> {
        match &self.tx {
            Some(tx) => tx.send(buffer).map_err(|_| StreamDisconnected),
            None => Err(StreamDisconnected),
        }
    }

    /// Ends the stream. Idempotent; dropping the sender closes it too.
    pub fn close(&mut self) {
        self.tx = None;
    }
}

/// Consumer half of the event stream.
pub struct EventStream {
    rx: Receiver<EventBuffer>,
    finished: bool,
}

impl EventStream {
    /// Blocks until a buffer arrives or the stream ends.
    ///
    /// Returns `None` exactly once, when the producer has closed the stream
    /// and every in-flight buffer has been delivered; later calls keep
    /// returning `None` without blocking.
    pub fn receive_blocking(&mut self) -> Option<EventBuffer> {
        if self.finished {
            return None;
        }
        match self.rx.recv() {
            Ok(buffer) => Some(buffer),
            Err(_) => {
                self.finished = true;
                None
            }
        }
    }
}

/// Creates a bounded stream holding at most `capacity` buffers in flight.
pub fn event_stream(capacity: usize) -> (EventStreamSender, EventStream) {
    let (tx, rx) = bounded(capacity);
    (
        EventStreamSender { tx: Some(tx) },
        EventStream {
            rx,
            finished: false,
        },
    )
}
