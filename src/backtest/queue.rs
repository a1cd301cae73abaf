//! Event Queue
//!
//! Min-heap of pending events with a strict total order:
//!
//! 1. timestamp (ascending)
//! 2. topic rank (MARKET_DATA < ORDER < FILL < PORTFOLIO_UPDATE)
//! 3. insertion sequence (stable among equals)
//!
//! The key lives beside the event in [`QueueEntry`]; events themselves carry
//! no ordering. Also holds [`StreamMerger`], the lazy k-way merge over the
//! per-symbol bar streams that feeds the queue.

use crate::backtest::clock::Nanos;
use crate::backtest::events::{Event, MarketDataEvent};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

/// Ordering key `(timestamp, topic_rank, insertion_sequence)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct QueueKey {
    pub timestamp: Nanos,
    pub rank: u8,
    pub seq: u64,
}

impl QueueKey {
    pub fn for_event(event: &Event, seq: u64) -> Self {
        Self {
            timestamp: event.timestamp(),
            rank: event.topic().rank(),
            seq,
        }
    }
}

/// Event plus its ordering key. Compares by key only.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub key: QueueKey,
    pub event: Event,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

/// Deterministic event queue.
///
/// `push` may be called while the driver is draining the queue (handlers
/// publishing in queued mode); a pushed event is visible to the next
/// `pop_next`.
#[derive(Debug, Default)]
pub struct EventQueue {
    heap: BinaryHeap<Reverse<QueueEntry>>,
    next_seq: u64,
    total_popped: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an event; O(log n).
    #[inline]
    pub fn push(&mut self, event: Event) -> QueueKey {
        let key = QueueKey::for_event(&event, self.next_seq);
        self.next_seq += 1;
        self.heap.push(Reverse(QueueEntry { key, event }));
        key
    }

    /// Remove and return the minimal event. `None` means the queue is empty.
    #[inline]
    pub fn pop_next(&mut self) -> Option<Event> {
        self.pop_entry().map(|entry| entry.event)
    }

    /// Like `pop_next`, keeping the ordering key.
    pub fn pop_entry(&mut self) -> Option<QueueEntry> {
        let entry = self.heap.pop().map(|r| r.0);
        if entry.is_some() {
            self.total_popped += 1;
        }
        entry
    }

    #[inline]
    pub fn peek_time(&self) -> Option<Nanos> {
        self.heap.peek().map(|r| r.0.key.timestamp)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Total events ever inserted.
    #[inline]
    pub fn total_inserted(&self) -> u64 {
        self.next_seq
    }

    #[inline]
    pub fn total_popped(&self) -> u64 {
        self.total_popped
    }
}

/// One per-symbol bar stream. Items are fallible so a file-backed feed can
/// surface a bad row mid-run.
pub type BarStream = Box<dyn Iterator<Item = anyhow::Result<MarketDataEvent>>>;

/// Head of one stream inside the merge heap. Ordered by `(timestamp, stream)`
/// so bars sharing a timestamp leave in stream registration order.
struct Head {
    timestamp: Nanos,
    stream: usize,
    bar: MarketDataEvent,
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp && self.stream == other.stream
    }
}

impl Eq for Head {}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Head {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.stream.cmp(&other.stream))
    }
}

/// Error from pulling a stream, tagged with the stream's label.
#[derive(Debug)]
pub struct StreamError {
    pub label: String,
    pub error: anyhow::Error,
}

/// Lazy k-way merge of timestamp-ascending bar streams.
///
/// Holds exactly one look-ahead bar per live stream. Every bar pulled from a
/// stream is reported to the `on_pull` observer passed to [`Self::prime`] /
/// [`Self::next_bar`], which is how the price history learns of look-ahead
/// bars.
pub struct StreamMerger {
    streams: Vec<(String, BarStream)>,
    last_seen: Vec<Option<Nanos>>,
    heads: BinaryHeap<Reverse<Head>>,
    primed: bool,
}

impl StreamMerger {
    pub fn new() -> Self {
        Self {
            streams: Vec::new(),
            last_seen: Vec::new(),
            heads: BinaryHeap::new(),
            primed: false,
        }
    }

    /// Register a stream. Registration order breaks timestamp ties.
    pub fn add_stream(&mut self, label: impl Into<String>, stream: BarStream) {
        self.streams.push((label.into(), stream));
        self.last_seen.push(None);
    }

    /// Pull the first bar of every stream.
    pub fn prime<F>(&mut self, on_pull: &mut F) -> Result<(), StreamError>
    where
        F: FnMut(&MarketDataEvent),
    {
        if self.primed {
            return Ok(());
        }
        self.primed = true;
        for idx in 0..self.streams.len() {
            self.advance(idx, on_pull)?;
        }
        Ok(())
    }

    /// Timestamp of the next bar across all streams.
    #[inline]
    pub fn peek_time(&self) -> Option<Nanos> {
        self.heads.peek().map(|h| h.0.timestamp)
    }

    pub fn is_exhausted(&self) -> bool {
        self.primed && self.heads.is_empty()
    }

    /// Pop the earliest bar and refill its stream.
    pub fn next_bar<F>(&mut self, on_pull: &mut F) -> Result<Option<MarketDataEvent>, StreamError>
    where
        F: FnMut(&MarketDataEvent),
    {
        self.prime(on_pull)?;
        let Some(Reverse(head)) = self.heads.pop() else {
            return Ok(None);
        };
        self.advance(head.stream, on_pull)?;
        Ok(Some(head.bar))
    }

    fn advance<F>(&mut self, idx: usize, on_pull: &mut F) -> Result<(), StreamError>
    where
        F: FnMut(&MarketDataEvent),
    {
        let (label, stream) = &mut self.streams[idx];
        match stream.next() {
            Some(Ok(bar)) => {
                if let Some(prev) = self.last_seen[idx] {
                    if bar.timestamp < prev {
                        tracing::warn!(
                            stream = %label,
                            prev,
                            ts = bar.timestamp,
                            "bar stream is not timestamp-ascending; ordering is no longer guaranteed"
                        );
                    }
                }
                self.last_seen[idx] = Some(bar.timestamp);
                on_pull(&bar);
                self.heads.push(Reverse(Head {
                    timestamp: bar.timestamp,
                    stream: idx,
                    bar,
                }));
                Ok(())
            }
            Some(Err(error)) => Err(StreamError {
                label: label.clone(),
                error,
            }),
            None => Ok(()),
        }
    }
}

impl Default for StreamMerger {
    fn default() -> Self {
        Self::new()
    }
}
