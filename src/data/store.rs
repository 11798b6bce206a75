//! The `DataStore` interface and its shared locked implementation.
//!
//! # Thread Safety
//!
//! Every store keeps its header, sample window, event window and journal
//! behind one `parking_lot::RwLock`:
//!
//! - **Appends** and **header replacement** take the write lock, so index
//!   assignment is serialised and a header swap acts as a barrier.
//! - **Reads** take the read lock and see a consistent snapshot.
//! - **Waiting** never touches the lock. After every mutation the new
//!   [`BufferCounts`] are published on a `tokio::sync::watch` channel that
//!   blocked readers subscribe to.

use crate::data::types::{BufferCounts, Event, Header, HeaderSnapshot, SampleBlock};
use crate::data::window::{EventWindow, SampleWindow};
use crate::error::{AppResult, BufferError};
use parking_lot::RwLock;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Operations every buffer variant supports.
///
/// All methods may be called concurrently from any number of connection
/// handlers. Callers never get references into the store's internals.
pub trait DataStore: Send + Sync {
    /// Replaces the header and clears all samples and events.
    fn put_header(&self, header: Header) -> AppResult<()>;

    /// Current header with running totals, or `None` when no header is set.
    fn header(&self) -> Option<HeaderSnapshot>;

    /// Appends a block and returns the totals after the append.
    fn put_data(&self, block: SampleBlock) -> AppResult<BufferCounts>;

    /// Samples in the half-open `range`, or the whole resident window for `None`.
    fn get_data(&self, range: Option<Range<u64>>) -> AppResult<SampleBlock>;

    /// Appends events in order and returns the totals after the append.
    fn put_events(&self, events: Vec<Event>) -> AppResult<BufferCounts>;

    fn put_event(&self, event: Event) -> AppResult<BufferCounts> {
        self.put_events(vec![event])
    }

    /// Events in the half-open `range`, or the whole resident window for `None`.
    fn get_events(&self, range: Option<Range<u64>>) -> AppResult<Vec<Event>>;

    /// Drops the header together with all samples and events.
    fn flush_header(&self) -> AppResult<()>;

    fn flush_data(&self) -> AppResult<()>;

    fn flush_events(&self) -> AppResult<()>;

    fn counts(&self) -> BufferCounts;

    /// Receiver that observes the totals after every mutation.
    fn subscribe(&self) -> watch::Receiver<BufferCounts>;

    /// Releases backing resources. Idempotent.
    fn cleanup(&self);

    /// Short name of the retention policy, for logs.
    fn kind(&self) -> &'static str;

    /// Whether puts and reads may wait on file I/O. Async callers should
    /// move such calls off the runtime's worker threads.
    fn blocking_io(&self) -> bool {
        false
    }
}

/// Side channel that mirrors every mutation, used by the saving store.
///
/// The default methods make a journal that records nothing and can recover
/// nothing, which is what the in-memory variants use.
pub trait Journal: Send + Sync {
    /// Set by journals that touch the filesystem.
    const BLOCKING_IO: bool = false;

    fn header(&mut self, _header: &Header) -> AppResult<()> {
        Ok(())
    }

    fn samples(&mut self, _first: u64, _data: &[u8]) -> AppResult<()> {
        Ok(())
    }

    fn events(&mut self, _first: u64, _events: &[Event]) -> AppResult<()> {
        Ok(())
    }

    fn flush_header(&mut self) -> AppResult<()> {
        Ok(())
    }

    fn flush_samples(&mut self) -> AppResult<()> {
        Ok(())
    }

    fn flush_events(&mut self) -> AppResult<()> {
        Ok(())
    }

    /// Raw sample bytes for `range`, if the journal holds them.
    fn read_samples(&self, _range: Range<u64>) -> Option<AppResult<Vec<u8>>> {
        None
    }

    fn read_events(&self, _range: Range<u64>) -> Option<AppResult<Vec<Event>>> {
        None
    }

    fn close(&mut self) {}
}

/// Journal of the in-memory variants.
#[derive(Debug, Default)]
pub struct NoJournal;

impl Journal for NoJournal {}

struct BufferState<J> {
    header: Option<Header>,
    samples: SampleWindow,
    events: EventWindow<Event>,
    journal: J,
    closed: bool,
}

impl<J> BufferState<J> {
    fn counts(&self) -> BufferCounts {
        BufferCounts::new(self.samples.total(), self.events.total())
    }

    /// Header for a put. Puts are refused once the store is cleaned up.
    fn writable_header(&self) -> AppResult<&Header> {
        if self.closed {
            return Err(BufferError::Persistence("buffer has been cleaned up".into()));
        }
        self.readable_header()
    }

    fn readable_header(&self) -> AppResult<&Header> {
        self.header.as_ref().ok_or(BufferError::NoHeader)
    }
}

/// Locked buffer shared by all three retention policies.
///
/// `J` decides what happens to data beyond the in-memory window; see
/// [`crate::data::memory`] and [`crate::data::saving`].
pub struct BufferStore<J> {
    state: RwLock<BufferState<J>>,
    counts: watch::Sender<BufferCounts>,
    kind: &'static str,
}

impl<J: Journal> BufferStore<J> {
    pub(crate) fn with_journal(
        sample_capacity: Option<u64>,
        event_capacity: Option<usize>,
        journal: J,
        kind: &'static str,
    ) -> Self {
        let (counts, _) = watch::channel(BufferCounts::default());
        Self {
            state: RwLock::new(BufferState {
                header: None,
                samples: SampleWindow::new(sample_capacity),
                events: EventWindow::new(event_capacity),
                journal,
                closed: false,
            }),
            counts,
            kind,
        }
    }

    // Called with the write lock held so subscribers see totals in order.
    fn publish(&self, counts: BufferCounts) {
        self.counts.send_replace(counts);
    }

    /// An explicit range must be non-empty and end at or before `total`.
    /// `None` selects the resident window, which may be empty.
    fn resolve(range: Option<Range<u64>>, first: u64, total: u64) -> AppResult<Range<u64>> {
        match range {
            None => Ok(first..total),
            Some(range) if range.start >= range.end || range.end > total => {
                Err(BufferError::range(range.start, range.end, first, total))
            }
            Some(range) => Ok(range),
        }
    }
}

impl<J: Journal> DataStore for BufferStore<J> {
    fn put_header(&self, header: Header) -> AppResult<()> {
        header.validate()?;
        let mut state = self.state.write();
        if state.closed {
            return Err(BufferError::Persistence("buffer has been cleaned up".into()));
        }
        state.journal.header(&header)?;
        state.samples.reset(header.sample_bytes());
        state.events.clear();
        state.header = Some(header);
        self.publish(state.counts());
        Ok(())
    }

    fn header(&self) -> Option<HeaderSnapshot> {
        let state = self.state.read();
        state.header.as_ref().map(|header| HeaderSnapshot {
            header: header.clone(),
            counts: state.counts(),
        })
    }

    fn put_data(&self, block: SampleBlock) -> AppResult<BufferCounts> {
        let mut state = self.state.write();
        let header = state.writable_header()?;
        block.check_shape(header)?;
        let block = block.into_order(header.byte_order);
        if block.nsamples == 0 {
            return Ok(state.counts());
        }

        let first = state.samples.total();
        state.journal.samples(first, &block.data)?;
        state.samples.append(&block.data);
        let counts = state.counts();
        self.publish(counts);
        Ok(counts)
    }

    fn get_data(&self, range: Option<Range<u64>>) -> AppResult<SampleBlock> {
        let state = self.state.read();
        let header = state.readable_header()?;
        let (first, total) = (state.samples.first(), state.samples.total());
        let range = Self::resolve(range, first, total)?;
        let nsamples = u32::try_from(range.end - range.start)
            .map_err(|_| BufferError::range(range.start, range.end, first, total))?;

        let data = match state.samples.read(range.clone()) {
            Some(data) => data,
            None => match state.journal.read_samples(range.clone()) {
                Some(read) => read?,
                None => return Err(BufferError::range(range.start, range.end, first, total)),
            },
        };

        Ok(SampleBlock::new(
            header.nchans,
            nsamples,
            header.data_type,
            header.byte_order,
            data,
        ))
    }

    fn put_events(&self, events: Vec<Event>) -> AppResult<BufferCounts> {
        let mut state = self.state.write();
        let order = state.writable_header()?.byte_order;
        for event in &events {
            event.validate()?;
        }
        let events: Vec<Event> = events.into_iter().map(|e| e.into_order(order)).collect();
        if events.is_empty() {
            return Ok(state.counts());
        }

        let first = state.events.total();
        state.journal.events(first, &events)?;
        for event in events {
            state.events.push(event);
        }
        let counts = state.counts();
        self.publish(counts);
        Ok(counts)
    }

    fn get_events(&self, range: Option<Range<u64>>) -> AppResult<Vec<Event>> {
        let state = self.state.read();
        state.readable_header()?;
        let (first, total) = (state.events.first(), state.events.total());
        let range = Self::resolve(range, first, total)?;

        match state.events.read(range.clone()) {
            Some(events) => Ok(events),
            None => match state.journal.read_events(range.clone()) {
                Some(read) => read,
                None => Err(BufferError::range(range.start, range.end, first, total)),
            },
        }
    }

    fn flush_header(&self) -> AppResult<()> {
        let mut state = self.state.write();
        state.journal.flush_header()?;
        state.header = None;
        state.samples.reset(0);
        state.events.clear();
        self.publish(state.counts());
        Ok(())
    }

    fn flush_data(&self) -> AppResult<()> {
        let mut state = self.state.write();
        state.journal.flush_samples()?;
        state.samples.clear();
        self.publish(state.counts());
        Ok(())
    }

    fn flush_events(&self) -> AppResult<()> {
        let mut state = self.state.write();
        state.journal.flush_events()?;
        state.events.clear();
        self.publish(state.counts());
        Ok(())
    }

    fn counts(&self) -> BufferCounts {
        self.state.read().counts()
    }

    fn subscribe(&self) -> watch::Receiver<BufferCounts> {
        self.counts.subscribe()
    }

    fn cleanup(&self) {
        let mut state = self.state.write();
        if !state.closed {
            state.journal.close();
            state.closed = true;
            tracing::info!(kind = self.kind, "buffer store cleaned up");
        }
    }

    fn kind(&self) -> &'static str {
        self.kind
    }

    fn blocking_io(&self) -> bool {
        J::BLOCKING_IO
    }
}

/// Retention policy chosen once at startup.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreKind {
    /// Keeps everything in memory.
    Simple,
    /// Keeps the newest `samples` samples and `events` events in memory.
    Ring { samples: u64, events: usize },
    /// Like `Ring`, mirroring every put to segment files under `path`.
    Saving {
        samples: u64,
        events: usize,
        path: PathBuf,
    },
}

/// Builds the store for `kind`.
pub fn build_store(kind: &StoreKind) -> AppResult<Arc<dyn DataStore>> {
    use crate::data::memory::MemoryStore;
    use crate::data::saving::SavingStore;

    let store: Arc<dyn DataStore> = match kind {
        StoreKind::Simple => Arc::new(MemoryStore::unbounded()),
        StoreKind::Ring { samples, events } => Arc::new(MemoryStore::ring(*samples, *events)?),
        StoreKind::Saving {
            samples,
            events,
            path,
        } => Arc::new(SavingStore::create(path, *samples, *events)?),
    };
    tracing::info!(kind = store.kind(), "buffer store ready");
    Ok(store)
}

/// Owns the process-wide store and releases it on every exit path.
///
/// Dropping the guard, whether on normal return, `?` propagation or panic
/// unwinding, runs [`DataStore::cleanup`].
pub struct StoreGuard {
    store: Arc<dyn DataStore>,
}

impl StoreGuard {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> Arc<dyn DataStore> {
        Arc::clone(&self.store)
    }
}

impl Drop for StoreGuard {
    fn drop(&mut self) {
        self.store.cleanup();
    }
}

/// Minimum totals a blocked reader is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitThreshold {
    pub samples: u64,
    pub events: u64,
    pub timeout: Duration,
}

impl WaitThreshold {
    pub fn is_met(&self, counts: &BufferCounts) -> bool {
        counts.samples >= self.samples || counts.events >= self.events
    }
}

/// Waits until either total reaches the threshold or the timeout elapses.
///
/// Returns the totals observed when the wait ended. Only the watch channel is
/// awaited, so no store lock is held while suspended.
pub async fn wait_for_counts(
    mut counts: watch::Receiver<BufferCounts>,
    threshold: WaitThreshold,
) -> BufferCounts {
    let reached = tokio::time::timeout(
        threshold.timeout,
        counts.wait_for(|c| threshold.is_met(c)),
    )
    .await
    .ok()
    .and_then(|r| r.ok())
    .map(|c| *c);
    reached.unwrap_or_else(|| *counts.borrow())
}
