//! In-memory store variants: unbounded and ring-bounded.

use crate::data::store::{BufferStore, NoJournal};
use crate::error::{AppResult, BufferError};

/// Store whose data lives only in memory.
pub type MemoryStore = BufferStore<NoJournal>;

impl BufferStore<NoJournal> {
    /// Never evicts; suitable for short sessions.
    pub fn unbounded() -> Self {
        Self::with_journal(None, None, NoJournal, "simple")
    }

    /// Keeps the newest `samples` samples and `events` events; older data is lost.
    pub fn ring(samples: u64, events: usize) -> AppResult<Self> {
        if samples == 0 || events == 0 {
            return Err(BufferError::Config(format!(
                "ring capacities must be positive (samples={samples}, events={events})"
            )));
        }
        Ok(Self::with_journal(
            Some(samples),
            Some(events),
            NoJournal,
            "ring",
        ))
    }
}
