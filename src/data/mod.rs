//! Buffer data model and store implementations.
//!
//! - **`types`**: header, sample block and event records.
//! - **`codec`**: byte-order aware layouts shared by the wire protocol and the journal.
//! - **`window`**: index-preserving sample and event windows.
//! - **`store`**: the `DataStore` interface, the locked `BufferStore`, and store selection.
//! - **`memory`**: unbounded and ring-bounded in-memory variants.
//! - **`saving`**: ring variant with segment-file persistence.
pub mod codec;
pub mod memory;
pub mod saving;
pub mod store;
pub mod types;
pub mod window;

pub use memory::MemoryStore;
pub use saving::SavingStore;
pub use store::{
    build_store, wait_for_counts, DataStore, StoreGuard, StoreKind, WaitThreshold,
};
pub use types::{
    BufferCounts, ByteOrder, DataType, Event, EventField, Header, HeaderSnapshot, SampleBlock,
};
