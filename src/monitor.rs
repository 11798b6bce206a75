//! Observability hooks for buffer activity.
//!
//! The server and every connection handler report through one
//! [`SharedMonitor`]. Swapping the monitor replaces a single `Arc` inside it,
//! so every holder sees the new sink on its next callback.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::data::types::DataType;

/// Identifier of a connected client. Never reused within a process.
pub type ClientId = i32;

/// Client id reported for operations the server performs itself.
pub const SERVER_CLIENT_ID: ClientId = -1;

/// Receiver of buffer activity notifications.
///
/// Every method has an empty default so sinks implement only what they need.
/// Implementations must not block; they run on the data path.
#[allow(unused_variables)]
pub trait BufferMonitor: Send + Sync {
    fn client_connected(&self, client: ClientId, addr: SocketAddr, time: DateTime<Utc>) {}

    fn client_closed(&self, client: ClientId, time: DateTime<Utc>) {}

    fn client_error(&self, client: ClientId, error: &str, time: DateTime<Utc>) {}

    fn client_put_header(
        &self,
        data_type: DataType,
        fsample: f32,
        nchans: u32,
        client: ClientId,
        time: DateTime<Utc>,
    ) {
    }

    fn client_put_samples(&self, total: u64, client: ClientId, time: DateTime<Utc>) {}

    fn client_put_events(&self, total: u64, client: ClientId, time: DateTime<Utc>) {}

    fn client_get_header(&self, client: ClientId, time: DateTime<Utc>) {}

    fn client_get_samples(&self, count: u32, client: ClientId, time: DateTime<Utc>) {}

    fn client_get_events(&self, count: usize, client: ClientId, time: DateTime<Utc>) {}

    fn client_waits(
        &self,
        nsamples: u64,
        nevents: u64,
        timeout_ms: u64,
        client: ClientId,
        time: DateTime<Utc>,
    ) {
    }

    fn client_flushed_header(&self, client: ClientId, time: DateTime<Utc>) {}

    fn client_flushed_data(&self, client: ClientId, time: DateTime<Utc>) {}

    fn client_flushed_events(&self, client: ClientId, time: DateTime<Utc>) {}
}

/// Monitor that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMonitor;

impl BufferMonitor for NullMonitor {}

/// Default monitor: one tracing event per notification.
///
/// Verbosity 0 reports connections, headers and flushes; 1 adds puts;
/// 2 adds reads and waits.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingMonitor {
    verbosity: u8,
}

impl LoggingMonitor {
    pub fn new(verbosity: u8) -> Self {
        Self { verbosity }
    }
}

impl BufferMonitor for LoggingMonitor {
    fn client_connected(&self, client: ClientId, addr: SocketAddr, time: DateTime<Utc>) {
        info!(client, %addr, %time, "client connected");
    }

    fn client_closed(&self, client: ClientId, time: DateTime<Utc>) {
        info!(client, %time, "client closed");
    }

    fn client_error(&self, client: ClientId, error: &str, time: DateTime<Utc>) {
        warn!(client, error, %time, "client error");
    }

    fn client_put_header(
        &self,
        data_type: DataType,
        fsample: f32,
        nchans: u32,
        client: ClientId,
        time: DateTime<Utc>,
    ) {
        info!(client, nchans, fsample, %data_type, %time, "header put");
    }

    fn client_put_samples(&self, total: u64, client: ClientId, time: DateTime<Utc>) {
        if self.verbosity >= 1 {
            debug!(client, nsamples = total, %time, "samples put");
        }
    }

    fn client_put_events(&self, total: u64, client: ClientId, time: DateTime<Utc>) {
        if self.verbosity >= 1 {
            debug!(client, nevents = total, %time, "events put");
        }
    }

    fn client_get_header(&self, client: ClientId, time: DateTime<Utc>) {
        if self.verbosity >= 2 {
            debug!(client, %time, "header read");
        }
    }

    fn client_get_samples(&self, count: u32, client: ClientId, time: DateTime<Utc>) {
        if self.verbosity >= 2 {
            debug!(client, count, %time, "samples read");
        }
    }

    fn client_get_events(&self, count: usize, client: ClientId, time: DateTime<Utc>) {
        if self.verbosity >= 2 {
            debug!(client, count, %time, "events read");
        }
    }

    fn client_waits(
        &self,
        nsamples: u64,
        nevents: u64,
        timeout_ms: u64,
        client: ClientId,
        time: DateTime<Utc>,
    ) {
        if self.verbosity >= 2 {
            debug!(client, nsamples, nevents, timeout_ms, %time, "client waiting");
        }
    }

    fn client_flushed_header(&self, client: ClientId, time: DateTime<Utc>) {
        info!(client, %time, "header flushed");
    }

    fn client_flushed_data(&self, client: ClientId, time: DateTime<Utc>) {
        info!(client, %time, "samples flushed");
    }

    fn client_flushed_events(&self, client: ClientId, time: DateTime<Utc>) {
        info!(client, %time, "events flushed");
    }
}

/// Runtime-swappable handle to the active monitor.
#[derive(Clone)]
pub struct SharedMonitor {
    current: Arc<RwLock<Arc<dyn BufferMonitor>>>,
}

impl std::fmt::Debug for SharedMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMonitor").finish_non_exhaustive()
    }
}

impl Default for SharedMonitor {
    fn default() -> Self {
        Self::new(Arc::new(LoggingMonitor::default()))
    }
}

impl SharedMonitor {
    pub fn new(monitor: Arc<dyn BufferMonitor>) -> Self {
        Self {
            current: Arc::new(RwLock::new(monitor)),
        }
    }

    /// Replaces the active monitor for every holder of this handle.
    pub fn set(&self, monitor: Arc<dyn BufferMonitor>) {
        *self.current.write() = monitor;
    }

    pub fn current(&self) -> Arc<dyn BufferMonitor> {
        Arc::clone(&self.current.read())
    }

    /// Runs `notify` against the active monitor, swallowing any panic.
    pub fn notify(&self, notify: impl FnOnce(&dyn BufferMonitor, DateTime<Utc>)) {
        let monitor = self.current();
        let outcome = catch_unwind(AssertUnwindSafe(|| notify(monitor.as_ref(), Utc::now())));
        if outcome.is_err() {
            warn!("buffer monitor panicked; notification dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        headers: AtomicUsize,
    }

    impl BufferMonitor for Counting {
        fn client_put_header(&self, _: DataType, _: f32, _: u32, _: ClientId, _: DateTime<Utc>) {
            self.headers.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicking;

    impl BufferMonitor for Panicking {
        fn client_closed(&self, _: ClientId, _: DateTime<Utc>) {
            panic!("monitor failure");
        }
    }

    #[test]
    fn swap_is_visible_to_every_clone() {
        let shared = SharedMonitor::new(Arc::new(NullMonitor));
        let handler_copy = shared.clone();
        let counting = Arc::new(Counting::default());

        shared.set(counting.clone());
        handler_copy.notify(|m, t| m.client_put_header(DataType::Float32, 10.0, 1, 3, t));

        assert_eq!(counting.headers.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_monitor_is_contained() {
        let shared = SharedMonitor::new(Arc::new(Panicking));
        shared.notify(|m, t| m.client_closed(0, t));
        shared.notify(|m, t| m.client_closed(1, t));
    }

    #[test]
    #[tracing_test::traced_test]
    fn logging_monitor_reports_server_flushes() {
        let monitor = LoggingMonitor::new(0);
        monitor.client_flushed_events(SERVER_CLIENT_ID, Utc::now());
        assert!(logs_contain("events flushed"));
        assert!(logs_contain("client=-1"));
    }
}
