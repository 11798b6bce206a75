//! Per-client request loop.

use crate::data::store::{wait_for_counts, DataStore, WaitThreshold};
use crate::data::types::BufferCounts;
use crate::error::{AppResult, BufferError};
use crate::monitor::{ClientId, SharedMonitor};
use crate::network::protocol::{read_frame, write_message, Request, RequestType, Response};
use crate::network::registry::ConnectionRegistry;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Why a connection loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed the socket between requests.
    PeerClosed,
    /// The server asked this handler to disconnect.
    Disconnected,
    /// Unparseable request or transport failure.
    Failed,
}

/// Serves one client until it leaves, misbehaves, or is told to disconnect.
pub struct ConnectionHandler<S> {
    id: ClientId,
    addr: SocketAddr,
    stream: S,
    store: Arc<dyn DataStore>,
    counts: watch::Receiver<BufferCounts>,
    monitor: SharedMonitor,
    registry: ConnectionRegistry,
    disconnect: watch::Receiver<bool>,
    max_message_bytes: usize,
    // Totals last reported to this client by a read or wait.
    cursor: BufferCounts,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: ClientId,
        addr: SocketAddr,
        stream: S,
        store: Arc<dyn DataStore>,
        monitor: SharedMonitor,
        registry: ConnectionRegistry,
        disconnect: watch::Receiver<bool>,
        max_message_bytes: usize,
    ) -> Self {
        Self {
            id,
            addr,
            stream,
            counts: store.subscribe(),
            store,
            monitor,
            registry,
            disconnect,
            max_message_bytes,
            cursor: BufferCounts::default(),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Runs the request loop, then removes the connection and reports the close.
    pub async fn run(mut self) -> CloseReason {
        let (id, addr) = (self.id, self.addr);
        self.monitor
            .notify(|m, t| m.client_connected(id, addr, t));

        let reason = match self.serve().await {
            Ok(reason) => reason,
            Err(e) => {
                warn!(client = id, %addr, error = %e, "closing connection");
                let message = e.to_string();
                self.monitor.notify(|m, t| m.client_error(id, &message, t));
                CloseReason::Failed
            }
        };

        self.registry.remove(id).await;
        debug!(
            client = id,
            ?reason,
            samples_seen = self.cursor.samples,
            events_seen = self.cursor.events,
            "connection finished"
        );
        self.monitor.notify(|m, t| m.client_closed(id, t));
        reason
    }

    async fn serve(&mut self) -> AppResult<CloseReason> {
        loop {
            if *self.disconnect.borrow() {
                return Ok(CloseReason::Disconnected);
            }

            let frame = tokio::select! {
                _ = disconnected(&mut self.disconnect) => return Ok(CloseReason::Disconnected),
                frame = read_frame(&mut self.stream, self.max_message_bytes) => frame?,
            };
            let Some(frame) = frame else {
                return Ok(CloseReason::PeerClosed);
            };

            let order = frame.def.order;
            let kind = RequestType::from_u16(frame.def.command).ok_or_else(|| {
                BufferError::Protocol(format!("unknown command 0x{:03x}", frame.def.command))
            })?;

            let result = match Request::decode(kind, order, &frame.payload) {
                Ok(Request::Wait(threshold)) => match self.wait(threshold).await {
                    Some(response) => Ok(response),
                    None => return Ok(CloseReason::Disconnected),
                },
                Ok(request) => self.dispatch(request).await,
                Err(e) => Err(e),
            };
            let response = self.recover(kind, result)?;
            self.advance_cursor(&response).await;

            write_message(&mut self.stream, &response.encode(order)).await?;
        }
    }

    /// Turns store-level failures into an error reply; anything else ends the connection.
    fn recover(&self, kind: RequestType, result: AppResult<Response>) -> AppResult<Response> {
        match result {
            Ok(response) => Ok(response),
            Err(e) if e.is_recoverable() => {
                debug!(client = self.id, request = ?kind, error = %e, "request rejected");
                Ok(Response::Error(kind))
            }
            Err(e) => Err(e),
        }
    }

    /// Runs a store request, on the blocking pool when the store does file I/O.
    fn dispatch(&self, request: Request) -> impl Future<Output = AppResult<Response>> + Send {
        let (id, store, monitor) = (self.id, Arc::clone(&self.store), self.monitor.clone());
        async move {
            if !store.blocking_io() {
                return execute(id, &*store, &monitor, request);
            }
            tokio::task::spawn_blocking(move || execute(id, &*store, &monitor, request))
                .await
                .unwrap_or_else(|e| {
                    Err(BufferError::Persistence(format!("store task failed: {e}")))
                })
        }
    }

    /// Remembers the totals a read or wait reported and publishes them.
    async fn advance_cursor(&mut self, response: &Response) {
        let seen = match response {
            Response::Header(snapshot) => snapshot.counts,
            Response::Data(_) | Response::Events(_) => *self.counts.borrow(),
            Response::WaitOk(counts) => *counts,
            _ => return,
        };
        self.cursor = seen;
        self.registry.record_seen(self.id, seen).await;
    }

    /// Blocks until the threshold, the timeout, or a disconnect. `None` means disconnect.
    async fn wait(&mut self, threshold: WaitThreshold) -> Option<Response> {
        let id = self.id;
        let timeout_ms = threshold.timeout.as_millis() as u64;
        self.monitor.notify(|m, t| {
            m.client_waits(threshold.samples, threshold.events, timeout_ms, id, t)
        });

        let counts = tokio::select! {
            counts = wait_for_counts(self.counts.clone(), threshold) => counts,
            _ = disconnected(&mut self.disconnect) => return None,
        };
        Some(Response::WaitOk(counts))
    }
}

/// Applies one non-waiting request to the store and reports it to the monitor.
fn execute(
    id: ClientId,
    store: &dyn DataStore,
    monitor: &SharedMonitor,
    request: Request,
) -> AppResult<Response> {
    match request {
        Request::PutHeader(header) => {
            let (data_type, fsample, nchans) = (header.data_type, header.fsample, header.nchans);
            store.put_header(header)?;
            monitor.notify(|m, t| m.client_put_header(data_type, fsample, nchans, id, t));
            Ok(Response::PutOk(BufferCounts::default()))
        }
        Request::PutData(block) => {
            let counts = store.put_data(block)?;
            monitor.notify(|m, t| m.client_put_samples(counts.samples, id, t));
            Ok(Response::PutOk(counts))
        }
        Request::PutEvents(events) => {
            let counts = store.put_events(events)?;
            monitor.notify(|m, t| m.client_put_events(counts.events, id, t));
            Ok(Response::PutOk(counts))
        }
        Request::GetHeader => {
            let snapshot = store.header().ok_or(BufferError::NoHeader)?;
            monitor.notify(|m, t| m.client_get_header(id, t));
            Ok(Response::Header(snapshot))
        }
        Request::GetData(range) => {
            let block = store.get_data(range)?;
            let count = block.nsamples;
            monitor.notify(|m, t| m.client_get_samples(count, id, t));
            Ok(Response::Data(block))
        }
        Request::GetEvents(range) => {
            let events = store.get_events(range)?;
            let count = events.len();
            monitor.notify(|m, t| m.client_get_events(count, id, t));
            Ok(Response::Events(events))
        }
        Request::FlushHeader => {
            store.flush_header()?;
            monitor.notify(|m, t| m.client_flushed_header(id, t));
            Ok(Response::FlushOk)
        }
        Request::FlushData => {
            store.flush_data()?;
            monitor.notify(|m, t| m.client_flushed_data(id, t));
            Ok(Response::FlushOk)
        }
        Request::FlushEvents => {
            store.flush_events()?;
            monitor.notify(|m, t| m.client_flushed_events(id, t));
            Ok(Response::FlushOk)
        }
        Request::Wait(_) => Err(BufferError::Protocol(
            "wait must be dispatched asynchronously".into(),
        )),
    }
}

/// Resolves once the server requests a disconnect or the registry entry is gone.
async fn disconnected(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|requested| *requested).await;
}
