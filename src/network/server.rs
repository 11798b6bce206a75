//! Listening socket, accept loop and server lifecycle.

use crate::config::BufferConfig;
use crate::data::store::DataStore;
use crate::data::types::{ByteOrder, DataType, Header};
use crate::error::{AppResult, BufferError};
use crate::monitor::{BufferMonitor, LoggingMonitor, SharedMonitor, SERVER_CLIENT_ID};
use crate::network::connection::{CloseReason, ConnectionHandler};
use crate::network::registry::{ConnectionInfo, ConnectionRegistry};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Lifecycle of a [`BufferServer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Running,
    /// Stop requested; handlers are being disconnected.
    Stopping,
    Stopped,
}

/// Tunables that do not change while the server runs.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub max_message_bytes: usize,
    /// Upper bound on how long `stop` waits for handlers before aborting them.
    pub shutdown_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        let config = BufferConfig::default();
        Self {
            max_message_bytes: config.max_message_bytes,
            shutdown_timeout: config.shutdown_timeout(),
        }
    }
}

struct ServerInner {
    requested_addr: SocketAddr,
    store: Arc<dyn DataStore>,
    monitor: SharedMonitor,
    registry: ConnectionRegistry,
    next_client: AtomicI32,
    listener: Mutex<Option<TcpListener>>,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,
    state: watch::Sender<ServerState>,
    options: ServerOptions,
}

/// TCP front end of the buffer. Cheap to clone; clones share one server.
#[derive(Clone)]
pub struct BufferServer {
    inner: Arc<ServerInner>,
}

impl BufferServer {
    pub fn new(
        addr: SocketAddr,
        store: Arc<dyn DataStore>,
        monitor: SharedMonitor,
        options: ServerOptions,
    ) -> Self {
        let (state, _) = watch::channel(ServerState::Created);
        Self {
            inner: Arc::new(ServerInner {
                requested_addr: addr,
                store,
                monitor,
                registry: ConnectionRegistry::new(),
                next_client: AtomicI32::new(0),
                listener: Mutex::new(None),
                local_addr: parking_lot::Mutex::new(None),
                state,
                options,
            }),
        }
    }

    /// Server listening where `config` says, reporting through a [`LoggingMonitor`].
    pub fn from_config(config: &BufferConfig, store: Arc<dyn DataStore>) -> AppResult<Self> {
        let monitor = SharedMonitor::new(Arc::new(LoggingMonitor::new(config.monitor_verbosity)));
        let options = ServerOptions {
            max_message_bytes: config.max_message_bytes,
            shutdown_timeout: config.shutdown_timeout(),
        };
        Ok(Self::new(config.listen_addr()?, store, monitor, options))
    }

    pub fn state(&self) -> ServerState {
        *self.inner.state.borrow()
    }

    pub fn store(&self) -> Arc<dyn DataStore> {
        Arc::clone(&self.inner.store)
    }

    /// Address actually bound; `None` before [`bind`](Self::bind).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    /// Replaces the monitor for the server and every live connection.
    pub fn set_monitor(&self, monitor: Arc<dyn BufferMonitor>) {
        self.inner.monitor.set(monitor);
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.registry.count().await
    }

    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        self.inner.registry.snapshot().await
    }

    /// Binds the listening socket and moves to `Running`.
    ///
    /// Bind failures are returned as [`BufferError::Connection`].
    pub async fn bind(&self) -> AppResult<SocketAddr> {
        let mut slot = self.inner.listener.lock().await;
        if self.state() != ServerState::Created {
            return Err(BufferError::Config(format!(
                "cannot bind a server in state {:?}",
                self.state()
            )));
        }
        let listener = TcpListener::bind(self.inner.requested_addr).await?;
        self.start_listening(&mut slot, listener)
    }

    /// Moves `Created` to `Running` and parks the listener for `run`.
    ///
    /// A `stop` that arrived while the socket was being bound wins: the
    /// listener is dropped and the state is left alone.
    fn start_listening(
        &self,
        slot: &mut Option<TcpListener>,
        listener: TcpListener,
    ) -> AppResult<SocketAddr> {
        let addr = listener.local_addr()?;
        let started = self.inner.state.send_if_modified(|s| {
            if *s == ServerState::Created {
                *s = ServerState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(BufferError::Config(format!(
                "server stopped while binding {addr}"
            )));
        }
        *slot = Some(listener);
        *self.inner.local_addr.lock() = Some(addr);
        info!(%addr, store = self.inner.store.kind(), "buffer server listening");
        Ok(addr)
    }

    /// Accepts connections until [`stop`](Self::stop), then shuts down.
    ///
    /// Binds first if needed. Returns once the store has been cleaned up.
    pub async fn run(&self) -> AppResult<()> {
        if self.state() == ServerState::Created {
            if let Err(e) = self.bind().await {
                if self.stop_requested() {
                    return Ok(());
                }
                return Err(e);
            }
        }
        let Some(listener) = self.inner.listener.lock().await.take() else {
            // Stopped before the loop started; `stop` did the shutdown.
            if self.stop_requested() {
                return Ok(());
            }
            return Err(BufferError::Config("server is already running".into()));
        };

        let mut state = self.inner.state.subscribe();
        let mut handlers = JoinSet::new();

        while *state.borrow() == ServerState::Running {
            tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let id = self.inner.next_client.fetch_add(1, Ordering::SeqCst);
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(client = id, error = %e, "could not disable Nagle");
                        }
                        let disconnect = self.inner.registry.register(id, addr).await;
                        let handler = ConnectionHandler::new(
                            id,
                            addr,
                            stream,
                            Arc::clone(&self.inner.store),
                            self.inner.monitor.clone(),
                            self.inner.registry.clone(),
                            disconnect,
                            self.inner.options.max_message_bytes,
                        );
                        handlers.spawn(handler.run().instrument(info_span!("client", id)));
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "connection task failed");
                    }
                }
            }
        }

        drop(listener);
        self.finish(handlers).await;
        Ok(())
    }

    fn stop_requested(&self) -> bool {
        matches!(self.state(), ServerState::Stopping | ServerState::Stopped)
    }

    /// Runs the server on its own task.
    pub fn spawn(&self) -> tokio::task::JoinHandle<AppResult<()>> {
        let server = self.clone();
        tokio::spawn(async move { server.run().await })
    }

    /// Stops accepting, disconnects every client, and cleans up the store.
    ///
    /// Idempotent. Returns once the server has reached `Stopped`.
    pub async fn stop(&self) {
        let mut requested = false;
        self.inner.state.send_if_modified(|s| match s {
            ServerState::Created | ServerState::Running => {
                *s = ServerState::Stopping;
                requested = true;
                true
            }
            _ => false,
        });

        if requested {
            info!("buffer server stopping");
            // No accept loop ever took the listener; shut down from here.
            let idle = self.inner.listener.lock().await.take();
            let never_ran = idle.is_some() || self.local_addr().is_none();
            drop(idle);
            if never_ran {
                self.finish(JoinSet::new()).await;
            }
        }

        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|s| *s == ServerState::Stopped).await;
    }

    async fn finish(&self, mut handlers: JoinSet<CloseReason>) {
        let registry = &self.inner.registry;
        let asked = registry.disconnect_all().await;
        debug!(connections = asked, "disconnect requested");

        let timeout = self.inner.options.shutdown_timeout;
        let drained = tokio::time::timeout(timeout, async {
            while let Some(joined) = handlers.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "connection task failed");
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = handlers.len(),
                ?timeout,
                "connections did not close in time; aborting"
            );
            handlers.abort_all();
            while handlers.join_next().await.is_some() {}
            for info in registry.snapshot().await {
                registry.remove(info.id).await;
                self.inner
                    .monitor
                    .notify(|m, t| m.client_closed(info.id, t));
            }
        }

        self.inner.store.cleanup();
        self.inner.state.send_replace(ServerState::Stopped);
        info!("buffer server stopped");
    }

    /// Sets a header on behalf of the server, in native byte order.
    pub fn put_header(&self, nchans: u32, fsample: f32, data_type: DataType) -> AppResult<()> {
        self.inner
            .store
            .put_header(Header::new(nchans, fsample, data_type, ByteOrder::native()))?;
        self.inner.monitor.notify(|m, t| {
            m.client_put_header(data_type, fsample, nchans, SERVER_CLIENT_ID, t)
        });
        Ok(())
    }

    pub fn flush_header(&self) -> AppResult<()> {
        self.inner.store.flush_header()?;
        self.inner
            .monitor
            .notify(|m, t| m.client_flushed_header(SERVER_CLIENT_ID, t));
        Ok(())
    }

    pub fn flush_samples(&self) -> AppResult<()> {
        self.inner.store.flush_data()?;
        self.inner
            .monitor
            .notify(|m, t| m.client_flushed_data(SERVER_CLIENT_ID, t));
        Ok(())
    }

    pub fn flush_events(&self) -> AppResult<()> {
        self.inner.store.flush_events()?;
        self.inner
            .monitor
            .notify(|m, t| m.client_flushed_events(SERVER_CLIENT_ID, t));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::memory::MemoryStore;
    use crate::monitor::NullMonitor;

    fn server() -> BufferServer {
        BufferServer::new(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            Arc::new(MemoryStore::unbounded()),
            SharedMonitor::new(Arc::new(NullMonitor)),
            ServerOptions::default(),
        )
    }

    #[tokio::test]
    async fn stop_before_start_cleans_up() {
        let server = server();
        server.stop().await;
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(server.put_header(1, 10.0, DataType::Float32).is_err());
    }

    #[tokio::test]
    async fn bind_then_stop_without_run() {
        let server = server();
        let addr = server.bind().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.local_addr(), Some(addr));
        server.stop().await;
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let server = server();
        let task = server.spawn();
        while server.local_addr().is_none() {
            tokio::task::yield_now().await;
        }
        server.stop().await;
        server.stop().await;
        task.await.unwrap().unwrap();
        assert!(server.bind().await.is_err());
    }

    #[tokio::test]
    async fn stop_during_bind_is_not_overwritten() {
        let server = server();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        // Hold the listener slot the way an in-flight bind does.
        let mut slot = server.inner.listener.lock().await;
        let stopper = server.clone();
        let stop = tokio::spawn(async move { stopper.stop().await });
        let mut state = server.inner.state.subscribe();
        state
            .wait_for(|s| *s == ServerState::Stopping)
            .await
            .unwrap();

        assert!(server.start_listening(&mut slot, listener).is_err());
        assert!(slot.is_none());
        assert_eq!(server.state(), ServerState::Stopping);
        assert_eq!(server.local_addr(), None);
        drop(slot);

        stop.await.unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(server.run().await.is_ok());
    }

    #[tokio::test]
    async fn server_side_header_and_flushes() {
        let server = server();
        server.put_header(3, 1000.0, DataType::Int16).unwrap();
        let snapshot = server.store().header().unwrap();
        assert_eq!(snapshot.header.nchans, 3);
        assert_eq!(snapshot.header.byte_order, ByteOrder::native());

        server.flush_events().unwrap();
        server.flush_samples().unwrap();
        server.flush_header().unwrap();
        assert!(server.store().header().is_none());
    }
}
