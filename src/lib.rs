//! # DAQ Buffer
//!
//! A network-accessible acquisition buffer. Producer clients stream sample
//! blocks and events into it; consumer clients read the same stream
//! concurrently, optionally blocking until new data arrives.
//!
//! ## Crate Structure
//!
//! - **`data`**: the header/sample/event model and the `DataStore` implementations
//!   (unbounded, ring-bounded, and ring-bounded with segment-file persistence).
//! - **`network`**: the binary wire protocol, one `ConnectionHandler` per client,
//!   and the `BufferServer` that owns the listening socket.
//! - **`monitor`**: the swappable activity sink the server and handlers report to.
//! - **`config`**: layered configuration (defaults, TOML, environment, CLI).
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`shutdown`**: Ctrl-C and `SIGTERM` handling for the binary.
//! - **`error`**: the `BufferError` taxonomy shared by every layer.
//!
//! ```no_run
//! use daq_buffer::{build_store, BufferConfig, BufferServer, ConfigOverrides, StoreGuard};
//!
//! # async fn demo() -> daq_buffer::AppResult<()> {
//! let config = BufferConfig::load(None, &ConfigOverrides::default())?;
//! let guard = StoreGuard::new(build_store(&config.store_kind())?);
//! let server = BufferServer::from_config(&config, guard.store())?;
//! server.run().await
//! # }
//! ```

pub mod config;
pub mod data;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod network;
pub mod shutdown;

pub use config::{BufferConfig, ConfigOverrides};
pub use data::{build_store, DataStore, StoreGuard, StoreKind};
pub use error::{AppResult, BufferError};
pub use monitor::{BufferMonitor, ClientId, LoggingMonitor, SharedMonitor, SERVER_CLIENT_ID};
pub use network::{BufferServer, ServerOptions, ServerState};
pub use shutdown::ShutdownSignal;
