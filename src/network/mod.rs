//! TCP front end: wire protocol, per-client handlers and the server lifecycle.
pub mod connection;
pub mod protocol;
pub mod registry;
pub mod server;

pub use connection::{CloseReason, ConnectionHandler};
pub use protocol::{Request, RequestType, Response};
pub use registry::{ConnectionInfo, ConnectionRegistry};
pub use server::{BufferServer, ServerOptions, ServerState};
