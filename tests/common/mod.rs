//! Minimal protocol client shared by the integration tests.
#![allow(dead_code)]

use daq_buffer::data::{BufferCounts, ByteOrder, WaitThreshold};
use daq_buffer::network::protocol::{MessageDef, Request, Response, MESSAGE_DEF_SIZE};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use daq_buffer::data::MemoryStore;
use daq_buffer::monitor::{NullMonitor, SharedMonitor};
use daq_buffer::{BufferServer, DataStore, ServerOptions};

pub struct TestClient {
    stream: TcpStream,
    order: ByteOrder,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        Self::connect_with_order(addr, ByteOrder::native()).await
    }

    pub async fn connect_with_order(addr: SocketAddr, order: ByteOrder) -> Self {
        let stream = TcpStream::connect(addr).await.expect("Failed to connect");
        Self { stream, order }
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("Failed to write");
    }

    pub async fn request(&mut self, request: Request) -> Response {
        let message = request.encode(self.order);
        self.send_raw(&message).await;
        self.read_response(&request).await
    }

    pub async fn read_response(&mut self, request: &Request) -> Response {
        let mut raw = [0u8; MESSAGE_DEF_SIZE];
        self.stream
            .read_exact(&mut raw)
            .await
            .expect("Failed to read reply definition");
        let def = MessageDef::parse(raw).expect("Invalid reply definition");
        assert_eq!(def.order, self.order, "reply must mirror request byte order");
        let mut payload = vec![0u8; def.bufsize as usize];
        self.stream
            .read_exact(&mut payload)
            .await
            .expect("Failed to read reply payload");
        Response::decode(request.request_type(), def.command, def.order, &payload)
            .expect("Failed to decode reply")
    }

    pub async fn wait(&mut self, samples: u64, events: u64, timeout: Duration) -> BufferCounts {
        let reply = self
            .request(Request::Wait(WaitThreshold {
                samples,
                events,
                timeout,
            }))
            .await;
        match reply {
            Response::WaitOk(counts) => counts,
            other => panic!("unexpected wait reply: {other:?}"),
        }
    }

    /// True once the server has closed this connection.
    pub async fn is_closed(&mut self) -> bool {
        let mut byte = [0u8; 1];
        matches!(
            tokio::time::timeout(Duration::from_secs(2), self.stream.read(&mut byte)).await,
            Ok(Ok(0)) | Ok(Err(_))
        )
    }
}

/// Starts a server on an ephemeral localhost port.
pub async fn start_server(store: Arc<dyn DataStore>) -> (BufferServer, SocketAddr) {
    let server = BufferServer::new(
        SocketAddr::from(([127, 0, 0, 1], 0)),
        store,
        SharedMonitor::new(Arc::new(NullMonitor)),
        ServerOptions {
            max_message_bytes: 1 << 20,
            shutdown_timeout: Duration::from_secs(2),
        },
    );
    let addr = server.bind().await.expect("Failed to bind");
    server.spawn();
    (server, addr)
}

pub async fn start_memory_server() -> (BufferServer, SocketAddr) {
    start_server(Arc::new(MemoryStore::unbounded())).await
}
