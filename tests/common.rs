//! Common test utilities.
//!
//! Shared helpers for integration tests. Import with `mod common;`.

#![allow(dead_code)]

use bytes::BytesMut;
use std::io::Write;
use std::net::SocketAddr;
use strata::core::config::Config;
use strata::core::runtime::Runtime;
use strata::protocol::{Operation, PacketBuffer, Status, PROTOCOL_VERSION};
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Password used by test fixtures.
pub const PASSWORD: &str = "test-secret";

/// Start a standalone runtime on an ephemeral port.
pub async fn start_standalone() -> Runtime {
    start_standalone_with_sweep(0).await
}

/// Start a standalone runtime with a sweep interval.
pub async fn start_standalone_with_sweep(expire_check_interval: u64) -> Runtime {
    let config = Config::from_toml(&format!(
        r#"
ip = "127.0.0.1"
port = 0
password = "{PASSWORD}"
expire_check_interval = {expire_check_interval}
"#
    ))
    .expect("valid test config");

    let mut runtime = Runtime::new(config).expect("runtime");
    runtime.start().await.expect("start");
    runtime
}

/// Write a config to a temp file for `Config::from_file` tests.
pub fn write_config_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("failed to create temp file");
    file.write_all(content.as_bytes())
        .expect("failed to write config");
    file
}

/// Pick a free TCP port.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .expect("bind")
        .local_addr()
        .expect("local addr")
        .port()
}

/// A raw wire-protocol client.
pub struct TestClient {
    stream: TcpStream,
    next_request_id: u32,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        Self {
            stream,
            next_request_id: 1,
        }
    }

    /// Connect and authenticate with the fixture password.
    pub async fn connect_and_login(addr: SocketAddr) -> Self {
        let mut client = Self::connect(addr).await;
        assert!(client.login(PASSWORD).await);
        client
    }

    /// Read one whole frame off the socket.
    pub async fn read_frame(&mut self) -> PacketBuffer {
        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header).await.expect("frame header");
        let len = u32::from_be_bytes(header) as usize;
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).await.expect("frame payload");
        PacketBuffer::from_payload(BytesMut::from(&payload[..]))
    }

    /// Send raw bytes (for malformed-frame tests).
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("send raw");
    }

    /// True once the server has closed this connection.
    pub async fn is_closed(&mut self) -> bool {
        let mut probe = [0u8; 1];
        matches!(self.stream.read(&mut probe).await, Ok(0) | Err(_))
    }

    /// Send a request and return its response, positioned after the
    /// request id (the next byte is the status).
    pub async fn request(
        &mut self,
        op: Operation,
        build: impl FnOnce(&mut PacketBuffer),
    ) -> PacketBuffer {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let mut frame = PacketBuffer::request(op, request_id);
        build(&mut frame);
        frame.finalize();
        self.stream.write_all(frame.frame()).await.expect("send");

        let mut response = self.read_frame().await;
        assert_eq!(response.read_u8().expect("op"), op as u8);
        assert_eq!(response.read_u32().expect("request id"), request_id);
        response
    }

    /// Send a request, asserting an `Ok` status; returns the body.
    pub async fn request_ok(
        &mut self,
        op: Operation,
        build: impl FnOnce(&mut PacketBuffer),
    ) -> PacketBuffer {
        let mut response = self.request(op, build).await;
        assert_eq!(response.read_u8().expect("status"), Status::Ok as u8);
        response
    }

    /// Send a request, asserting an `Error` status; returns the message.
    pub async fn request_err(
        &mut self,
        op: Operation,
        build: impl FnOnce(&mut PacketBuffer),
    ) -> String {
        let mut response = self.request(op, build).await;
        assert_eq!(response.read_u8().expect("status"), Status::Error as u8);
        response.read_string().expect("error message")
    }

    /// Log in; returns the authenticated flag.
    pub async fn login(&mut self, password: &str) -> bool {
        let mut response = self
            .request_ok(Operation::Login, |frame| {
                frame.write_u8(PROTOCOL_VERSION);
                frame.write_string(password);
            })
            .await;
        response.read_bool().expect("authenticated flag")
    }

    pub async fn set_string(&mut self, key: &str, value: &str, ttl_ms: u64) {
        self.request_ok(Operation::SetString, |frame| {
            frame.write_string(key);
            frame.write_opt_string(Some(value));
            frame.write_var_uint(ttl_ms);
        })
        .await;
    }

    pub async fn get_string(&mut self, key: &str) -> Option<String> {
        let mut response = self
            .request_ok(Operation::GetString, |frame| {
                frame.write_string(key);
            })
            .await;
        response.read_opt_string().expect("string body")
    }
}
