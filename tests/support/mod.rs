#![allow(dead_code)]
//! Shared helpers for the integration test binaries: a plain `mod.rs` that
//! isn't itself compiled as a test binary.

use std::net::TcpListener as StdTcpListener;
use std::time::Duration;

use h2flow::client::Http2Connection;
use h2flow::{Http2Client, ResponseTimeoutHook};

/// Reserves an ephemeral localhost port by binding and immediately dropping
/// a std listener, so each test gets its own address without hardcoding one.
pub fn free_port() -> u16 {
    StdTcpListener::bind("127.0.0.1:0")
        .expect("failed to reserve an ephemeral port")
        .local_addr()
        .expect("failed to read local address")
        .port()
}

/// Polls `client.is_connected()` until it reports `OPEN` or `timeout` elapses.
pub async fn wait_connected<H: ResponseTimeoutHook>(client: &Http2Client<H>, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if client.is_connected() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    client.is_connected()
}

/// Same idea, for a bare [`Http2Connection`] (used by the dedicated client
/// connection tests).
pub fn wait_connection(conn: &Http2Connection, timeout: Duration) -> bool {
    conn.wait_to_be_connected(timeout)
}
