//! Shared helpers for the integration suites.
#![allow(dead_code)]

use std::time::Duration;

/// Polls `condition` until it holds or the suite-wide deadline passes.
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A localhost port with nothing listening on it.
pub async fn dead_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind probe listener");
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}
