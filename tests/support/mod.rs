#![allow(dead_code)]

use std::net::TcpListener;
use std::time::Duration;

use homeport::ui::{UiEvent, UiEvents};

/// A port that was free a moment ago on all interfaces.
pub fn free_port() -> u16 {
    TcpListener::bind("0.0.0.0:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

/// Client for the export listener; its certificate is self-signed.
pub fn https_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .danger_accept_invalid_certs(true)
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

/// Next UI event. Generous timeout: the first export start generates an RSA key.
pub async fn next_event(events: &mut UiEvents) -> UiEvent {
    tokio::time::timeout(Duration::from_secs(30), events.recv())
        .await
        .expect("timed out waiting for UI event")
        .expect("UI channel closed")
}
