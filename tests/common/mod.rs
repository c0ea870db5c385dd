//! Shared test utilities: local mock servers and worker round trips.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use chartfeed::config::{AlpacaConfig, FinnhubConfig};
use chartfeed::figi::StaticResolver;
use chartfeed::models::AssetData;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tungstenite::Message;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Serves `router` on an ephemeral local port and returns its base URL.
pub async fn spawn_http(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind mock HTTP server");
    let addr = listener.local_addr().expect("Failed to read local address");
    tokio::spawn(async move {
        axum::serve(listener, router)
            .await
            .expect("Mock HTTP server failed");
    });
    format!("http://{addr}")
}

/// Accepts one WebSocket client and hands the stream to `script`.
/// Returns the `ws://` base URL.
pub async fn spawn_ws<F, Fut>(script: F) -> String
where
    F: FnOnce(WebSocketStream<tokio::net::TcpStream>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind mock WebSocket server");
    let addr = listener.local_addr().expect("Failed to read local address");
    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.expect("Failed to accept client");
        let ws = tokio_tungstenite::accept_async(tcp)
            .await
            .expect("WebSocket upgrade failed");
        script(ws).await;
    });
    format!("ws://{addr}")
}

/// Next text frame sent by the client, parsed as JSON.
pub async fn next_json(ws: &mut WebSocketStream<tokio::net::TcpStream>) -> serde_json::Value {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(text.as_str()).expect("Client sent invalid JSON");
            }
            Some(Ok(_)) => {}
            other => panic!("Client stream ended: {other:?}"),
        }
    }
}

pub async fn send_text(ws: &mut WebSocketStream<tokio::net::TcpStream>, text: &str) {
    ws.send(Message::Text(text.to_string().into()))
        .await
        .expect("Failed to send frame");
}

pub fn alpaca_config(http: &str, ws: &str) -> AlpacaConfig {
    AlpacaConfig {
        api_key: "test-key".to_string(),
        api_secret: "test-secret".to_string(),
        trading_url: http.to_string(),
        paper_url: format!("{http}/paper"),
        data_url: http.to_string(),
        websocket_url: ws.to_string(),
    }
}

pub fn finnhub_config(http: &str, ws: &str) -> FinnhubConfig {
    FinnhubConfig {
        api_key: "test-token".to_string(),
        rest_url: http.to_string(),
        websocket_url: ws.to_string(),
        requests_per_second: 30,
    }
}

pub fn resolver() -> Arc<StaticResolver> {
    Arc::new(StaticResolver::new(vec![AssetData::new(
        "AAPL",
        "APPLE INC",
        "XNAS",
        "USD",
        "BBG000B9XRY4",
        true,
    )]))
}

pub fn apple() -> AssetData {
    AssetData::new("AAPL", "Apple Inc.", "XNAS", "USD", "BBG000B9XRY4", true)
}

/// Runs a worker over a single request and returns its single response.
/// The worker must stop once the request channel closes.
pub async fn round_trip<Req, Resp, W, Fut>(worker: W, request: Req) -> Resp
where
    W: FnOnce(mpsc::Receiver<Req>, mpsc::Sender<Resp>) -> Fut,
    Fut: Future<Output = ()>,
{
    let (req_tx, req_rx) = mpsc::channel(1);
    let (resp_tx, mut resp_rx) = mpsc::channel(1);
    req_tx.send(request).await.expect("Failed to queue request");
    drop(req_tx);

    tokio::time::timeout(TEST_TIMEOUT, worker(req_rx, resp_tx))
        .await
        .expect("Worker did not stop");
    let response = resp_rx.recv().await.expect("Worker sent no response");
    assert!(resp_rx.recv().await.is_none(), "Worker sent more than one response");
    response
}
