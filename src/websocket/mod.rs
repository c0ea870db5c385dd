//! Realtime WebSocket transport.
//!
//! This module is organized by concern:
//! - [`connection`] - Connection state machine, subscription bookkeeping
//!   and the reader loop that feeds the fan-out maps
//!
//! The provider-specific parts (URL, handshake, control frames, record
//! decoding) are supplied through [`StreamProtocol`].

pub mod connection;

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use tungstenite::Message;

use crate::models::{DataKind, RealtimeRecord};
use crate::{ChartfeedError, Result};

pub use connection::{ConnectionState, RealtimeConnection};

/// Write half of a provider WebSocket connection.
pub type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Read half of a provider WebSocket connection.
pub type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// How long each handshake acknowledgement may take.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Provider-specific side of a realtime stream.
pub trait StreamProtocol: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Endpoint to dial, including any credentials carried in the URL.
    fn url(&self) -> String;

    /// Acknowledgement the server sends right after connecting, if any.
    fn connected_ack(&self) -> Option<&'static str> {
        None
    }

    /// Authentication frame to send once connected, if any.
    fn auth_frame(&self) -> Option<serde_json::Value> {
        None
    }

    /// Acknowledgement expected after the authentication frame, if any.
    fn authenticated_ack(&self) -> Option<&'static str> {
        None
    }

    /// Checks that `frame` is the acknowledgement `expected`.
    ///
    /// # Errors
    ///
    /// Returns [`ChartfeedError::Handshake`] for any other frame.
    fn verify_ack(&self, frame: &str, expected: &str) -> Result<()> {
        Err(ChartfeedError::Handshake(format!(
            "{} does not acknowledge {expected}, got {frame}",
            self.name()
        )))
    }

    /// Control frames that start delivery of `kind` for `symbol`.
    fn subscribe_frames(&self, symbol: &str, kind: DataKind) -> Vec<serde_json::Value>;

    /// Control frames that stop delivery of `kind` for `symbol`.
    fn unsubscribe_frames(&self, symbol: &str, kind: DataKind) -> Vec<serde_json::Value>;

    /// Decodes one inbound text frame into records. Control frames decode
    /// to an empty batch.
    ///
    /// # Errors
    ///
    /// Returns [`ChartfeedError::Json`] or
    /// [`ChartfeedError::MalformedMessage`] for frames that cannot be read.
    fn decode(&self, frame: &str) -> Result<Vec<RealtimeRecord>>;
}

/// Establishes a WebSocket connection to the given URL.
///
/// # Errors
///
/// Returns [`ChartfeedError::WebSocket`] if the connection or TLS handshake
/// fails.
pub async fn connect(url: &str) -> Result<(WsWriter, WsReader)> {
    let (ws_stream, _) = connect_async(url).await?;
    info!("WebSocket handshake completed");

    Ok(ws_stream.split())
}

/// Serializes `frame` and sends it as a text message.
///
/// # Errors
///
/// Returns [`ChartfeedError::Json`] if serialization fails or
/// [`ChartfeedError::WebSocket`] if sending fails.
pub async fn send_json<T: Serialize + ?Sized>(write: &mut WsWriter, frame: &T) -> Result<()> {
    let json = serde_json::to_string(frame)?;
    debug!(bytes = json.len(), "Sending frame");
    write.send(Message::Text(json.into())).await?;

    Ok(())
}

/// Waits for the next text frame, skipping ping/pong traffic.
///
/// # Errors
///
/// Returns [`ChartfeedError::Handshake`] if nothing arrives within the
/// handshake timeout or the server closes the stream, and
/// [`ChartfeedError::WebSocket`] on read errors.
pub async fn next_text_frame(read: &mut WsReader) -> Result<String> {
    tokio::time::timeout(HANDSHAKE_TIMEOUT, read_text(read))
        .await
        .map_err(|_| ChartfeedError::Handshake("timed out waiting for acknowledgement".into()))?
}

async fn read_text(read: &mut WsReader) -> Result<String> {
    while let Some(msg) = read.next().await {
        match msg? {
            Message::Text(text) => return Ok(text.as_str().to_owned()),
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(ChartfeedError::Handshake("connection closed during handshake".into()))
}
