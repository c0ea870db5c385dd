//! Realtime connection lifecycle management.
//!
//! [`RealtimeConnection`] owns one provider WebSocket and the two fan-out
//! maps (trades, bid/ask) fed from it. The connection is dialed lazily on
//! the first subscription, walks the provider's handshake, and then hands
//! the read half to a reader task that decodes frames and publishes them.
//!
//! If the stream drops, the reader closes every channel and the state
//! returns to [`ConnectionState::Disconnected`]. Subscriptions are not
//! restored automatically: consumers observe the closed channel and
//! subscribe again, which reconnects.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tungstenite::Message as WsMessage;

use super::{StreamProtocol, WsReader, WsWriter, connect, next_text_frame, send_json};
use crate::broker::{BrokerKind, log_request_error};
use crate::models::{
    DataKind, RealtimeBidAskData, RealtimeRecord, RealtimeStream, RealtimeTickData,
    SubscriptionAction, SubscriptionRequest, SubscriptionResponse,
};
use crate::realtime::RealtimeMap;
use crate::{ChartfeedError, Result};

/// Initial backoff duration between connection attempts.
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Maximum backoff duration between connection attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Connection attempts made for a single subscription request.
const MAX_CONNECT_ATTEMPTS: u32 = 3;

/// Records older than this are reported as stale (but still delivered).
const STALE_AFTER: TimeDelta = TimeDelta::seconds(60);

/// Where the connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Authenticating,
    Streaming,
}

impl ConnectionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Authenticating => "authenticating",
            Self::Streaming => "streaming",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the reader loop exited.
enum DisconnectReason {
    /// The connection was lost or errored.
    ConnectionError,
    /// The connection is being torn down on purpose.
    Shutdown,
}

type SharedState = Arc<Mutex<ConnectionState>>;

fn set_state(state: &SharedState, provider: &'static str, next: ConnectionState) {
    let mut guard = state.lock().unwrap_or_else(|p| p.into_inner());
    let previous = *guard;
    if previous != next {
        debug!(provider, from = %previous, to = %next, "Connection state changed");
        *guard = next;
    }
}

struct ReaderTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// One provider's realtime stream and its subscribers.
pub struct RealtimeConnection<P: StreamProtocol> {
    protocol: Arc<P>,
    trades: Arc<RealtimeMap<RealtimeTickData>>,
    quotes: Arc<RealtimeMap<RealtimeBidAskData>>,
    state: SharedState,
    writer: Option<WsWriter>,
    reader: Option<ReaderTask>,
}

impl<P: StreamProtocol> fmt::Debug for RealtimeConnection<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeConnection")
            .field("provider", &self.protocol.name())
            .field("state", &self.state())
            .field("trades", &self.trades.len())
            .field("quotes", &self.quotes.len())
            .finish_non_exhaustive()
    }
}

impl<P: StreamProtocol> RealtimeConnection<P> {
    /// Creates a disconnected connection for `protocol`.
    #[must_use]
    pub fn new(protocol: P) -> Self {
        Self {
            protocol: Arc::new(protocol),
            trades: Arc::new(RealtimeMap::default()),
            quotes: Arc::new(RealtimeMap::default()),
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            writer: None,
            reader: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn provider(&self) -> &'static str {
        self.protocol.name()
    }

    /// Answers subscription requests until the request stream closes or
    /// `cancel` fires, then tears the connection down.
    pub async fn serve(
        mut self,
        broker: BrokerKind,
        bid_ask_supported: bool,
        cancel: CancellationToken,
        mut requests: mpsc::Receiver<SubscriptionRequest>,
        responses: mpsc::Sender<SubscriptionResponse>,
    ) {
        debug!(%broker, worker = "subscribe_data", "Worker started");
        loop {
            let request = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                request = requests.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            let response = self
                .answer(broker, bid_ask_supported, &cancel, request)
                .await;
            if responses.send(response).await.is_err() {
                warn!(%broker, worker = "subscribe_data", "Response receiver dropped, stopping worker");
                break;
            }
        }

        self.shutdown().await;
        info!(%broker, "Realtime connection torn down");
    }

    async fn answer(
        &mut self,
        broker: BrokerKind,
        bid_ask_supported: bool,
        cancel: &CancellationToken,
        request: SubscriptionRequest,
    ) -> SubscriptionResponse {
        let SubscriptionRequest {
            asset,
            kind,
            action,
        } = request;

        let result = match action {
            SubscriptionAction::Subscribe => self
                .subscribe(cancel, &asset.symbol, kind, bid_ask_supported)
                .await
                .map(Some),
            SubscriptionAction::Unsubscribe => {
                self.unsubscribe(&asset.symbol, kind).await.map(|()| None)
            }
        };

        let (stream, error) = match result {
            Ok(stream) => (stream, None),
            Err(e) => {
                log_request_error(broker, "subscribe_data", &asset.symbol, &e);
                (None, Some(e))
            }
        };
        SubscriptionResponse {
            asset,
            kind,
            action,
            stream,
            error,
        }
    }

    /// Returns `true` while `symbol` has an open stream of `kind`.
    #[must_use]
    pub fn is_subscribed(&self, symbol: &str, kind: DataKind) -> bool {
        match kind {
            DataKind::Trades => self.trades.is_subscribed(symbol),
            DataKind::BidAsk => self.quotes.is_subscribed(symbol),
        }
    }

    /// Opens a realtime stream for `symbol`, connecting first if needed.
    ///
    /// # Errors
    ///
    /// Returns [`ChartfeedError::NotSupported`] for bid/ask on a provider
    /// without it, [`ChartfeedError::AlreadySubscribed`] for duplicates, and
    /// [`ChartfeedError::Connection`] if the provider cannot be reached.
    pub async fn subscribe(
        &mut self,
        cancel: &CancellationToken,
        symbol: &str,
        kind: DataKind,
        bid_ask_supported: bool,
    ) -> Result<RealtimeStream> {
        if kind == DataKind::BidAsk && !bid_ask_supported {
            return Err(ChartfeedError::NotSupported(format!(
                "{} does not stream bid/ask",
                self.provider()
            )));
        }
        self.ensure_connected(cancel).await?;

        let stream = match kind {
            DataKind::Trades => RealtimeStream::Trades(self.trades.subscribe(symbol)?),
            DataKind::BidAsk => RealtimeStream::BidAsk(self.quotes.subscribe(symbol)?),
        };

        let frames = self.protocol.subscribe_frames(symbol, kind);
        if let Err(e) = self.send_frames(&frames).await {
            error!(provider = self.provider(), symbol, "Subscribe frame failed: {e}");
            self.shutdown().await;
            return Err(e);
        }

        info!(
            provider = self.provider(),
            symbol,
            kind = kind.as_str(),
            "Subscribed to realtime data"
        );
        Ok(stream)
    }

    /// Stops the stream for `symbol`. The channel is closed by the reader
    /// before it handles the next frame.
    ///
    /// # Errors
    ///
    /// Returns [`ChartfeedError::NotSubscribed`] if there is no such stream.
    pub async fn unsubscribe(&mut self, symbol: &str, kind: DataKind) -> Result<()> {
        match kind {
            DataKind::Trades => self.trades.unsubscribe(symbol)?,
            DataKind::BidAsk => self.quotes.unsubscribe(symbol)?,
        }

        if self.state() == ConnectionState::Streaming {
            let frames = self.protocol.unsubscribe_frames(symbol, kind);
            if let Err(e) = self.send_frames(&frames).await {
                warn!(provider = self.provider(), symbol, "Unsubscribe frame failed: {e}");
            }
        }

        info!(
            provider = self.provider(),
            symbol,
            kind = kind.as_str(),
            "Unsubscribed from realtime data"
        );
        Ok(())
    }

    async fn send_frames(&mut self, frames: &[serde_json::Value]) -> Result<()> {
        let write = self
            .writer
            .as_mut()
            .ok_or_else(|| ChartfeedError::Connection("not connected".into()))?;
        for frame in frames {
            send_json(write, frame).await?;
        }
        Ok(())
    }

    /// Connects unless already streaming, retrying with exponential backoff.
    ///
    /// Channels left over from a previous transport are closed first: the
    /// new connection carries no subscriptions, so nothing would feed them.
    async fn ensure_connected(&mut self, cancel: &CancellationToken) -> Result<()> {
        let reader_alive = self
            .reader
            .as_ref()
            .is_some_and(|reader| !reader.handle.is_finished());
        if self.state() == ConnectionState::Streaming && self.writer.is_some() && reader_alive {
            return Ok(());
        }
        self.stop_transport().await;

        let stale = self.trades.len()
            + self.trades.pending_close_len()
            + self.quotes.len()
            + self.quotes.pending_close_len();
        if stale > 0 {
            warn!(provider = self.provider(), stale, "Closing channels of the previous connection");
            self.trades.clear();
            self.quotes.clear();
        }

        let mut backoff = INITIAL_BACKOFF;
        let mut last_error = None;
        for attempt in 1..=MAX_CONNECT_ATTEMPTS {
            match self.connect_once().await {
                Ok(()) => {
                    info!(provider = self.provider(), attempt, "Realtime stream connected");
                    return Ok(());
                }
                Err(e) => {
                    set_state(&self.state, self.provider(), ConnectionState::Disconnected);
                    error!(provider = self.provider(), attempt, "Connection failed: {e}");
                    last_error = Some(e);
                }
            }

            if attempt < MAX_CONNECT_ATTEMPTS {
                info!(backoff_secs = backoff.as_secs(), "Backing off before retry");
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(ChartfeedError::Cancelled),
                    () = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }

        Err(ChartfeedError::Connection(format!(
            "{} unreachable after {MAX_CONNECT_ATTEMPTS} attempts: {}",
            self.provider(),
            last_error.map_or_else(String::new, |e| e.to_string())
        )))
    }

    /// Dials, walks the handshake and starts the reader task.
    async fn connect_once(&mut self) -> Result<()> {
        let provider = self.provider();
        set_state(&self.state, provider, ConnectionState::Connecting);
        info!(provider, "Connecting to WebSocket");
        let (mut write, mut read) = connect(&self.protocol.url()).await?;

        if let Some(ack) = self.protocol.connected_ack() {
            set_state(&self.state, provider, ConnectionState::Handshaking);
            let frame = next_text_frame(&mut read).await?;
            self.protocol.verify_ack(&frame, ack)?;
        }

        if let Some(auth) = self.protocol.auth_frame() {
            set_state(&self.state, provider, ConnectionState::Authenticating);
            send_json(&mut write, &auth).await?;
            if let Some(ack) = self.protocol.authenticated_ack() {
                let frame = next_text_frame(&mut read).await?;
                self.protocol.verify_ack(&frame, ack)?;
            }
        }

        set_state(&self.state, provider, ConnectionState::Streaming);
        self.writer = Some(write);
        self.reader = Some(self.spawn_reader(read));
        Ok(())
    }

    fn spawn_reader(&self, read: WsReader) -> ReaderTask {
        let cancel = CancellationToken::new();
        let protocol = Arc::clone(&self.protocol);
        let trades = Arc::clone(&self.trades);
        let quotes = Arc::clone(&self.quotes);
        let state = Arc::clone(&self.state);
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let reason = read_loop(protocol.as_ref(), read, &trades, &quotes, &token).await;
            if let DisconnectReason::ConnectionError = reason {
                set_state(&state, protocol.name(), ConnectionState::Disconnected);
                trades.clear();
                quotes.clear();
                warn!(provider = protocol.name(), "Realtime stream lost, all channels closed");
            }
        });

        ReaderTask { cancel, handle }
    }

    /// Stops the reader and drops the writer, leaving subscriptions alone.
    async fn stop_transport(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.cancel.cancel();
            if let Err(e) = reader.handle.await {
                warn!(provider = self.provider(), "Reader task failed: {e}");
            }
        }
        if let Some(mut write) = self.writer.take()
            && let Err(e) = write.close().await
        {
            debug!(provider = self.provider(), "Close frame not sent: {e}");
        }
    }

    /// Closes the stream and every channel.
    pub async fn shutdown(&mut self) {
        self.stop_transport().await;
        set_state(&self.state, self.provider(), ConnectionState::Disconnected);
        self.trades.clear();
        self.quotes.clear();
    }
}

/// Reads frames until the stream fails or `cancel` fires.
async fn read_loop<P: StreamProtocol>(
    protocol: &P,
    mut read: WsReader,
    trades: &RealtimeMap<RealtimeTickData>,
    quotes: &RealtimeMap<RealtimeBidAskData>,
    cancel: &CancellationToken,
) -> DisconnectReason {
    let provider = protocol.name();
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return DisconnectReason::Shutdown,
            msg = read.next() => match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    trades.clear_pending_close();
                    quotes.clear_pending_close();
                    match protocol.decode(&text) {
                        Ok(records) => dispatch(provider, records, trades, quotes),
                        Err(e) => warn!(provider, "Dropping undecodable frame: {e}"),
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    warn!(provider, ?frame, "Server closed the stream");
                    return DisconnectReason::ConnectionError;
                }
                Some(Ok(_)) => {} // Binary/Ping/Pong frames
                Some(Err(e)) => {
                    warn!(provider, "WebSocket error: {e}");
                    return DisconnectReason::ConnectionError;
                }
                None => {
                    warn!(provider, "WebSocket stream ended");
                    return DisconnectReason::ConnectionError;
                }
            },
        }
    }
}

/// Publishes a decoded batch to the subscribers of each record's symbol.
pub(crate) fn dispatch(
    provider: &'static str,
    records: Vec<RealtimeRecord>,
    trades: &RealtimeMap<RealtimeTickData>,
    quotes: &RealtimeMap<RealtimeBidAskData>,
) {
    let now = Utc::now();
    for record in records {
        let age = now - record.timestamp();
        if age > STALE_AFTER {
            warn!(
                provider,
                symbol = record.symbol(),
                age_secs = age.num_seconds(),
                "Stale realtime record"
            );
        }

        let result = match record {
            RealtimeRecord::Trade { symbol, tick } => trades.add_new_data(&symbol, tick),
            RealtimeRecord::Quote { symbol, bid_ask } => quotes.add_new_data(&symbol, bid_ask),
        };
        if let Err(e) = result {
            warn!(provider, "Realtime record dropped: {e}");
        }
    }
}
