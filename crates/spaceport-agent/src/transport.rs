//! Resilient event-stream transport
//!
//! One logical subscription to `{channel, cluster_id}` over an authenticated
//! websocket. The transport runs as an explicit state machine:
//!
//! ```text
//! Disconnected --backoff--> Connecting --> Subscribing --confirm--> Streaming
//!       ^                        |              |                       |
//!       +------------------------+--------------+-----------------------+
//!                              (error, close, disconnect frame)
//! Streaming/Subscribing --cancel--> Closing --> (return)
//! ```
//!
//! Inbound domain events are acked before being dispatched, in wire order.
//! Outbound payloads enter through a bounded channel; while not streaming
//! they are appended to the [`Backlog`] and flushed FIFO right after the
//! next subscription confirmation.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backlog::Backlog;
use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::protocol::{
    ack_frame, message_frame, parse_frame, subscribe_frame, ControlFrame, Inbound, InboundEvent,
};
use crate::router::Router;
use crate::token::TokenSource;

/// Write half of a connection
pub type FrameSink = Pin<Box<dyn Sink<Message, Error = StreamError> + Send>>;

/// Read half of a connection
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Message, StreamError>> + Send>>;

/// Transport state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// Not connected; waiting out the backoff timer
    Disconnected,
    /// Exchanging the token and dialing
    Connecting,
    /// Subscribe frame sent, waiting for confirmation
    Subscribing,
    /// Subscription confirmed, outbound traffic flows
    Streaming,
    /// Close handshake in progress
    Closing,
}

/// Opens authenticated connections
#[async_trait]
pub trait Connector: Send + Sync {
    /// Dial the stream, presenting `token` as a bearer credential
    async fn connect(&self, token: &str) -> Result<(FrameSink, FrameStream), StreamError>;
}

/// Websocket connector built on tokio-tungstenite
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    /// Create a connector for the given `ws://` or `wss://` URL
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, token: &str) -> Result<(FrameSink, FrameStream), StreamError> {
        let uri: tungstenite::http::Uri = self
            .url
            .parse()
            .map_err(|e: tungstenite::http::uri::InvalidUri| StreamError::Connect(e.to_string()))?;

        let request =
            ClientRequestBuilder::new(uri).with_header("Authorization", format!("Bearer {token}"));

        let (ws, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| match e {
                tungstenite::Error::Http(resp) if resp.status().as_u16() == 401 => {
                    StreamError::Auth("stream rejected bearer token".to_string())
                }
                other => StreamError::Connect(other.to_string()),
            })?;

        let (write, read) = ws.split();
        let sink = write.sink_map_err(|e| StreamError::Connect(e.to_string()));
        let stream = read.map(|r| r.map_err(|e| StreamError::Connect(e.to_string())));
        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

/// Cloneable handle for sending outbound messages and observing state
#[derive(Clone)]
pub struct StreamHandle {
    tx: mpsc::Sender<serde_json::Value>,
    state: watch::Receiver<StreamState>,
}

impl StreamHandle {
    /// Queue a payload for delivery as a `message` command.
    ///
    /// Delivered immediately while streaming; otherwise backlogged (or
    /// dropped when the backlog is disabled).
    pub async fn send(&self, payload: serde_json::Value) -> Result<(), StreamError> {
        self.tx
            .send(payload)
            .await
            .map_err(|_| StreamError::ChannelClosed)
    }

    /// Current transport state
    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    /// Wait until the transport reaches `state`
    pub async fn wait_for(&mut self, state: StreamState) -> Result<(), StreamError> {
        self.state
            .wait_for(|s| *s == state)
            .await
            .map(|_| ())
            .map_err(|_| StreamError::ChannelClosed)
    }
}

/// How a session ended
enum SessionEnd {
    /// Shutdown requested; close handshake done
    Cancelled,
    /// Peer closed or asked us to disconnect
    Closed,
}

/// Outcome of handling one text frame
enum FrameOutcome {
    Continue,
    Confirmed,
    Disconnect,
}

/// The event stream: owns the connection loop
pub struct EventStream {
    config: StreamConfig,
    identifier: String,
    connector: Arc<dyn Connector>,
    tokens: Arc<dyn TokenSource>,
    router: Arc<Router>,
    outbound_rx: mpsc::Receiver<serde_json::Value>,
    outbound_open: bool,
    backlog: Backlog,
    state: watch::Sender<StreamState>,
}

impl EventStream {
    /// Create the stream and a handle to it
    pub fn new(
        config: StreamConfig,
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenSource>,
        router: Arc<Router>,
    ) -> Result<(Self, StreamHandle), StreamError> {
        let identifier = config.identifier().encode()?;
        let (tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let (state, state_rx) = watch::channel(StreamState::Disconnected);
        let backlog = Backlog::new(config.use_backlog);

        let stream = Self {
            config,
            identifier,
            connector,
            tokens,
            router,
            outbound_rx,
            outbound_open: true,
            backlog,
            state,
        };
        let handle = StreamHandle {
            tx,
            state: state_rx,
        };
        Ok((stream, handle))
    }

    fn set_state(&self, state: StreamState) {
        self.state.send_replace(state);
    }

    /// Run until `cancel` fires. Never returns an error: every failure ends
    /// in a backoff and a fresh connect.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let mut streamed = false;
            match self.session(&cancel, &mut streamed).await {
                Ok(SessionEnd::Cancelled) => break,
                Ok(SessionEnd::Closed) => info!("event stream closed by peer, reconnecting"),
                Err(e) => warn!(error = %e, attempt, "event stream session failed"),
            }
            if streamed {
                attempt = 0;
            }

            self.set_state(StreamState::Disconnected);
            let delay = self.config.reconnect.jittered_delay(attempt);
            info!(delay_ms = delay.as_millis() as u64, attempt, "waiting before reconnect");
            attempt = attempt.saturating_add(1);

            if !self.backoff(delay, &cancel).await {
                break;
            }
        }

        self.set_state(StreamState::Disconnected);
        debug!(backlog = self.backlog.len(), "event stream stopped");
    }

    /// Sleep out the backoff, backlogging outbound traffic.
    ///
    /// Returns false when cancelled.
    async fn backoff(&mut self, delay: Duration, cancel: &CancellationToken) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                _ = &mut sleep => return true,
                msg = self.outbound_rx.recv(), if self.outbound_open => match msg {
                    Some(payload) => self.backlog.push(payload),
                    None => self.outbound_open = false,
                },
            }
        }
    }

    /// One connect, subscribe, read cycle
    async fn session(
        &mut self,
        cancel: &CancellationToken,
        streamed: &mut bool,
    ) -> Result<SessionEnd, StreamError> {
        self.set_state(StreamState::Connecting);

        let connector = self.connector.clone();
        let tokens = self.tokens.clone();
        let dial = async move {
            let token = tokens.token().await?;
            connector.connect(&token).await
        };
        let (mut sink, mut stream) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
            conn = dial => conn?,
        };
        info!(url = %self.config.url, "event stream connected");

        self.set_state(StreamState::Subscribing);
        sink.send(Message::Text(subscribe_frame(&self.identifier)?.into()))
            .await?;

        let (wire_tx, wire_rx) = mpsc::channel::<Message>(self.config.outbound_capacity.max(1));
        let mut writer = tokio::spawn(write_loop(sink, wire_rx));

        let result = self
            .read_loop(cancel, streamed, &wire_tx, &mut stream, &mut writer)
            .await;

        match result {
            Ok(SessionEnd::Cancelled) => {
                self.close(wire_tx, &mut stream, writer).await;
                Ok(SessionEnd::Cancelled)
            }
            other => {
                drop(wire_tx);
                writer.abort();
                other
            }
        }
    }

    async fn read_loop(
        &mut self,
        cancel: &CancellationToken,
        streamed: &mut bool,
        wire_tx: &mpsc::Sender<Message>,
        stream: &mut FrameStream,
        writer: &mut JoinHandle<Result<(), StreamError>>,
    ) -> Result<SessionEnd, StreamError> {
        let deadline = tokio::time::sleep(self.config.subscribe_timeout);
        tokio::pin!(deadline);
        let mut subscribed = false;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
                _ = &mut deadline, if !subscribed => {
                    return Err(StreamError::Protocol(format!(
                        "subscription not confirmed within {:?}",
                        self.config.subscribe_timeout
                    )));
                }
                res = &mut *writer => {
                    return match res {
                        Ok(Err(e)) => Err(e),
                        _ => Err(StreamError::ChannelClosed),
                    };
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        match self.on_text(text.as_str(), wire_tx).await? {
                            FrameOutcome::Continue => {}
                            FrameOutcome::Confirmed => {
                                if !subscribed {
                                    subscribed = true;
                                    self.flush_backlog(wire_tx).await?;
                                    self.set_state(StreamState::Streaming);
                                    *streamed = true;
                                    info!(channel = %self.config.channel, "subscription confirmed");
                                }
                            }
                            FrameOutcome::Disconnect => return Ok(SessionEnd::Closed),
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(frame = ?frame, "close frame received");
                        return Ok(SessionEnd::Closed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e),
                    None => return Ok(SessionEnd::Closed),
                },
                msg = self.outbound_rx.recv(), if self.outbound_open => match msg {
                    Some(payload) if subscribed => {
                        let frame = message_frame(&self.identifier, &payload)?;
                        send_wire(wire_tx, frame).await?;
                    }
                    Some(payload) => self.backlog.push(payload),
                    None => self.outbound_open = false,
                },
            }
        }
    }

    async fn on_text(
        &self,
        text: &str,
        wire_tx: &mpsc::Sender<Message>,
    ) -> Result<FrameOutcome, StreamError> {
        let inbound = match parse_frame(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(error = %e, "dropping undecodable frame");
                return Ok(FrameOutcome::Continue);
            }
        };

        match inbound {
            Inbound::Control(ControlFrame::Ping) => Ok(FrameOutcome::Continue),
            Inbound::Control(ControlFrame::Welcome) => {
                debug!("welcome received");
                Ok(FrameOutcome::Continue)
            }
            Inbound::Control(ControlFrame::ConfirmSubscription) => Ok(FrameOutcome::Confirmed),
            Inbound::Control(ControlFrame::RejectSubscription) => Err(StreamError::Protocol(
                "subscription rejected".to_string(),
            )),
            Inbound::Control(ControlFrame::Disconnect { reason }) => {
                info!(reason = ?reason, "server requested disconnect");
                Ok(FrameOutcome::Disconnect)
            }
            Inbound::Event(event) => {
                send_wire(wire_tx, ack_frame(&event.id)?).await?;
                self.dispatch(&event).await;
                Ok(FrameOutcome::Continue)
            }
        }
    }

    async fn dispatch(&self, event: &InboundEvent) {
        match self.router.dispatch(event).await {
            Ok(()) => debug!(event_id = %event.id, event_type = %event.event_type, "event handled"),
            Err(StreamError::NoHandler(t)) => {
                warn!(event_id = %event.id, event_type = %t, "no handler registered")
            }
            Err(e) => {
                error!(event_id = %event.id, event_type = %event.event_type, error = %e, "event handler failed")
            }
        }
    }

    async fn flush_backlog(&mut self, wire_tx: &mpsc::Sender<Message>) -> Result<(), StreamError> {
        let pending = self.backlog.drain();
        if !pending.is_empty() {
            info!(count = pending.len(), "flushing backlog");
        }
        for payload in pending {
            send_wire(wire_tx, message_frame(&self.identifier, &payload)?).await?;
        }
        Ok(())
    }

    /// Close handshake: send a close frame, then wait a bounded time for the peer's
    async fn close(
        &self,
        wire_tx: mpsc::Sender<Message>,
        stream: &mut FrameStream,
        writer: JoinHandle<Result<(), StreamError>>,
    ) {
        self.set_state(StreamState::Closing);
        if wire_tx.send(Message::Close(None)).await.is_err() {
            debug!("writer already gone, skipping close frame");
        }
        drop(wire_tx);

        let wait_peer = async {
            while let Some(frame) = stream.next().await {
                if matches!(frame, Ok(Message::Close(_)) | Err(_)) {
                    break;
                }
            }
        };
        if tokio::time::timeout(self.config.close_timeout, wait_peer)
            .await
            .is_err()
        {
            debug!("peer did not acknowledge close in time");
        }

        match tokio::time::timeout(self.config.close_timeout, writer).await {
            Ok(Ok(Err(e))) => debug!(error = %e, "writer ended with error during close"),
            Ok(_) => {}
            Err(_) => debug!("writer did not finish in time"),
        }
        info!("event stream closed");
    }
}

async fn send_wire(wire_tx: &mpsc::Sender<Message>, frame: String) -> Result<(), StreamError> {
    wire_tx
        .send(Message::Text(frame.into()))
        .await
        .map_err(|_| StreamError::ChannelClosed)
}

/// Single writer: drains the wire channel into the sink in order
async fn write_loop(
    mut sink: FrameSink,
    mut wire_rx: mpsc::Receiver<Message>,
) -> Result<(), StreamError> {
    while let Some(msg) = wire_rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        sink.send(msg).await?;
        if closing {
            break;
        }
    }
    if let Err(e) = sink.close().await {
        debug!(error = %e, "sink close failed");
    }
    Ok(())
}
