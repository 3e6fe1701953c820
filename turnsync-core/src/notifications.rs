//! Push notification channel.
//!
//! Keeps one websocket open to the server's notification endpoint, turns
//! incoming frames into [`ResourceChange`]s, reconnects with exponential
//! backoff after unexpected failures and emits a polling signal while the
//! socket is down. Everything is reported through [`NotificationChannel::subscribe`].

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::config::NotificationConfig;

pub const RESOURCE_SESSION: &str = "session";
pub const ACTION_UPDATED: &str = "updated";
pub const ACTION_DELETED: &str = "deleted";

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("notifications: connect failed - {0}")]
    Connect(String),

    #[error("notifications: timed out - {0}")]
    Timeout(String),

    #[error("notifications: protocol error - {0}")]
    Protocol(String),

    #[error("notifications: channel closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, ChannelError>;

/// A change to a server-side resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceChange {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ResourceChange {
    pub fn is_session_update(&self) -> bool {
        self.kind == RESOURCE_SESSION && self.action == ACTION_UPDATED
    }

    pub fn is_session_deletion(&self) -> bool {
        self.kind == RESOURCE_SESSION && self.action == ACTION_DELETED
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationEvent {
    Change(ResourceChange),
    ConnectionChanged(bool),
    Error(String),
    /// The socket is down; pull state instead.
    PollFallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

#[async_trait]
pub trait FrameStream: Send {
    /// `None` once the underlying transport is gone.
    async fn next_frame(&mut self) -> Option<Result<Frame>>;
    async fn send_frame(&mut self, frame: Frame) -> Result<()>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, token: &str) -> Result<Box<dyn FrameStream>>;
}

// ============================================================================
// Websocket transport
// ============================================================================

pub struct WsConnector {
    url: Url,
}

impl WsConnector {
    pub fn new(url: Url) -> Self {
        Self { url }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, token: &str) -> Result<Box<dyn FrameStream>> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ChannelError::Connect(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| ChannelError::Connect(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;
        log::debug!("notifications: websocket open to {}", self.url);
        Ok(Box::new(WsStream { inner: ws }))
    }
}

struct WsStream {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl FrameStream for WsStream {
    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        loop {
            let msg = match self.inner.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(ChannelError::Protocol(e.to_string()))),
            };
            let frame = match msg {
                Message::Text(text) => Frame::Text(text),
                Message::Binary(data) => Frame::Binary(data),
                Message::Ping(payload) => Frame::Ping(payload),
                Message::Pong(payload) => Frame::Pong(payload),
                Message::Close(_) => Frame::Close,
                Message::Frame(_) => continue,
            };
            return Some(Ok(frame));
        }
    }

    async fn send_frame(&mut self, frame: Frame) -> Result<()> {
        let msg = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data),
            Frame::Ping(payload) => Message::Ping(payload),
            Frame::Pong(payload) => Message::Pong(payload),
            Frame::Close => Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            })),
        };
        self.inner
            .send(msg)
            .await
            .map_err(|e| ChannelError::Protocol(e.to_string()))
    }
}

// ============================================================================
// Backoff
// ============================================================================

/// Exponential delay sequence capped at a ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
    factor: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, factor: u32) -> Self {
        Self {
            current: initial.min(max),
            max,
            factor,
        }
    }

    pub fn from_config(settings: &NotificationConfig) -> Self {
        Self::new(
            settings.initial_backoff(),
            settings.max_backoff(),
            settings.backoff_factor,
        )
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self
            .current
            .checked_mul(self.factor)
            .map_or(self.max, |d| d.min(self.max));
        delay
    }
}

// ============================================================================
// Channel
// ============================================================================

struct StoppableTask {
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl StoppableTask {
    async fn stop(self) {
        let _ = self.stop_tx.send(());
        let _ = self.handle.await;
    }
}

#[derive(Default)]
struct ChannelState {
    connected: bool,
    token: Option<String>,
    reconnecting: bool,
    closed: bool,
    reader: Option<StoppableTask>,
    reconnect: Option<StoppableTask>,
    poll: Option<StoppableTask>,
}

struct Shared {
    connector: Arc<dyn Connector>,
    settings: NotificationConfig,
    state: Mutex<ChannelState>,
    events_tx: broadcast::Sender<NotificationEvent>,
}

pub struct NotificationChannel {
    shared: Arc<Shared>,
}

impl NotificationChannel {
    pub fn new(connector: Arc<dyn Connector>, settings: NotificationConfig) -> Self {
        let (events_tx, _) = broadcast::channel(100);
        Self {
            shared: Arc::new(Shared {
                connector,
                settings,
                state: Mutex::new(ChannelState::default()),
                events_tx,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.shared.events_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().unwrap().connected
    }

    /// Open the socket with `token`, replacing any socket already open.
    pub async fn connect(&self, token: &str) -> Result<()> {
        let old_reader = {
            let mut st = self.shared.state.lock().unwrap();
            st.closed = false;
            st.connected = false;
            st.reader.take()
        };
        if let Some(reader) = old_reader {
            reader.stop().await;
        }
        self.shared.open(token, true).await
    }

    /// Close the current socket on purpose and open a new one with `token`.
    /// A pending backoff loop is abandoned since the new token supersedes it.
    pub async fn reconnect(&self, token: &str) -> Result<()> {
        let pending = self.shared.state.lock().unwrap().reconnect.take();
        if let Some(task) = pending {
            task.stop().await;
        }

        let old_reader = {
            let mut st = self.shared.state.lock().unwrap();
            st.closed = false;
            st.reconnecting = true;
            st.token = Some(token.to_string());
            st.reader.take()
        };
        if let Some(reader) = old_reader {
            reader.stop().await;
        }
        {
            let mut st = self.shared.state.lock().unwrap();
            st.connected = false;
            st.reconnecting = false;
        }
        self.shared.open(token, true).await
    }

    /// Stop every background task. No event is emitted once this returns.
    pub async fn disconnect(&self) {
        let (reconnect, poll, reader) = {
            let mut st = self.shared.state.lock().unwrap();
            st.closed = true;
            st.connected = false;
            st.reconnecting = false;
            st.token = None;
            (st.reconnect.take(), st.poll.take(), st.reader.take())
        };

        for task in [reconnect, poll, reader].into_iter().flatten() {
            task.stop().await;
        }
        log::info!("notifications: disconnected");
    }

    pub fn start_polling(&self) {
        let mut st = self.shared.state.lock().unwrap();
        if st.poll.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(poll_loop(Arc::clone(&self.shared), stop_rx));
        st.poll = Some(StoppableTask { stop_tx, handle });
    }

    pub async fn stop_polling(&self) {
        let poll = self.shared.state.lock().unwrap().poll.take();
        if let Some(task) = poll {
            task.stop().await;
        }
    }
}

impl Drop for NotificationChannel {
    fn drop(&mut self) {
        let mut st = self.shared.state.lock().unwrap();
        st.closed = true;
        for task in [st.reconnect.take(), st.poll.take(), st.reader.take()]
            .into_iter()
            .flatten()
        {
            task.handle.abort();
        }
    }
}

impl Shared {
    // Events are sent under the state lock so connection changes stay ordered.
    fn emit(&self, event: NotificationEvent) {
        let _ = self.events_tx.send(event);
    }

    /// `explicit` is false when the backoff loop is the caller.
    async fn open(self: &Arc<Self>, token: &str, explicit: bool) -> Result<()> {
        let handshake = self.settings.handshake_timeout();
        let result = match timeout(handshake, self.connector.connect(token)).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Timeout(format!("handshake after {:?}", handshake))),
        };

        let mut st = self.state.lock().unwrap();
        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                st.connected = false;
                if explicit {
                    log::error!("notifications: {}", e);
                    self.emit(NotificationEvent::ConnectionChanged(false));
                    if !st.reconnecting {
                        self.emit(NotificationEvent::Error(e.to_string()));
                    }
                }
                return Err(e);
            }
        };
        if st.closed {
            return Err(ChannelError::Closed);
        }
        if !explicit && st.connected {
            // An explicit connect won while this handshake was in flight.
            log::debug!("notifications: already connected, dropping backoff socket");
            return Ok(());
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(read_loop(Arc::clone(self), stream, stop_rx));
        st.token = Some(token.to_string());
        st.connected = true;
        st.reader = Some(StoppableTask { stop_tx, handle });
        self.emit(NotificationEvent::ConnectionChanged(true));
        log::info!("notifications: connected");
        Ok(())
    }

    fn dispatch(&self, raw: &[u8]) {
        match serde_json::from_slice::<ResourceChange>(raw) {
            Ok(change) => {
                log::debug!(
                    "notifications: {} {} {}",
                    change.kind,
                    change.id,
                    change.action
                );
                self.emit(NotificationEvent::Change(change));
            }
            Err(e) => log::warn!("notifications: skipping malformed frame: {}", e),
        }
    }

    /// Called by the read loop when the socket ends on its own. `failure` is
    /// `None` for a clean close from the server.
    fn read_ended(self: &Arc<Self>, failure: Option<String>) {
        let mut st = self.state.lock().unwrap();
        if st.closed {
            return;
        }
        st.connected = false;
        self.emit(NotificationEvent::ConnectionChanged(false));

        let failure = match failure {
            Some(f) => f,
            None => {
                log::info!("notifications: server closed the connection");
                return;
            }
        };
        if st.reconnecting {
            return;
        }

        log::error!("notifications: read failed: {}", failure);
        self.emit(NotificationEvent::Error(failure));

        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(reconnect_loop(Arc::clone(self), stop_rx));
        // Replacing drops the previous stop sender, which ends that loop.
        st.reconnect = Some(StoppableTask { stop_tx, handle });
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    mut stream: Box<dyn FrameStream>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let read_timeout = shared.settings.read_timeout();
    let write_timeout = shared.settings.write_timeout();

    let failure = loop {
        let next = tokio::select! {
            _ = &mut stop_rx => {
                let _ = timeout(write_timeout, stream.send_frame(Frame::Close)).await;
                return;
            }
            next = timeout(read_timeout, stream.next_frame()) => next,
        };

        match next {
            Err(_) => break Some(format!("no frame within {:?}", read_timeout)),
            Ok(None) => break Some("connection dropped".to_string()),
            Ok(Some(Err(e))) => break Some(e.to_string()),
            Ok(Some(Ok(frame))) => match frame {
                Frame::Text(text) => shared.dispatch(text.as_bytes()),
                Frame::Binary(data) => shared.dispatch(&data),
                Frame::Ping(payload) => {
                    match timeout(write_timeout, stream.send_frame(Frame::Pong(payload))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => break Some(e.to_string()),
                        Err(_) => break Some("pong write timed out".to_string()),
                    }
                }
                Frame::Pong(_) => {}
                Frame::Close => break None,
            },
        }
    };

    shared.read_ended(failure);
}

async fn reconnect_loop(shared: Arc<Shared>, mut stop_rx: oneshot::Receiver<()>) {
    let mut backoff = Backoff::from_config(&shared.settings);

    loop {
        let delay = backoff.next_delay();
        log::debug!("notifications: reconnecting in {:?}", delay);
        tokio::select! {
            _ = &mut stop_rx => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let token = {
            let st = shared.state.lock().unwrap();
            if st.closed || st.connected {
                return;
            }
            st.token.clone()
        };
        let token = match token {
            Some(token) => token,
            None => return,
        };

        let attempt = tokio::select! {
            _ = &mut stop_rx => return,
            attempt = shared.open(&token, false) => attempt,
        };
        match attempt {
            Ok(()) => {
                log::info!("notifications: reconnected");
                return;
            }
            Err(ChannelError::Closed) => return,
            Err(e) => log::warn!("notifications: reconnect attempt failed: {}", e),
        }
    }
}

async fn poll_loop(shared: Arc<Shared>, mut stop_rx: oneshot::Receiver<()>) {
    let period = shared.settings.poll_interval();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut stop_rx => return,
            _ = ticker.tick() => {
                let st = shared.state.lock().unwrap();
                if !st.connected {
                    log::debug!("notifications: socket down, polling");
                    shared.emit(NotificationEvent::PollFallback);
                }
            }
        }
    }
}
