//! One logical WebSocket connection to the relay.
//!
//! ```text
//!  disconnected ──start──► connecting ──open──► connected ──registered──► registered
//!        ▲                     ▲                    │                         │
//!        │ attempt cap         │ backoff            └──────── close ──────────┤
//!        └──────────────── reconnecting ◄─────────────────────────────────────┘
//!
//!  stop() from any state ──► closed
//! ```
//!
//! All transport, command and timer handling runs on one actor task, so the
//! session state is never mutated concurrently. The handle talks to it over
//! an mpsc channel; state is published on a `watch` channel and events on a
//! `broadcast` channel (dropping a receiver unsubscribes).
//!
//! Broadcast receivers that fall behind lose events. A consumer that must
//! see every application frame calls [`ConnectionSession::messages`]: from
//! then on those frames go to a bounded mpsc channel and the actor waits
//! for room instead of dropping them.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::delay::{cancellable_sleep, Cancelled};
use crate::protocol::{ClientFrame, ProtocolError, ServerFrame};

/// First reconnect delay.
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Upper bound for any reconnect delay.
pub const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Reconnect attempts before the session gives up.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:9090";

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Session connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Transport open, registration not yet acknowledged
    Connected,
    Registered,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    /// Whether frames can be written right now.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Connected | Self::Registered)
    }
}

/// `delay(attempt) = min(base * 2^attempt, cap)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: BACKOFF_BASE,
            cap: BACKOFF_CAP,
        }
    }
}

impl BackoffPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).unwrap_or(self.cap).min(self.cap)
    }
}

/// What happens to application frames sent while the transport is down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SendPolicy {
    /// Drop with a warning.
    #[default]
    Drop,
    /// Hold up to `max_frames` (oldest evicted first) and flush them in
    /// order right after the next registration frame.
    Buffer { max_frames: usize },
}

/// What [`ConnectionSession::send`] did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Buffered,
    Dropped,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Relay WebSocket URL
    pub url: String,
    /// Account id announced in `register`
    pub user_id: String,
    pub token: String,
    /// Client metadata announced in `register`
    pub metadata: serde_json::Map<String, Value>,
    pub backoff: BackoffPolicy,
    pub max_reconnect_attempts: u32,
    pub send_policy: SendPolicy,
    pub connect_timeout: Duration,
    /// Buffered events per subscriber before it starts lagging; also the
    /// capacity of the [`ConnectionSession::messages`] channel
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_RELAY_URL.to_string(),
            user_id: String::new(),
            token: String::new(),
            metadata: serde_json::Map::new(),
            backoff: BackoffPolicy::default(),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            send_policy: SendPolicy::Drop,
            connect_timeout: Duration::from_secs(10),
            event_capacity: 256,
        }
    }
}

impl SessionConfig {
    pub fn new(url: impl Into<String>, user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user_id: user_id.into(),
            token: token.into(),
            ..Self::default()
        }
    }

    /// Millisecond backoff and a small attempt cap.
    pub fn for_testing(url: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            backoff: BackoffPolicy {
                base: Duration::from_millis(10),
                cap: Duration::from_millis(80),
            },
            max_reconnect_attempts: 3,
            connect_timeout: Duration::from_secs(2),
            ..Self::new(url, user_id, "test-token")
        }
    }
}

/// Events observable by session subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Transport opened and `register` sent
    Opened { reconnect: bool },
    /// Relay acknowledged registration
    Registered,
    /// Relay reported an error; the connection stays open
    ServerError(String),
    /// Application frame from the relay, when no
    /// [`ConnectionSession::messages`] receiver is attached
    Message(ServerFrame),
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// Attempt cap reached; the session is down for good
    GaveUp { attempts: u32 },
    Closed,
}

/// Session errors.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// `start()` called while the session is live
    AlreadyRunning(ConnectionState),
    /// Transport could not be opened
    Transport(String),
    Protocol(ProtocolError),
    GaveUp { attempts: u32 },
    /// Interrupted by `stop()`
    Cancelled,
}

impl SessionError {
    /// Cancellation caused by shutdown rather than a real failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyRunning(state) => write!(f, "Session already running ({state:?})"),
            Self::Transport(e) => write!(f, "Transport error: {e}"),
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
            Self::GaveUp { attempts } => write!(f, "Gave up after {attempts} reconnect attempts"),
            Self::Cancelled => write!(f, "Session cancelled"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<Cancelled> for SessionError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

enum Command {
    Send(ClientFrame),
}

type Inbound = Arc<Mutex<Option<mpsc::Sender<ServerFrame>>>>;

struct Running {
    cancel: CancellationToken,
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

/// Handle to one relay connection. Explicitly owned; create one per client.
pub struct ConnectionSession {
    config: SessionConfig,
    state: Arc<watch::Sender<ConnectionState>>,
    events: broadcast::Sender<SessionEvent>,
    inbound: Inbound,
    running: Mutex<Option<Running>>,
}

impl ConnectionSession {
    pub fn new(config: SessionConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            state: Arc::new(state),
            events,
            inbound: Arc::new(Mutex::new(None)),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Route application frames to a lossless channel.
    ///
    /// Frames that would have been [`SessionEvent::Message`] go here
    /// instead, in arrival order. When the channel is full the actor stops
    /// reading the socket until the receiver catches up. Calling this again
    /// replaces the previous receiver; dropping it routes frames back to
    /// the broadcast channel.
    pub fn messages(&self) -> mpsc::Receiver<ServerFrame> {
        let (tx, rx) = mpsc::channel(self.config.event_capacity.max(1));
        *self.inbound.lock().unwrap_or_else(|p| p.into_inner()) = Some(tx);
        rx
    }

    /// Whether an actor task is alive (connected or retrying).
    pub fn is_running(&self) -> bool {
        self.lock_running()
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    /// Open the transport and register.
    ///
    /// Resolves once the transport is open; the registration ack arrives
    /// later as [`SessionEvent::Registered`]. Fails with `AlreadyRunning`
    /// while connecting, connected or registered. Called while
    /// reconnecting, it drops the pending backoff and starts over. If the
    /// first connect fails the error is returned and the session keeps
    /// retrying in the background until `stop()` or the attempt cap.
    pub async fn start(&self) -> Result<(), SessionError> {
        let previous = {
            let mut running = self.lock_running();
            let live = running.as_ref().is_some_and(|r| !r.task.is_finished());
            let state = self.state();
            if live && matches!(
                state,
                ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Registered
            ) {
                return Err(SessionError::AlreadyRunning(state));
            }
            running.take()
        };

        if let Some(old) = previous {
            log::debug!("Restarting session for {}", self.config.user_id);
            old.cancel.cancel();
            let _ = old.task.await;
        }

        let (first_tx, first_rx) = oneshot::channel();
        {
            let mut running = self.lock_running();
            if running.is_some() {
                return Err(SessionError::AlreadyRunning(self.state()));
            }
            // Published before the lock is released so a concurrent
            // start() sees a live session.
            self.state.send_replace(ConnectionState::Connecting);
            let cancel = CancellationToken::new();
            let (commands_tx, commands_rx) = mpsc::channel(256);
            let actor = SessionActor {
                config: self.config.clone(),
                state: self.state.clone(),
                events: self.events.clone(),
                inbound: self.inbound.clone(),
                commands: commands_rx,
                cancel: cancel.clone(),
                held: VecDeque::new(),
                attempt: 0,
            };
            let task = tokio::spawn(actor.run(first_tx));
            *running = Some(Running {
                cancel,
                commands: commands_tx,
                task,
            });
        }

        match first_rx.await {
            Ok(result) => result,
            Err(_) => Err(SessionError::Cancelled),
        }
    }

    /// Tear the session down. Safe to call from any state, any number of
    /// times. Sends `unregister` first if the transport is open.
    pub async fn stop(&self) {
        let Some(running) = self.lock_running().take() else {
            return;
        };
        running.cancel.cancel();
        if let Err(e) = running.task.await {
            if e.is_panic() {
                log::error!("Session task for {} panicked", self.config.user_id);
            }
        }
        self.state.send_replace(ConnectionState::Closed);
    }

    /// Queue an application frame.
    ///
    /// While the transport is not open the frame is dropped with a warning
    /// (or held, under [`SendPolicy::Buffer`]); it is never silently queued.
    pub fn send(&self, frame: ClientFrame) -> SendOutcome {
        let commands = self.lock_running().as_ref().map(|r| r.commands.clone());
        let Some(commands) = commands else {
            log::warn!("Dropping {} frame: session not started", frame.kind());
            return SendOutcome::Dropped;
        };

        let open = self.state().is_open();
        if !open && self.config.send_policy == SendPolicy::Drop {
            log::warn!("Dropping {} frame: transport not open ({:?})", frame.kind(), self.state());
            return SendOutcome::Dropped;
        }

        let kind = frame.kind();
        match commands.try_send(Command::Send(frame)) {
            Ok(()) if open => SendOutcome::Sent,
            Ok(()) => SendOutcome::Buffered,
            Err(e) => {
                log::warn!("Dropping {kind} frame: {e}");
                SendOutcome::Dropped
            }
        }
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

enum DriveExit {
    Lost,
    Cancelled,
}

struct SessionActor {
    config: SessionConfig,
    state: Arc<watch::Sender<ConnectionState>>,
    events: broadcast::Sender<SessionEvent>,
    inbound: Inbound,
    commands: mpsc::Receiver<Command>,
    cancel: CancellationToken,
    /// Frames held under `SendPolicy::Buffer`
    held: VecDeque<ClientFrame>,
    attempt: u32,
}

impl SessionActor {
    async fn run(mut self, first: oneshot::Sender<Result<(), SessionError>>) {
        let mut first = Some(first);
        let mut opened_before = false;

        loop {
            self.set_state(ConnectionState::Connecting);
            let connect = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                r = tokio::time::timeout(
                    self.config.connect_timeout,
                    tokio_tungstenite::connect_async(self.config.url.as_str()),
                ) => r,
            };

            match connect {
                Ok(Ok((ws, _))) => {
                    self.attempt = 0;
                    self.set_state(ConnectionState::Connected);
                    if let Some(tx) = first.take() {
                        let _ = tx.send(Ok(()));
                    }
                    self.emit(SessionEvent::Opened {
                        reconnect: opened_before,
                    });
                    opened_before = true;
                    log::info!("Session {} connected to {}", self.config.user_id, self.config.url);

                    if let DriveExit::Cancelled = self.drive(ws).await {
                        break;
                    }
                    log::debug!("Session {} lost its transport", self.config.user_id);
                }
                Ok(Err(e)) => {
                    log::debug!("Connect to {} failed: {e}", self.config.url);
                    if let Some(tx) = first.take() {
                        let _ = tx.send(Err(SessionError::Transport(e.to_string())));
                    }
                }
                Err(_) => {
                    log::debug!("Connect to {} timed out", self.config.url);
                    if let Some(tx) = first.take() {
                        let _ = tx.send(Err(SessionError::Transport("connect timed out".into())));
                    }
                }
            }

            if self.attempt >= self.config.max_reconnect_attempts {
                log::error!(
                    "Session {} giving up after {} reconnect attempts",
                    self.config.user_id,
                    self.attempt
                );
                self.set_state(ConnectionState::Disconnected);
                self.emit(SessionEvent::GaveUp {
                    attempts: self.attempt,
                });
                return;
            }

            let delay = self.config.backoff.delay(self.attempt);
            log::info!(
                "Session {} reconnecting in {delay:?} (attempt {})",
                self.config.user_id,
                self.attempt + 1
            );
            self.set_state(ConnectionState::Reconnecting);
            self.emit(SessionEvent::ReconnectScheduled {
                attempt: self.attempt,
                delay,
            });
            self.attempt += 1;

            if self.wait_backoff(delay).await.is_err() {
                break;
            }
        }

        self.set_state(ConnectionState::Closed);
        self.emit(SessionEvent::Closed);
    }

    /// Pump one open connection until it drops or the session is cancelled.
    async fn drive(&mut self, ws: WsStream) -> DriveExit {
        let (mut sink, mut stream) = ws.split();

        let register = ClientFrame::register(
            self.config.user_id.clone(),
            self.config.token.clone(),
            self.config.metadata.clone(),
        );
        if let Err(e) = write_frame(&mut sink, &register).await {
            log::debug!("Register write failed: {e}");
            return DriveExit::Lost;
        }

        while let Some(frame) = self.held.pop_front() {
            if let Err(e) = write_frame(&mut sink, &frame).await {
                log::debug!("Flush of held {} frame failed: {e}", frame.kind());
                self.held.push_front(frame);
                return DriveExit::Lost;
            }
        }

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.farewell(&mut sink).await;
                    return DriveExit::Cancelled;
                }
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Send(frame)) => {
                        if let Err(e) = write_frame(&mut sink, &frame).await {
                            log::debug!("Write of {} frame failed: {e}", frame.kind());
                            self.hold(frame);
                            return DriveExit::Lost;
                        }
                    }
                    None => {
                        self.farewell(&mut sink).await;
                        return DriveExit::Cancelled;
                    }
                },
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.dispatch(text.as_str()).await,
                    Some(Ok(Message::Close(_))) | None => return DriveExit::Lost,
                    Some(Err(e)) => {
                        log::debug!("Transport error: {e}");
                        return DriveExit::Lost;
                    }
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    async fn farewell(&self, sink: &mut WsSink) {
        let bye = ClientFrame::unregister(self.config.user_id.clone());
        if let Err(e) = write_frame(sink, &bye).await {
            log::debug!("Unregister not delivered: {e}");
        }
        let _ = sink.close().await;
    }

    /// Sleep out a backoff delay while still applying the send policy to
    /// frames that arrive in the meantime.
    async fn wait_backoff(&mut self, delay: Duration) -> Result<(), Cancelled> {
        let cancel = self.cancel.clone();
        let sleep = cancellable_sleep(&cancel, delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                r = &mut sleep => return r,
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Send(frame)) => self.hold(frame),
                    None => return Err(Cancelled),
                },
            }
        }
    }

    async fn dispatch(&mut self, text: &str) {
        let frame = match ServerFrame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Dropping malformed frame: {e}");
                return;
            }
        };
        match frame {
            ServerFrame::Registered { .. } => {
                self.set_state(ConnectionState::Registered);
                self.emit(SessionEvent::Registered);
            }
            ServerFrame::Error { .. } => {
                let message = frame.error_message().unwrap_or_default();
                log::warn!("Relay reported error: {message}");
                self.emit(SessionEvent::ServerError(message));
            }
            ServerFrame::Unknown => log::trace!("Ignoring frame of unknown type"),
            other => self.deliver(other).await,
        }
    }

    async fn deliver(&self, frame: ServerFrame) {
        let route = self.inbound.lock().unwrap_or_else(|p| p.into_inner()).clone();
        let Some(tx) = route else {
            self.emit(SessionEvent::Message(frame));
            return;
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {}
            sent = tx.send(frame) => {
                if let Err(mpsc::error::SendError(frame)) = sent {
                    log::debug!("Message receiver for {} dropped", self.config.user_id);
                    let mut inbound = self.inbound.lock().unwrap_or_else(|p| p.into_inner());
                    if inbound.as_ref().is_some_and(|current| current.same_channel(&tx)) {
                        *inbound = None;
                    }
                    drop(inbound);
                    self.emit(SessionEvent::Message(frame));
                }
            }
        }
    }

    fn hold(&mut self, frame: ClientFrame) {
        match self.config.send_policy {
            SendPolicy::Drop => {
                log::warn!("Dropping {} frame: transport not open", frame.kind());
            }
            SendPolicy::Buffer { max_frames } => {
                if max_frames == 0 {
                    log::warn!("Dropping {} frame: send buffer disabled", frame.kind());
                    return;
                }
                while self.held.len() >= max_frames {
                    if let Some(evicted) = self.held.pop_front() {
                        log::warn!("Send buffer full; evicting oldest {} frame", evicted.kind());
                    }
                }
                self.held.push_back(frame);
            }
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            log::trace!("Session {}: {prev:?} -> {next:?}", self.config.user_id);
        }
    }

    fn emit(&self, event: SessionEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

async fn write_frame(sink: &mut WsSink, frame: &ClientFrame) -> Result<(), SessionError> {
    let text = frame.encode()?;
    sink.send(Message::Text(text.into()))
        .await
        .map_err(|e| SessionError::Transport(e.to_string()))
}
