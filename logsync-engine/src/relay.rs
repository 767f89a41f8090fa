//! Minimal in-process WebSocket relay.
//!
//! ```text
//! Client A ──┐                       ┌──► Client B (friends/public, or member of group)
//!            ├── connection task ── broadcast ──┤
//! Client C ──┘        │                         └──► Client C (filters out its own frames)
//!                     └── online registry (conn id → account id)
//! ```
//!
//! Every connection task subscribes to one shared broadcast channel and
//! filters by audience locally, so a fan-out is a single `send`. The relay
//! does no authentication and stores nothing.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::protocol::{ClientFrame, ReceiveLogsData, ServerFrame, Target};

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per connection before it starts lagging
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 1024,
        }
    }
}

impl RelayConfig {
    /// Ephemeral localhost port.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            broadcast_capacity: 256,
        }
    }
}

/// Relay counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_relayed: u64,
    pub frames_dropped: u64,
    pub malformed_frames: u64,
}

#[derive(Default)]
struct AtomicRelayStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    frames_relayed: AtomicU64,
    frames_dropped: AtomicU64,
    malformed_frames: AtomicU64,
}

#[derive(Debug, Clone)]
enum Audience {
    Everyone,
    Group(String),
}

/// One pre-encoded frame on the shared fan-out channel.
#[derive(Debug)]
struct Outbound {
    from: Uuid,
    audience: Audience,
    text: String,
}

struct RelayShared {
    fanout: broadcast::Sender<Arc<Outbound>>,
    online: RwLock<HashMap<Uuid, String>>,
    stats: AtomicRelayStats,
}

pub struct RelayServer {
    config: RelayConfig,
    shared: Arc<RelayShared>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let (fanout, _) = broadcast::channel(config.broadcast_capacity.max(1));
        Self {
            config,
            shared: Arc::new(RelayShared {
                fanout,
                online: RwLock::new(HashMap::new()),
                stats: AtomicRelayStats::default(),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Bind `config.bind_addr` and serve until the process exits.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|e| RelayError::Bind(format!("{}: {e}", self.config.bind_addr)))?;
        self.serve(listener, CancellationToken::new()).await
    }

    /// Bind and serve on a background task.
    pub async fn spawn(config: RelayConfig) -> Result<RelayHandle, RelayError> {
        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .map_err(|e| RelayError::Bind(format!("{}: {e}", config.bind_addr)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| RelayError::Io(e.to_string()))?;
        let server = Arc::new(Self::new(config));
        let cancel = CancellationToken::new();

        let task = {
            let server = server.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve(listener, cancel).await {
                    log::error!("Relay on {addr} stopped: {e}");
                }
            })
        };
        Ok(RelayHandle {
            addr,
            server,
            cancel,
            task,
        })
    }

    /// Accept loop on an already bound listener.
    pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) -> Result<(), RelayError> {
        if let Ok(addr) = listener.local_addr() {
            log::info!("Relay listening on {addr}");
        }
        loop {
            let (stream, addr) = tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("Relay shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => accepted.map_err(|e| RelayError::Io(e.to_string()))?,
            };
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, shared, cancel).await {
                    log::debug!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn online_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.shared.online.read().await.values().cloned().collect();
        users.sort();
        users.dedup();
        users
    }

    pub fn stats(&self) -> RelayStats {
        let s = &self.shared.stats;
        RelayStats {
            total_connections: s.total_connections.load(Ordering::Relaxed),
            active_connections: s.active_connections.load(Ordering::Relaxed),
            frames_relayed: s.frames_relayed.load(Ordering::Relaxed),
            frames_dropped: s.frames_dropped.load(Ordering::Relaxed),
            malformed_frames: s.malformed_frames.load(Ordering::Relaxed),
        }
    }
}

/// A relay serving on a background task.
pub struct RelayHandle {
    addr: SocketAddr,
    server: Arc<RelayServer>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RelayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn server(&self) -> &RelayServer {
        &self.server
    }

    /// Stop accepting and close every open connection.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Per-connection state, owned by the connection task.
#[derive(Default)]
struct Peer {
    user_id: Option<String>,
    groups: HashSet<String>,
}

impl Peer {
    fn accepts(&self, audience: &Audience) -> bool {
        if self.user_id.is_none() {
            return false;
        }
        match audience {
            Audience::Everyone => true,
            Audience::Group(id) => self.groups.contains(id),
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<RelayShared>,
    cancel: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let conn_id = Uuid::new_v4();
    let mut fanout_rx = shared.fanout.subscribe();
    let mut peer = Peer::default();

    shared.stats.total_connections.fetch_add(1, Ordering::Relaxed);
    shared.stats.active_connections.fetch_add(1, Ordering::Relaxed);
    log::debug!("WebSocket connection {conn_id} established from {addr}");

    let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = async {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = ws_sender.close().await;
                    break;
                }
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        let replies = handle_frame(text.as_str(), conn_id, &mut peer, &shared).await;
                        for reply in replies {
                            ws_sender.send(Message::Text(reply.into())).await?;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(_)) => {}
                },
                outbound = fanout_rx.recv() => match outbound {
                    Ok(out) => {
                        if out.from != conn_id && peer.accepts(&out.audience) {
                            ws_sender.send(Message::Text(out.text.as_str().into())).await?;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Connection {conn_id} lagged; dropped {n} frames");
                        shared.stats.frames_dropped.fetch_add(n, Ordering::Relaxed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        Ok(())
    }
    .await;

    go_offline(conn_id, &mut peer, &shared).await;
    shared.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    log::debug!("Connection {conn_id} from {addr} closed");
    result
}

/// Apply one client frame. Returns frames to send back to this client only.
async fn handle_frame(text: &str, conn_id: Uuid, peer: &mut Peer, shared: &RelayShared) -> Vec<String> {
    let frame = match ClientFrame::decode(text) {
        Ok(frame) => frame,
        Err(e) => {
            shared.stats.malformed_frames.fetch_add(1, Ordering::Relaxed);
            log::warn!("Malformed frame on {conn_id}: {e}");
            return encode_all([ServerFrame::error(format!("malformed frame: {e}"))]);
        }
    };

    match frame {
        ClientFrame::Register { user_id, .. } => {
            if peer.user_id.is_some() {
                go_offline(conn_id, peer, shared).await;
            }
            let already_online: Vec<String> = {
                let mut online = shared.online.write().await;
                let others = online
                    .iter()
                    .filter(|(id, user)| **id != conn_id && **user != user_id)
                    .map(|(_, user)| user.clone())
                    .collect::<HashSet<_>>()
                    .into_iter()
                    .collect();
                online.insert(conn_id, user_id.clone());
                others
            };
            peer.user_id = Some(user_id.clone());
            log::info!("Registered {user_id} on {conn_id}");
            publish(shared, conn_id, Audience::Everyone, &ServerFrame::UserOnline { user_id: user_id.clone() });

            let mut replies = vec![ServerFrame::Registered { user_id: Some(user_id) }];
            replies.extend(already_online.into_iter().map(|user_id| ServerFrame::UserOnline { user_id }));
            encode_all(replies)
        }
        ClientFrame::Unregister { .. } => {
            go_offline(conn_id, peer, shared).await;
            Vec::new()
        }
        ClientFrame::JoinGroups { data } => {
            log::debug!("{conn_id} joined {} groups", data.group_ids.len());
            peer.groups = data.group_ids.into_iter().collect();
            Vec::new()
        }
        ClientFrame::SendLogs { data } => {
            let Some(sender_id) = peer.user_id.clone() else {
                return encode_all([ServerFrame::error("send_logs before register")]);
            };
            let (audience, group_id) = match data.target {
                Target::Group { group_id } => (Audience::Group(group_id.clone()), Some(group_id)),
                Target::Friends | Target::Public => (Audience::Everyone, None),
            };
            let relayed = ServerFrame::ReceiveLogs {
                data: ReceiveLogsData {
                    sender_id,
                    group_id,
                    payload: data.payload,
                },
            };
            publish(shared, conn_id, audience, &relayed);
            Vec::new()
        }
    }
}

async fn go_offline(conn_id: Uuid, peer: &mut Peer, shared: &RelayShared) {
    let Some(user_id) = peer.user_id.take() else {
        return;
    };
    let still_online = {
        let mut online = shared.online.write().await;
        online.remove(&conn_id);
        online.values().any(|u| *u == user_id)
    };
    if !still_online {
        log::info!("{user_id} went offline");
        publish(shared, conn_id, Audience::Everyone, &ServerFrame::UserOffline { user_id });
    }
}

fn publish(shared: &RelayShared, from: Uuid, audience: Audience, frame: &ServerFrame) {
    let text = match frame.encode() {
        Ok(text) => text,
        Err(e) => {
            log::error!("Failed to encode relay frame: {e}");
            return;
        }
    };
    // zero receivers is not an error for a relay
    let _ = shared.fanout.send(Arc::new(Outbound { from, audience, text }));
    shared.stats.frames_relayed.fetch_add(1, Ordering::Relaxed);
}

fn encode_all(frames: impl IntoIterator<Item = ServerFrame>) -> Vec<String> {
    frames
        .into_iter()
        .filter_map(|f| match f.encode() {
            Ok(text) => Some(text),
            Err(e) => {
                log::error!("Failed to encode reply: {e}");
                None
            }
        })
        .collect()
}

/// Relay errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    Bind(String),
    Io(String),
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bind(e) => write!(f, "Bind failed: {e}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for RelayError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_audience_filter() {
        let mut peer = Peer::default();
        assert!(!peer.accepts(&Audience::Everyone));

        peer.user_id = Some("acct-a".into());
        assert!(peer.accepts(&Audience::Everyone));
        assert!(!peer.accepts(&Audience::Group("g1".into())));

        peer.groups.insert("g1".into());
        assert!(peer.accepts(&Audience::Group("g1".into())));
    }

    #[tokio::test]
    async fn test_register_and_offline_bookkeeping() {
        let server = RelayServer::new(RelayConfig::for_testing());
        let shared = server.shared.clone();
        let mut rx = shared.fanout.subscribe();
        let conn = Uuid::new_v4();
        let mut peer = Peer::default();

        let replies = handle_frame(
            r#"{"type":"register","userId":"acct-a","token":"t"}"#,
            conn,
            &mut peer,
            &shared,
        )
        .await;
        assert_eq!(replies.len(), 1);
        assert_eq!(
            ServerFrame::decode(&replies[0]).unwrap(),
            ServerFrame::Registered { user_id: Some("acct-a".into()) }
        );
        assert_eq!(server.online_users().await, vec!["acct-a".to_string()]);

        let announced = rx.recv().await.unwrap();
        assert_eq!(
            ServerFrame::decode(&announced.text).unwrap(),
            ServerFrame::UserOnline { user_id: "acct-a".into() }
        );

        go_offline(conn, &mut peer, &shared).await;
        assert!(server.online_users().await.is_empty());
        let gone = rx.recv().await.unwrap();
        assert_eq!(
            ServerFrame::decode(&gone.text).unwrap(),
            ServerFrame::UserOffline { user_id: "acct-a".into() }
        );
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_error_reply() {
        let server = RelayServer::new(RelayConfig::for_testing());
        let mut peer = Peer::default();
        let replies = handle_frame("{oops", Uuid::new_v4(), &mut peer, &server.shared).await;
        let reply = ServerFrame::decode(&replies[0]).unwrap();
        assert!(reply.error_message().unwrap().starts_with("malformed frame"));
        assert_eq!(server.stats().malformed_frames, 1);
    }

    #[tokio::test]
    async fn test_send_logs_requires_registration() {
        let server = RelayServer::new(RelayConfig::for_testing());
        let mut peer = Peer::default();
        let frame = ClientFrame::send_logs(&[], Target::Public).unwrap().encode().unwrap();
        let replies = handle_frame(&frame, Uuid::new_v4(), &mut peer, &server.shared).await;
        let reply = ServerFrame::decode(&replies[0]).unwrap();
        assert_eq!(reply.error_message().as_deref(), Some("send_logs before register"));
    }
}
