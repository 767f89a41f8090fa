//! Per-client sync driver.
//!
//! ```text
//!  producers ──ingest/play──► SyncOrchestrator ──send_logs──► ConnectionSession ──► relay
//!                                  │    ▲                            │
//!                   merge + trim   │    └──── receive_logs ◄─────────┘
//!                                  ▼
//!                      LogBook (self / friend / group) ──save──► PersistentCache
//! ```
//!
//! The orchestrator owns its session and a driver task that consumes
//! session events: on every open it re-sends `join_groups`, inbound batches
//! are merged into the matching friend or group collection and persisted.
//! Inbound frames arrive over the session's lossless message channel, so a
//! slow cache write delays later batches but never drops them.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::aggregate::{SpreeAggregator, SpreeRules};
use crate::cache::{PersistentCache, SaveOutcome, SourceKey, SourceKind};
use crate::delay::cancellable_sleep;
use crate::event::LogEvent;
use crate::protocol::{ClientFrame, ReceiveLogsData, ServerFrame, Target};
use crate::scoreboard::{compute_scoreboard, ScoreboardContext, ScoreboardEntry};
use crate::session::{ConnectionSession, ConnectionState, SendOutcome, SessionConfig, SessionError, SessionEvent};
use crate::store::{self, LogCollection, DEFAULT_MEMORY_LIMIT};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub session: SessionConfig,
    /// Groups announced with `join_groups` on every open
    pub groups: Vec<String>,
    /// Where ingested batches are delivered
    pub target: Target,
    /// Per-collection retention
    pub memory_limit: usize,
    pub spree_rules: SpreeRules,
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            groups: Vec::new(),
            target: Target::Friends,
            memory_limit: DEFAULT_MEMORY_LIMIT,
            spree_rules: SpreeRules::default(),
            event_capacity: 256,
        }
    }
}

impl OrchestratorConfig {
    pub fn new(session: SessionConfig) -> Self {
        Self {
            session,
            ..Self::default()
        }
    }

    pub fn for_testing(url: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            memory_limit: 100,
            ..Self::new(SessionConfig::for_testing(url, user_id))
        }
    }
}

/// Local view of every source this client knows about.
#[derive(Debug, Clone, Default)]
pub struct LogBook {
    pub own: LogCollection,
    pub friends: HashMap<String, LogCollection>,
    pub groups: HashMap<String, LogCollection>,
}

impl LogBook {
    pub fn collection(&self, source: &SourceKey) -> Option<&LogCollection> {
        match source.kind {
            SourceKind::Own => Some(&self.own),
            SourceKind::Friend => self.friends.get(&source.id),
            SourceKind::Group => self.groups.get(&source.id),
        }
    }

    pub fn collection_mut(&mut self, source: &SourceKey) -> &mut LogCollection {
        match source.kind {
            SourceKind::Own => &mut self.own,
            SourceKind::Friend => self.friends.entry(source.id.clone()).or_default(),
            SourceKind::Group => self.groups.entry(source.id.clone()).or_default(),
        }
    }

    /// Every known event, deduplicated by id and sorted.
    pub fn all_events(&self) -> Vec<LogEvent> {
        let all = self
            .own
            .iter()
            .chain(self.friends.values().flat_map(LogCollection::iter))
            .chain(self.groups.values().flat_map(LogCollection::iter))
            .cloned();
        store::dedupe_and_sort(all)
    }

    pub fn clear(&mut self) {
        self.own.clear();
        self.friends.clear();
        self.groups.clear();
    }
}

/// Notifications for the host application.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected { reconnect: bool },
    LogsUpdated { source: SourceKey, count: usize },
    FriendOnline(String),
    FriendOffline(String),
    ServerError(String),
    /// Session gave up; no more reconnects will happen
    Fatal(SessionError),
}

/// What one `ingest` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestReport {
    /// Own collection size after merge and trim
    pub total: usize,
    /// Oldest events dropped by the memory limit
    pub trimmed: usize,
    pub persisted: SaveOutcome,
    pub sent: SendOutcome,
}

struct Shared {
    config: OrchestratorConfig,
    session: ConnectionSession,
    cache: Arc<PersistentCache>,
    book: Mutex<LogBook>,
    online: Mutex<HashSet<String>>,
    groups: Mutex<Vec<String>>,
    events: broadcast::Sender<SyncEvent>,
}

impl Shared {
    fn own_key(&self) -> SourceKey {
        SourceKey::own(self.config.session.user_id.clone())
    }

    fn book(&self) -> MutexGuard<'_, LogBook> {
        self.book.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    fn join_groups(&self) {
        let groups = self.groups.lock().unwrap_or_else(|p| p.into_inner()).clone();
        if groups.is_empty() {
            return;
        }
        self.session.send(ClientFrame::join_groups(groups));
    }

    /// Merge `events` into `source`, trim, persist and notify.
    fn absorb(&self, source: &SourceKey, events: Vec<LogEvent>) -> (usize, usize, SaveOutcome) {
        let (snapshot, trimmed) = {
            let mut book = self.book();
            let collection = book.collection_mut(source);
            collection.merge(events);
            let trimmed = collection.apply_memory_limit(self.config.memory_limit);
            (collection.as_slice().to_vec(), trimmed)
        };
        if trimmed > 0 {
            log::debug!("Trimmed {trimmed} old events from {source}");
        }
        let persisted = self.cache.save(source, &snapshot);
        self.emit(SyncEvent::LogsUpdated {
            source: source.clone(),
            count: snapshot.len(),
        });
        (snapshot.len(), trimmed, persisted)
    }

    fn receive(&self, data: ReceiveLogsData) {
        let source = match &data.group_id {
            Some(group) => SourceKey::group(group.clone()),
            None => SourceKey::friend(data.sender_id.clone()),
        };
        let events = match data.payload.into_events() {
            Ok(events) => events,
            Err(e) => {
                log::warn!("Dropping undecodable batch from {}: {e}", data.sender_id);
                return;
            }
        };
        log::debug!("Received {} events for {source}", events.len());
        self.absorb(&source, events);
    }

    fn on_frame(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::ReceiveLogs { data } => self.receive(data),
            ServerFrame::UserOnline { user_id } => {
                if user_id != self.config.session.user_id {
                    self.online.lock().unwrap_or_else(|p| p.into_inner()).insert(user_id.clone());
                    self.emit(SyncEvent::FriendOnline(user_id));
                }
            }
            ServerFrame::UserOffline { user_id } => {
                self.online.lock().unwrap_or_else(|p| p.into_inner()).remove(&user_id);
                self.emit(SyncEvent::FriendOffline(user_id));
            }
            other => log::trace!("Ignoring {other:?}"),
        }
    }

    fn hydrate(&self) {
        let own = self.own_key();
        let mut loaded = vec![(own.clone(), self.cache.load(&own))];
        for kind in [SourceKind::Friend, SourceKind::Group] {
            match self.cache.list_sources(kind) {
                Ok(ids) => loaded.extend(ids.into_iter().map(|id| {
                    let key = SourceKey { kind, id };
                    let logs = self.cache.load(&key);
                    (key, logs)
                })),
                Err(e) => log::warn!("Could not list cached {kind} sources: {e}"),
            }
        }

        let mut book = self.book();
        for (key, logs) in loaded {
            if logs.is_empty() {
                continue;
            }
            log::debug!("Hydrated {} events for {key}", logs.len());
            let collection = book.collection_mut(&key);
            collection.merge(logs);
            collection.apply_memory_limit(self.config.memory_limit);
        }
    }
}

/// One client's sync engine. Create with [`SyncOrchestrator::new`], then
/// `start`, and `stop` when done.
pub struct SyncOrchestrator {
    shared: Arc<Shared>,
    cancel: Mutex<CancellationToken>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl SyncOrchestrator {
    pub fn new(config: OrchestratorConfig, cache: Arc<PersistentCache>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let session = ConnectionSession::new(config.session.clone());
        let groups = config.groups.clone();
        Self {
            shared: Arc::new(Shared {
                config,
                session,
                cache,
                book: Mutex::new(LogBook::default()),
                online: Mutex::new(HashSet::new()),
                groups: Mutex::new(groups),
                events,
            }),
            cancel: Mutex::new(CancellationToken::new()),
            driver: Mutex::new(None),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.shared.config.session.user_id
    }

    pub fn session(&self) -> &ConnectionSession {
        &self.shared.session
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.session.state()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.events.subscribe()
    }

    /// Hydrate from the cache, then connect.
    ///
    /// Returns the session's start result; a failed first connect keeps
    /// retrying in the background.
    pub async fn start(&self) -> Result<(), SessionError> {
        self.shared.hydrate();

        let cancel = {
            let mut cancel = self.cancel.lock().unwrap_or_else(|p| p.into_inner());
            if cancel.is_cancelled() {
                *cancel = CancellationToken::new();
            }
            cancel.clone()
        };

        {
            let mut driver = self.driver.lock().unwrap_or_else(|p| p.into_inner());
            if driver.as_ref().map_or(true, |d| d.is_finished()) {
                let rx = self.shared.session.subscribe();
                let inbound = self.shared.session.messages();
                *driver = Some(tokio::spawn(drive(self.shared.clone(), rx, inbound, cancel)));
            }
        }

        self.shared.session.start().await
    }

    /// Cancel pending delays, unregister and close. Idempotent.
    pub async fn stop(&self) {
        self.current_cancel().cancel();
        self.shared.session.stop().await;
        let driver = self.driver.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(driver) = driver {
            let _ = driver.await;
        }
    }

    /// Merge new local events into "my logs", persist them and send them
    /// to the configured target.
    pub fn ingest(&self, events: Vec<LogEvent>) -> Result<IngestReport, SessionError> {
        let frame = ClientFrame::send_logs(&events, self.shared.config.target.clone())?;
        let own = self.shared.own_key();
        let (total, trimmed, persisted) = self.shared.absorb(&own, events);
        let sent = self.shared.session.send(frame);
        Ok(IngestReport {
            total,
            trimmed,
            persisted,
            sent,
        })
    }

    /// Ingest `events` one at a time, `pace` apart.
    ///
    /// Fails with [`SessionError::Cancelled`] if `stop()` interrupts it.
    pub async fn play(&self, events: Vec<LogEvent>, pace: Duration) -> Result<usize, SessionError> {
        let cancel = self.current_cancel();
        let mut played = 0;
        for event in events {
            if played > 0 {
                cancellable_sleep(&cancel, pace).await?;
            } else if cancel.is_cancelled() {
                return Err(SessionError::Cancelled);
            }
            self.ingest(vec![event])?;
            played += 1;
        }
        Ok(played)
    }

    pub fn my_logs(&self) -> Vec<LogEvent> {
        self.shared.book().own.as_slice().to_vec()
    }

    pub fn friend_logs(&self, account_id: &str) -> Vec<LogEvent> {
        self.logs(&SourceKey::friend(account_id))
    }

    pub fn group_logs(&self, group_id: &str) -> Vec<LogEvent> {
        self.logs(&SourceKey::group(group_id))
    }

    pub fn logs(&self, source: &SourceKey) -> Vec<LogEvent> {
        self.shared
            .book()
            .collection(source)
            .map(|c| c.as_slice().to_vec())
            .unwrap_or_default()
    }

    /// Snapshot of the whole log book.
    pub fn log_book(&self) -> LogBook {
        self.shared.book().clone()
    }

    /// Kill-spree view of one source.
    pub fn aggregated(&self, source: &SourceKey) -> Vec<LogEvent> {
        let logs = self.logs(source);
        SpreeAggregator::new(self.shared.config.spree_rules).aggregate(&logs)
    }

    /// Scoreboard over every known event.
    pub fn scoreboard(&self, ctx: &ScoreboardContext<'_>) -> Vec<ScoreboardEntry> {
        let events = self.shared.book().all_events();
        compute_scoreboard(&events, ctx)
    }

    pub fn online_friends(&self) -> Vec<String> {
        let mut online: Vec<String> = self
            .shared
            .online
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect();
        online.sort();
        online
    }

    pub fn groups(&self) -> Vec<String> {
        self.shared.groups.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Add a group and re-announce membership.
    pub fn join_group(&self, group_id: impl Into<String>) {
        let group_id = group_id.into();
        {
            let mut groups = self.shared.groups.lock().unwrap_or_else(|p| p.into_inner());
            if groups.contains(&group_id) {
                return;
            }
            groups.push(group_id);
        }
        self.shared.join_groups();
    }

    /// Forget a friend and destroy their cache.
    pub fn remove_friend(&self, account_id: &str) -> Result<(), crate::cache::CacheError> {
        self.shared.book().friends.remove(account_id);
        self.shared.online.lock().unwrap_or_else(|p| p.into_inner()).remove(account_id);
        self.shared.cache.clear(&SourceKey::friend(account_id))
    }

    /// Leave a group and destroy its cache.
    pub fn remove_group(&self, group_id: &str) -> Result<(), crate::cache::CacheError> {
        self.shared.book().groups.remove(group_id);
        let remaining = {
            let mut groups = self.shared.groups.lock().unwrap_or_else(|p| p.into_inner());
            groups.retain(|g| g != group_id);
            groups.clone()
        };
        if self.connection_state().is_open() {
            self.shared.session.send(ClientFrame::join_groups(remaining));
        }
        self.shared.cache.clear(&SourceKey::group(group_id))
    }

    /// Stop, then wipe every in-memory and cached source.
    pub async fn logout(&self) -> Result<usize, crate::cache::CacheError> {
        self.stop().await;
        self.shared.book().clear();
        self.shared.online.lock().unwrap_or_else(|p| p.into_inner()).clear();
        self.shared.cache.clear_all()
    }

    fn current_cancel(&self) -> CancellationToken {
        self.cancel.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

async fn drive(
    shared: Arc<Shared>,
    mut rx: broadcast::Receiver<SessionEvent>,
    mut inbound: mpsc::Receiver<ServerFrame>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            Some(frame) = inbound.recv() => {
                shared.on_frame(frame);
                continue;
            }
            event = rx.recv() => event,
        };
        match event {
            Ok(SessionEvent::Opened { reconnect }) => {
                shared.join_groups();
                shared.emit(SyncEvent::Connected { reconnect });
            }
            Ok(SessionEvent::Message(frame)) => shared.on_frame(frame),
            Ok(SessionEvent::ServerError(message)) => shared.emit(SyncEvent::ServerError(message)),
            Ok(SessionEvent::GaveUp { attempts }) => {
                shared.emit(SyncEvent::Fatal(SessionError::GaveUp { attempts }));
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                // lifecycle only; application frames use `inbound`
                log::warn!("Orchestrator for {} missed {n} session events", shared.config.session.user_id);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{keys, EventType};
    use crate::protocol::LogPayload;

    fn orchestrator(limit: usize) -> SyncOrchestrator {
        let mut config = OrchestratorConfig::for_testing(crate::session::DEFAULT_RELAY_URL, "acct-a");
        config.memory_limit = limit;
        SyncOrchestrator::new(config, Arc::new(PersistentCache::in_memory()))
    }

    fn kill(id: &str, minute: u32) -> LogEvent {
        LogEvent::new(id, "acct-a", EventType::ActorDeath, format!("2025-05-01T20:{minute:02}:00Z"))
            .with_player("Alice")
            .with_meta(keys::KILLER_NAME, "Alice")
            .with_meta(keys::VICTIM_NAME, "Bob")
    }

    #[test]
    fn test_ingest_offline_merges_persists_and_drops_send() {
        let orch = orchestrator(100);
        let report = orch.ingest(vec![kill("k2", 2), kill("k1", 1)]).unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.persisted, SaveOutcome::Saved);
        assert_eq!(report.sent, SendOutcome::Dropped);

        let ids: Vec<String> = orch.my_logs().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["k1", "k2"]);
    }

    #[test]
    fn test_ingest_trims_to_memory_limit() {
        let orch = orchestrator(3);
        let events: Vec<LogEvent> = (0..5).map(|i| kill(&format!("k{i}"), i)).collect();
        let report = orch.ingest(events).unwrap();
        assert_eq!(report.total, 3);
        assert_eq!(report.trimmed, 2);
        assert_eq!(orch.my_logs()[0].id, "k2");
    }

    #[test]
    fn test_receive_routes_by_group_or_sender() {
        let orch = orchestrator(100);
        let payload = LogPayload::from_events(&[kill("k1", 1)]).unwrap();
        orch.shared.receive(ReceiveLogsData {
            sender_id: "acct-b".into(),
            group_id: None,
            payload: payload.clone(),
        });
        orch.shared.receive(ReceiveLogsData {
            sender_id: "acct-c".into(),
            group_id: Some("g1".into()),
            payload,
        });
        assert_eq!(orch.friend_logs("acct-b").len(), 1);
        assert_eq!(orch.group_logs("g1").len(), 1);
        assert!(orch.friend_logs("acct-c").is_empty());
    }

    #[test]
    fn test_aggregated_view_groups_sprees() {
        let orch = orchestrator(100);
        orch.ingest(vec![kill("k1", 1), kill("k2", 2), kill("k3", 3)]).unwrap();
        let view = orch.aggregated(&SourceKey::own("acct-a"));
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].event_type, EventType::KillingSpree);
        assert_eq!(orch.my_logs().len(), 3);
    }

    #[test]
    fn test_remove_friend_clears_memory_and_cache() {
        let orch = orchestrator(100);
        let fresh = LogEvent::new("f1", "acct-b", EventType::LandingPad, chrono::Utc::now().to_rfc3339());
        orch.shared.absorb(&SourceKey::friend("acct-b"), vec![fresh]);
        assert_eq!(orch.shared.cache.list_sources(SourceKind::Friend).unwrap(), vec!["acct-b"]);

        orch.remove_friend("acct-b").unwrap();
        assert!(orch.friend_logs("acct-b").is_empty());
        assert!(orch.shared.cache.list_sources(SourceKind::Friend).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_interrupts_play() {
        let orch = Arc::new(orchestrator(100));
        let events: Vec<LogEvent> = (0..3).map(|i| kill(&format!("k{i}"), i)).collect();
        let player = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.play(events, Duration::from_secs(60)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        orch.stop().await;

        let result = player.await.unwrap();
        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(orch.my_logs().len(), 1);
    }
}
