//! Per-source persistent log cache.
//!
//! ```text
//! PersistentCache ── key "logsync:{self|friend|group}:{id}"
//!        │                 value {version, lastUpdated, logs, sourceType?, sourceId?}
//!        ├── CacheBackend (RocksBackend on desktop, MemoryBackend in tests)
//!        └── MemoryBackend fallback once the backend reports Unavailable
//! ```
//!
//! Loads prune events past the retention window and persist the pruned set.
//! A save that hits the storage quota is retried once with the last 24 hours
//! only; if that also fails the save is abandoned and logged. In-memory state
//! owned by callers is never rolled back because of a failed persist.

pub mod backend;
pub mod rocks;

pub use backend::{CacheBackend, CacheError, MemoryBackend};
pub use rocks::{RocksBackend, StoreConfig};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::LogEvent;
use crate::store;

/// Envelope schema version. Anything else on disk is wiped.
pub const CACHE_VERSION: u32 = 1;

/// Events older than this are dropped on load.
pub const RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Window kept by the single retry after a quota failure.
pub const QUOTA_FALLBACK_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

pub const DEFAULT_NAMESPACE: &str = "logsync";

/// Which stream a cache entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Own,
    Friend,
    Group,
}

impl SourceKind {
    pub const ALL: [SourceKind; 3] = [SourceKind::Own, SourceKind::Friend, SourceKind::Group];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Own => "self",
            Self::Friend => "friend",
            Self::Group => "group",
        }
    }

    fn is_remote(&self) -> bool {
        !matches!(self, Self::Own)
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(kind, id)` pair addressing one cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceKey {
    pub kind: SourceKind,
    pub id: String,
}

impl SourceKey {
    pub fn own(id: impl Into<String>) -> Self {
        Self { kind: SourceKind::Own, id: id.into() }
    }

    pub fn friend(id: impl Into<String>) -> Self {
        Self { kind: SourceKind::Friend, id: id.into() }
    }

    pub fn group(id: impl Into<String>) -> Self {
        Self { kind: SourceKind::Group, id: id.into() }
    }
}

impl std::fmt::Display for SourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Stored form of one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEnvelope {
    pub version: u32,
    /// Milliseconds since the Unix epoch
    pub last_updated: i64,
    pub logs: Vec<LogEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
}

/// Result of a save attempt. Only `Abandoned` means nothing was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    /// Quota retry succeeded with `kept` events from the fallback window
    Narrowed { kept: usize },
    Abandoned,
    /// Written to the in-process fallback only
    MemoryOnly,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub namespace: String,
    pub retention: Duration,
    pub quota_fallback_window: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            retention: RETENTION,
            quota_fallback_window: QUOTA_FALLBACK_WINDOW,
        }
    }
}

impl CacheConfig {
    pub fn for_testing() -> Self {
        Self {
            namespace: "logsync-test".to_string(),
            ..Self::default()
        }
    }
}

pub struct PersistentCache {
    backend: Arc<dyn CacheBackend>,
    fallback: MemoryBackend,
    degraded: AtomicBool,
    config: CacheConfig,
}

impl PersistentCache {
    pub fn new(backend: Arc<dyn CacheBackend>, config: CacheConfig) -> Self {
        Self {
            backend,
            fallback: MemoryBackend::new(),
            degraded: AtomicBool::new(false),
            config,
        }
    }

    /// Memory-only cache, for tests and for hosts without a data directory.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()), CacheConfig::default())
    }

    /// Whether the primary backend has been abandoned for this process.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn key(&self, source: &SourceKey) -> String {
        format!("{}:{}:{}", self.config.namespace, source.kind, source.id)
    }

    fn kind_prefix(&self, kind: SourceKind) -> String {
        format!("{}:{}:", self.config.namespace, kind)
    }

    /// Load a source, pruning expired events.
    pub fn load(&self, source: &SourceKey) -> Vec<LogEvent> {
        self.load_at(source, Utc::now())
    }

    /// [`Self::load`] with an explicit clock.
    pub fn load_at(&self, source: &SourceKey, now: DateTime<Utc>) -> Vec<LogEvent> {
        let key = self.key(source);
        let raw = match self.with_backend(|b| b.get(&key)) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e @ CacheError::Corrupt(_)) => {
                self.discard(source, &key, &e);
                return Vec::new();
            }
            Err(e) => {
                log::warn!("Cache read for {source} failed: {e}");
                return Vec::new();
            }
        };

        let envelope = match decode_envelope(&raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.discard(source, &key, &e);
                return Vec::new();
            }
        };

        let total = envelope.logs.len();
        let cutoff = now - chrono_duration(self.config.retention);
        let fresh: Vec<LogEvent> = envelope
            .logs
            .into_iter()
            .filter(|e| e.parsed_timestamp().is_some_and(|ts| ts >= cutoff))
            .collect();
        let fresh = store::dedupe_and_sort(fresh);

        if fresh.len() < total {
            log::debug!("Pruned {} expired events from {source}", total - fresh.len());
            self.save_at(source, &fresh, now);
        }
        fresh
    }

    /// Persist a source.
    pub fn save(&self, source: &SourceKey, logs: &[LogEvent]) -> SaveOutcome {
        self.save_at(source, logs, Utc::now())
    }

    /// [`Self::save`] with an explicit clock.
    pub fn save_at(&self, source: &SourceKey, logs: &[LogEvent], now: DateTime<Utc>) -> SaveOutcome {
        let key = self.key(source);

        let first = self
            .encode(source, logs, now)
            .and_then(|raw| self.with_backend(|b| b.set(&key, &raw)));
        match first {
            Ok(()) if self.is_degraded() => return SaveOutcome::MemoryOnly,
            Ok(()) => return SaveOutcome::Saved,
            Err(CacheError::QuotaExceeded { .. }) => {}
            Err(e) => {
                log::error!("Abandoning cache save for {source}: {e}");
                return SaveOutcome::Abandoned;
            }
        }

        let cutoff = now - chrono_duration(self.config.quota_fallback_window);
        let recent: Vec<LogEvent> = logs
            .iter()
            .filter(|e| e.parsed_timestamp().is_some_and(|ts| ts >= cutoff))
            .cloned()
            .collect();
        log::warn!(
            "Storage quota exceeded for {source}; retrying with {} of {} events",
            recent.len(),
            logs.len()
        );

        let retry = self
            .encode(source, &recent, now)
            .and_then(|raw| self.with_backend(|b| b.set(&key, &raw)));
        match retry {
            Ok(()) if self.is_degraded() => SaveOutcome::MemoryOnly,
            Ok(()) => SaveOutcome::Narrowed { kept: recent.len() },
            Err(e) => {
                log::error!("Abandoning cache save for {source} after quota retry: {e}");
                SaveOutcome::Abandoned
            }
        }
    }

    /// Ids of every cached source of `kind`.
    pub fn list_sources(&self, kind: SourceKind) -> Result<Vec<String>, CacheError> {
        let prefix = self.kind_prefix(kind);
        let keys = self.with_backend(|b| b.keys_with_prefix(&prefix))?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    /// Destroy one source wholesale.
    pub fn clear(&self, source: &SourceKey) -> Result<(), CacheError> {
        let key = self.key(source);
        self.with_backend(|b| b.remove(&key))
    }

    /// Destroy every source in this namespace. Returns the number removed.
    pub fn clear_all(&self) -> Result<usize, CacheError> {
        let mut removed = 0;
        for kind in SourceKind::ALL {
            for id in self.list_sources(kind)? {
                self.clear(&SourceKey { kind, id })?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn encode(&self, source: &SourceKey, logs: &[LogEvent], now: DateTime<Utc>) -> Result<String, CacheError> {
        let envelope = CacheEnvelope {
            version: CACHE_VERSION,
            last_updated: now.timestamp_millis(),
            logs: logs.to_vec(),
            source_type: source.kind.is_remote().then(|| source.kind.as_str().to_string()),
            source_id: source.kind.is_remote().then(|| source.id.clone()),
        };
        serde_json::to_string(&envelope).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    /// Run `op` against the active backend, switching to the in-process
    /// fallback for good the first time the primary reports `Unavailable`.
    fn discard(&self, source: &SourceKey, key: &str, reason: &CacheError) {
        log::warn!("Discarding cache entry {source}: {reason}");
        if let Err(e) = self.with_backend(|b| b.remove(key)) {
            log::warn!("Failed to wipe cache entry {source}: {e}");
        }
    }

    fn with_backend<T>(
        &self,
        op: impl Fn(&dyn CacheBackend) -> Result<T, CacheError>,
    ) -> Result<T, CacheError> {
        if self.is_degraded() {
            return op(&self.fallback);
        }
        match op(self.backend.as_ref()) {
            Err(CacheError::Unavailable(reason)) => {
                if !self.degraded.swap(true, Ordering::SeqCst) {
                    log::warn!("Cache backend unavailable ({reason}); continuing memory-only");
                }
                op(&self.fallback)
            }
            other => other,
        }
    }
}

fn decode_envelope(raw: &str) -> Result<CacheEnvelope, CacheError> {
    let value: Value = serde_json::from_str(raw).map_err(|e| CacheError::Corrupt(e.to_string()))?;
    let version = value.get("version").and_then(Value::as_u64);
    if version != Some(u64::from(CACHE_VERSION)) {
        return Err(CacheError::Corrupt(format!("unsupported version {version:?}")));
    }
    serde_json::from_value(value).map_err(|e| CacheError::Corrupt(e.to_string()))
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;

    fn now() -> DateTime<Utc> {
        parse("2025-06-10T12:00:00Z")
    }

    fn parse(s: &str) -> DateTime<Utc> {
        crate::event::parse_timestamp(s).unwrap()
    }

    fn event_at(id: &str, at: DateTime<Utc>) -> LogEvent {
        LogEvent::new(id, "acct-a", EventType::ActorDeath, at.to_rfc3339()).with_player("Alice")
    }

    fn cache_with(backend: Arc<MemoryBackend>) -> PersistentCache {
        PersistentCache::new(backend, CacheConfig::default())
    }

    /// Stores values but fails every read as undecodable.
    struct GarbledBackend {
        inner: MemoryBackend,
    }

    impl CacheBackend for GarbledBackend {
        fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
            match self.inner.get(key)? {
                Some(_) => Err(CacheError::Corrupt("lz4 frame truncated".into())),
                None => Ok(None),
            }
        }

        fn set(&self, key: &str, value: &str) -> Result<(), CacheError> {
            self.inner.set(key, value)
        }

        fn remove(&self, key: &str) -> Result<(), CacheError> {
            self.inner.remove(key)
        }

        fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
            self.inner.keys_with_prefix(prefix)
        }
    }

    #[test]
    fn test_undecodable_backend_value_is_wiped() {
        let backend = Arc::new(GarbledBackend { inner: MemoryBackend::new() });
        let cache = PersistentCache::new(backend.clone(), CacheConfig::default());
        let source = SourceKey::friend("acct-b");
        cache.save_at(&source, &[event_at("a", now())], now());
        assert!(backend.inner.get(&cache.key(&source)).unwrap().is_some());

        assert!(cache.load_at(&source, now()).is_empty());
        assert!(backend.inner.get(&cache.key(&source)).unwrap().is_none());
        assert!(cache.list_sources(SourceKind::Friend).unwrap().is_empty());
        assert!(!cache.is_degraded());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let cache = PersistentCache::in_memory();
        let source = SourceKey::own("acct-a");
        let logs = vec![event_at("a", now() - chrono::Duration::hours(2)), event_at("b", now())];

        assert_eq!(cache.save_at(&source, &logs, now()), SaveOutcome::Saved);
        assert_eq!(cache.load_at(&source, now()), logs);
    }

    #[test]
    fn test_load_prunes_expired_and_resaves() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = cache_with(backend.clone());
        let source = SourceKey::friend("acct-b");
        let old = event_at("old", now() - chrono::Duration::days(8));
        let recent = event_at("recent", now() - chrono::Duration::hours(1));
        cache.save_at(&source, &[old, recent.clone()], now());

        let loaded = cache.load_at(&source, now());
        assert_eq!(loaded, vec![recent]);

        let raw = backend.get(&cache.key(&source)).unwrap().unwrap();
        let envelope: CacheEnvelope = serde_json::from_str(&raw).unwrap();
        assert_eq!(envelope.logs.len(), 1);
        assert_eq!(envelope.source_type.as_deref(), Some("friend"));
        assert_eq!(envelope.source_id.as_deref(), Some("acct-b"));
    }

    #[test]
    fn test_own_envelope_has_no_source_fields() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = cache_with(backend.clone());
        let source = SourceKey::own("me");
        cache.save_at(&source, &[event_at("a", now())], now());

        let raw = backend.get("logsync:self:me").unwrap().unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["version"], 1);
        assert_eq!(value["lastUpdated"], now().timestamp_millis());
        assert!(value.get("sourceType").is_none());
    }

    #[test]
    fn test_version_mismatch_wipes_entry() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = cache_with(backend.clone());
        let source = SourceKey::group("g1");
        backend
            .set(&cache.key(&source), r#"{"version":2,"lastUpdated":0,"logs":[]}"#)
            .unwrap();

        assert!(cache.load_at(&source, now()).is_empty());
        assert_eq!(backend.get(&cache.key(&source)).unwrap(), None);
    }

    #[test]
    fn test_corrupt_entry_wipes_entry() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = cache_with(backend.clone());
        let source = SourceKey::own("me");
        backend.set(&cache.key(&source), "{{{").unwrap();

        assert!(cache.load_at(&source, now()).is_empty());
        assert!(backend.is_empty());
    }

    #[test]
    fn test_quota_retry_narrows_to_last_day() {
        let source = SourceKey::own("me");
        let recent = event_at("recent", now() - chrono::Duration::hours(3));
        let mut logs: Vec<LogEvent> = (0..40)
            .map(|i| {
                event_at(&format!("old-{i}"), now() - chrono::Duration::days(3))
                    .with_line("x".repeat(200))
            })
            .collect();
        logs.push(recent.clone());

        let full = PersistentCache::in_memory().encode(&source, &logs, now()).unwrap();
        let narrow = PersistentCache::in_memory()
            .encode(&source, &[recent.clone()], now())
            .unwrap();
        let quota = "logsync:self:me".len() + (full.len() + narrow.len()) / 2;

        let cache = cache_with(Arc::new(MemoryBackend::with_quota(quota)));
        assert_eq!(cache.save_at(&source, &logs, now()), SaveOutcome::Narrowed { kept: 1 });
        assert_eq!(cache.load_at(&source, now()), vec![recent]);
    }

    #[test]
    fn test_quota_retry_failure_abandons() {
        let cache = cache_with(Arc::new(MemoryBackend::with_quota(16)));
        let source = SourceKey::own("me");
        let logs = vec![event_at("a", now())];
        assert_eq!(cache.save_at(&source, &logs, now()), SaveOutcome::Abandoned);
    }

    #[test]
    fn test_unavailable_backend_degrades_to_memory() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_available(false);
        let cache = cache_with(backend);
        let source = SourceKey::own("me");
        let logs = vec![event_at("a", now())];

        assert_eq!(cache.save_at(&source, &logs, now()), SaveOutcome::MemoryOnly);
        assert!(cache.is_degraded());
        assert_eq!(cache.load_at(&source, now()), logs);
        assert_eq!(cache.save_at(&source, &logs, now()), SaveOutcome::MemoryOnly);
    }

    #[test]
    fn test_list_and_clear_sources() {
        let cache = PersistentCache::in_memory();
        let logs = vec![event_at("a", now())];
        cache.save_at(&SourceKey::friend("f1"), &logs, now());
        cache.save_at(&SourceKey::friend("f2"), &logs, now());
        cache.save_at(&SourceKey::group("g1"), &logs, now());
        cache.save_at(&SourceKey::own("me"), &logs, now());

        assert_eq!(cache.list_sources(SourceKind::Friend).unwrap(), vec!["f1", "f2"]);

        cache.clear(&SourceKey::friend("f1")).unwrap();
        assert_eq!(cache.list_sources(SourceKind::Friend).unwrap(), vec!["f2"]);

        assert_eq!(cache.clear_all().unwrap(), 3);
        assert!(cache.list_sources(SourceKind::Group).unwrap().is_empty());
    }

    #[test]
    fn test_missing_source_loads_empty() {
        let cache = PersistentCache::in_memory();
        assert!(cache.load_at(&SourceKey::group("nobody"), now()).is_empty());
    }
}
