//! Key/value backends behind [`super::PersistentCache`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Minimal string key/value store.
///
/// Implementations must be safe to share between tasks. Writes to one key
/// are last-write-wins; callers serialize same-key writes themselves.
pub trait CacheBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    fn set(&self, key: &str, value: &str) -> Result<(), CacheError>;
    fn remove(&self, key: &str) -> Result<(), CacheError>;
    /// All keys starting with `prefix`, in ascending order.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError>;
}

/// In-process backend.
///
/// Doubles as the degraded-mode store and as a test double: a byte quota
/// simulates quota failures, and [`MemoryBackend::set_available`] simulates
/// a backend that went away.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<BTreeMap<String, String>>,
    quota_bytes: Option<usize>,
    unavailable: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject writes that would push `sum(key.len() + value.len())` over `bytes`.
    pub fn with_quota(bytes: usize) -> Self {
        Self {
            quota_bytes: Some(bytes),
            ..Self::default()
        }
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Bytes currently stored.
    pub fn used_bytes(&self) -> usize {
        self.entries
            .lock()
            .map(|m| m.iter().map(|(k, v)| k.len() + v.len()).sum())
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), CacheError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("memory backend switched off".into()));
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>, CacheError> {
        self.entries
            .lock()
            .map_err(|_| CacheError::Unavailable("memory backend lock poisoned".into()))
    }
}

impl CacheBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.check_available()?;
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), CacheError> {
        self.check_available()?;
        let mut entries = self.lock()?;
        if let Some(quota) = self.quota_bytes {
            let others: usize = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            let needed = others + key.len() + value.len();
            if needed > quota {
                return Err(CacheError::QuotaExceeded { needed, quota });
            }
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.check_available()?;
        self.lock()?.remove(key);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        self.check_available()?;
        Ok(self
            .lock()?
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

/// Cache errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The write would exceed the backend's storage quota
    QuotaExceeded { needed: usize, quota: usize },
    /// Backend cannot be used at all
    Unavailable(String),
    /// Stored bytes could not be decoded
    Corrupt(String),
    /// Envelope could not be serialized
    Serialization(String),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QuotaExceeded { needed, quota } => {
                write!(f, "Storage quota exceeded: {needed} bytes needed, {quota} allowed")
            }
            Self::Unavailable(e) => write!(f, "Storage unavailable: {e}"),
            Self::Corrupt(e) => write!(f, "Corrupt cache entry: {e}"),
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
        }
    }
}

impl std::error::Error for CacheError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_get_set_remove() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.get("a").unwrap(), None);
        backend.set("a", "1").unwrap();
        assert_eq!(backend.get("a").unwrap().as_deref(), Some("1"));
        backend.remove("a").unwrap();
        assert!(backend.is_empty());
    }

    #[test]
    fn test_prefix_scan_is_bounded() {
        let backend = MemoryBackend::new();
        for key in ["ns:friend:a", "ns:friend:b", "ns:group:x", "ns:friendz"] {
            backend.set(key, "{}").unwrap();
        }
        assert_eq!(
            backend.keys_with_prefix("ns:friend:").unwrap(),
            vec!["ns:friend:a".to_string(), "ns:friend:b".to_string()]
        );
    }

    #[test]
    fn test_quota_counts_replacement_once() {
        let backend = MemoryBackend::with_quota(10);
        backend.set("k", "12345").unwrap();
        // replacing the same key must not count the old value
        backend.set("k", "123456789").unwrap();
        let err = backend.set("k2", "x").unwrap_err();
        assert!(matches!(err, CacheError::QuotaExceeded { quota: 10, .. }));
    }

    #[test]
    fn test_unavailable_switch() {
        let backend = MemoryBackend::new();
        backend.set_available(false);
        assert!(matches!(backend.get("a"), Err(CacheError::Unavailable(_))));
        backend.set_available(true);
        assert!(backend.get("a").is_ok());
    }
}
