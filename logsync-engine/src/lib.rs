//! # logsync-engine: Shared game-log synchronization
//!
//! Players parse their own game logs into [`LogEvent`]s and share them with
//! friends and groups in near real time through a WebSocket relay.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   JSON frames    ┌─────────────┐   JSON frames    ┌──────────────────┐
//! │ SyncOrchestrator │ ◄──────────────► │ RelayServer │ ◄──────────────► │ SyncOrchestrator │
//! │ (player A)       │  send/receive    │ (fan-out)   │                  │ (player B)       │
//! └───┬──────────┬───┘                  └─────────────┘                  └──────────────────┘
//!     │          │
//!     ▼          ▼
//! ┌────────┐ ┌─────────────────┐
//! │LogBook │ │ PersistentCache │ ── MemoryBackend | RocksBackend
//! └───┬────┘ └─────────────────┘
//!     │
//!     ├──► SpreeAggregator (kill sprees)
//!     └──► compute_scoreboard
//! ```
//!
//! ## Modules
//!
//! - [`event`]: Log event model and wire projection
//! - [`store`]: Dedupe, ordering, retention and filters
//! - [`aggregate`]: Kill-spree grouping
//! - [`scoreboard`]: Per-player scoring with identity resolution
//! - [`transmission`]: Batch compression policy and codec
//! - [`protocol`]: Client/relay frame types
//! - [`cache`]: Versioned per-source persistence with expiry
//! - [`delay`]: Cancellable sleeps
//! - [`session`]: Reconnecting WebSocket session
//! - [`orchestrator`]: Per-client sync driver
//! - [`relay`]: Reference relay server
//! - [`watcher`]: Game-log tailing

pub mod event;
pub mod store;
pub mod aggregate;
pub mod scoreboard;
pub mod transmission;
pub mod protocol;
pub mod cache;
pub mod delay;
pub mod session;
pub mod orchestrator;
pub mod relay;
pub mod watcher;

// Re-exports for convenience
pub use event::{EventDetails, EventType, LogEvent, LogEventWire, Metadata};
pub use store::{LogCollection, DEFAULT_MEMORY_LIMIT};
pub use aggregate::{aggregate_kill_sprees, SpreeAggregator, SpreeRules};
pub use scoreboard::{
    compute_scoreboard, Friend, Group, GroupMember, ScoreboardContext, ScoreboardEntry, Split,
};
pub use transmission::TransmissionError;
pub use protocol::{ClientFrame, LogPayload, ProtocolError, ServerFrame, Target};
pub use cache::{
    CacheBackend, CacheConfig, CacheError, MemoryBackend, PersistentCache, RocksBackend,
    SaveOutcome, SourceKey, SourceKind, StoreConfig,
};
pub use delay::{cancellable_sleep, Cancelled};
pub use session::{
    BackoffPolicy, ConnectionSession, ConnectionState, SendOutcome, SendPolicy, SessionConfig,
    SessionError, SessionEvent,
};
pub use orchestrator::{IngestReport, LogBook, OrchestratorConfig, SyncEvent, SyncOrchestrator};
pub use relay::{RelayConfig, RelayError, RelayHandle, RelayServer, RelayStats};
pub use watcher::{LogTail, LogUpdate, RawLogPattern, WatchError};
