//! Pure log-collection operations: dedupe, chronological merge, memory
//! trimming and filtering.
//!
//! Nothing here performs I/O. [`LogCollection`] wraps a `Vec<LogEvent>` and
//! keeps it deduplicated by id and sorted ascending by timestamp across every
//! mutating call, so consumers never have to re-sort.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{keys, EventType, LogEvent};

/// Default number of events retained per source.
pub const DEFAULT_MEMORY_LIMIT: usize = 1000;

/// Deduplicate by id (last occurrence wins) and sort ascending by timestamp.
///
/// Each timestamp is parsed exactly once. Events whose timestamp does not
/// parse sort before every valid one. The sort is stable, so events with
/// equal timestamps keep the position of the first copy of their id.
pub fn dedupe_and_sort(events: impl IntoIterator<Item = LogEvent>) -> Vec<LogEvent> {
    let iter = events.into_iter();
    let mut index: HashMap<String, usize> = HashMap::with_capacity(iter.size_hint().0);
    let mut out: Vec<LogEvent> = Vec::with_capacity(iter.size_hint().0);

    for event in iter {
        match index.get(&event.id) {
            Some(&slot) => out[slot] = event,
            None => {
                index.insert(event.id.clone(), out.len());
                out.push(event);
            }
        }
    }

    out.sort_by_cached_key(LogEvent::parsed_timestamp);
    out
}

/// Merge two collections. Copies in `incoming` replace same-id copies in `existing`.
pub fn merge(existing: Vec<LogEvent>, incoming: Vec<LogEvent>) -> Vec<LogEvent> {
    dedupe_and_sort(existing.into_iter().chain(incoming))
}

/// Keep only the `limit` most recent events.
///
/// Input that is not chronologically sorted is sorted first, so the
/// decision is always "drop the oldest".
pub fn apply_memory_limit(mut events: Vec<LogEvent>, limit: usize) -> Vec<LogEvent> {
    if events.len() <= limit {
        return events;
    }
    if !is_sorted(&events) {
        events.sort_by_cached_key(LogEvent::parsed_timestamp);
    }
    events.split_off(events.len() - limit)
}

/// True if every event's timestamp is <= its successor's.
pub fn is_sorted(events: &[LogEvent]) -> bool {
    let mut prev = None;
    for event in events {
        let ts = event.parsed_timestamp();
        if prev > Some(ts) {
            return false;
        }
        prev = Some(ts);
    }
    true
}

// ─── Filters ──────────────────────────────────────────────────────────

pub fn filter_by_user(events: &[LogEvent], user_id: &str) -> Vec<LogEvent> {
    events.iter().filter(|e| e.user_id == user_id).cloned().collect()
}

pub fn filter_by_users<S: AsRef<str>>(events: &[LogEvent], user_ids: &[S]) -> Vec<LogEvent> {
    events
        .iter()
        .filter(|e| user_ids.iter().any(|id| id.as_ref() == e.user_id))
        .cloned()
        .collect()
}

/// Events at or after `since`. Unparseable timestamps are excluded.
pub fn filter_since(events: &[LogEvent], since: DateTime<Utc>) -> Vec<LogEvent> {
    events
        .iter()
        .filter(|e| e.parsed_timestamp().is_some_and(|ts| ts >= since))
        .cloned()
        .collect()
}

/// Events within `[start, end]`, both ends inclusive.
pub fn filter_time_range(
    events: &[LogEvent],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<LogEvent> {
    events
        .iter()
        .filter(|e| {
            e.parsed_timestamp()
                .is_some_and(|ts| ts >= start && ts <= end)
        })
        .cloned()
        .collect()
}

/// Events whose type is in `types`. An empty set matches everything.
pub fn filter_by_event_types(events: &[LogEvent], types: &[EventType]) -> Vec<LogEvent> {
    if types.is_empty() {
        return events.to_vec();
    }
    events
        .iter()
        .filter(|e| types.contains(&e.event_type))
        .cloned()
        .collect()
}

/// Events mentioning any of `players`. An empty set matches everything.
pub fn filter_by_players<S: AsRef<str>>(events: &[LogEvent], players: &[S]) -> Vec<LogEvent> {
    if players.is_empty() {
        return events.to_vec();
    }
    events
        .iter()
        .filter(|e| {
            let mentioned = extract_mentioned_players(e);
            players.iter().any(|p| mentioned.contains(p.as_ref()))
        })
        .cloned()
        .collect()
}

/// Owner, killer, victim and cause names, plus those of every child.
pub fn extract_mentioned_players(event: &LogEvent) -> BTreeSet<String> {
    let mut players = BTreeSet::new();
    collect_mentioned(event, &mut players);
    players
}

fn collect_mentioned(event: &LogEvent, into: &mut BTreeSet<String>) {
    if let Some(player) = &event.player {
        into.insert(player.clone());
    }
    for key in [keys::KILLER_NAME, keys::VICTIM_NAME, keys::CAUSE_NAME] {
        if let Some(name) = event.meta_str(key) {
            into.insert(name.to_string());
        }
    }
    for child in &event.children {
        collect_mentioned(child, into);
    }
}

// ─── NPC / AI detection ───────────────────────────────────────────────

/// Whether an entity name belongs to an AI-controlled actor.
pub fn is_ai_entity(name: &str) -> bool {
    name.starts_with("PU_") || name.contains("_NPC_") || name.contains("AIModule")
}

/// Whether the event was authored by an NPC.
///
/// Narrower than [`is_ai_entity`]: `AIModule` names are not treated as log
/// owners to hide.
pub fn is_npc_log(event: &LogEvent) -> bool {
    event
        .player
        .as_deref()
        .is_some_and(|p| p.starts_with("PU_") || p.contains("_NPC_"))
}

pub fn hide_npc_logs(events: &[LogEvent]) -> Vec<LogEvent> {
    events.iter().filter(|e| !is_npc_log(e)).cloned().collect()
}

/// Sorted, unique, non-AI player names mentioned anywhere in `events`.
pub fn list_players(events: &[LogEvent]) -> Vec<String> {
    let mut all = BTreeSet::new();
    for event in events {
        collect_mentioned(event, &mut all);
    }
    all.into_iter().filter(|name| !is_ai_entity(name)).collect()
}

// ─── LogCollection ────────────────────────────────────────────────────

/// Deduplicated, chronologically sorted sequence of events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<LogEvent>", into = "Vec<LogEvent>")]
pub struct LogCollection {
    events: Vec<LogEvent>,
}

impl LogCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_events(events: impl IntoIterator<Item = LogEvent>) -> Self {
        Self {
            events: dedupe_and_sort(events),
        }
    }

    /// Merge `incoming` into the collection; later copies win.
    pub fn merge(&mut self, incoming: impl IntoIterator<Item = LogEvent>) {
        let existing = std::mem::take(&mut self.events);
        self.events = dedupe_and_sort(existing.into_iter().chain(incoming));
    }

    /// Drop the oldest events beyond `limit`. Returns how many were dropped.
    pub fn apply_memory_limit(&mut self, limit: usize) -> usize {
        let before = self.events.len();
        if before > limit {
            self.events.drain(..before - limit);
        }
        before - self.events.len()
    }

    /// Keep only events matching `keep`. Order is preserved.
    pub fn retain(&mut self, keep: impl FnMut(&LogEvent) -> bool) -> usize {
        let before = self.events.len();
        self.events.retain(keep);
        before - self.events.len()
    }

    pub fn as_slice(&self) -> &[LogEvent] {
        &self.events
    }

    pub fn iter(&self) -> std::slice::Iter<'_, LogEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Most recent event.
    pub fn latest(&self) -> Option<&LogEvent> {
        self.events.last()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn into_vec(self) -> Vec<LogEvent> {
        self.events
    }
}

impl From<Vec<LogEvent>> for LogCollection {
    fn from(events: Vec<LogEvent>) -> Self {
        Self::from_events(events)
    }
}

impl From<LogCollection> for Vec<LogEvent> {
    fn from(collection: LogCollection) -> Self {
        collection.events
    }
}

impl<'a> IntoIterator for &'a LogCollection {
    type Item = &'a LogEvent;
    type IntoIter = std::slice::Iter<'a, LogEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}
