//! Kill-spree aggregation.
//!
//! Single pass over a chronologically sorted stream. Consecutive kills by
//! the same actor, each within [`SpreeRules::window`] of the previous one,
//! collapse into one synthetic `killing_spree` event once the run reaches
//! [`SpreeRules::min_kills`]. Shorter runs pass through untouched. Merged
//! streams (group views) interleave several actors; a kill by anyone other
//! than the run's owner closes the run.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::event::{keys, EventType, LogEvent};

/// Minimum run length that becomes a spree.
pub const SPREE_MIN_KILLS: usize = 3;

/// Maximum gap between two consecutive kills of one spree.
pub const SPREE_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Prefix of synthetic spree ids; the rest is the first kill's id.
pub const SPREE_ID_PREFIX: &str = "spree-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpreeRules {
    pub min_kills: usize,
    pub window: Duration,
}

impl Default for SpreeRules {
    fn default() -> Self {
        Self {
            min_kills: SPREE_MIN_KILLS,
            window: SPREE_WINDOW,
        }
    }
}

/// Group kill runs with the default rules.
pub fn aggregate_kill_sprees(events: &[LogEvent]) -> Vec<LogEvent> {
    SpreeAggregator::new(SpreeRules::default()).aggregate(events)
}

/// Stateful run tracker. One instance per pass.
pub struct SpreeAggregator {
    rules: SpreeRules,
    current_run: Vec<LogEvent>,
    last_kill_time: Option<DateTime<Utc>>,
    output: Vec<LogEvent>,
}

impl SpreeAggregator {
    pub fn new(rules: SpreeRules) -> Self {
        Self {
            rules,
            current_run: Vec::new(),
            last_kill_time: None,
            output: Vec::new(),
        }
    }

    /// Run the state machine over `events` and return the grouped stream.
    pub fn aggregate(mut self, events: &[LogEvent]) -> Vec<LogEvent> {
        self.output.reserve(events.len());
        for event in events {
            self.push(event);
        }
        self.flush();
        self.output
    }

    fn push(&mut self, event: &LogEvent) {
        if !event.is_kill() {
            self.flush();
            self.output.push(event.clone());
            return;
        }

        let same_actor = self
            .current_run
            .first()
            .map_or(true, |first| first.player == event.player);
        if !same_actor {
            self.flush();
        }

        let ts = event.parsed_timestamp();
        if let Some(last) = self.last_kill_time {
            let contiguous = ts.is_some_and(|ts| {
                (ts - last)
                    .to_std()
                    .map_or(true, |gap| gap <= self.rules.window)
            });
            if !contiguous {
                self.flush();
            }
        } else if !self.current_run.is_empty() {
            // Previous kill had no usable timestamp; it cannot anchor a run.
            self.flush();
        }

        self.current_run.push(event.clone());
        self.last_kill_time = ts;
    }

    fn flush(&mut self) {
        let run = std::mem::take(&mut self.current_run);
        self.last_kill_time = None;

        if run.len() >= self.rules.min_kills {
            self.output.push(build_spree(run));
        } else {
            self.output.extend(run);
        }
    }
}

fn build_spree(run: Vec<LogEvent>) -> LogEvent {
    let first = &run[0];
    let last = &run[run.len() - 1];
    let player = first.player.clone().unwrap_or_default();

    let victims: Vec<Value> = run
        .iter()
        .map(|kill| Value::from(kill.meta_str(keys::VICTIM_NAME).unwrap_or("unknown")))
        .collect();

    let mut spree = LogEvent::new(
        format!("{SPREE_ID_PREFIX}{}", first.id),
        first.user_id.clone(),
        EventType::KillingSpree,
        first.timestamp.clone(),
    )
    .with_player(player.clone())
    .with_line(format!("{player} is on a killing spree ({} kills)", run.len()))
    .with_meta(keys::KILL_COUNT, run.len() as u64)
    .with_meta(keys::VICTIMS, victims)
    .with_meta(keys::KILLER_NAME, player)
    .with_meta(keys::START_TIME, first.timestamp.clone())
    .with_meta(keys::END_TIME, last.timestamp.clone());

    spree.open = Some(false);
    spree.children = run;
    spree
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventDetails;
    use chrono::TimeZone;

    fn ts(seconds: i64) -> String {
        (Utc.with_ymd_and_hms(2025, 5, 1, 20, 0, 0).unwrap() + chrono::Duration::seconds(seconds))
            .to_rfc3339()
    }

    fn kill(id: &str, seconds: i64, victim: &str) -> LogEvent {
        LogEvent::new(id, "acct-a", EventType::ActorDeath, ts(seconds))
            .with_player("Alice")
            .with_meta(keys::KILLER_NAME, "Alice")
            .with_meta(keys::VICTIM_NAME, victim)
    }

    #[test]
    fn test_three_kills_become_spree() {
        let events = vec![kill("k1", 0, "Bob"), kill("k2", 60, "Carol"), kill("k3", 120, "Dan")];
        let out = aggregate_kill_sprees(&events);

        assert_eq!(out.len(), 1);
        let spree = &out[0];
        assert_eq!(spree.event_type, EventType::KillingSpree);
        assert_eq!(spree.id, "spree-k1");
        assert_eq!(spree.children, events);
        match spree.details() {
            EventDetails::KillingSpree(s) => {
                assert_eq!(s.kill_count, 3);
                assert_eq!(s.victims, vec!["Bob", "Carol", "Dan"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_two_kills_stay_separate() {
        let events = vec![kill("k1", 0, "Bob"), kill("k2", 60, "Carol")];
        let out = aggregate_kill_sprees(&events);
        assert_eq!(out, events);
    }

    #[test]
    fn test_gap_splits_run() {
        let events = vec![
            kill("k1", 0, "Bob"),
            kill("k2", 60, "Carol"),
            kill("k3", 60 + 7 * 60, "Dan"),
        ];
        let out = aggregate_kill_sprees(&events);
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|e| e.event_type == EventType::ActorDeath));
    }

    #[test]
    fn test_window_is_measured_from_previous_kill() {
        // 4 minutes apart each: spans 12 minutes but stays one spree
        let events: Vec<LogEvent> = (0..4)
            .map(|i| kill(&format!("k{i}"), i * 240, "Bob"))
            .collect();
        let out = aggregate_kill_sprees(&events);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].children.len(), 4);
    }

    #[test]
    fn test_non_kill_breaks_run() {
        let landing = LogEvent::new("l", "acct-a", EventType::LandingPad, ts(61)).with_player("Alice");
        let events = vec![
            kill("k1", 0, "Bob"),
            kill("k2", 60, "Carol"),
            landing.clone(),
            kill("k3", 90, "Dan"),
        ];
        let out = aggregate_kill_sprees(&events);
        assert_eq!(out.len(), 4);
        assert_eq!(out[2], landing);
    }

    #[test]
    fn test_witnessed_death_is_not_a_kill() {
        let witnessed = kill("w", 30, "Zed").with_player("Observer");
        let events = vec![kill("k1", 0, "Bob"), witnessed, kill("k2", 60, "Carol"), kill("k3", 90, "Dan")];
        let out = aggregate_kill_sprees(&events);
        // k1 flushed alone by the witnessed death, then k2 + k3 stay below threshold
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn test_kills_by_different_actors_do_not_combine() {
        let by = |id: &str, seconds: i64, actor: &str| {
            LogEvent::new(id, format!("acct-{actor}"), EventType::ActorDeath, ts(seconds))
                .with_player(actor)
                .with_meta(keys::KILLER_NAME, actor)
                .with_meta(keys::VICTIM_NAME, "PU_Pilot")
        };
        let events = vec![by("a1", 0, "Alice"), by("b1", 30, "Bob"), by("c1", 60, "Carol")];
        let out = aggregate_kill_sprees(&events);
        assert_eq!(out, events);
    }

    #[test]
    fn test_interleaved_actor_closes_run() {
        let bob = |id: &str, seconds: i64| {
            LogEvent::new(id, "acct-b", EventType::ActorDeath, ts(seconds))
                .with_player("Bob")
                .with_meta(keys::KILLER_NAME, "Bob")
                .with_meta(keys::VICTIM_NAME, "PU_Pilot")
        };
        let events = vec![
            kill("k1", 0, "X1"),
            kill("k2", 20, "X2"),
            kill("k3", 40, "X3"),
            bob("b1", 50),
            bob("b2", 60),
            bob("b3", 70),
            kill("k4", 80, "X4"),
        ];
        let out = aggregate_kill_sprees(&events);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].id, "spree-k1");
        assert_eq!(out[0].player.as_deref(), Some("Alice"));
        assert_eq!(out[1].id, "spree-b1");
        assert_eq!(out[1].player.as_deref(), Some("Bob"));
        assert_eq!(out[1].children.len(), 3);
        assert_eq!(out[2].id, "k4");
    }

    #[test]
    fn test_custom_rules() {
        let rules = SpreeRules { min_kills: 2, window: Duration::from_secs(30) };
        let events = vec![kill("k1", 0, "Bob"), kill("k2", 20, "Carol"), kill("k3", 100, "Dan")];
        let out = SpreeAggregator::new(rules).aggregate(&events);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].id, "spree-k1");
        assert_eq!(out[1].id, "k3");
    }

    #[test]
    fn test_empty_stream() {
        assert!(aggregate_kill_sprees(&[]).is_empty());
    }
}
