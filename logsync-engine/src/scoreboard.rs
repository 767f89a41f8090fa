//! Per-player combat statistics and ranked scoreboard.
//!
//! Everything here is a pure projection of a log slice plus the identity
//! map (player name → account id). Nothing is cached; callers recompute
//! after every relevant log mutation.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::event::{EventDetails, LogEvent};

pub const PLAYER_KILL_POINTS: i64 = 2;
pub const PLAYER_SHIP_POINTS: i64 = 2;
pub const AI_KILL_POINTS: i64 = 1;
pub const AI_SHIP_POINTS: i64 = 1;
pub const DEATH_PENALTY: i64 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Friend {
    pub account_id: String,
    /// In-game character name, if known.
    pub player_name: Option<String>,
    pub online: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMember {
    pub account_id: String,
    pub player_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub id: String,
    pub members: Vec<GroupMember>,
}

/// Who is looking at the scoreboard, and through which filter.
#[derive(Debug, Clone, Copy)]
pub struct ScoreboardContext<'a> {
    pub self_player: Option<&'a str>,
    pub self_account: &'a str,
    pub active_group_id: Option<&'a str>,
    pub friends: &'a [Friend],
    pub groups: &'a [Group],
}

/// Player-vs-AI split counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Split {
    pub player: u32,
    pub ai: u32,
}

impl Split {
    pub fn total(&self) -> u32 {
        self.player + self.ai
    }
}

/// Raw accumulated stats for one account.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlayerStats {
    pub kills: Split,
    pub ships_destroyed: Split,
    pub deaths: u32,
    destroyed_vehicles: HashSet<String>,
}

impl PlayerStats {
    pub fn score(&self) -> i64 {
        PLAYER_KILL_POINTS * i64::from(self.kills.player)
            + PLAYER_SHIP_POINTS * i64::from(self.ships_destroyed.player)
            + AI_KILL_POINTS * i64::from(self.kills.ai)
            + AI_SHIP_POINTS * i64::from(self.ships_destroyed.ai)
            - DEATH_PENALTY * i64::from(self.deaths)
    }

    /// Kills per death; with zero deaths, the raw kill count.
    pub fn kd_ratio(&self) -> f64 {
        let kills = f64::from(self.kills.total());
        if self.deaths == 0 {
            kills
        } else {
            kills / f64::from(self.deaths)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.kills.total() == 0 && self.ships_destroyed.total() == 0 && self.deaths == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreboardEntry {
    pub player_name: String,
    pub account_id: String,
    pub kills: Split,
    pub ships_destroyed: Split,
    pub deaths: u32,
    pub score: i64,
    pub kd_ratio: f64,
    pub rank: usize,
}

/// Player name → account id, built from self, friends, then group members.
///
/// A name claimed by two accounts resolves to whichever was inserted last.
pub fn build_identity_map(ctx: &ScoreboardContext<'_>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some(name) = ctx.self_player {
        map.insert(name.to_string(), ctx.self_account.to_string());
    }
    for friend in ctx.friends {
        if let Some(name) = &friend.player_name {
            map.insert(name.clone(), friend.account_id.clone());
        }
    }
    for group in ctx.groups {
        for member in &group.members {
            if let Some(name) = &member.player_name {
                map.insert(name.clone(), member.account_id.clone());
            }
        }
    }
    map
}

/// Accumulate stats per resolved account in one pass.
///
/// Composite events are expanded into their children so aggregated views
/// score the same as raw ones.
pub fn collect_stats(
    events: &[LogEvent],
    identities: &HashMap<String, String>,
) -> HashMap<String, PlayerStats> {
    let mut stats: HashMap<String, PlayerStats> = HashMap::new();
    for event in events {
        accumulate(event, identities, &mut stats);
    }
    stats
}

fn accumulate(
    event: &LogEvent,
    identities: &HashMap<String, String>,
    stats: &mut HashMap<String, PlayerStats>,
) {
    if !event.children.is_empty() {
        for child in &event.children {
            accumulate(child, identities, stats);
        }
        return;
    }

    let resolve = |name: Option<&str>| name.and_then(|n| identities.get(n)).cloned();

    match event.details() {
        EventDetails::ActorDeath(death) => {
            let killer = resolve(death.killer_name);
            let victim = resolve(death.victim_name);
            let suicide = death.killer_name.is_some() && death.killer_name == death.victim_name;

            if let (Some(account), false) = (killer, suicide) {
                let entry = stats.entry(account).or_default();
                if death.is_ai_victim {
                    entry.kills.ai += 1;
                } else {
                    entry.kills.player += 1;
                }
            }
            if let (Some(account), false) = (victim, death.is_ai_victim) {
                stats.entry(account).or_default().deaths += 1;
            }
        }
        EventDetails::Destruction(destruction) => {
            let Some(account) = resolve(destruction.cause_name) else {
                return;
            };
            let vehicle = destruction
                .vehicle_name
                .or(destruction.vehicle_id)
                .unwrap_or(event.id.as_str())
                .to_string();
            let entry = stats.entry(account).or_default();
            if entry.destroyed_vehicles.insert(vehicle) {
                if destruction.is_ai_vehicle {
                    entry.ships_destroyed.ai += 1;
                } else {
                    entry.ships_destroyed.player += 1;
                }
            }
        }
        _ => {}
    }
}

/// Ranked scoreboard for the eligible accounts in `ctx`.
///
/// The viewer's own account never appears; callers show it separately via
/// [`collect_stats`].
pub fn compute_scoreboard(events: &[LogEvent], ctx: &ScoreboardContext<'_>) -> Vec<ScoreboardEntry> {
    let identities = build_identity_map(ctx);
    let stats = collect_stats(events, &identities);

    // An account known under several names shows the first in name order
    let mut names: HashMap<&str, &str> = HashMap::new();
    for (name, account) in &identities {
        names
            .entry(account.as_str())
            .and_modify(|current| {
                if compare_names(name, current) == Ordering::Less {
                    *current = name.as_str();
                }
            })
            .or_insert(name.as_str());
    }
    // Friends and members listed explicitly take precedence for display
    for friend in ctx.friends {
        if let Some(name) = &friend.player_name {
            names.insert(friend.account_id.as_str(), name.as_str());
        }
    }

    let eligible: Vec<&str> = match ctx
        .active_group_id
        .and_then(|gid| ctx.groups.iter().find(|g| g.id == gid))
    {
        Some(group) => group.members.iter().map(|m| m.account_id.as_str()).collect(),
        None if ctx.active_group_id.is_some() => Vec::new(),
        None => ctx
            .friends
            .iter()
            .filter(|f| f.online || stats.get(&f.account_id).is_some_and(|s| !s.is_empty()))
            .map(|f| f.account_id.as_str())
            .collect(),
    };

    let empty = PlayerStats::default();
    let mut seen = HashSet::new();
    let mut entries: Vec<ScoreboardEntry> = eligible
        .into_iter()
        .filter(|account| *account != ctx.self_account && seen.insert(*account))
        .map(|account| {
            let s = stats.get(account).unwrap_or(&empty);
            ScoreboardEntry {
                player_name: names.get(account).copied().unwrap_or(account).to_string(),
                account_id: account.to_string(),
                kills: s.kills,
                ships_destroyed: s.ships_destroyed,
                deaths: s.deaths,
                score: s.score(),
                kd_ratio: s.kd_ratio(),
                rank: 0,
            }
        })
        .collect();

    entries.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| compare_names(&a.player_name, &b.player_name))
    });
    for (i, entry) in entries.iter_mut().enumerate() {
        entry.rank = i + 1;
    }
    entries
}

/// Case-insensitive first, then byte order, for a stable locale-like compare.
fn compare_names(a: &str, b: &str) -> Ordering {
    a.to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| a.cmp(b))
}
