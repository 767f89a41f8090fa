//! LogSync demo: a relay and two players sharing a scripted dogfight.
//!
//! Environment:
//! - `LOGSYNC_BIND` relay address (default `127.0.0.1:9090`)
//! - `LOGSYNC_DATA_DIR` persist caches with RocksDB under this directory
//! - `LOGSYNC_PACE_MS` delay between replayed events (default 150)
//! - `RUST_LOG` log filter, as usual for `env_logger`

use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::info;

use logsync_engine::event::{keys, EventType, LogEvent};
use logsync_engine::{
    Friend, Group, GroupMember, OrchestratorConfig, PersistentCache, RelayConfig, RelayHandle,
    RelayServer, RocksBackend, ScoreboardContext, SessionConfig, SourceKey, StoreConfig, SyncOrchestrator,
    Target,
};

const SQUAD: &str = "squad-7";

struct Player {
    account: &'static str,
    name: &'static str,
}

const ALICE: Player = Player { account: "acct-alice", name: "Alice_Vega" };
const BOB: Player = Player { account: "acct-bob", name: "Bob_Tanaka" };

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let bind = std::env::var("LOGSYNC_BIND").unwrap_or_else(|_| "127.0.0.1:9090".to_string());
    let data_dir = std::env::var("LOGSYNC_DATA_DIR").ok();
    let pace = std::env::var("LOGSYNC_PACE_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_millis(150));

    let relay = RelayServer::spawn(RelayConfig {
        bind_addr: bind,
        ..RelayConfig::default()
    })
    .await?;
    info!("Relay up at {}", relay.url());

    let mut alice_config = OrchestratorConfig::new(SessionConfig::new(relay.url(), ALICE.account, "demo"));
    alice_config.groups = vec![SQUAD.to_string()];
    let alice = SyncOrchestrator::new(alice_config, open_cache(data_dir.as_deref(), ALICE.account)?);

    let mut bob_config = OrchestratorConfig::new(SessionConfig::new(relay.url(), BOB.account, "demo"));
    bob_config.target = Target::Group { group_id: SQUAD.to_string() };
    let bob = SyncOrchestrator::new(bob_config, open_cache(data_dir.as_deref(), BOB.account)?);

    alice.start().await?;
    bob.start().await?;
    wait_for_peers(&relay, 2).await;

    let start = Utc::now() - ChronoDuration::minutes(10);
    let alice_fight = dogfight(&ALICE, &BOB, start);
    let bob_fight = dogfight(&BOB, &ALICE, start + ChronoDuration::seconds(15));

    // Bob's client uploads a backlog in one batch; Alice replays live.
    let report = bob.ingest(bob_fight)?;
    info!("Bob ingested {} events ({:?})", report.total, report.sent);
    let played = alice.play(alice_fight, pace).await?;
    info!("Alice replayed {played} events");

    tokio::time::sleep(Duration::from_millis(300)).await;

    let friends = [Friend {
        account_id: BOB.account.to_string(),
        player_name: Some(BOB.name.to_string()),
        online: alice.online_friends().iter().any(|f| f == BOB.account),
    }];
    let groups = [Group {
        id: SQUAD.to_string(),
        members: [&ALICE, &BOB]
            .iter()
            .map(|p| GroupMember {
                account_id: p.account.to_string(),
                player_name: Some(p.name.to_string()),
            })
            .collect(),
    }];
    let ctx = ScoreboardContext {
        self_player: Some(ALICE.name),
        self_account: ALICE.account,
        active_group_id: None,
        friends: &friends,
        groups: &groups,
    };

    println!("\n== Scoreboard (as seen by {}) ==", ALICE.name);
    println!("{:<4} {:<14} {:>5} {:>5} {:>6} {:>6} {:>5}", "#", "player", "kills", "ships", "deaths", "score", "k/d");
    for entry in alice.scoreboard(&ctx) {
        println!(
            "{:<4} {:<14} {:>5} {:>5} {:>6} {:>6} {:>5.2}",
            entry.rank,
            entry.player_name,
            entry.kills.total(),
            entry.ships_destroyed.total(),
            entry.deaths,
            entry.score,
            entry.kd_ratio,
        );
    }

    println!("\n== {}'s log, sprees folded ==", ALICE.name);
    for event in alice.aggregated(&SourceKey::own(ALICE.account)) {
        let extra = match event.event_type {
            EventType::KillingSpree => format!(" ({} events)", event.children.len()),
            _ => String::new(),
        };
        println!("{} {:<14} {}{extra}", event.timestamp, event.event_type.as_str(), event.line);
    }

    println!("\n== {SQUAD} as seen by {} ==", ALICE.name);
    println!("{} events from {}", alice.group_logs(SQUAD).len(), BOB.name);
    println!("online friends: {:?}", alice.online_friends());

    alice.stop().await;
    bob.stop().await;
    relay.shutdown().await;
    Ok(())
}

fn open_cache(data_dir: Option<&str>, account: &str) -> Result<Arc<PersistentCache>, Box<dyn Error>> {
    let Some(dir) = data_dir else {
        return Ok(Arc::new(PersistentCache::in_memory()));
    };
    let path = Path::new(dir).join(account);
    info!("Caching {account} under {}", path.display());
    let backend = RocksBackend::open(StoreConfig {
        path,
        ..StoreConfig::default()
    })?;
    Ok(Arc::new(PersistentCache::new(Arc::new(backend), Default::default())))
}

async fn wait_for_peers(relay: &RelayHandle, count: usize) {
    for _ in 0..100 {
        if relay.server().online_users().await.len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    log::warn!(
        "Only {} of {count} players came online",
        relay.server().online_users().await.len()
    );
}

/// A short engagement from `me`'s point of view: an AI kill streak, a
/// ship kill, a duel with `rival`, and a death.
fn dogfight(me: &Player, rival: &Player, start: DateTime<Utc>) -> Vec<LogEvent> {
    let mut script = Script {
        me,
        at: start,
        events: Vec::new(),
    };
    for pirate in ["PU_Pilot_Xeno_01", "PU_Pilot_Xeno_02", "PU_Pilot_Xeno_03", "PU_Pilot_Xeno_04"] {
        script.kill(40, me.name, pirate, true);
    }
    script.ship(90, "DRAK_Cutlass_Black_AI");
    script.kill(60, me.name, rival.name, false);
    script.kill(45, rival.name, me.name, false);
    script.events
}

struct Script<'a> {
    me: &'a Player,
    at: DateTime<Utc>,
    events: Vec<LogEvent>,
}

impl Script<'_> {
    fn event(&mut self, step_secs: i64, event_type: EventType, line: String) -> LogEvent {
        self.at += ChronoDuration::seconds(step_secs);
        LogEvent::new(
            format!("{}-{:03}", self.me.account, self.events.len()),
            self.me.account,
            event_type,
            self.at.to_rfc3339(),
        )
        .with_player(self.me.name)
        .with_line(line)
    }

    fn kill(&mut self, step_secs: i64, killer: &str, victim: &str, ai_victim: bool) {
        let line = format!("<Actor Death> '{victim}' killed by '{killer}'");
        let event = self
            .event(step_secs, EventType::ActorDeath, line)
            .with_meta(keys::KILLER_NAME, killer)
            .with_meta(keys::VICTIM_NAME, victim)
            .with_meta(keys::IS_AI_VICTIM, ai_victim);
        self.events.push(event);
    }

    fn ship(&mut self, step_secs: i64, vehicle: &str) {
        let line = format!("<Vehicle Destruction> '{vehicle}' destroyed by '{}'", self.me.name);
        let event = self
            .event(step_secs, EventType::Destruction, line)
            .with_meta(keys::VEHICLE_NAME, vehicle)
            .with_meta(keys::CAUSE_NAME, self.me.name)
            .with_meta(keys::IS_AI_VEHICLE, true);
        self.events.push(event);
    }
}
