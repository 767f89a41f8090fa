use std::hint::black_box;

use chrono::{Duration, TimeZone, Utc};
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use logsync_engine::aggregate::aggregate_kill_sprees;
use logsync_engine::event::{keys, EventType, LogEvent, LogEventWire};
use logsync_engine::protocol::{ClientFrame, LogPayload, Target};
use logsync_engine::scoreboard::{compute_scoreboard, Friend, ScoreboardContext};
use logsync_engine::store::{self, LogCollection};
use logsync_engine::transmission;

/// `n` kills by Alice, 30s apart, with a death every 7th event.
fn combat_log(n: usize) -> Vec<LogEvent> {
    let start = Utc.with_ymd_and_hms(2025, 5, 1, 20, 0, 0).unwrap();
    (0..n)
        .map(|i| {
            let at = (start + Duration::seconds(30 * i as i64)).to_rfc3339();
            let (killer, victim) = if i % 7 == 6 { ("Bob", "Alice") } else { ("Alice", "PU_Pilot_Human") };
            LogEvent::new(format!("evt-{i:05}"), "acct-a", EventType::ActorDeath, at)
                .with_player("Alice")
                .with_line(format!("<Actor Death> '{victim}' killed by '{killer}'"))
                .with_meta(keys::KILLER_NAME, killer)
                .with_meta(keys::VICTIM_NAME, victim)
                .with_meta(keys::IS_AI_VICTIM, victim.starts_with("PU_"))
        })
        .collect()
}

fn shuffled(mut events: Vec<LogEvent>) -> Vec<LogEvent> {
    // newest first, with every tenth event repeated
    let dupes: Vec<LogEvent> = events.iter().step_by(10).cloned().collect();
    events.reverse();
    events.extend(dupes);
    events
}

fn bench_dedupe_and_sort_10k(c: &mut Criterion) {
    let events = shuffled(combat_log(10_000));
    c.bench_function("dedupe_and_sort_10k", |b| {
        b.iter_batched(
            || events.clone(),
            |events| black_box(store::dedupe_and_sort(events)),
            BatchSize::LargeInput,
        )
    });
}

fn bench_collection_merge_trim(c: &mut Criterion) {
    let base = combat_log(1_000);
    let incoming: Vec<LogEvent> = combat_log(1_100).split_off(1_000);
    c.bench_function("collection_merge_100_into_1k", |b| {
        b.iter_batched(
            || {
                let mut collection = LogCollection::default();
                collection.merge(base.clone());
                (collection, incoming.clone())
            },
            |(mut collection, incoming)| {
                collection.merge(incoming);
                black_box(collection.apply_memory_limit(store::DEFAULT_MEMORY_LIMIT));
            },
            BatchSize::LargeInput,
        )
    });
}

fn bench_spree_aggregation_1k(c: &mut Criterion) {
    let events = combat_log(1_000);
    c.bench_function("spree_aggregation_1k", |b| {
        b.iter(|| black_box(aggregate_kill_sprees(black_box(&events))))
    });
}

fn bench_scoreboard_1k(c: &mut Criterion) {
    let events = combat_log(1_000);
    let friends = vec![Friend {
        account_id: "acct-b".into(),
        player_name: Some("Bob".into()),
        online: true,
    }];
    let ctx = ScoreboardContext {
        self_player: Some("Alice"),
        self_account: "acct-a",
        active_group_id: None,
        friends: &friends,
        groups: &[],
    };
    c.bench_function("scoreboard_1k", |b| {
        b.iter(|| black_box(compute_scoreboard(black_box(&events), &ctx)))
    });
}

fn bench_compress_batch(c: &mut Criterion) {
    let wire: Vec<LogEventWire> = combat_log(100).iter().map(LogEventWire::from).collect();
    c.bench_function("compress_100_events", |b| {
        b.iter(|| black_box(transmission::compress(black_box(&wire)).unwrap()))
    });
}

fn bench_decompress_batch(c: &mut Criterion) {
    let wire: Vec<LogEventWire> = combat_log(100).iter().map(LogEventWire::from).collect();
    let encoded = transmission::compress(&wire).unwrap();
    c.bench_function("decompress_100_events", |b| {
        b.iter(|| {
            black_box(transmission::decompress::<Vec<LogEventWire>>(black_box(&encoded)).unwrap())
        })
    });
}

fn bench_send_logs_frame(c: &mut Criterion) {
    let events = combat_log(5);
    c.bench_function("send_logs_frame_encode_5", |b| {
        b.iter(|| {
            let frame = ClientFrame::send_logs(black_box(&events), Target::Friends).unwrap();
            black_box(frame.encode().unwrap())
        })
    });

    let payload = LogPayload::from_events(&combat_log(50)).unwrap();
    c.bench_function("payload_into_events_50_compressed", |b| {
        b.iter_batched(
            || payload.clone(),
            |payload| black_box(payload.into_events().unwrap()),
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    bench_dedupe_and_sort_10k,
    bench_collection_merge_trim,
    bench_spree_aggregation_1k,
    bench_scoreboard_1k,
    bench_compress_batch,
    bench_decompress_batch,
    bench_send_logs_frame,
);
criterion_main!(benches);
