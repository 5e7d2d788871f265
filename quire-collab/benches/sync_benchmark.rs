use std::hint::black_box;
use std::time::Duration;

use chrono::Utc;
use criterion::{Criterion, criterion_group, criterion_main};
use quire_collab::autosave::{AutosaveEvent, AutosaveMachine};
use quire_collab::history::summarize;
use quire_collab::presence::{CursorColor, PresenceEvent, PresenceRecord, PresenceRoom};
use quire_collab::relay::{Frame, Request};
use quire_collab::store::{BroadcastGroup, SnapshotRecord};
use quire_collab::sync::{decode_content, encode_content};
use quire_collab::{LocalOp, Origin, Replica};
use uuid::Uuid;

fn replica_with_text(chars: usize) -> Replica {
    let mut replica = Replica::new();
    replica.apply_local_op(&LocalOp::insert(0, "x".repeat(chars)));
    replica
}

fn bench_local_typing(c: &mut Criterion) {
    c.bench_function("replica_type_1K_chars", |b| {
        b.iter(|| {
            let mut replica = Replica::new();
            for i in 0..1000u32 {
                replica.apply_local_op(&LocalOp::insert(i, "a"));
            }
            black_box(replica.char_len());
        })
    });
}

fn bench_encode_full_state(c: &mut Criterion) {
    let replica = replica_with_text(10_000);

    c.bench_function("encode_full_state_10K", |b| {
        b.iter(|| {
            let state = replica.encode_full_state();
            black_box(encode_content(&state));
        })
    });
}

fn bench_merge_remote_snapshot(c: &mut Criterion) {
    let source = replica_with_text(10_000);
    let content = encode_content(&source.encode_full_state());

    c.bench_function("merge_snapshot_10K_fresh", |b| {
        b.iter(|| {
            let mut replica = Replica::new();
            let bytes = decode_content(black_box(&content)).unwrap();
            black_box(replica.apply_remote_update(&bytes, Origin::Remote));
        })
    });

    let mut merged = Replica::new();
    let bytes = decode_content(&content).unwrap();
    merged.apply_remote_update(&bytes, Origin::Remote);

    c.bench_function("merge_snapshot_10K_echo", |b| {
        b.iter(|| {
            black_box(merged.apply_remote_update(black_box(&bytes), Origin::Remote));
        })
    });
}

fn bench_frame_roundtrip(c: &mut Criterion) {
    let frame = Frame::Request {
        id: 1,
        body: Request::PutSnapshot {
            doc_id: Uuid::new_v4(),
            content: encode_content(&replica_with_text(1_000).encode_full_state()),
        },
    };

    c.bench_function("frame_put_snapshot_roundtrip_1K", |b| {
        b.iter(|| {
            let encoded = frame.encode().unwrap();
            black_box(Frame::decode(&encoded).unwrap());
        })
    });
}

fn bench_summarize(c: &mut Criterion) {
    let before = "lorem ipsum ".repeat(1_000);
    let after = format!("{before}dolor");

    c.bench_function("history_summarize_12K", |b| {
        b.iter(|| black_box(summarize(black_box(&before), black_box(&after))))
    });
}

fn bench_autosave_machine(c: &mut Criterion) {
    c.bench_function("autosave_machine_1K_cycles", |b| {
        b.iter(|| {
            let mut machine = AutosaveMachine::new();
            for _ in 0..1000 {
                machine.handle(AutosaveEvent::LocalChange);
                machine.handle(AutosaveEvent::DebounceElapsed);
                machine.handle(AutosaveEvent::LocalChange);
                machine.handle(AutosaveEvent::PushSucceeded);
                machine.handle(AutosaveEvent::PushSucceeded);
            }
            black_box(machine.state());
        })
    });
}

fn bench_presence_room(c: &mut Criterion) {
    let mut room = PresenceRoom::new(Uuid::new_v4(), Duration::from_secs(30));
    let now = Utc::now();
    for i in 0..100 {
        let user_id = Uuid::new_v4();
        room.handle_event(&PresenceEvent::Upserted(PresenceRecord {
            user_id,
            name: format!("User {i:03}"),
            color: CursorColor::from_uuid(user_id).to_hex(),
            cursor: None,
            last_seen: now,
        }));
    }

    c.bench_function("presence_collaborators_100", |b| {
        b.iter(|| black_box(room.collaborators(black_box(now))))
    });
}

fn bench_snapshot_fan_out(c: &mut Criterion) {
    let group = BroadcastGroup::new(1024);
    let mut receivers: Vec<_> = (0..100).map(|_| group.watch_snapshots()).collect();
    let record = SnapshotRecord {
        content: encode_content(&[0u8; 256]),
        updated_at: Utc::now(),
    };

    c.bench_function("snapshot_fan_out_100_watchers", |b| {
        b.iter(|| {
            black_box(group.publish_snapshot(record.clone()));
            for rx in receivers.iter_mut() {
                let _ = rx.try_recv();
            }
        })
    });
}

criterion_group!(
    benches,
    bench_local_typing,
    bench_encode_full_state,
    bench_merge_remote_snapshot,
    bench_frame_roundtrip,
    bench_summarize,
    bench_autosave_machine,
    bench_presence_room,
    bench_snapshot_fan_out,
);
criterion_main!(benches);
