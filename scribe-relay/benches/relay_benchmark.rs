use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use scribe_relay::presence::color_for_user;
use scribe_relay::{
    ClientMessage, ConnectionId, CrdtRelay, CursorPosition, Dispatcher, DocumentStore,
    FileStore, MemoryStore, PresencePatch, PresencePolicy, PresenceRecord, PresenceStore,
    RoomRegistry, ServerMessage,
};
use uuid::Uuid;
use yrs::sync::{Message, SyncMessage};
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Text, Transact};

fn text_update(content: &str) -> Vec<u8> {
    let doc = Doc::new();
    let text = doc.get_or_insert_text("content");
    text.insert(&mut doc.transact_mut(), 0, content);
    let txn = doc.transact();
    txn.encode_state_as_update_v1(&StateVector::default())
}

fn bench_update_encode(c: &mut Criterion) {
    let msg = ClientMessage::Update {
        document_id: Uuid::new_v4(),
        update: vec![0u8; 64],
    };

    c.bench_function("update_encode_64B", |b| {
        b.iter(|| {
            black_box(black_box(&msg).encode().unwrap());
        })
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let encoded = ClientMessage::Update {
        document_id: Uuid::new_v4(),
        update: vec![0u8; 64],
    }
    .encode()
    .unwrap();

    c.bench_function("update_decode_64B", |b| {
        b.iter(|| {
            black_box(ClientMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_presence_list_encode_50(c: &mut Criterion) {
    let document_id = Uuid::new_v4();
    let presences: Vec<PresenceRecord> = (0..50)
        .map(|i| {
            let user = Uuid::new_v4();
            PresenceRecord::new(user, format!("User {i}"), None, color_for_user(user))
        })
        .collect();
    let msg = ServerMessage::PresenceList {
        document_id,
        presences,
    };

    c.bench_function("presence_list_encode_50", |b| {
        b.iter(|| {
            black_box(black_box(&msg).encode().unwrap());
        })
    });
}

fn bench_color_for_user(c: &mut Criterion) {
    let user = Uuid::new_v4();
    c.bench_function("color_for_user", |b| {
        b.iter(|| {
            black_box(color_for_user(black_box(user)));
        })
    });
}

fn bench_presence_cursor_update(c: &mut Criterion) {
    let document_id = Uuid::new_v4();
    let users: Vec<Uuid> = (0..100).map(|_| Uuid::new_v4()).collect();
    let mut store = PresenceStore::new();
    for user in &users {
        store.upsert(
            document_id,
            PresenceRecord::new(*user, "Bench", None, color_for_user(*user)),
            0,
        );
    }

    let mut tick = 0u32;
    c.bench_function("presence_cursor_update_100_users", |b| {
        b.iter(|| {
            tick = tick.wrapping_add(1);
            let user = users[tick as usize % users.len()];
            let patch = PresencePatch::cursor(CursorPosition {
                line: tick % 80,
                index: tick % 120,
            });
            black_box(store.update(document_id, user, &patch, u64::from(tick)));
        })
    });
}

fn bench_presence_sweep_1000(c: &mut Criterion) {
    let document_id = Uuid::new_v4();
    let policy = PresencePolicy::default();

    c.bench_function("presence_sweep_1000", |b| {
        b.iter_batched(
            || {
                let mut store = PresenceStore::new();
                for i in 0..1000u64 {
                    let user = Uuid::new_v4();
                    store.upsert(
                        document_id,
                        PresenceRecord::new(user, "Bench", None, "#336699"),
                        i * 1000,
                    );
                }
                store
            },
            |mut store| {
                black_box(store.sweep(black_box(600_000), &policy));
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_dispatch_room_100(c: &mut Criterion) {
    let document_id = Uuid::new_v4();
    let msg = ServerMessage::Update {
        document_id,
        update: vec![0u8; 128],
    };

    c.bench_function("dispatch_room_100_connections", |b| {
        b.iter_batched(
            || {
                let mut rooms = RoomRegistry::new();
                let mut dispatcher = Dispatcher::new(16);
                let mut outboxes = Vec::with_capacity(100);
                for _ in 0..100 {
                    let conn = ConnectionId::new();
                    outboxes.push(dispatcher.register(conn));
                    rooms.admit(conn, Uuid::new_v4(), document_id).unwrap();
                }
                (rooms, dispatcher, outboxes)
            },
            |(rooms, mut dispatcher, outboxes)| {
                black_box(dispatcher.to_room(&rooms, document_id, black_box(&msg)));
                drop(outboxes);
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_relay_apply_update(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let relay = CrdtRelay::new(Arc::new(MemoryStore::new()), Duration::from_secs(60));
    let document_id = Uuid::new_v4();
    rt.block_on(relay.open(document_id)).unwrap();
    let updates: Vec<Vec<u8>> = (0..256).map(|i| text_update(&format!("edit {i}"))).collect();

    let mut next = 0usize;
    c.bench_function("relay_apply_update", |b| {
        b.iter(|| {
            // Replays become no-ops once every update has been integrated.
            let update = &updates[next % updates.len()];
            next += 1;
            rt.block_on(relay.on_update(document_id, black_box(update)))
                .unwrap();
        })
    });
}

fn bench_relay_step1_reply(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let relay = CrdtRelay::new(Arc::new(MemoryStore::new()), Duration::from_secs(60));
    let document_id = Uuid::new_v4();
    rt.block_on(async {
        relay.open(document_id).await.unwrap();
        for i in 0..100 {
            relay
                .on_update(document_id, &text_update(&format!("paragraph {i}")))
                .await
                .unwrap();
        }
    });
    let ask = Message::Sync(SyncMessage::SyncStep1(StateVector::default())).encode_v1();

    c.bench_function("relay_step1_full_reply", |b| {
        b.iter(|| {
            black_box(
                rt.block_on(relay.on_sync_message(document_id, black_box(&ask)))
                    .unwrap(),
            );
        })
    });
}

fn bench_file_store_roundtrip_4kb(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let store = rt.block_on(FileStore::open(dir.path())).unwrap();
    let document_id = Uuid::new_v4();
    let snapshot = vec![7u8; 4096];

    c.bench_function("file_store_save_load_4KB", |b| {
        b.iter(|| {
            rt.block_on(async {
                store.save(document_id, black_box(&snapshot)).await.unwrap();
                black_box(store.load(document_id).await.unwrap());
            })
        })
    });
}

criterion_group!(
    benches,
    bench_update_encode,
    bench_update_decode,
    bench_presence_list_encode_50,
    bench_color_for_user,
    bench_presence_cursor_update,
    bench_presence_sweep_1000,
    bench_dispatch_room_100,
    bench_relay_apply_update,
    bench_relay_step1_reply,
    bench_file_store_roundtrip_4kb,
);
criterion_main!(benches);
