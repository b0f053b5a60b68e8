use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use tandem_collab::broadcast::BroadcastGroup;
use tandem_collab::operation::{diff, Edit, TextOperation};
use tandem_collab::protocol::{ClientId, ClientMessage, RemoteOperation, ServerMessage, SessionId, UserData};
use tandem_collab::replica::Replica;
use tandem_collab::session::{Outbound, Session};
use tokio::sync::mpsc;

fn source_text(lines: usize) -> String {
    (0..lines).map(|i| format!("let value_{i} = compute({i});\n")).collect()
}

fn bench_diff_single_char(c: &mut Criterion) {
    let old = source_text(500);
    let mut new = old.clone();
    new.insert(old.len() / 2, 'x');

    c.bench_function("diff_insert_middle_16KB", |b| {
        b.iter(|| black_box(diff(black_box(&old), black_box(&new))))
    });
}

fn bench_diff_unrelated(c: &mut Criterion) {
    let old = source_text(500);
    let new = old.to_uppercase();

    c.bench_function("diff_full_replace_16KB", |b| {
        b.iter(|| black_box(diff(black_box(&old), black_box(&new))))
    });
}

fn bench_apply(c: &mut Criterion) {
    let text = source_text(500);
    let edit = Edit::replace(text.chars().count() / 2, "replacement", 12);

    c.bench_function("apply_replace_16KB", |b| {
        b.iter(|| black_box(edit.apply(black_box(&text)).unwrap()))
    });
}

fn bench_operation_encode(c: &mut Criterion) {
    let message = ClientMessage::Operation(TextOperation::new(Edit::insert(42, "hello"), 7));

    c.bench_function("operation_encode", |b| {
        b.iter(|| black_box(black_box(&message).encode().unwrap()))
    });
}

fn bench_operation_decode(c: &mut Criterion) {
    let message = ServerMessage::Operation(RemoteOperation {
        operation: TextOperation::new(Edit::insert(42, "hello"), 7),
        revision: 8,
        client_id: ClientId::new(),
    });
    let encoded = message.encode().unwrap();

    c.bench_function("operation_decode", |b| {
        b.iter(|| black_box(ServerMessage::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_session_sequence_1000(c: &mut Criterion) {
    let members: Vec<ClientId> = (0..10).map(|_| ClientId::new()).collect();

    c.bench_function("session_sequence_1000_ops_10_members", |b| {
        b.iter(|| {
            let mut session = Session::new(SessionId::new("bench"), source_text(50), 10);
            for (i, id) in members.iter().enumerate() {
                session.join(*id, &UserData::named(format!("Peer{i}"))).unwrap();
            }
            for i in 0..1000u64 {
                let op = TextOperation::new(Edit::insert((i % 100) as usize, "x"), i);
                let from = members[(i % 10) as usize];
                black_box(session.handle(from, ClientMessage::Operation(op)));
            }
        })
    });
}

fn bench_broadcast_100_members(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let sender = ClientId::new();
    let batch = vec![Outbound::all_except(
        sender,
        ServerMessage::Operation(RemoteOperation {
            operation: TextOperation::new(Edit::insert(0, "x"), 0),
            revision: 1,
            client_id: sender,
        }),
    )];

    c.bench_function("broadcast_1_op_100_members", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut group = BroadcastGroup::new();
                let mut receivers = Vec::new();
                for _ in 0..100 {
                    let (tx, rx) = mpsc::channel(16);
                    group.add_member(ClientId::new(), tx);
                    receivers.push(rx);
                }
                black_box(group.deliver(black_box(&batch)));
                black_box(receivers.len());
            });
        })
    });

    c.bench_function("broadcast_1000_ops_100_members", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut group = BroadcastGroup::new();
                let mut receivers = Vec::new();
                for _ in 0..100 {
                    let (tx, rx) = mpsc::channel(2048);
                    group.add_member(ClientId::new(), tx);
                    receivers.push(rx);
                }
                for _ in 0..1000 {
                    black_box(group.deliver(&batch));
                }
                black_box(group.stats());
            });
        })
    });
}

fn bench_replica_remote_ops(c: &mut Criterion) {
    let author = ClientId::new();
    let ops: Vec<ServerMessage> = (1..=1000u64)
        .map(|revision| {
            ServerMessage::Operation(RemoteOperation {
                operation: TextOperation::new(Edit::insert(0, "y"), revision - 1),
                revision,
                client_id: author,
            })
        })
        .collect();

    c.bench_function("replica_apply_1000_remote_ops", |b| {
        b.iter(|| {
            let mut replica = Replica::create(source_text(20));
            for op in ops.iter() {
                black_box(replica.handle(op.clone()));
            }
            black_box(replica.revision());
        })
    });
}

criterion_group!(
    benches,
    bench_diff_single_char,
    bench_diff_unrelated,
    bench_apply,
    bench_operation_encode,
    bench_operation_decode,
    bench_session_sequence_1000,
    bench_broadcast_100_members,
    bench_replica_remote_ops,
);
criterion_main!(benches);
