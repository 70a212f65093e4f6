use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ov_session::{Message, Role, SessionStore};
use ov_storage::{Agfs, LocalAgfs};
use std::sync::Arc;
use tempfile::TempDir;

fn bench_message_jsonl(c: &mut Criterion) {
    let msg = Message::new(Role::User, "I prefer concise answers with code samples.");
    c.bench_function("message_jsonl_roundtrip_1000", |b| {
        b.iter(|| {
            for _ in 0..1000 {
                let line = msg.to_jsonl().unwrap();
                black_box(Message::from_jsonl(line.trim_end()).unwrap());
            }
        })
    });
}

fn bench_append(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let tmp = TempDir::new().unwrap();
    let (store, id) = rt.block_on(async {
        let agfs: Arc<dyn Agfs> =
            Arc::new(LocalAgfs::open(tmp.path().join("agfs")).await.unwrap());
        let store = SessionStore::new(agfs);
        let id = store.create().await.unwrap();
        (store, id)
    });
    c.bench_function("session_append_50", |b| {
        b.iter(|| {
            rt.block_on(async {
                for i in 0..50 {
                    store
                        .append(&id, Role::User, &format!("message number {i}"))
                        .await
                        .unwrap();
                }
            })
        })
    });
}

criterion_group!(benches, bench_message_jsonl, bench_append);
criterion_main!(benches);
