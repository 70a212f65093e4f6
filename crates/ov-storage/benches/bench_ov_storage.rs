use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ov_core::uri::VikingUri;
use ov_storage::{Agfs, LocalAgfs, LsOptions, WriteOptions};
use tempfile::TempDir;

fn bench_write_read(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let tmp = TempDir::new().unwrap();
    let agfs = rt.block_on(async { LocalAgfs::open(tmp.path().join("agfs")).await.unwrap() });
    rt.block_on(async {
        agfs.mkdir(&VikingUri::parse("viking://resources").unwrap()).await.unwrap();
    });

    c.bench_function("agfs_write_read_100", |b| {
        b.iter(|| {
            rt.block_on(async {
                for i in 0..100 {
                    let uri = VikingUri::parse(&format!("viking://resources/bench-{i}.md")).unwrap();
                    agfs.write(&uri, b"bench content", WriteOptions::default()).await.unwrap();
                    black_box(agfs.read(&uri).await.unwrap());
                }
            })
        })
    });
}

fn bench_ls(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let tmp = TempDir::new().unwrap();
    let agfs = rt.block_on(async {
        let agfs = LocalAgfs::open(tmp.path().join("agfs")).await.unwrap();
        let dir = VikingUri::parse("viking://resources/listing").unwrap();
        agfs.mkdir(&dir).await.unwrap();
        for i in 0..200 {
            let uri = dir.join(&format!("f{i:03}.md")).unwrap();
            agfs.write(&uri, b"x", WriteOptions::default()).await.unwrap();
        }
        agfs
    });
    let dir = VikingUri::parse("viking://resources/listing").unwrap();

    c.bench_function("agfs_ls_200", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(agfs.ls(&dir, LsOptions::default()).await.unwrap());
            })
        })
    });
}

criterion_group!(benches, bench_write_read, bench_ls);
criterion_main!(benches);
