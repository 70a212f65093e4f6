use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ov_core::trace::RequestTrace;
use ov_core::uri::VikingUri;

fn bench_uri_parse(c: &mut Criterion) {
    c.bench_function("uri_parse_1000", |b| {
        b.iter(|| {
            for i in 0..1000 {
                let uri = VikingUri::parse(&format!("viking://resources/docs/guide-{i}/section.md"))
                    .unwrap();
                black_box(uri);
            }
        })
    });
}

fn bench_uri_prefix(c: &mut Criterion) {
    let prefix = VikingUri::parse("viking://user/memories").unwrap();
    let uris: Vec<VikingUri> = (0..1000)
        .map(|i| VikingUri::parse(&format!("viking://user/memories/session-{i}/facts/f.md")).unwrap())
        .collect();
    c.bench_function("uri_is_under_1000", |b| {
        b.iter(|| {
            for uri in &uris {
                black_box(uri.is_under(&prefix));
            }
        })
    });
}

fn bench_trace_events(c: &mut Criterion) {
    c.bench_function("trace_1000_events", |b| {
        b.iter(|| {
            let trace = RequestTrace::new(2000);
            for i in 0..1000 {
                trace.event("bench", &format!("event-{i}"), "ok", serde_json::Value::Null);
                trace.incr("vector.search_calls", 1);
            }
            black_box(trace.finish());
        })
    });
}

criterion_group!(benches, bench_uri_parse, bench_uri_prefix, bench_trace_events);
criterion_main!(benches);
