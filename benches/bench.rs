use criterion::*;
use sapling::{current, spawn, Payload};

fn ping_pong(c: &mut Criterion) {
    let mut group = c.benchmark_group("ping_pong");
    group.throughput(Throughput::Elements(1));
    group.bench_function("sapling", |b| {
        let root = current();
        let co = spawn(move |mut p| loop {
            p = root.switch(p)?;
        });
        co.switch(Payload::none()).unwrap();
        b.iter(|| {
            black_box(co.switch(Payload::none()).unwrap());
        });
    });
}

fn spawn_and_finish(c: &mut Criterion) {
    let mut group = c.benchmark_group("spawn_and_finish");
    group.throughput(Throughput::Elements(1));
    group.bench_function("sapling", |b| {
        b.iter(|| {
            let co = spawn(|p| Ok(p));
            black_box(co.switch(Payload::none()).unwrap());
        });
    });
}

criterion_group!(benches, ping_pong, spawn_and_finish);
criterion_main!(benches);
