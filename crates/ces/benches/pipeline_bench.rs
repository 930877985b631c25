use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use weft_ces::{Pipeline, PipelineConfig};

fn bench_process(c: &mut Criterion) {
    let pipeline = Pipeline::with_key([0x22; 32], PipelineConfig::default()).unwrap();
    let data: Vec<u8> = (0u8..=255).cycle().take(1 << 20).collect();

    let mut group = c.benchmark_group("ces");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("process_1mib", |b| {
        b.iter(|| pipeline.process(&data).unwrap())
    });

    let shards = pipeline.process(&data).unwrap();
    let present = vec![true; shards.len()];
    group.bench_function("reconstruct_1mib", |b| {
        b.iter(|| pipeline.reconstruct(&shards, &present).unwrap())
    });
    group.finish();
}

criterion_group!(benches, bench_process);
criterion_main!(benches);
