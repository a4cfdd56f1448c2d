//! Fan-out path benchmarks
//!
//! Measures the per-chunk cost of level computation and the full ingest
//! path (analysis window + capture ring + level).

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use perch_core::{compute_level, AudioFanout, AudioFrame, PcmFormat, SourceId};

fn benchmark_level(c: &mut Criterion) {
    let mut group = c.benchmark_group("level");

    // Typical reader chunk sizes in bytes
    for chunk_bytes in [4096usize, 32768, 96000].iter() {
        let pcm: Vec<u8> = (0..*chunk_bytes)
            .map(|i| ((i as f32 * 0.01).sin() * 120.0) as i8 as u8)
            .collect();

        group.throughput(Throughput::Bytes(*chunk_bytes as u64));
        group.bench_function(format!("compute_level_{}_bytes", chunk_bytes), |b| {
            b.iter(|| compute_level(black_box(&pcm)))
        });
    }

    group.finish();
}

fn benchmark_ingest(c: &mut Criterion) {
    let (fanout, analysis_rx, level_rx) = AudioFanout::new(PcmFormat::default(), None);
    let id = SourceId::new("bench");
    fanout.allocate_buffers(&id).unwrap();

    // One reader-sized chunk; drain the consumer ends so nothing stalls.
    let pcm: Vec<u8> = (0..32768usize).map(|i| (i % 251) as u8).collect();

    c.bench_function("ingest_32k_chunk", |b| {
        b.iter(|| {
            fanout.ingest(AudioFrame {
                source_id: id.clone(),
                display_name: "bench".into(),
                pcm: black_box(pcm.clone()),
            });
            while analysis_rx.try_recv().is_ok() {}
            while level_rx.try_recv().is_ok() {}
        })
    });
}

criterion_group!(benches, benchmark_level, benchmark_ingest);
criterion_main!(benches);
