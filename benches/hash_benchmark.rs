use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fnindex_workspace::{CommentStyle, HashService};

fn generate_body(lines: usize) -> String {
    (0..lines)
        .map(|i| match i % 4 {
            0 => format!("    // step {i}\n"),
            1 => format!("    let value_{i} = compute(\"item {i}\", {i});\n"),
            2 => format!("    /* block {i} */ total += value_{};\n", i - 1),
            _ => "\n".to_string(),
        })
        .collect()
}

fn benchmark_normalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("normalize_body");

    for lines in [10, 100, 1000].iter() {
        let body = generate_body(*lines);
        group.throughput(Throughput::Bytes(body.len() as u64));
        group.bench_with_input(BenchmarkId::new("c_family", lines), &body, |b, body| {
            b.iter(|| HashService::normalize_body(black_box(body), CommentStyle::CFamily))
        });
    }

    group.finish();
}

fn benchmark_digests(c: &mut Criterion) {
    let mut group = c.benchmark_group("digests");

    for size in [1024, 64 * 1024, 1024 * 1024].iter() {
        let content = vec![b'x'; *size];
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::new("file_hash", size), &content, |b, content| {
            b.iter(|| HashService::file_hash(black_box(content)))
        });
        group.bench_with_input(
            BenchmarkId::new("file_change_digest", size),
            &content,
            |b, content| b.iter(|| HashService::file_change_digest(black_box(content))),
        );
    }

    group.finish();
}

fn benchmark_function_hash(c: &mut Criterion) {
    let body = generate_body(50);
    c.bench_function("function_hash_50_lines", |b| {
        b.iter(|| HashService::function_hash(black_box(&body), CommentStyle::CFamily))
    });
}

criterion_group!(
    benches,
    benchmark_normalize,
    benchmark_digests,
    benchmark_function_hash
);
criterion_main!(benches);
