use criterion::{black_box, criterion_group, criterion_main, Criterion};

use wattscope::sampler::parse::{parse_chunk, parse_line};

fn interval_lines(events: usize) -> Vec<String> {
    let mut lines = Vec::with_capacity(events);
    lines.push("1.000104          12,345.67 Joules power/energy-pkg/".to_string());

    for i in 1..events {
        lines.push(format!(
            "1.000104     {},{:03},{:03}        event_{i}",
            i, 234, 567,
        ));
    }

    lines
}

fn bench_parse_line(c: &mut Criterion) {
    c.bench_function("parse_line_energy", |b| {
        b.iter(|| parse_line(black_box("1.000104          12,345.67 Joules power/energy-pkg/")))
    });

    c.bench_function("parse_line_plain", |b| {
        b.iter(|| parse_line(black_box("1.000104      1,234,567,890        instructions")))
    });

    c.bench_function("parse_line_not_counted", |b| {
        b.iter(|| parse_line(black_box("1.000104     <not counted>        instructions")))
    });
}

fn bench_parse_chunk(c: &mut Criterion) {
    let chunk = interval_lines(16);

    c.bench_function("parse_chunk_16_events", |b| {
        b.iter(|| parse_chunk(black_box(&chunk)))
    });
}

criterion_group!(benches, bench_parse_line, bench_parse_chunk);
criterion_main!(benches);
