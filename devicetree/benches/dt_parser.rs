use criterion::{black_box, criterion_group, criterion_main, Criterion};
use devicetree::dt::DeviceTree;

pub fn parse(c: &mut Criterion) {
    let source = include_str!("sample-board.dts");

    c.bench_function("DeviceTree::parse_str sample-board.dts", |b| {
        b.iter(|| DeviceTree::parse_str("sample-board.dts", black_box(source), &[]))
    });
}

criterion_group!(benches, parse);
criterion_main!(benches);
