//! Micro benchmarks for DSCP marking and the scavenger-class token bucket
//! (spec §4.8). Pure CPU, no IO.
//!
//! ```bash
//! cargo bench --bench bench_qos
//! ```

use std::time::Instant;

use criterion::{criterion_group, criterion_main, Criterion};

use sase_core::metadata::QosClass;
use sase_core::qos::{mark_dscp, ShaperTable};

fn bench_mark_dscp(c: &mut Criterion) {
    c.bench_function("qos_mark_dscp", |b| {
        b.iter(|| mark_dscp(std::hint::black_box(0x02), std::hint::black_box(QosClass::Scavenger)));
    });
}

fn bench_admit_scavenger_under_burst(c: &mut Criterion) {
    let now = Instant::now();
    let mut table = ShaperTable::new();
    table.configure(7, QosClass::Scavenger, 1_000_000, now);

    c.bench_function("qos_admit_scavenger_repeated", |b| {
        b.iter(|| table.admit(std::hint::black_box(7), QosClass::Scavenger, 512, now));
    });
}

fn bench_admit_unconfigured_class(c: &mut Criterion) {
    let now = Instant::now();
    let mut table = ShaperTable::new();

    c.bench_function("qos_admit_unconfigured_always_true", |b| {
        b.iter(|| table.admit(std::hint::black_box(7), QosClass::Business, 512, now));
    });
}

criterion_group!(qos_benches, bench_mark_dscp, bench_admit_scavenger_under_burst, bench_admit_unconfigured_class);
criterion_main!(qos_benches);
