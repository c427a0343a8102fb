//! Micro benchmarks for the per-worker session tracker. Pure CPU, no IO.
//!
//! ```bash
//! cargo bench --bench bench_session
//! ```

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use criterion::{criterion_group, criterion_main, Criterion};

use sase_core::fivetuple::{FiveTuple, Protocol};
use sase_core::session::SessionTable;

fn tuple(n: u16) -> FiveTuple {
    FiveTuple {
        src_addr: Ipv4Addr::new(10, 1, (n >> 8) as u8, n as u8).into(),
        dst_addr: Ipv4Addr::new(203, 0, 113, 10).into(),
        src_port: 1024 + n,
        dst_port: 443,
        protocol: Protocol::Tcp,
    }
}

fn bench_track_new_session(c: &mut Criterion) {
    let now = Instant::now();
    let mut table = SessionTable::new(1_000_000, Duration::from_secs(300));
    let mut n: u16 = 0;

    c.bench_function("session_track_new_flow", |b| {
        b.iter(|| {
            n = n.wrapping_add(1);
            table.track(std::hint::black_box(tuple(n)), 7, now).unwrap()
        });
    });
}

fn bench_track_existing_session(c: &mut Criterion) {
    let now = Instant::now();
    let mut table = SessionTable::new(1024, Duration::from_secs(300));
    let key = tuple(1);
    table.track(key, 7, now).unwrap();

    c.bench_function("session_track_existing_flow", |b| {
        b.iter(|| table.track(std::hint::black_box(key), 7, now).unwrap());
    });
}

fn bench_sweep(c: &mut Criterion) {
    let now = Instant::now();
    let mut table = SessionTable::new(4096, Duration::from_secs(0));
    for n in 0..2048u16 {
        table.track(tuple(n), 7, now).unwrap();
    }
    let later = now + Duration::from_secs(1);

    c.bench_function("session_sweep_256_steps", |b| {
        b.iter(|| table.sweep(std::hint::black_box(later), 256));
    });
}

criterion_group!(session_benches, bench_track_new_session, bench_track_existing_session, bench_sweep);
criterion_main!(session_benches);
