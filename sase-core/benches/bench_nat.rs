//! Micro benchmarks for stateful NAT44 translation (spec §4.7). Pure CPU,
//! no IO.
//!
//! ```bash
//! cargo bench --bench bench_nat
//! ```

use std::net::Ipv4Addr;
use std::time::Instant;

use criterion::{criterion_group, criterion_main, Criterion};

use sase_core::fivetuple::{FiveTuple, Protocol};
use sase_core::nat::{NatPool, NatTable};

fn tuple(n: u16) -> FiveTuple {
    FiveTuple {
        src_addr: Ipv4Addr::new(10, 1, (n >> 8) as u8, n as u8).into(),
        dst_addr: Ipv4Addr::new(203, 0, 113, 10).into(),
        src_port: 1024 + n,
        dst_port: 443,
        protocol: Protocol::Tcp,
    }
}

fn bench_translate_new_mapping(c: &mut Criterion) {
    let now = Instant::now();
    let mut table = NatTable::new();
    table.configure_pool(7, NatPool::new(Ipv4Addr::new(198, 51, 100, 4).into(), 10000, 60000));
    let mut n: u16 = 0;

    c.bench_function("nat_translate_new_mapping", |b| {
        b.iter(|| {
            n = n.wrapping_add(1);
            table.translate(std::hint::black_box(tuple(n)), 7, false, now).unwrap()
        });
    });
}

fn bench_translate_existing_mapping(c: &mut Criterion) {
    let now = Instant::now();
    let mut table = NatTable::new();
    table.configure_pool(7, NatPool::new(Ipv4Addr::new(198, 51, 100, 4).into(), 10000, 60000));
    let key = tuple(1);
    table.translate(key, 7, false, now).unwrap();

    c.bench_function("nat_translate_existing_mapping", |b| {
        b.iter(|| table.translate(std::hint::black_box(key), 7, false, now).unwrap());
    });
}

criterion_group!(nat_benches, bench_translate_new_mapping, bench_translate_existing_mapping);
criterion_main!(nat_benches);
