//! Mailbox throughput benchmarks
//!
//! Measures the transport primitives and the guest register path.

use apple_a7iop::{A7iop, A7iopConfig, Direction, Generation, Message, MmioDevice};
use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;

fn build(generation: Generation) -> A7iop {
    A7iop::new(&A7iopConfig::new("BENCH", generation), None, None).expect("valid config")
}

fn transport_bench(c: &mut Criterion) {
    let iop = build(Generation::V4);
    c.bench_function("send-recv-iop", |b| {
        b.iter(|| {
            iop.send_iop(Message::new(0x20, black_box(0x1234)));
            black_box(iop.recv_iop())
        })
    });
}

fn register_bench(c: &mut Criterion) {
    for generation in [Generation::V2, Generation::V4] {
        let iop = build(generation);
        let layout = generation.layout();
        let base = generation.ap_mailbox_base();
        let recv0 = base + layout.recv_word(Direction::Ap, 0);

        c.bench_function(&format!("mmio-recv-{generation:?}"), |b| {
            b.iter(|| {
                iop.send_ap(Message::new(0x20, black_box(0x5678)));
                black_box(iop.read(recv0, 8))
            })
        });
    }
}

criterion_group!(benches, transport_bench, register_bench);
criterion_main!(benches);
