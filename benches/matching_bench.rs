//! Criterion micro-benchmarks for the matching hot path.
//!
//! These benchmarks measure the stages a worker round runs per pool:
//! - Ticket-to-view conversion
//! - Candidate slot insertion
//! - Full match rounds at increasing pool sizes (the 1,000-ticket case
//!   crosses the parallel-search threshold)
//!
//! Run with: `cargo bench --bench matching_bench`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use crymatch::matching::{match_function, TicketView};
use crymatch::protocol::{Affinity, Ticket};
use crymatch::types::{GlobalId, PoolId};

fn rated_ticket(rating: f32) -> Ticket {
    Ticket {
        global_id: GlobalId::random(),
        expiry_matchmaker: 1_000_000_000,
        affinities: vec![Affinity {
            value: rating,
            max_margin: 1000.0,
            prefer_disimilar: false,
            soft_margin: true,
            priority_factor: 1.0,
        }],
        state: vec![vec![rating], vec![1.0]],
        ..Ticket::new(PoolId::default_pool())
    }
}

fn population(n: usize) -> Vec<Ticket> {
    (0..n)
        .map(|i| rated_ticket(800.0 + ((i * 37) % 800) as f32))
        .collect()
}

fn bench_conversion(c: &mut Criterion) {
    let mut group = c.benchmark_group("ticket_conversion");
    let tickets = population(1_000);
    let max_state = TicketView::max_state_size(&tickets);

    group.throughput(Throughput::Elements(tickets.len() as u64));
    group.bench_function("convert_1000", |b| {
        b.iter(|| {
            let views: Vec<TicketView> = tickets
                .iter()
                .map(|t| TicketView::convert(black_box(t), max_state, 8))
                .collect();
            black_box(views)
        });
    });
    group.finish();
}

fn bench_add_candidate(c: &mut Criterion) {
    let mut group = c.benchmark_group("add_candidate");
    let tickets = population(256);

    group.bench_function("fill_and_churn", |b| {
        b.iter_with_setup(
            || {
                tickets
                    .iter()
                    .map(|t| TicketView::convert(t, 2, 8))
                    .collect::<Vec<TicketView>>()
            },
            |views| {
                // Churn the first ticket's slots with ratings that keep
                // displacing the tail.
                for i in 1..views.len() {
                    views[0].add_candidate(&views, i, i as f32);
                }
                black_box(views)
            },
        );
    });
    group.finish();
}

fn bench_match_rounds(c: &mut Criterion) {
    let mut group = c.benchmark_group("match_function");
    group.sample_size(10);

    for &n in [100usize, 1_000, 4_000].iter() {
        let tickets = population(n);
        let max_state = TicketView::max_state_size(&tickets);

        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::new("round_1v1", n), &n, |b, _| {
            b.iter_with_setup(
                || {
                    tickets
                        .iter()
                        .map(|t| TicketView::convert(t, max_state, 8))
                        .collect::<Vec<TicketView>>()
                },
                |mut views| {
                    let outcome = match_function(&mut views, 2, None, false);
                    black_box(outcome)
                },
            );
        });
    }
    group.finish();
}

fn bench_wire_codec(c: &mut Criterion) {
    use crymatch::protocol::Ticket;
    use crymatch::ToWire;

    let mut group = c.benchmark_group("wire_codec");
    let tickets = population(1_000);

    group.throughput(Throughput::Elements(tickets.len() as u64));
    group.bench_function("encode_1000", |b| {
        b.iter(|| {
            let payloads: Vec<_> = tickets.iter().map(|t| black_box(t).to_wire()).collect();
            black_box(payloads)
        });
    });

    let payloads: Vec<_> = tickets.iter().map(ToWire::to_wire).collect();
    group.bench_function("parse_1000", |b| {
        b.iter(|| {
            let parsed: Vec<Ticket> = payloads
                .iter()
                .map(|p| Ticket::from_wire(black_box(p)).expect("bench payloads are valid"))
                .collect();
            black_box(parsed)
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_conversion,
    bench_add_candidate,
    bench_match_rounds,
    bench_wire_codec
);
criterion_main!(benches);
