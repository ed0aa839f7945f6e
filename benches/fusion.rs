use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

use tickstream::fusion::FusionTable;
use tickstream::indicators::IndicatorBook;
use tickstream::types::Tick;
use tickstream::worker::TickBuffer;

const BROKERS: [&str; 5] = ["kite", "upstox", "angel", "dhan", "fyers"];

fn fusion_update(c: &mut Criterion) {
    let mut table = FusionTable::new();
    let mut price = 24_500.0;
    c.bench_function("fusion_update_5_brokers", |b| {
        b.iter(|| {
            for broker in BROKERS {
                price += 0.05;
                black_box(table.update("NIFTY 50", broker, price));
            }
        })
    });
}

fn buffer_merge(c: &mut Criterion) {
    let ticks: Vec<Tick> = (0..1_000u32)
        .map(|i| {
            let mut tick = Tick::new(256_265 + i % 50);
            tick.last_price = Some(24_500.0 + i as f64 * 0.05);
            tick.volume = Some(u64::from(i));
            tick
        })
        .collect();

    c.bench_function("buffer_merge_1000_ticks_50_tokens", |b| {
        b.iter_batched(
            TickBuffer::new,
            |mut buffer| {
                for tick in &ticks {
                    buffer.merge(tick.clone());
                }
                black_box(buffer.drain())
            },
            BatchSize::SmallInput,
        )
    });
}

fn ema_full_window(c: &mut Criterion) {
    let mut book = IndicatorBook::new(500, 20);
    for i in 0..500 {
        book.push("NIFTY 50", 24_500.0 + (i % 17) as f64);
    }
    c.bench_function("ema_push_full_window", |b| {
        b.iter(|| black_box(book.push("NIFTY 50", black_box(24_510.0))))
    });
}

criterion_group!(benches, fusion_update, buffer_merge, ema_full_window);
criterion_main!(benches);
