//! Performance benchmarks for the telnet codec.
//!
//! Measures decode throughput for clean and command-heavy input, and the cost
//! of escaping outbound data.

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio_util::codec::Decoder;

use chardev_core::telnet::{option, TelnetCodec, TelnetMode, IAC, IAC_DO, IAC_NOP, IAC_WILL};

/// `len` bytes where roughly one in `every` starts a telnet command.
fn input(len: usize, every: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut i = 0usize;
    while out.len() < len {
        if every > 0 && i % every == 0 {
            match i % 3 {
                0 => out.extend_from_slice(&[IAC, IAC_WILL, option::ECHO]),
                1 => out.extend_from_slice(&[IAC, IAC_DO, option::BINARY]),
                _ => out.extend_from_slice(&[IAC, IAC_NOP]),
            }
        } else {
            out.push(b'a' + (i % 26) as u8);
        }
        i += 1;
    }
    out.truncate(len);
    out
}

fn decode_all(codec: &mut TelnetCodec, data: &[u8]) -> usize {
    let mut src = BytesMut::from(data);
    let mut frames = 0;
    while let Ok(Some(frame)) = codec.decode(&mut src) {
        black_box(frame);
        frames += 1;
    }
    frames
}

/// Benchmark decoding at different command densities.
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("telnet_decode");

    for (name, every) in [("clean", 0), ("sparse", 512), ("dense", 8)] {
        let data = input(64 * 1024, every);
        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_with_input(BenchmarkId::new("64KiB", name), &data, |b, data| {
            b.iter(|| {
                let mut codec = TelnetCodec::new(TelnetMode::Telnet);
                black_box(decode_all(&mut codec, data));
            });
        });
    }

    group.finish();
}

/// Benchmark escaping outbound data.
fn bench_escape(c: &mut Criterion) {
    let mut group = c.benchmark_group("telnet_escape");
    let codec = TelnetCodec::new(TelnetMode::Telnet);

    for (name, fill) in [("no_iac", 0x41u8), ("all_iac", IAC)] {
        let data = vec![fill; 4096];
        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_with_input(BenchmarkId::new("4KiB", name), &data, |b, data| {
            b.iter(|| {
                let mut dst = BytesMut::with_capacity(data.len() * 2);
                codec.escape_into(data, &mut dst);
                black_box(dst);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_decode, bench_escape);
criterion_main!(benches);
