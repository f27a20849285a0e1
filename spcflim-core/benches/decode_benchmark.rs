//! Benchmarks for raw-record decoding and the full pixellation path.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use spcflim_core::histogram::{FrameCallbackSink, Histogram, Histogrammer};
use spcflim_core::parser::{encode_marker, encode_photon, encode_multiple_overflow};
use spcflim_core::pixellator::{LineClockPixellator, PixellatorConfig};
use spcflim_core::types::{DecodedEvent, DecodedEventSink, DeviceEventSink, SinkError};
use spcflim_core::SpcEventDecoder;

/// Synthetic scan: line markers every `width * pixel_time` units with evenly
/// spread photons, overflow records keeping macro-times in range.
fn synthetic_scan(lines: u32, photons_per_line: u32) -> Vec<u32> {
    let mut words = Vec::new();
    for line in 0..lines {
        // Lines are 4000 units apart; one overflow record per line keeps the
        // 12-bit macro-time counter in range.
        if line > 0 {
            words.push(encode_multiple_overflow(1));
        }
        words.push(encode_marker(0, 0b0010));
        for p in 0..photons_per_line {
            let offset = 1 + p * (3800 / photons_per_line.max(1));
            words.push(encode_photon(offset as u16, (p * 37 % 4096) as u16, 0));
        }
    }
    words
}

/// Sink that counts events without further processing.
struct CountingSink(u64);

impl DecodedEventSink for CountingSink {
    fn handle_event(&mut self, event: DecodedEvent) -> Result<(), SinkError> {
        black_box(event);
        self.0 += 1;
        Ok(())
    }
    fn handle_error(&mut self, _message: &str) {}
    fn handle_finish(&mut self) {}
}

fn decode_benchmark(c: &mut Criterion) {
    let words = synthetic_scan(1000, 100);

    let mut group = c.benchmark_group("decode_buffer");
    group.throughput(Throughput::Elements(words.len() as u64));

    group.bench_function("synthetic_100k_photons", |b| {
        b.iter(|| {
            let mut decoder = SpcEventDecoder::new(Box::new(CountingSink(0)));
            decoder.handle_words(black_box(&words)).unwrap();
            decoder.handle_finish();
        })
    });

    group.finish();
}

fn pipeline_benchmark(c: &mut Criterion) {
    let words = synthetic_scan(4096, 64);

    let mut group = c.benchmark_group("full_pipeline");
    group.throughput(Throughput::Elements(words.len() as u64));

    group.bench_function("decode_pixellate_histogram", |b| {
        b.iter(|| {
            let sink = FrameCallbackSink::new(Box::new(|frame| {
                black_box(frame.total_count());
            }), None);
            let histogrammer =
                Histogrammer::with_sink(Histogram::for_device(8, true, 64, 64), Box::new(sink));
            let pixellator = LineClockPixellator::new(
                PixellatorConfig {
                    width: 64,
                    height: 64,
                    max_frames: 64,
                    line_delay: 0,
                    pixel_time: 59, // 64 pixels inside the 4000-unit line pitch
                    line_marker_bit: 1,
                    frame_marker_bit: None,
                },
                Box::new(histogrammer),
                None,
            );
            let mut decoder = SpcEventDecoder::new(Box::new(pixellator));
            decoder.handle_words(black_box(&words)).unwrap();
            decoder.handle_finish();
        })
    });

    group.finish();
}

criterion_group!(benches, decode_benchmark, pipeline_benchmark);
criterion_main!(benches);
