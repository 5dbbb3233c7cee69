//! Detector throughput over realistic streaming shapes.

use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};

use lumo_bridge_common::BridgeMetrics;
use lumo_bridge_detect::{JsonBraceTracker, StreamingToolDetector};

fn plain_prose(c: &mut Criterion) {
    let text = "The weather in Paris is mild today, with light rain expected. ".repeat(64);
    let chunks: Vec<&str> = text
        .as_bytes()
        .chunks(24)
        .map(|b| std::str::from_utf8(b).unwrap_or(""))
        .collect();

    c.bench_function("detector_plain_prose", |b| {
        b.iter(|| {
            let mut det = StreamingToolDetector::new("user:", BridgeMetrics::new());
            for chunk in &chunks {
                black_box(det.process_chunk(chunk));
            }
            black_box(det.finalize());
        });
    });
}

fn fenced_tool_call(c: &mut Criterion) {
    let text = format!(
        "Let me check. ```json\n{{\"name\":\"user:get_weather\",\"arguments\":{{\"city\":\"{}\"}}}}``` Done.",
        "P".repeat(512)
    );
    let chunks: Vec<&str> = text
        .as_bytes()
        .chunks(16)
        .map(|b| std::str::from_utf8(b).unwrap_or(""))
        .collect();

    c.bench_function("detector_fenced_tool_call", |b| {
        b.iter(|| {
            let mut det = StreamingToolDetector::new("user:", BridgeMetrics::new());
            for chunk in &chunks {
                black_box(det.process_chunk(chunk));
            }
            black_box(det.finalize());
        });
    });
}

fn brace_tracker_single_bytes(c: &mut Criterion) {
    let object = format!("{{\"name\":\"t\",\"arguments\":{{\"blob\":\"{}\"}}}}", "x".repeat(1024));

    c.bench_function("brace_tracker_single_bytes", |b| {
        b.iter(|| {
            let mut tracker = JsonBraceTracker::new();
            for ch in object.chars() {
                let mut buf = [0u8; 4];
                black_box(tracker.feed(ch.encode_utf8(&mut buf)));
            }
        });
    });
}

criterion_group!(benches, plain_prose, fenced_tool_call, brace_tracker_single_bytes);
criterion_main!(benches);
