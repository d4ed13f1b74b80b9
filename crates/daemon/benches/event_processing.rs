//! Performance benchmarks for observer traffic.
//!
//! These benchmarks measure the hot paths between a shell and its observer:
//! - Event serialization
//! - Inbound text frame interpretation
//! - Output fan-out through the observer registry
//! - Output truncation for step reports

use std::sync::Arc;

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use daemon::exec::truncate_for_display;
use daemon::terminal::{ObserverHandle, ObserverRegistry};
use protocol::{ClientFrame, EventKind, LabEvent, Progress, StepReport};

fn bench_event_serialization(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_serialization");

    let progress = LabEvent::new(EventKind::Progress, "Executing setup steps...")
        .with_data(Progress::new(3, 6));
    group.bench_function("progress", |b| {
        b.iter(|| black_box(&progress).to_json().unwrap());
    });

    let step = LabEvent::new(EventKind::StepFailed, "[2/5] Failed: Install packages (exit code: 100)")
        .with_data(StepReport {
            step_number: 2,
            total_steps: 5,
            title: "Install packages".to_string(),
            exit_code: Some(100),
            expected_exit_code: Some(0),
            stdout: Some("Reading package lists...\n".repeat(40)),
            stderr: Some("E: Unable to locate package\n".to_string()),
            ..Default::default()
        });
    group.bench_function("step_failed_with_output", |b| {
        b.iter(|| black_box(&step).to_json().unwrap());
    });

    group.finish();
}

fn bench_frame_interpretation(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_interpretation");

    group.bench_function("keystroke_raw", |b| {
        b.iter(|| ClientFrame::interpret(black_box("l")));
    });
    group.bench_function("input_json", |b| {
        b.iter(|| ClientFrame::interpret(black_box(r#"{"type":"input","data":"ls -la\r"}"#)));
    });
    group.bench_function("resize_json", |b| {
        b.iter(|| ClientFrame::interpret(black_box(r#"{"type":"resize","cols":120,"rows":40}"#)));
    });

    group.finish();
}

fn bench_output_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("output_fanout");

    let registry = ObserverRegistry::new();
    let (handle, mut rx) = ObserverHandle::new(256);
    registry.attach("lab-1", Arc::new(handle));

    let chunk = Bytes::from(vec![b'x'; 4096]);
    group.throughput(Throughput::Bytes(chunk.len() as u64));
    group.bench_function("send_output_4KB", |b| {
        b.iter(|| {
            registry.send_output("lab-1", black_box(chunk.clone()));
            black_box(rx.try_recv().ok())
        });
    });

    group.bench_function("send_output_unobserved", |b| {
        b.iter(|| registry.send_output("lab-2", black_box(chunk.clone())));
    });

    group.finish();
}

fn bench_truncation(c: &mut Criterion) {
    let mut group = c.benchmark_group("truncation");

    let short = "ok\n".to_string();
    let long = "line of setup output\n".repeat(500);
    group.bench_function("short", |b| {
        b.iter(|| truncate_for_display(black_box(&short), 1000));
    });
    group.bench_function("long_10KB", |b| {
        b.iter(|| truncate_for_display(black_box(&long), 1000));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_event_serialization,
    bench_frame_interpretation,
    bench_output_fanout,
    bench_truncation,
);

criterion_main!(benches);
