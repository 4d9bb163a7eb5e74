use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram, MeterProvider},
    KeyValue,
};
use prometheus::Registry;
use std::collections::HashSet;

pub struct Metrics {
    request_counter: Counter<u64>,
    frames_sent: Counter<u64>,
    frames_dropped: Counter<u64>,
    encode_duration: Histogram<u64>,
    confidence_updates: Counter<u64>,
    training_epoch: Gauge<u64>,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build prometheus exporter: {e}"))?;

        let provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
            .with_reader(exporter)
            .build();

        let meter = provider.meter("live_classifier");
        global::set_meter_provider(provider);

        let request_counter = meter
            .u64_counter("requests_total")
            .with_description("Total number of status requests")
            .build();

        let frames_sent = meter
            .u64_counter("frames_sent_total")
            .with_description("Frames sent on the inference channel")
            .build();

        let frames_dropped = meter
            .u64_counter("frames_dropped_total")
            .with_description("Capture ticks that did not produce a sent frame")
            .build();

        let boundaries = generate_boundaries((5, 25, 45, 205, 1005));

        let encode_duration = meter
            .u64_histogram("frame_encode_duration_ms")
            .with_boundaries(boundaries)
            .with_description("Capture and encode time per frame in milliseconds")
            .build();

        let confidence_updates = meter
            .u64_counter("confidence_updates_total")
            .with_description("Confidence messages applied to the live model")
            .build();

        let training_epoch = meter
            .u64_gauge("training_epoch")
            .with_description("Last epoch reported by the monitored training session")
            .build();

        Ok(Metrics {
            request_counter,
            frames_sent,
            frames_dropped,
            encode_duration,
            confidence_updates,
            training_epoch,
            registry,
        })
    }

    pub fn record_request(&self, route: &str) {
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.request_counter.add(1, &attributes);
    }

    pub fn record_frame_sent(&self, encode_ms: u64) {
        self.frames_sent.add(1, &[]);
        self.encode_duration.record(encode_ms, &[]);
    }

    pub fn record_frame_dropped(&self, reason: &'static str) {
        let attributes = vec![KeyValue::new("reason", reason)];
        self.frames_dropped.add(1, &attributes);
    }

    pub fn record_confidence_update(&self) {
        self.confidence_updates.add(1, &[]);
    }

    pub fn record_training_epoch(&self, epoch: u32) {
        self.training_epoch.record(u64::from(epoch), &[]);
    }
}

fn generate_boundaries(parts: (i32, i32, i32, i32, i32)) -> Vec<f64> {
    let first_step: usize = 10;
    let middle_step: usize = 2;
    let end_step: usize = 20;
    let tail_step: usize = 100;
    let first_part = (parts.0..=parts.1).step_by(first_step);
    let middle_part = (parts.1..=parts.2).step_by(middle_step);
    let end_part = (parts.2..=parts.3).step_by(end_step);
    let tail_part = (parts.3..=parts.4).step_by(tail_step);

    let mut seen = HashSet::new();
    first_part
        .chain(middle_part)
        .chain(end_part)
        .chain(tail_part)
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}
