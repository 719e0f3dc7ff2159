use std::time::{Duration, Instant};

use opentelemetry::{
    metrics::{Counter, Histogram},
    KeyValue,
};

/// Sink for elapsed-time observations.
pub trait ElapsedSink {
    fn observe(&self, elapsed: Duration, labels: &[KeyValue]);
}

impl ElapsedSink for Histogram<f64> {
    fn observe(&self, elapsed: Duration, labels: &[KeyValue]) {
        self.record(elapsed.as_secs_f64(), labels);
    }
}

impl ElapsedSink for Counter<f64> {
    fn observe(&self, elapsed: Duration, labels: &[KeyValue]) {
        self.add(elapsed.as_secs_f64(), labels);
    }
}

/// Measures a scope and records the elapsed time into the sink on drop.
pub struct Timer<'a, T: ElapsedSink> {
    started: Instant,
    sink: &'a T,
    labels: &'a [KeyValue],
}

impl<'a, T: ElapsedSink> Timer<'a, T> {
    pub fn start(sink: &'a T, labels: &'a [KeyValue]) -> Self {
        Self {
            started: Instant::now(),
            sink,
            labels,
        }
    }
}

impl<T: ElapsedSink> Drop for Timer<'_, T> {
    fn drop(&mut self) {
        self.sink.observe(self.started.elapsed(), self.labels);
    }
}

pub mod api_io_stats {
    use opentelemetry::metrics::{Counter, UpDownCounter};

    #[derive(Debug)]
    pub struct Metrics {
        pub uploads: Counter<u64>,
        pub upload_bytes: Counter<u64>,
        pub installs_started: Counter<u64>,
        pub installs_failed: Counter<u64>,
        pub installs_cancelled: Counter<u64>,
        pub artifact_downloads: Counter<u64>,
        pub event_streams_active: UpDownCounter<i64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("swinstall-server");
            let uploads = meter
                .u64_counter("swinstall.server.uploads")
                .with_description("number of package uploads accepted")
                .build();
            let upload_bytes = meter
                .u64_counter("swinstall.server.upload_bytes")
                .with_description("number of bytes ingested during package uploads")
                .build();
            let installs_started = meter
                .u64_counter("swinstall.server.installs_started")
                .with_description("number of install runs started")
                .build();
            let installs_failed = meter
                .u64_counter("swinstall.server.installs_failed")
                .with_description("number of install runs that ended in error")
                .build();
            let installs_cancelled = meter
                .u64_counter("swinstall.server.installs_cancelled")
                .with_description("number of install runs cancelled by an operator")
                .build();
            let artifact_downloads = meter
                .u64_counter("swinstall.server.artifact_downloads")
                .with_description("number of CI artifact downloads started")
                .build();
            let event_streams_active = meter
                .i64_up_down_counter("swinstall.server.event_streams_active")
                .with_description("number of currently open progress streams")
                .build();
            Metrics {
                uploads,
                upload_bytes,
                installs_started,
                installs_failed,
                installs_cancelled,
                artifact_downloads,
                event_streams_active,
            }
        }
    }
}

pub mod state_store_stats {
    use opentelemetry::metrics::Histogram;

    #[derive(Debug)]
    pub struct StateStoreMetrics {
        pub state_write: Histogram<f64>,
    }

    impl Default for StateStoreMetrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl StateStoreMetrics {
        pub fn new() -> StateStoreMetrics {
            let meter = opentelemetry::global::meter("swinstall-server");
            let state_write = meter
                .f64_histogram("swinstall.state_store.write_latency")
                .with_description("state store write latencies in seconds")
                .build();
            StateStoreMetrics { state_write }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct RecordingSink(Mutex<Vec<f64>>);

    impl ElapsedSink for RecordingSink {
        fn observe(&self, elapsed: Duration, _labels: &[KeyValue]) {
            self.0.lock().unwrap().push(elapsed.as_secs_f64());
        }
    }

    #[test]
    fn timer_records_exactly_once_on_drop() {
        let sink = RecordingSink(Mutex::new(Vec::new()));
        {
            let _timer = Timer::start(&sink, &[]);
            assert!(sink.0.lock().unwrap().is_empty());
        }
        let observed = sink.0.lock().unwrap();
        assert_eq!(observed.len(), 1);
        assert!(observed[0] >= 0.0);
    }
}
