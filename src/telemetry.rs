//! Metric descriptions shared by the server and the worker.

use metrics::{describe_counter, describe_histogram, Unit};

/// Register help text for every metric this crate emits. Call after installing
/// the recorder.
pub fn describe_metrics() {
    describe_counter!("rounds_started_total", "Retrieval rounds started by alerts");
    describe_counter!(
        "rounds_available_total",
        "Rounds whose retrievals all resolved"
    );
    describe_counter!("rounds_completed_total", "Rounds marked done");
    describe_counter!(
        "rounds_poll_failures_total",
        "Rounds skipped in a sweep because polling failed or the document was unreadable"
    );
    describe_counter!(
        "rounds_action_failures_total",
        "Failed terminal action runs"
    );
    describe_counter!(
        "rounds_abandoned_total",
        "Rounds completed with an error after repeated action failures"
    );
    describe_histogram!(
        "round_check_seconds",
        Unit::Seconds,
        "Duration of one check sweep"
    );
    describe_counter!("slug_bugs_detected_total", "Slug bug sightings notified");
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString};

    use super::*;

    /// Records the names of described metrics.
    #[derive(Default)]
    struct Descriptions(Mutex<Vec<String>>);

    impl Descriptions {
        fn push(&self, key: KeyName) {
            self.0.lock().unwrap().push(key.as_str().to_string());
        }
    }

    impl Recorder for Descriptions {
        fn describe_counter(&self, key: KeyName, _unit: Option<Unit>, _description: SharedString) {
            self.push(key);
        }

        fn describe_gauge(&self, key: KeyName, _unit: Option<Unit>, _description: SharedString) {
            self.push(key);
        }

        fn describe_histogram(&self, key: KeyName, _unit: Option<Unit>, _description: SharedString) {
            self.push(key);
        }

        fn register_counter(&self, _key: &Key, _metadata: &Metadata<'_>) -> Counter {
            Counter::noop()
        }

        fn register_gauge(&self, _key: &Key, _metadata: &Metadata<'_>) -> Gauge {
            Gauge::noop()
        }

        fn register_histogram(&self, _key: &Key, _metadata: &Metadata<'_>) -> Histogram {
            Histogram::noop()
        }
    }

    #[test]
    fn test_every_emitted_metric_is_described() {
        let recorder = Descriptions::default();
        metrics::with_local_recorder(&recorder, describe_metrics);

        let described = recorder.0.lock().unwrap();
        for name in [
            "rounds_started_total",
            "rounds_available_total",
            "rounds_completed_total",
            "rounds_poll_failures_total",
            "rounds_action_failures_total",
            "rounds_abandoned_total",
            "round_check_seconds",
            "slug_bugs_detected_total",
        ] {
            assert!(described.iter().any(|d| d == name), "{name} is not described");
        }
    }
}
