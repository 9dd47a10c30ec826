//! Prometheus metrics exporter.
//!
//! Exports metrics in Prometheus text format.

use std::sync::Arc;

use super::collector::{HistogramSnapshot, MetricsCollector};

/// Prometheus metrics exporter.
pub struct PrometheusExporter {
    collector: Arc<MetricsCollector>,
    namespace: String,
}

impl PrometheusExporter {
    /// Create a new Prometheus exporter.
    pub fn new(collector: Arc<MetricsCollector>) -> Self {
        Self::with_namespace(collector, "courier")
    }

    /// Create a new Prometheus exporter with custom namespace.
    pub fn with_namespace(collector: Arc<MetricsCollector>, namespace: impl Into<String>) -> Self {
        Self {
            collector,
            namespace: namespace.into(),
        }
    }

    /// Export metrics in Prometheus text format.
    pub fn export(&self) -> String {
        let snapshot = self.collector.snapshot();
        let mut output = String::new();

        // Submission metrics
        self.write_header(
            &mut output,
            "submissions_total",
            "Job submissions by priority and outcome",
            "counter",
        );
        for (priority, outcome, count) in &snapshot.submissions {
            self.write_sample(
                &mut output,
                "submissions_total",
                &[("priority", priority), ("outcome", outcome)],
                *count as f64,
            );
        }

        self.write_header(
            &mut output,
            "lane_depth",
            "Jobs waiting per priority lane",
            "gauge",
        );
        for (priority, depth) in &snapshot.lane_depth {
            self.write_sample(&mut output, "lane_depth", &[("priority", priority)], *depth as f64);
        }

        // Processing metrics
        self.write_header(
            &mut output,
            "jobs_processed_total",
            "Jobs reaching a terminal state by destination and state",
            "counter",
        );
        for (destination, state, count) in &snapshot.jobs_processed {
            self.write_sample(
                &mut output,
                "jobs_processed_total",
                &[("destination", destination), ("state", state)],
                *count as f64,
            );
        }

        self.write_header(
            &mut output,
            "retry_attempts_total",
            "Retries by destination and error classification",
            "counter",
        );
        for (destination, class, count) in &snapshot.retry_attempts {
            self.write_sample(
                &mut output,
                "retry_attempts_total",
                &[("destination", destination), ("classification", class)],
                *count as f64,
            );
        }

        self.write_histogram(
            &mut output,
            "job_duration_seconds",
            "End-to-end job processing time",
            &snapshot.job_duration,
        );
        self.write_histogram(
            &mut output,
            "queue_wait_seconds",
            "Time spent queued before the first attempt",
            &snapshot.queue_wait,
        );

        self.write_gauge(
            &mut output,
            "active_workers",
            "Workers currently processing a job",
            snapshot.active_workers as f64,
        );
        self.write_gauge(
            &mut output,
            "idle_workers",
            "Workers waiting for a job",
            snapshot.idle_workers as f64,
        );

        // Circuit breaker metrics
        self.write_header(
            &mut output,
            "circuit_breaker_trips_total",
            "Circuit breaker trips by destination",
            "counter",
        );
        for (destination, count) in &snapshot.breaker_trips {
            self.write_sample(
                &mut output,
                "circuit_breaker_trips_total",
                &[("destination", destination)],
                *count as f64,
            );
        }

        self.write_header(
            &mut output,
            "circuit_breaker_recoveries_total",
            "Circuit breaker recoveries by destination",
            "counter",
        );
        for (destination, count) in &snapshot.breaker_recoveries {
            self.write_sample(
                &mut output,
                "circuit_breaker_recoveries_total",
                &[("destination", destination)],
                *count as f64,
            );
        }

        // Dead letter metrics
        self.write_header(
            &mut output,
            "dead_letter_writes_total",
            "Dead-letter writes by destination",
            "counter",
        );
        for (destination, count) in &snapshot.dead_letter_writes {
            self.write_sample(
                &mut output,
                "dead_letter_writes_total",
                &[("destination", destination)],
                *count as f64,
            );
        }

        self.write_header(
            &mut output,
            "dead_letter_replays_total",
            "Dead-letter replays by outcome",
            "counter",
        );
        for (outcome, count) in &snapshot.dead_letter_replays {
            self.write_sample(
                &mut output,
                "dead_letter_replays_total",
                &[("outcome", outcome)],
                *count as f64,
            );
        }

        self.write_gauge(
            &mut output,
            "dead_letter_size",
            "Entries currently in the dead-letter store",
            snapshot.dead_letter_size as f64,
        );

        output
    }

    fn full_name(&self, name: &str) -> String {
        format!("{}_{}", self.namespace, name)
    }

    fn write_header(&self, output: &mut String, name: &str, help: &str, kind: &str) {
        let full_name = self.full_name(name);
        output.push_str(&format!("# HELP {} {}\n", full_name, help));
        output.push_str(&format!("# TYPE {} {}\n", full_name, kind));
    }

    fn write_sample(&self, output: &mut String, name: &str, labels: &[(&str, &str)], value: f64) {
        let full_name = self.full_name(name);
        if labels.is_empty() {
            output.push_str(&format!("{} {}\n", full_name, value));
            return;
        }

        let labels_str = labels
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, escape_label(v)))
            .collect::<Vec<_>>()
            .join(",");

        output.push_str(&format!("{}{{{}}} {}\n", full_name, labels_str, value));
    }

    fn write_gauge(&self, output: &mut String, name: &str, help: &str, value: f64) {
        self.write_header(output, name, help, "gauge");
        self.write_sample(output, name, &[], value);
    }

    fn write_histogram(&self, output: &mut String, name: &str, help: &str, hist: &HistogramSnapshot) {
        self.write_header(output, name, help, "histogram");
        let bucket = format!("{}_bucket", name);

        for (bound_ms, count) in &hist.buckets {
            let le = format!("{}", *bound_ms as f64 / 1000.0);
            self.write_sample(output, &bucket, &[("le", &le)], *count as f64);
        }
        self.write_sample(output, &bucket, &[("le", "+Inf")], hist.count as f64);
        self.write_sample(
            output,
            &format!("{}_sum", name),
            &[],
            hist.sum_ms as f64 / 1000.0,
        );
        self.write_sample(output, &format!("{}_count", name), &[], hist.count as f64);
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
