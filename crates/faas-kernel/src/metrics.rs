//! Error/metric/tracing surface (spec §2, §4.5.3): labelled counters and a
//! duration histogram the worker loop emits after every invocation.
//!
//! Grounded on the plain `prometheus` crate idiom (`IntCounterVec` /
//! `HistogramVec` registered against a `Registry`), the same crate the
//! workspace already carries for the daemon's `/metrics` route — the
//! scheduler owns the registration, the daemon only renders it.

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

pub struct Metrics {
    registry: Registry,
    invocations_total: IntCounterVec,
    invocation_errors_total: IntCounterVec,
    cold_starts_total: IntCounterVec,
    duration_seconds: HistogramVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let invocations_total = IntCounterVec::new(
            Opts::new("faas_invocations_total", "Completed invocations by function/runtime/status"),
            &["function", "runtime", "status"],
        )
        .expect("static metric definition");
        let invocation_errors_total = IntCounterVec::new(
            Opts::new("faas_invocation_errors_total", "Failed invocations by function/runtime"),
            &["function", "runtime"],
        )
        .expect("static metric definition");
        let cold_starts_total = IntCounterVec::new(
            Opts::new("faas_cold_starts_total", "Cold-start invocations by function/runtime"),
            &["function", "runtime"],
        )
        .expect("static metric definition");
        let duration_seconds = HistogramVec::new(
            HistogramOpts::new("faas_invocation_duration_seconds", "Invocation duration"),
            &["function", "runtime", "status"],
        )
        .expect("static metric definition");

        registry
            .register(Box::new(invocations_total.clone()))
            .expect("metric registration");
        registry
            .register(Box::new(invocation_errors_total.clone()))
            .expect("metric registration");
        registry
            .register(Box::new(cold_starts_total.clone()))
            .expect("metric registration");
        registry
            .register(Box::new(duration_seconds.clone()))
            .expect("metric registration");

        Self {
            registry,
            invocations_total,
            invocation_errors_total,
            cold_starts_total,
            duration_seconds,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Records one completed invocation (spec §4.5.3 step 8): a counter
    /// labelled by (function, runtime, status), a duration histogram, and a
    /// cold-start/error counter when applicable.
    pub fn record_invocation(
        &self,
        function_name: &str,
        runtime: &str,
        status: &str,
        duration_ms: u64,
        cold_start: bool,
    ) {
        self.invocations_total
            .with_label_values(&[function_name, runtime, status])
            .inc();
        self.duration_seconds
            .with_label_values(&[function_name, runtime, status])
            .observe(duration_ms as f64 / 1000.0);
        if cold_start {
            self.cold_starts_total.with_label_values(&[function_name, runtime]).inc();
        }
        if status != "success" {
            self.invocation_errors_total
                .with_label_values(&[function_name, runtime])
                .inc();
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Encoder;

    #[test]
    fn records_show_up_in_the_text_exposition() {
        let metrics = Metrics::new();
        metrics.record_invocation("hello", "python3.11", "success", 42, true);
        metrics.record_invocation("hello", "python3.11", "failed", 7, false);

        let mut buf = Vec::new();
        prometheus::TextEncoder::new()
            .encode(&metrics.registry().gather(), &mut buf)
            .unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("faas_invocations_total"));
        assert!(text.contains("faas_cold_starts_total"));
        assert!(text.contains("faas_invocation_errors_total"));
    }
}
