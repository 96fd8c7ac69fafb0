//! Prometheus metrics for apply runs, the run queue and Waybill specs.
//!
//! All series live on a single owned [`Registry`] behind a process-wide
//! facade; tests call [`ApplierMetrics::reset`] to clear state between
//! cases instead of juggling registries.

use std::sync::OnceLock;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use regex::Regex;
use tracing::warn;

use crate::crd::Waybill;
use crate::run::RunType;

static METRICS: OnceLock<ApplierMetrics> = OnceLock::new();

/// Process-wide metrics instance
pub fn get() -> &'static ApplierMetrics {
    METRICS.get_or_init(ApplierMetrics::new)
}

/// Serializes tests that assert on the process-wide registry
#[cfg(test)]
pub(crate) fn test_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: OnceLock<std::sync::Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| std::sync::Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

/// One parsed `<type>/<name> <action>` line of apply output
#[derive(Debug, PartialEq, Eq)]
struct ApplyResultLine {
    type_: String,
    name: String,
    action: String,
}

fn output_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^([\w.\-]+)/([\w.\-]+) (\w+).*").expect("valid regex"))
}

/// Metrics registry for kube-applier
pub struct ApplierMetrics {
    registry: Registry,
    kubectl_exit_code_count: IntCounterVec,
    namespace_apply_count: IntCounterVec,
    run_latency: HistogramVec,
    result_summary: IntGaugeVec,
    last_run_timestamp: IntGaugeVec,
    run_queue: IntGaugeVec,
    run_queue_failures: IntCounterVec,
    waybill_spec_dry_run: IntGaugeVec,
    waybill_spec_run_interval: IntGaugeVec,
}

impl ApplierMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let kubectl_exit_code_count = IntCounterVec::new(
            Opts::new("kubectl_exit_code_count", "Count of kubectl exit codes"),
            &["namespace", "exit_code"],
        )
        .expect("Failed to create kubectl_exit_code_count metric");
        registry
            .register(Box::new(kubectl_exit_code_count.clone()))
            .expect("Failed to register kubectl_exit_code_count");

        let namespace_apply_count = IntCounterVec::new(
            Opts::new(
                "namespace_apply_count",
                "Success metric for every namespace applied",
            ),
            &["namespace", "success"],
        )
        .expect("Failed to create namespace_apply_count metric");
        registry
            .register(Box::new(namespace_apply_count.clone()))
            .expect("Failed to register namespace_apply_count");

        let run_latency = HistogramVec::new(
            HistogramOpts::new("run_latency_seconds", "Latency for completed apply runs"),
            &["success"],
        )
        .expect("Failed to create run_latency_seconds metric");
        registry
            .register(Box::new(run_latency.clone()))
            .expect("Failed to register run_latency_seconds");

        let result_summary = IntGaugeVec::new(
            Opts::new("result_summary", "Result summary for every manifest"),
            &["namespace", "type", "name", "action"],
        )
        .expect("Failed to create result_summary metric");
        registry
            .register(Box::new(result_summary.clone()))
            .expect("Failed to register result_summary");

        let last_run_timestamp = IntGaugeVec::new(
            Opts::new(
                "last_run_timestamp_seconds",
                "Timestamp of the last completed apply run",
            ),
            &["namespace"],
        )
        .expect("Failed to create last_run_timestamp_seconds metric");
        registry
            .register(Box::new(last_run_timestamp.clone()))
            .expect("Failed to register last_run_timestamp_seconds");

        let run_queue = IntGaugeVec::new(
            Opts::new("run_queue", "Number of run requests currently queued"),
            &["namespace", "type"],
        )
        .expect("Failed to create run_queue metric");
        registry
            .register(Box::new(run_queue.clone()))
            .expect("Failed to register run_queue");

        let run_queue_failures = IntCounterVec::new(
            Opts::new(
                "run_queue_failures",
                "Number of run requests dropped because the queue was full",
            ),
            &["namespace", "type"],
        )
        .expect("Failed to create run_queue_failures metric");
        registry
            .register(Box::new(run_queue_failures.clone()))
            .expect("Failed to register run_queue_failures");

        let waybill_spec_dry_run = IntGaugeVec::new(
            Opts::new(
                "waybill_spec_dry_run",
                "dryRun flag of the Waybill spec, per namespace",
            ),
            &["namespace"],
        )
        .expect("Failed to create waybill_spec_dry_run metric");
        registry
            .register(Box::new(waybill_spec_dry_run.clone()))
            .expect("Failed to register waybill_spec_dry_run");

        let waybill_spec_run_interval = IntGaugeVec::new(
            Opts::new(
                "waybill_spec_run_interval",
                "runInterval of the Waybill spec, per namespace",
            ),
            &["namespace"],
        )
        .expect("Failed to create waybill_spec_run_interval metric");
        registry
            .register(Box::new(waybill_spec_run_interval.clone()))
            .expect("Failed to register waybill_spec_run_interval");

        Self {
            registry,
            kubectl_exit_code_count,
            namespace_apply_count,
            run_latency,
            result_summary,
            last_run_timestamp,
            run_queue,
            run_queue_failures,
            waybill_spec_dry_run,
            waybill_spec_run_interval,
        }
    }

    /// Increment the exit-code counter for a kubectl invocation
    pub fn update_kubectl_exit_code_count(&self, namespace: &str, code: i32) {
        self.kubectl_exit_code_count
            .with_label_values(&[namespace, &code.to_string()])
            .inc();
    }

    /// Adjust the queued-request gauge when a request is queued (+1) or
    /// picked up by a worker (-1)
    pub fn update_run_request(&self, type_: RunType, waybill: &Waybill, diff: i64) {
        self.run_queue
            .with_label_values(&[waybill.namespace(), &type_.to_string()])
            .add(diff);
    }

    /// Count a request that was dropped because the queue stayed full
    pub fn add_run_request_queue_failure(&self, type_: RunType, waybill: &Waybill) {
        self.run_queue_failures
            .with_label_values(&[waybill.namespace(), &type_.to_string()])
            .inc();
    }

    /// Record the outcome of a finished run from the Waybill's lastRun
    /// status: apply count, latency, last-run timestamp and the per-object
    /// result summary parsed from the captured output.
    pub fn update_from_last_run(&self, waybill: &Waybill) {
        let Some(last_run) = waybill.status.as_ref().and_then(|s| s.last_run.as_ref()) else {
            return;
        };
        let success = last_run.success.to_string();
        self.namespace_apply_count
            .with_label_values(&[waybill.namespace(), &success])
            .inc();
        if let (Some(started), Some(finished)) = (&last_run.started, &last_run.finished) {
            let latency = (finished.0 - started.0).num_milliseconds() as f64 / 1000.0;
            self.run_latency
                .with_label_values(&[&success])
                .observe(latency);
            self.last_run_timestamp
                .with_label_values(&[waybill.namespace()])
                .set(finished.0.timestamp());
        }

        // Only the latest run's objects are reported.
        self.result_summary.reset();
        for result in parse_apply_output(&last_run.output) {
            self.result_summary
                .with_label_values(&[
                    waybill.namespace(),
                    &result.type_,
                    &result.name,
                    &result.action,
                ])
                .set(1);
        }
    }

    /// Refresh the per-namespace spec gauges on each Waybill sync
    pub fn update_waybill_spec(&self, waybill: &Waybill) {
        self.waybill_spec_dry_run
            .with_label_values(&[waybill.namespace()])
            .set(i64::from(waybill.spec.dry_run));
        self.waybill_spec_run_interval
            .with_label_values(&[waybill.namespace()])
            .set(waybill.run_interval());
    }

    /// Encode all series in the Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Clear all series. Intended for tests.
    pub fn reset(&self) {
        self.kubectl_exit_code_count.reset();
        self.namespace_apply_count.reset();
        self.run_latency.reset();
        self.result_summary.reset();
        self.last_run_timestamp.reset();
        self.run_queue.reset();
        self.run_queue_failures.reset();
        self.waybill_spec_dry_run.reset();
        self.waybill_spec_run_interval.reset();
    }
}

/// Extract `<type>/<name> <action>` triplets from apply output
fn parse_apply_output(output: &str) -> Vec<ApplyResultLine> {
    let mut results = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match output_pattern().captures(line) {
            Some(caps) => results.push(ApplyResultLine {
                type_: caps[1].to_string(),
                name: caps[2].to_string(),
                action: caps[3].to_string(),
            }),
            None => {
                warn!(line, "expected format: <resource-type>/<name> <action>");
            }
        }
    }
    results
}
