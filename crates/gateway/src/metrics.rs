use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static DECISIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static TOOL_CALLS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static EXECUTOR_LATENCY_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static APPROVALS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static AUDIT_WRITE_FAILURES_TOTAL: OnceLock<IntCounter> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn http_requests_total() -> &'static IntCounterVec {
    HTTP_REQUESTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "datagate_gateway_http_requests_total",
                    "Gateway HTTP request count.",
                ),
                &["route", "status"],
            )
            .expect("create datagate_gateway_http_requests_total"),
        )
    })
}

fn decisions_total() -> &'static IntCounterVec {
    DECISIONS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "datagate_gateway_decisions_total",
                    "Policy decisions by verdict.",
                ),
                &["decision"],
            )
            .expect("create datagate_gateway_decisions_total"),
        )
    })
}

fn tool_calls_total() -> &'static IntCounterVec {
    TOOL_CALLS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "datagate_gateway_tool_calls_total",
                    "Tool invocations by tool and outcome.",
                ),
                &["tool", "outcome"],
            )
            .expect("create datagate_gateway_tool_calls_total"),
        )
    })
}

fn executor_latency_seconds() -> &'static HistogramVec {
    EXECUTOR_LATENCY_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "datagate_gateway_executor_latency_seconds",
                    "Tool execution latency in seconds.",
                )
                .buckets(vec![
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
                ]),
                &["tool"],
            )
            .expect("create datagate_gateway_executor_latency_seconds"),
        )
    })
}

fn approvals_total() -> &'static IntCounterVec {
    APPROVALS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "datagate_gateway_approvals_total",
                    "Approval requests by terminal outcome.",
                ),
                &["outcome"],
            )
            .expect("create datagate_gateway_approvals_total"),
        )
    })
}

fn audit_write_failures_total() -> &'static IntCounter {
    AUDIT_WRITE_FAILURES_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "datagate_gateway_audit_write_failures_total",
                "Audit writes that failed and aborted their request.",
            )
            .expect("create datagate_gateway_audit_write_failures_total"),
        )
    })
}

pub fn observe_http_request(route: &str, status: u16) {
    let status_str = status.to_string();
    http_requests_total()
        .with_label_values(&[route, status_str.as_str()])
        .inc();
}

pub fn observe_decision(decision: &str) {
    decisions_total().with_label_values(&[decision]).inc();
}

pub fn observe_tool_call(tool: &str, outcome: &str) {
    tool_calls_total().with_label_values(&[tool, outcome]).inc();
}

pub fn observe_executor_latency(tool: &str, latency: Duration) {
    executor_latency_seconds()
        .with_label_values(&[tool])
        .observe(latency.as_secs_f64());
}

pub fn observe_approval(outcome: &str) {
    approvals_total().with_label_values(&[outcome]).inc();
}

pub fn inc_audit_write_failure() {
    audit_write_failures_total().inc();
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = audit_write_failures_total();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}
