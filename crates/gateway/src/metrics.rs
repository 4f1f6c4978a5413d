use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static INGEST_EVENTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static EVENTS_PUBLISHED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static RATE_LIMITED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static SSE_CLIENTS: OnceLock<IntGauge> = OnceLock::new();

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
                Opts::new("pik_gateway_http_requests_total", "Gateway HTTP request count."),
                &["route", "method", "status"],
            )
            .expect("create pik_gateway_http_requests_total"),
        )
    })
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "pik_gateway_http_request_duration_seconds",
                    "Gateway HTTP request duration in seconds.",
                )
                .buckets(vec![
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ]),
                &["route", "method", "outcome"],
            )
            .expect("create pik_gateway_http_request_duration_seconds"),
        )
    })
}

fn ingest_events_total() -> &'static IntCounterVec {
    INGEST_EVENTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "pik_gateway_ingest_events_total",
                    "Ingested progression events by type and outcome.",
                ),
                &["event_type", "outcome"],
            )
            .expect("create pik_gateway_ingest_events_total"),
        )
    })
}

fn events_published_total() -> &'static IntCounterVec {
    EVENTS_PUBLISHED_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "pik_gateway_events_published_total",
                    "Ledger events published on the in-process bus.",
                ),
                &["event_type"],
            )
            .expect("create pik_gateway_events_published_total"),
        )
    })
}

fn rate_limited_total() -> &'static IntCounterVec {
    RATE_LIMITED_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "pik_gateway_rate_limited_total",
                    "Requests rejected by the rate limiter.",
                ),
                &["policy"],
            )
            .expect("create pik_gateway_rate_limited_total"),
        )
    })
}

fn sse_clients() -> &'static IntGauge {
    SSE_CLIENTS.get_or_init(|| {
        register_collector(
            IntGauge::new("pik_gateway_sse_clients", "Connected SSE observers.")
                .expect("create pik_gateway_sse_clients"),
        )
    })
}

pub fn observe_http_request(route: &str, method: &str, status: u16, duration: Duration) {
    let status_str = status.to_string();
    http_requests_total()
        .with_label_values(&[route, method, status_str.as_str()])
        .inc();

    let outcome = if (200..400).contains(&status) {
        "success"
    } else {
        "error"
    };
    http_request_duration_seconds()
        .with_label_values(&[route, method, outcome])
        .observe(duration.as_secs_f64());
}

pub fn observe_ingest(event_type: &str, outcome: &str) {
    ingest_events_total()
        .with_label_values(&[event_type, outcome])
        .inc();
}

pub fn observe_event_published(event_type: &str) {
    events_published_total()
        .with_label_values(&[event_type])
        .inc();
}

pub fn inc_rate_limited(policy: &str) {
    rate_limited_total().with_label_values(&[policy]).inc();
}

pub fn sse_client_connected() {
    sse_clients().inc();
}

pub fn sse_client_disconnected() {
    sse_clients().dec();
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = sse_clients();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}
