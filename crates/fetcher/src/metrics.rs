//! Prometheus metrics for the fetch pipeline.

use crate::error::ErrorKind;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Remote fetch metrics
pub static FETCHES_STARTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "pgext_fetches_started_total",
        "Total number of download tasks started",
    )
    .expect("metric creation failed")
});

pub static FETCH_ATTEMPTS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "pgext_fetch_attempts_total",
        "Total remote GET attempts, including retries",
    )
    .expect("metric creation failed")
});

pub static FETCH_RETRIES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "pgext_fetch_retries_total",
        "Total remote GET attempts beyond the first",
    )
    .expect("metric creation failed")
});

pub static FETCH_FAILURES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("pgext_fetch_failures_total", "Failed key requests by kind"),
        &["kind"],
    )
    .expect("metric creation failed")
});

pub static BYTES_DOWNLOADED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "pgext_bytes_downloaded_total",
        "Total bytes downloaded from the remote store",
    )
    .expect("metric creation failed")
});

pub static FETCH_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "pgext_fetch_duration_seconds",
            "Time from starting a fetch to installing the file",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
    )
    .expect("metric creation failed")
});

// Cache and coordination metrics
pub static CACHE_HITS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "pgext_cache_hits_total",
        "Requests served from an installed file without network calls",
    )
    .expect("metric creation failed")
});

pub static LOCAL_COPIES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "pgext_local_copies_total",
        "Files installed by copying another extension's cached copy",
    )
    .expect("metric creation failed")
});

pub static COALESCED_WAITERS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "pgext_coalesced_waiters_total",
        "Requests attached to an already running fetch",
    )
    .expect("metric creation failed")
});

pub static NEGATIVE_CACHE_HITS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "pgext_negative_cache_hits_total",
        "Requests answered from a recently failed fetch",
    )
    .expect("metric creation failed")
});

pub static FETCHES_IN_FLIGHT: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "pgext_fetches_in_flight",
        "Download tasks currently holding a fetch permit",
    )
    .expect("metric creation failed")
});

/// Guard to ensure metrics are only registered once.
static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry. Idempotent.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(FETCHES_STARTED.clone()),
            Box::new(FETCH_ATTEMPTS.clone()),
            Box::new(FETCH_RETRIES.clone()),
            Box::new(FETCH_FAILURES.clone()),
            Box::new(BYTES_DOWNLOADED.clone()),
            Box::new(FETCH_DURATION.clone()),
            Box::new(CACHE_HITS.clone()),
            Box::new(LOCAL_COPIES.clone()),
            Box::new(COALESCED_WAITERS.clone()),
            Box::new(NEGATIVE_CACHE_HITS.clone()),
            Box::new(FETCHES_IN_FLIGHT.clone()),
        ];
        for collector in collectors {
            REGISTRY
                .register(collector)
                .expect("metric registration failed");
        }
    });
}

/// Text exposition of all registered metrics.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        return format!("# failed to encode metrics: {e}\n");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub fn record_failure(kind: ErrorKind) {
    FETCH_FAILURES.with_label_values(&[kind.as_str()]).inc();
}

/// Decrements the in-flight gauge on drop, including when the fetch is aborted.
pub(crate) struct InFlightGuard;

impl InFlightGuard {
    pub(crate) fn new() -> Self {
        FETCHES_IN_FLIGHT.inc();
        Self
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        FETCHES_IN_FLIGHT.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_and_render() {
        register_metrics();
        register_metrics();
        record_failure(ErrorKind::NotFound);
        let text = render();
        assert!(text.contains("pgext_fetch_failures_total"));
        assert!(text.contains("not_found"));
    }
}
