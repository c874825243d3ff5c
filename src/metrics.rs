//! Prometheus metrics for gitauth.
//!
//! Everything is registered lazily in the global default registry and
//! scraped from `GET /metrics`. Labels are fixed small enums; owner ids,
//! prefixes and fingerprints never become label values.

use once_cell::sync::Lazy;
use prometheus::{
    opts, register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec,
    TextEncoder,
};

static INTROSPECTIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!("gitauth_introspections_total", "Token introspections by result"),
        &["result"]
    )
    .expect("failed to register gitauth_introspections_total")
});

static DELEGATION_CALLS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "gitauth_delegation_calls_total",
            "Outbound delegate calls by operation and outcome"
        ),
        &["op", "outcome"]
    )
    .expect("failed to register gitauth_delegation_calls_total")
});

static DELEGATION_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        prometheus::histogram_opts!(
            "gitauth_delegation_duration_seconds",
            "Outbound delegate call latency in seconds",
            vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
        ),
        &["op"]
    )
    .expect("failed to register gitauth_delegation_duration_seconds")
});

static CACHE_LOOKUPS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!("gitauth_cache_lookups_total", "Lookup cache reads by key kind"),
        &["kind", "result"]
    )
    .expect("failed to register gitauth_cache_lookups_total")
});

static CREDENTIAL_MUTATIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "gitauth_credential_mutations_total",
            "Credential writes by kind and operation"
        ),
        &["kind", "op"]
    )
    .expect("failed to register gitauth_credential_mutations_total")
});

pub fn record_introspection(active: bool) {
    let result = if active { "active" } else { "inactive" };
    INTROSPECTIONS_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_delegation(op: &str, outcome: &str, elapsed_secs: f64) {
    DELEGATION_CALLS_TOTAL.with_label_values(&[op, outcome]).inc();
    DELEGATION_DURATION_SECONDS
        .with_label_values(&[op])
        .observe(elapsed_secs);
}

pub fn record_cache_lookup(kind: &str, hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    CACHE_LOOKUPS_TOTAL.with_label_values(&[kind, result]).inc();
}

pub fn record_mutation(kind: &str, op: &str) {
    CREDENTIAL_MUTATIONS_TOTAL.with_label_values(&[kind, op]).inc();
}

/// Encode all registered metrics as Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap_or_default();
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorded_counters_show_up_in_output() {
        record_introspection(false);
        record_cache_lookup("ssh", true);
        record_mutation("token", "create");
        record_delegation("introspect", "ok", 0.02);

        let output = encode_metrics();
        assert!(output.contains("gitauth_introspections_total"));
        assert!(output.contains("gitauth_cache_lookups_total"));
        assert!(output.contains("gitauth_credential_mutations_total"));
        assert!(output.contains("gitauth_delegation_calls_total"));
    }
}
