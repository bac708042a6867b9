//! Prometheus metrics for the Kafka relay.
//!
//! All counters are lock-free atomics, so thousands of pairs can update them
//! concurrently without contending on anything shared.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Traffic direction label values.
pub mod direction {
    pub const CLIENT_TO_BROKER: &str = "client_to_broker";
    pub const BROKER_TO_CLIENT: &str = "broker_to_client";
}

/// TLS handshake side label values.
pub mod side {
    pub const CLIENT: &str = "client";
    pub const BROKER: &str = "broker";
}

/// Relay metrics collection.
///
/// Contains all metrics exposed by the relay for monitoring.
pub struct ProxyMetrics {
    /// The Prometheus registry.
    pub registry: Registry,

    /// Accepted client connections by broker id.
    pub connections_accepted: IntCounterVec,

    /// Client connections refused before a pair was formed, by reason.
    pub connections_rejected: IntCounterVec,

    /// Connection pairs not yet closed.
    pub active_connection_pairs: IntGauge,

    /// Closed pairs by close reason.
    pub connection_pairs_closed: IntCounterVec,

    /// Pair faults by error kind.
    pub faults: IntCounterVec,

    /// Responses whose broker addresses were rewritten, by API.
    pub rewrites: IntCounterVec,

    /// Broker entries forwarded unmodified because the registry had no match.
    pub rewrite_misses: IntCounterVec,

    /// TLS handshake failures by side.
    pub tls_handshake_failures: IntCounterVec,

    /// Relayed bytes by direction (frame bodies plus prefixes).
    pub bytes_relayed: IntCounterVec,

    /// Relayed frames by direction.
    pub frames_relayed: IntCounterVec,

    /// Pending requests moved out of the live table after the request timeout.
    pub pending_request_timeouts: IntCounter,

    /// Responses that arrived after their request timed out and were still
    /// delivered.
    pub late_responses: IntCounter,
}

impl ProxyMetrics {
    /// Create a new metrics collection.
    ///
    /// # Panics
    ///
    /// Panics if metric registration fails (should not happen with unique names).
    #[must_use]
    pub fn new() -> Self {
        let registry = Registry::new();

        let connections_accepted = counter_vec(
            &registry,
            "kafka_relay_connections_accepted_total",
            "Client connections accepted, by broker id",
            &["broker_id"],
        );
        let connections_rejected = counter_vec(
            &registry,
            "kafka_relay_connections_rejected_total",
            "Client connections refused before relaying, by reason",
            &["reason"],
        );
        let connection_pairs_closed = counter_vec(
            &registry,
            "kafka_relay_connection_pairs_closed_total",
            "Connection pairs closed, by reason",
            &["reason"],
        );
        let faults = counter_vec(
            &registry,
            "kafka_relay_faults_total",
            "Connection pair faults, by error kind",
            &["kind"],
        );
        let rewrites = counter_vec(
            &registry,
            "kafka_relay_rewrites_total",
            "Responses with rewritten broker addresses, by API",
            &["api_key"],
        );
        let rewrite_misses = counter_vec(
            &registry,
            "kafka_relay_rewrite_misses_total",
            "Broker entries with no registry match, forwarded unmodified, by API",
            &["api_key"],
        );
        let tls_handshake_failures = counter_vec(
            &registry,
            "kafka_relay_tls_handshake_failures_total",
            "TLS handshake failures, by side",
            &["side"],
        );
        let bytes_relayed = counter_vec(
            &registry,
            "kafka_relay_bytes_relayed_total",
            "Bytes relayed, by direction",
            &["direction"],
        );
        let frames_relayed = counter_vec(
            &registry,
            "kafka_relay_frames_relayed_total",
            "Frames relayed, by direction",
            &["direction"],
        );

        let active_connection_pairs = IntGauge::new(
            "kafka_relay_active_connection_pairs",
            "Connection pairs currently open",
        )
        .expect("metric creation should succeed");
        registry
            .register(Box::new(active_connection_pairs.clone()))
            .expect("metric registration should succeed");

        let pending_request_timeouts = counter(
            &registry,
            "kafka_relay_pending_request_timeouts_total",
            "In-flight requests that passed the request timeout without a response",
        );
        let late_responses = counter(
            &registry,
            "kafka_relay_late_responses_total",
            "Responses delivered after their request timed out",
        );

        Self {
            registry,
            connections_accepted,
            connections_rejected,
            active_connection_pairs,
            connection_pairs_closed,
            faults,
            rewrites,
            rewrite_misses,
            tls_handshake_failures,
            bytes_relayed,
            frames_relayed,
            pending_request_timeouts,
            late_responses,
        }
    }

    pub fn record_accept(&self, broker_id: i32) {
        self.connections_accepted
            .with_label_values(&[&broker_id.to_string()])
            .inc();
    }

    pub fn record_reject(&self, reason: &str) {
        self.connections_rejected.with_label_values(&[reason]).inc();
    }

    pub fn pair_opened(&self) {
        self.active_connection_pairs.inc();
    }

    pub fn pair_closed(&self) {
        self.active_connection_pairs.dec();
    }

    pub fn record_close(&self, reason: &str) {
        self.connection_pairs_closed
            .with_label_values(&[reason])
            .inc();
    }

    pub fn record_fault(&self, kind: &str) {
        self.faults.with_label_values(&[kind]).inc();
    }

    pub fn record_rewrite(&self, api: &str, misses: u64) {
        self.rewrites.with_label_values(&[api]).inc();
        self.record_rewrite_misses(api, misses);
    }

    pub fn record_rewrite_misses(&self, api: &str, misses: u64) {
        if misses > 0 {
            self.rewrite_misses.with_label_values(&[api]).inc_by(misses);
        }
    }

    pub fn record_tls_failure(&self, side: &str) {
        self.tls_handshake_failures.with_label_values(&[side]).inc();
    }

    pub fn record_frames(&self, direction: &str, frames: u64, bytes: u64) {
        self.frames_relayed
            .with_label_values(&[direction])
            .inc_by(frames);
        self.bytes_relayed.with_label_values(&[direction]).inc_by(bytes);
    }

    pub fn record_pending_timeouts(&self, count: u64) {
        self.pending_request_timeouts.inc_by(count);
    }

    pub fn record_late_response(&self) {
        self.late_responses.inc();
    }

    /// Current value of a labelled counter; zero if never touched.
    #[must_use]
    pub fn counter_value(vec: &IntCounterVec, label: &str) -> u64 {
        vec.get_metric_with_label_values(&[label])
            .map(|c| c.get())
            .unwrap_or(0)
    }

    /// Encode metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = String::new();
        encoder.encode_utf8(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let vec = IntCounterVec::new(Opts::new(name, help), labels)
        .expect("metric creation should succeed");
    registry
        .register(Box::new(vec.clone()))
        .expect("metric registration should succeed");
    vec
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("metric creation should succeed");
    registry
        .register(Box::new(counter.clone()))
        .expect("metric registration should succeed");
    counter
}
