//! Prometheus metrics for character devices.
//!
//! Every series is labelled with the device label (`chardev`).

use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

/// Device metrics collection.
pub struct ChardevMetrics {
    /// The Prometheus registry.
    pub registry: Registry,

    /// Bytes transmitted to the transport.
    pub bytes_written: IntCounterVec,

    /// Bytes delivered to the front-end.
    pub bytes_received: IntCounterVec,

    /// Connections that reached the connected state.
    pub connects: IntCounterVec,

    /// Connected channels that were torn down.
    pub disconnects: IntCounterVec,

    /// Failed connect attempts, including failed handshakes.
    pub connect_failures: IntCounterVec,

    /// Connect attempts started by the reconnect timer.
    pub reconnect_attempts: IntCounterVec,

    /// Devices currently connected (0 or 1 per label).
    pub active_connections: IntGaugeVec,
}

fn counter(name: &str, help: &str) -> IntCounterVec {
    IntCounterVec::new(Opts::new(name, help), &["chardev"])
        .expect("metric creation should succeed")
}

impl ChardevMetrics {
    /// Create a new metrics collection.
    ///
    /// # Panics
    ///
    /// Panics if metric registration fails (should not happen with unique names).
    #[must_use]
    pub fn new() -> Self {
        let registry = Registry::new();

        let bytes_written = counter(
            "chardev_bytes_written_total",
            "Total bytes written to the transport",
        );
        let bytes_received = counter(
            "chardev_bytes_received_total",
            "Total bytes delivered to the front-end",
        );
        let connects = counter("chardev_connects_total", "Total established connections");
        let disconnects = counter(
            "chardev_disconnects_total",
            "Total connections closed after being established",
        );
        let connect_failures = counter(
            "chardev_connect_failures_total",
            "Total failed connect or handshake attempts",
        );
        let reconnect_attempts = counter(
            "chardev_reconnect_attempts_total",
            "Total connect attempts made by the reconnect timer",
        );
        let active_connections = IntGaugeVec::new(
            Opts::new(
                "chardev_active_connections",
                "Whether the device currently has a connected peer",
            ),
            &["chardev"],
        )
        .expect("metric creation should succeed");

        for collector in [
            &bytes_written,
            &bytes_received,
            &connects,
            &disconnects,
            &connect_failures,
            &reconnect_attempts,
        ] {
            registry
                .register(Box::new(collector.clone()))
                .expect("metric registration should succeed");
        }
        registry
            .register(Box::new(active_connections.clone()))
            .expect("metric registration should succeed");

        Self {
            registry,
            bytes_written,
            bytes_received,
            connects,
            disconnects,
            connect_failures,
            reconnect_attempts,
            active_connections,
        }
    }

    pub fn record_bytes_written(&self, label: &str, bytes: usize) {
        self.bytes_written
            .with_label_values(&[label])
            .inc_by(bytes as u64);
    }

    pub fn record_bytes_received(&self, label: &str, bytes: usize) {
        self.bytes_received
            .with_label_values(&[label])
            .inc_by(bytes as u64);
    }

    /// Record a channel entering the connected state.
    pub fn record_connect(&self, label: &str) {
        self.connects.with_label_values(&[label]).inc();
        self.active_connections.with_label_values(&[label]).set(1);
    }

    /// Record a connected channel going away.
    pub fn record_disconnect(&self, label: &str) {
        self.disconnects.with_label_values(&[label]).inc();
        self.active_connections.with_label_values(&[label]).set(0);
    }

    pub fn record_connect_failure(&self, label: &str) {
        self.connect_failures.with_label_values(&[label]).inc();
    }

    pub fn record_reconnect_attempt(&self, label: &str) {
        self.reconnect_attempts.with_label_values(&[label]).inc();
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

impl Default for ChardevMetrics {
    fn default() -> Self {
        Self::new()
    }
}
