//! Metrics collection for character devices.
//!
//! Provides Prometheus-compatible counters for traffic and connection
//! lifecycle, labelled per device.

pub mod prometheus;

pub use prometheus::ChardevMetrics;
