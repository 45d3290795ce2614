//! Push-based observability
//!
//! Outbound data only: Prometheus counters and gauges kept in-process, and a
//! reporter that periodically prints a JSON snapshot to stdout. No HTTP
//! server, no incoming requests.

pub mod metrics;
pub mod reporter;

pub use metrics::Metrics;
pub use reporter::MetricsReporter;
