//! Metrics and observability
//!
//! Prometheus-compatible counters for chunk traffic, session outcomes and
//! manifest health.

pub mod exporter;
pub mod recorder;

pub use exporter::{install_recorder, metrics_route, render_metrics, MetricsError};
pub use recorder::{init_metrics, SessionTimer};
