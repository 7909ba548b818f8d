//! Cache observability.
//!
//! - [`timeseries`]: Rate-limited snapshot history
//! - [`exporter`]: Prometheus gauges and counters

pub mod exporter;
pub mod timeseries;
