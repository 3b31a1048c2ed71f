/*!
 * Monitoring
 * Structured tracing and kernel counters
 */

pub mod metrics;
pub mod tracer;

pub use metrics::{KernelMetrics, MetricsSnapshot};
pub use tracer::{generate_trace_id, init_tracing, DispatchSpan};
