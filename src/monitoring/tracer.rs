/*!
 * Tracing
 * Subscriber setup and per-message dispatch spans
 */

use crate::core::types::{ChannelId, OpCode, ProcessId};
use std::time::{Duration, Instant};
use tracing::{debug, info, span, warn, Level};
use tracing_subscriber::{fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

/// Handlers slower than this are logged at warn
const SLOW_DISPATCH: Duration = Duration::from_millis(50);

/// Install the global subscriber
///
/// - `RUST_LOG` sets the filter (default: info)
/// - `json` selects JSON lines instead of the compact formatter
///
/// Returns false if a subscriber was already installed.
pub fn init_tracing(json: bool) -> bool {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_names(true)
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()
            .is_ok()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_names(true)
                    .compact(),
            )
            .try_init()
            .is_ok()
    };

    if installed {
        info!(json, "Tracing initialized");
    }
    installed
}

/// Generate a unique trace ID for request correlation
pub fn generate_trace_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span covering one dispatched message, from routing to reply
pub struct DispatchSpan {
    span: tracing::Span,
    start: Instant,
    trace_id: String,
    subsystem: String,
    op: OpCode,
}

impl DispatchSpan {
    pub fn new(pid: ProcessId, subsystem: &str, op: OpCode, channel: Option<ChannelId>) -> Self {
        let trace_id = generate_trace_id();
        let span = span!(
            Level::DEBUG,
            "dispatch",
            trace_id = %trace_id,
            pid,
            subsystem,
            op,
            channel = tracing::field::Empty,
            duration_us = tracing::field::Empty,
            result = tracing::field::Empty,
            error = tracing::field::Empty,
        );
        if let Some(channel) = channel {
            span.record("channel", channel);
        }

        Self {
            span,
            start: Instant::now(),
            trace_id,
            subsystem: subsystem.to_string(),
            op,
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub fn record_success(&self) {
        self.span.record("result", "success");
    }

    pub fn record_error(&self, error: &str) {
        self.span.record("error", error);
        self.span.record("result", "error");
    }
}

impl Drop for DispatchSpan {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        self.span.record("duration_us", duration.as_micros() as u64);
        let _entered = self.span.enter();

        if duration > SLOW_DISPATCH {
            warn!(
                trace_id = %self.trace_id,
                subsystem = %self.subsystem,
                op = self.op,
                duration_ms = duration.as_millis() as u64,
                "slow handler"
            );
        } else {
            debug!(
                trace_id = %self.trace_id,
                subsystem = %self.subsystem,
                op = self.op,
                duration_us = duration.as_micros() as u64,
                "dispatch completed"
            );
        }
    }
}
