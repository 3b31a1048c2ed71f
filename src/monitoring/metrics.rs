/*!
 * Kernel Counters
 * Lock-free counters for the dispatch, callback and loader paths
 */

use crate::core::serde::is_zero_u64;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic kernel counters
#[derive(Debug)]
pub struct KernelMetrics {
    messages_dispatched: AtomicU64,
    error_replies: AtomicU64,
    callbacks_invoked: AtomicU64,
    replies_dropped: AtomicU64,
    requests_timed_out: AtomicU64,
    subsystems_loaded: AtomicU64,
    modules_loaded: AtomicU64,
    processes_created: AtomicU64,
    processes_exited: AtomicU64,
    start_time: Instant,
}

impl KernelMetrics {
    pub fn new() -> Self {
        Self {
            messages_dispatched: AtomicU64::new(0),
            error_replies: AtomicU64::new(0),
            callbacks_invoked: AtomicU64::new(0),
            replies_dropped: AtomicU64::new(0),
            requests_timed_out: AtomicU64::new(0),
            subsystems_loaded: AtomicU64::new(0),
            modules_loaded: AtomicU64::new(0),
            processes_created: AtomicU64::new(0),
            processes_exited: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    #[inline]
    pub fn message_dispatched(&self) {
        self.messages_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn error_reply(&self) {
        self.error_replies.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn callback_invoked(&self) {
        self.callbacks_invoked.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn reply_dropped(&self) {
        self.replies_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn request_timed_out(&self) {
        self.requests_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn subsystem_loaded(&self) {
        self.subsystems_loaded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn module_loaded(&self) {
        self.modules_loaded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn process_created(&self) {
        self.processes_created.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn process_exited(&self) {
        self.processes_exited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_dispatched: self.messages_dispatched.load(Ordering::Relaxed),
            error_replies: self.error_replies.load(Ordering::Relaxed),
            callbacks_invoked: self.callbacks_invoked.load(Ordering::Relaxed),
            replies_dropped: self.replies_dropped.load(Ordering::Relaxed),
            requests_timed_out: self.requests_timed_out.load(Ordering::Relaxed),
            subsystems_loaded: self.subsystems_loaded.load(Ordering::Relaxed),
            modules_loaded: self.modules_loaded.load(Ordering::Relaxed),
            processes_created: self.processes_created.load(Ordering::Relaxed),
            processes_exited: self.processes_exited.load(Ordering::Relaxed),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }
}

impl Default for KernelMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    #[serde(skip_serializing_if = "is_zero_u64", default)]
    pub messages_dispatched: u64,
    #[serde(skip_serializing_if = "is_zero_u64", default)]
    pub error_replies: u64,
    #[serde(skip_serializing_if = "is_zero_u64", default)]
    pub callbacks_invoked: u64,
    #[serde(skip_serializing_if = "is_zero_u64", default)]
    pub replies_dropped: u64,
    #[serde(skip_serializing_if = "is_zero_u64", default)]
    pub requests_timed_out: u64,
    #[serde(skip_serializing_if = "is_zero_u64", default)]
    pub subsystems_loaded: u64,
    #[serde(skip_serializing_if = "is_zero_u64", default)]
    pub modules_loaded: u64,
    #[serde(skip_serializing_if = "is_zero_u64", default)]
    pub processes_created: u64,
    #[serde(skip_serializing_if = "is_zero_u64", default)]
    pub processes_exited: u64,
    pub uptime_secs: u64,
}
