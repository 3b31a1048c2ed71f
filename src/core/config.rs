/*!
 * Kernel Configuration
 *
 * Loader search directories, timeouts and limits. Defaults come from
 * `core::limits`; `from_env` overlays NTWEB_* environment variables.
 */

use super::errors::KernelError;
use super::limits::*;
use super::serde::duration_millis;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Kernel-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct KernelConfig {
    /// Primary system directory searched by the loader
    pub system_dir: String,

    /// Secondary system directory searched by the loader
    pub secondary_system_dir: String,

    /// Windows root directory searched by the loader
    pub root_dir: String,

    /// Environment variable holding the `;`-separated search path
    pub path_variable: String,

    /// Default timeout for requests and kernel callbacks
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,

    /// Maximum number of live processes
    pub max_processes: usize,

    /// Shared slots granted when a subsystem asks for a segment without a size
    pub default_shared_slots: usize,

    /// Emit JSON logs instead of the compact formatter
    pub trace_json: bool,
}

impl KernelConfig {
    /// Create default configuration
    pub fn new() -> Self {
        Self {
            system_dir: DEFAULT_SYSTEM_DIR.to_string(),
            secondary_system_dir: DEFAULT_SECONDARY_SYSTEM_DIR.to_string(),
            root_dir: DEFAULT_ROOT_DIR.to_string(),
            path_variable: DEFAULT_PATH_VARIABLE.to_string(),
            request_timeout: STANDARD_REQUEST_TIMEOUT,
            max_processes: DEFAULT_MAX_PROCESSES,
            default_shared_slots: DEFAULT_SHARED_SLOTS,
            trace_json: false,
        }
    }

    /// Short timeouts for development and tests
    pub fn aggressive() -> Self {
        Self {
            request_timeout: RESTRICTED_REQUEST_TIMEOUT,
            ..Self::new()
        }
    }

    /// Long timeouts for slow environments
    pub fn relaxed() -> Self {
        Self {
            request_timeout: RELAXED_REQUEST_TIMEOUT,
            ..Self::new()
        }
    }

    /// Defaults overlaid with NTWEB_* environment variables
    ///
    /// Environment variables:
    /// - NTWEB_SYSTEM_DIR, NTWEB_SECONDARY_SYSTEM_DIR, NTWEB_ROOT_DIR
    /// - NTWEB_REQUEST_TIMEOUT_MS
    /// - NTWEB_MAX_PROCESSES
    /// - NTWEB_TRACE_JSON (1/true)
    pub fn from_env() -> Result<Self, KernelError> {
        Self::new().overlay_env()
    }

    /// Apply NTWEB_* environment overrides on top of `self`
    pub fn overlay_env(mut self) -> Result<Self, KernelError> {
        if let Ok(dir) = std::env::var("NTWEB_SYSTEM_DIR") {
            self.system_dir = dir;
        }
        if let Ok(dir) = std::env::var("NTWEB_SECONDARY_SYSTEM_DIR") {
            self.secondary_system_dir = dir;
        }
        if let Ok(dir) = std::env::var("NTWEB_ROOT_DIR") {
            self.root_dir = dir;
        }
        if let Ok(ms) = std::env::var("NTWEB_REQUEST_TIMEOUT_MS") {
            let ms: u64 = ms.parse().map_err(|e| {
                KernelError::Configuration(format!("NTWEB_REQUEST_TIMEOUT_MS={}: {}", ms, e))
            })?;
            self.request_timeout = Duration::from_millis(ms);
        }
        if let Ok(max) = std::env::var("NTWEB_MAX_PROCESSES") {
            self.max_processes = max.parse().map_err(|e| {
                KernelError::Configuration(format!("NTWEB_MAX_PROCESSES={}: {}", max, e))
            })?;
        }
        if let Ok(json) = std::env::var("NTWEB_TRACE_JSON") {
            self.trace_json = json == "1" || json.eq_ignore_ascii_case("true");
        }
        Ok(self)
    }

    pub fn with_system_dir(mut self, dir: impl Into<String>) -> Self {
        self.system_dir = dir.into();
        self
    }

    pub fn with_secondary_system_dir(mut self, dir: impl Into<String>) -> Self {
        self.secondary_system_dir = dir.into();
        self
    }

    pub fn with_root_dir(mut self, dir: impl Into<String>) -> Self {
        self.root_dir = dir.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_processes(mut self, max: usize) -> Self {
        self.max_processes = max;
        self
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new()
    }
}
