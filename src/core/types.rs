/*!
 * Core Types
 * Common types used across the kernel
 */

use serde::{Deserialize, Serialize};
use std::fmt;

/// Process ID type
pub type ProcessId = u32;

/// Operation code inside a subsystem export table
pub type OpCode = u32;

/// Correlation id carried by requests, replies and callbacks
pub type ChannelId = u32;

/// Common result type for kernel operations
pub type KernelResult<T> = Result<T, super::errors::KernelError>;

/// Opaque handle to a kernel-managed object
///
/// Handles are small integers minted by the object manager. `0` is the kernel
/// root (and "no owner"), `-1` means "invalid" in query results and "the
/// calling process" in user-mode requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(pub i32);

impl Handle {
    /// Kernel root owner. Never destroyed implicitly.
    pub const NULL: Handle = Handle(0);

    /// Invalid handle sentinel
    pub const INVALID: Handle = Handle(-1);

    /// Pseudo-handle for the calling process in user-mode requests
    pub const CURRENT_PROCESS: Handle = Handle(-1);

    #[inline]
    pub const fn raw(self) -> i32 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// True for handles that can name a table entry
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 > 0
    }
}

impl Default for Handle {
    fn default() -> Self {
        Handle::NULL
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<i32> for Handle {
    fn from(raw: i32) -> Self {
        Handle(raw)
    }
}
