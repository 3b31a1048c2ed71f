/*!
 * System Limits and Constants
 *
 * Centralized location for wire constants, thresholds and default paths.
 * Organized by domain for maintainability and discoverability.
 */

use std::time::Duration;

// =============================================================================
// WIRE PROTOCOL
// =============================================================================

/// High bit of the operation type marks an error reply
pub const ERROR_REPLY_BIT: u32 = 0x8000_0000;

/// Reserved operation type for kernel -> user-mode callback requests
/// Never used as an export code by any subsystem
pub const CALLBACK_OP: u32 = 0x7FFF_FFFF;

// =============================================================================
// IPC TIMEOUTS
// =============================================================================

/// Standard request timeout (30 seconds)
/// Applied to user-mode requests and kernel callbacks unless overridden
pub const STANDARD_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Relaxed request timeout for slow environments (5 minutes)
pub const RELAXED_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Restricted request timeout for tests and development (2 seconds)
pub const RESTRICTED_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// PROCESS LIMITS
// =============================================================================

/// Maximum live processes per kernel
pub const DEFAULT_MAX_PROCESSES: usize = 256;

// =============================================================================
// SHARED MEMORY
// =============================================================================

/// Slots in a subsystem shared segment when the subsystem asks for one
pub const DEFAULT_SHARED_SLOTS: usize = 16;

/// Upper bound on a single shared segment (in 32-bit slots)
pub const MAX_SHARED_SLOTS: usize = 64 * 1024;

/// Slot holding the thread's last error in the kernel32 segment
pub const LAST_ERROR_SLOT: usize = 0;

// =============================================================================
// LOADER
// =============================================================================

/// Magic prefix of a packaged module image
pub const MODULE_MAGIC: [u8; 4] = *b"MZJS";

/// Largest module image the loader will read (64MB)
pub const MAX_MODULE_SIZE: u64 = 64 * 1024 * 1024;

/// Extension appended to library names that have none
pub const DEFAULT_LIBRARY_EXTENSION: &str = ".dll";

/// Primary system directory in the DLL search order
pub const DEFAULT_SYSTEM_DIR: &str = "C:/Windows/System32";

/// Secondary (16-bit era) system directory
pub const DEFAULT_SECONDARY_SYSTEM_DIR: &str = "C:/Windows/System";

/// Windows root directory
pub const DEFAULT_ROOT_DIR: &str = "C:/Windows";

/// Environment variable searched last
pub const DEFAULT_PATH_VARIABLE: &str = "PATH";

/// Url scheme prefix for published module blobs
pub const BLOB_URL_PREFIX: &str = "blob:ntweb/";
