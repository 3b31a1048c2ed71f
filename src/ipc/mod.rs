/*!
 * Inter-Process Communication (IPC)
 * Message channel between the kernel and each execution context
 */

pub mod channel;
pub mod pending;
pub mod shm;
pub mod types;

// Re-exports
pub use channel::{MessagePort, MessageSender, WeakMessageSender};
pub use pending::{PendingReplies, Requester};
pub use shm::SharedSegment;
pub use types::{IpcError, IpcResult, Message, RequestOutcome, CALLBACK_SUBSYSTEM};
