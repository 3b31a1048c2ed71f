/*!
 * Object Manager Module
 * Process-wide registry of handles, their owners and destructors
 */

pub mod manager;
pub mod types;

// Re-exports
pub use manager::ObjectManager;
pub use types::{HandleInfo, ObjectError, ObjectResult, ObjectType};
