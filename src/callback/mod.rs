/*!
 * Callbacks
 * Kernel bridge into user-mode functions and the user-side registry
 */

pub mod bridge;
pub mod table;

pub use bridge::{CallbackBridge, CallbackObject};
pub use table::{CallbackTable, UserCallback};
