/*!
 * User Mode
 * The execution-context side of a process channel
 */

pub mod context;
pub mod program;
pub mod runtime;

pub use context::UserContext;
pub use program::{ProgramRegistry, UserProgram};
pub use runtime::UserRuntime;
