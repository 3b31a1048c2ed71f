/*!
 * Process Module
 * Process bookkeeping, dispatch and execution hosts
 */

pub mod context;
pub mod dispatch;
pub mod host;
pub mod process;
pub mod types;

// Re-export for convenience
pub use context::ProcessContext;
pub use host::{ContextLaunch, ExecutionHost, ExternalHost, TaskHost};
pub use process::{LoadedSubsystem, ModuleRef, Process, ProcessImage};
pub use types::{
    split_command_line, CreateProcessInfo, CreatedProcess, ExitReason, ExitStatus, ProcessError, ProcessInfo,
    ProcessResult, ProcessState, StartupInfo,
};
