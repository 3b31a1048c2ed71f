/*!
 * NtWeb Kernel Library
 * Handle table, subsystem dispatch, module loader and process lifecycle
 * for isolated execution contexts
 */

pub mod callback;
pub mod core;
pub mod ipc;
pub mod kernel;
pub mod loader;
pub mod monitoring;
pub mod object;
pub mod process;
pub mod subsystem;
pub mod usermode;

// Re-exports
pub use crate::core::{Handle, KernelConfig, KernelError, KernelResult, ProcessId, SerializableError};
pub use callback::CallbackBridge;
pub use ipc::{IpcError, Message, MessagePort, SharedSegment};
pub use kernel::{Kernel, KernelBuilder};
pub use loader::{encode_image, Loader, MemStorage, ModuleDescriptor, ModuleInfo, ModuleKind, Storage};
pub use monitoring::{init_tracing, KernelMetrics, MetricsSnapshot};
pub use object::{ObjectManager, ObjectType};
pub use process::{
    CreateProcessInfo, ExecutionHost, ExitReason, ExitStatus, ExternalHost, Process, ProcessContext, ProcessError,
    ProcessInfo, ProcessState, TaskHost,
};
pub use subsystem::{ExportTable, Subsystem, SubsystemError, SubsystemId};
pub use usermode::{ProgramRegistry, UserContext, UserProgram};
