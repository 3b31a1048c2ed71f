/*!
 * Subsystems
 * Allow-listed API surfaces, their registry and per-process instances
 */

pub mod ntdll;
pub mod registry;
pub mod state;
pub mod types;

// Re-exports
pub use ntdll::Ntdll;
pub use registry::{ExportTable, Subsystem, SubsystemRegistry};
pub use state::{SubsystemState, SubsystemSummary};
pub use types::{SubsystemError, SubsystemId, SubsystemResult};
