/*!
 * Subsystem Types
 * Allow-listed subsystem names and handler errors
 */

use crate::core::types::{Handle, OpCode, ProcessId};
use crate::ipc::types::IpcError;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Subsystem handler result
pub type SubsystemResult<T> = Result<T, SubsystemError>;

/// The fixed set of subsystems a process may load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubsystemId {
    Ntdll,
    Kernel32,
    User32,
    Gdi32,
    Shell32,
}

impl SubsystemId {
    pub const ALL: [SubsystemId; 5] = [
        SubsystemId::Ntdll,
        SubsystemId::Kernel32,
        SubsystemId::User32,
        SubsystemId::Gdi32,
        SubsystemId::Shell32,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            SubsystemId::Ntdll => "ntdll",
            SubsystemId::Kernel32 => "kernel32",
            SubsystemId::User32 => "user32",
            SubsystemId::Gdi32 => "gdi32",
            SubsystemId::Shell32 => "shell32",
        }
    }

    /// Validate a wire name against the allow-list
    ///
    /// Matching ignores case and an optional `.dll` suffix.
    pub fn parse(name: &str) -> SubsystemResult<SubsystemId> {
        let lowered = name.to_ascii_lowercase();
        let bare = lowered.strip_suffix(".dll").unwrap_or(&lowered);
        SubsystemId::ALL
            .into_iter()
            .find(|id| id.as_str() == bare)
            .ok_or_else(|| SubsystemError::NotAllowed(name.to_string()))
    }
}

impl FromStr for SubsystemId {
    type Err = SubsystemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SubsystemId::parse(s)
    }
}

impl fmt::Display for SubsystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised at the subsystem boundary and turned into error replies
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Diagnostic)]
#[serde(rename_all = "snake_case", tag = "error", content = "details")]
pub enum SubsystemError {
    #[error("Subsystem '{0}' is not on the allow-list")]
    #[diagnostic(
        code(subsystem::not_allowed),
        help("Only ntdll, kernel32, user32, gdi32 and shell32 can be loaded.")
    )]
    NotAllowed(String),

    #[error("Subsystem '{0}' has no registered implementation")]
    #[diagnostic(
        code(subsystem::not_registered),
        help("Register the subsystem with the kernel before processes call into it.")
    )]
    NotRegistered(SubsystemId),

    #[error("Subsystem '{subsystem}' exports no operation {op:#x}")]
    #[diagnostic(code(subsystem::unknown_operation))]
    UnknownOperation { subsystem: String, op: OpCode },

    #[error("Invalid payload: {0}")]
    #[diagnostic(code(subsystem::invalid_payload))]
    InvalidPayload(String),

    #[error("Invalid handle {0}")]
    #[diagnostic(code(subsystem::invalid_handle))]
    InvalidHandle(Handle),

    #[error("Handle {handle} is not owned by process {process}")]
    #[diagnostic(
        code(subsystem::access_denied),
        help("A process may only use handles it owns, directly or through another handle it owns.")
    )]
    AccessDenied { handle: Handle, process: ProcessId },

    #[error("Not found: {0}")]
    #[diagnostic(code(subsystem::not_found))]
    NotFound(String),

    #[error("IPC failure: {0}")]
    #[diagnostic(code(subsystem::ipc))]
    Ipc(IpcError),

    #[error("{0}")]
    #[diagnostic(code(subsystem::failed))]
    Failed(String),
}

impl SubsystemError {
    /// Stable error type tag used in error replies
    pub fn kind(&self) -> &'static str {
        match self {
            SubsystemError::NotAllowed(_) => "not_allowed",
            SubsystemError::NotRegistered(_) => "not_registered",
            SubsystemError::UnknownOperation { .. } => "unknown_operation",
            SubsystemError::InvalidPayload(_) => "invalid_payload",
            SubsystemError::InvalidHandle(_) => "invalid_handle",
            SubsystemError::AccessDenied { .. } => "access_denied",
            SubsystemError::NotFound(_) => "not_found",
            SubsystemError::Ipc(_) => "ipc_error",
            SubsystemError::Failed(_) => "failed",
        }
    }
}

impl From<serde_json::Error> for SubsystemError {
    fn from(err: serde_json::Error) -> Self {
        SubsystemError::InvalidPayload(err.to_string())
    }
}

impl From<IpcError> for SubsystemError {
    fn from(err: IpcError) -> Self {
        SubsystemError::Ipc(err)
    }
}
