/*!
 * Error Types
 * Centralized error handling with thiserror, miette, and serde support
 */

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use crate::ipc::types::IpcError;
pub use crate::object::types::ObjectError;
pub use crate::process::types::ProcessError;
pub use crate::subsystem::types::SubsystemError;

/// Unified kernel error type with miette diagnostics
#[derive(Error, Debug, Diagnostic)]
pub enum KernelError {
    #[error("Object error: {0}")]
    #[diagnostic(transparent)]
    Object(#[from] ObjectError),

    #[error("IPC error: {0}")]
    #[diagnostic(transparent)]
    Ipc(#[from] IpcError),

    #[error("Subsystem error: {0}")]
    #[diagnostic(transparent)]
    Subsystem(#[from] SubsystemError),

    #[error("Process error: {0}")]
    #[diagnostic(transparent)]
    Process(#[from] ProcessError),

    #[error("Configuration error: {0}")]
    #[diagnostic(
        code(kernel::configuration_error),
        help("Invalid configuration. Review the NTWEB_* environment variables.")
    )]
    Configuration(String),

    #[error("Internal error: {0}")]
    #[diagnostic(
        code(kernel::internal_error),
        help("An unexpected internal error occurred. Please report this issue.")
    )]
    Internal(String),
}

impl From<String> for KernelError {
    fn from(msg: String) -> Self {
        KernelError::Internal(msg)
    }
}

impl From<&str> for KernelError {
    fn from(msg: &str) -> Self {
        KernelError::Internal(msg.to_string())
    }
}

/// Serializable error representation carried by error replies
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SerializableError {
    pub error_type: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub details: Option<String>,
}

impl SerializableError {
    /// Create a new serializable error
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            details: None,
        }
    }

    /// Create with additional details
    pub fn with_details(
        error_type: impl Into<String>,
        message: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            details: Some(details.into()),
        }
    }
}

impl std::fmt::Display for SerializableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)?;
        if let Some(details) = &self.details {
            write!(f, " ({})", details)?;
        }
        Ok(())
    }
}

impl From<&SubsystemError> for SerializableError {
    fn from(err: &SubsystemError) -> Self {
        SerializableError::new(err.kind(), err.to_string())
    }
}

impl From<SubsystemError> for SerializableError {
    fn from(err: SubsystemError) -> Self {
        SerializableError::from(&err)
    }
}

impl From<ProcessError> for SerializableError {
    fn from(err: ProcessError) -> Self {
        SerializableError::new("process_error", err.to_string())
    }
}

impl From<IpcError> for SerializableError {
    fn from(err: IpcError) -> Self {
        match err {
            IpcError::Remote(remote) => remote,
            other => SerializableError::new("ipc_error", other.to_string()),
        }
    }
}

impl From<KernelError> for SerializableError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::Subsystem(e) => e.into(),
            KernelError::Process(e) => e.into(),
            KernelError::Ipc(e) => e.into(),
            KernelError::Object(e) => SerializableError::new("object_error", e.to_string()),
            KernelError::Configuration(msg) => {
                SerializableError::new("configuration_error", msg)
            }
            KernelError::Internal(msg) => SerializableError::new("internal_error", msg),
        }
    }
}
