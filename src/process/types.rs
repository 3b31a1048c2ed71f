/*!
 * Process Types
 * Creation descriptor, exit status, snapshots and errors
 */

use crate::core::serde::{is_empty_vec, is_false, is_none};
use crate::core::types::{Handle, ProcessId};
use crate::loader::ModuleInfo;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Process operation result
pub type ProcessResult<T> = Result<T, ProcessError>;

/// Process errors
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Diagnostic)]
#[serde(rename_all = "snake_case", tag = "error", content = "details")]
pub enum ProcessError {
    #[error("Process not found: {0}")]
    #[diagnostic(code(process::not_found))]
    NotFound(ProcessId),

    #[error("Executable not found: {0}")]
    #[diagnostic(
        code(process::executable_not_found),
        help("The loader searched the process directory, the system directories, the current directory and PATH.")
    )]
    ExecutableNotFound(String),

    #[error("Module '{0}' is not an executable")]
    #[diagnostic(code(process::not_executable))]
    NotExecutable(String),

    #[error("Process limit exceeded: current {current}, limit {limit}")]
    #[diagnostic(
        code(process::limit),
        help("Raise max_processes or NTWEB_MAX_PROCESSES.")
    )]
    LimitReached { current: usize, limit: usize },

    #[error("System halted: {0}")]
    #[diagnostic(
        code(process::halted),
        help("A critical process died; the kernel refuses new work until restarted.")
    )]
    SystemHalted(String),

    #[error("Execution context failed to start: {0}")]
    #[diagnostic(code(process::context))]
    ContextFailed(String),
}

/// Lifecycle state of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// Registered, execution context not yet started
    Starting,
    Running,
    /// Quit received, draining in-flight handlers
    Exiting,
    Terminated,
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Cooperative `Quit`
    Quit,
    /// Explicit terminate
    Terminated,
    /// The execution context reported an unhandled failure or vanished
    Crashed,
    /// An owning handle was destroyed
    OwnerDestroyed,
    /// Kernel fatal halt
    Halted,
    /// Creation failed before the context ran
    StartFailed,
}

/// Final status delivered to waiters and termination hooks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub code: i32,
    pub reason: ExitReason,
    #[serde(skip_serializing_if = "is_none", default)]
    pub error: Option<String>,
}

impl ExitStatus {
    pub fn quit(code: i32) -> Self {
        Self {
            code,
            reason: ExitReason::Quit,
            error: None,
        }
    }

    pub fn terminated(code: i32, error: Option<String>) -> Self {
        Self {
            code,
            reason: ExitReason::Terminated,
            error,
        }
    }

    pub fn crashed(error: impl Into<String>) -> Self {
        Self {
            code: -1,
            reason: ExitReason::Crashed,
            error: Some(error.into()),
        }
    }

    pub fn owner_destroyed() -> Self {
        Self {
            code: -1,
            reason: ExitReason::OwnerDestroyed,
            error: None,
        }
    }

    pub fn halted(reason: impl Into<String>) -> Self {
        Self {
            code: -1,
            reason: ExitReason::Halted,
            error: Some(reason.into()),
        }
    }

    pub fn start_failed(error: impl Into<String>) -> Self {
        Self {
            code: -1,
            reason: ExitReason::StartFailed,
            error: Some(error.into()),
        }
    }

    /// Anything but a cooperative quit
    pub fn is_unexpected(&self) -> bool {
        self.reason != ExitReason::Quit
    }
}

/// Process creation descriptor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateProcessInfo {
    pub application_path: String,
    #[serde(skip_serializing_if = "is_none")]
    pub command_line: Option<String>,
    #[serde(skip_serializing_if = "is_false")]
    pub inherit_handles: bool,
    pub environment: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "is_none")]
    pub current_directory: Option<String>,
    /// Opaque to the kernel; forwarded to the execution context
    pub startup_info: Value,
}

impl CreateProcessInfo {
    pub fn new(application_path: impl Into<String>) -> Self {
        Self {
            application_path: application_path.into(),
            ..Default::default()
        }
    }

    pub fn with_command_line(mut self, command_line: impl Into<String>) -> Self {
        self.command_line = Some(command_line.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_current_directory(mut self, cwd: impl Into<String>) -> Self {
        self.current_directory = Some(cwd.into());
        self
    }

    pub fn with_startup_info(mut self, startup_info: Value) -> Self {
        self.startup_info = startup_info;
        self
    }
}

/// Reply to a successful create
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedProcess {
    pub pid: ProcessId,
    pub handle: Handle,
}

/// Payload of the `CREATE` message that starts an execution context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartupInfo {
    pub pid: ProcessId,
    pub handle: Handle,
    pub module: ModuleInfo,
    pub command_line: String,
    pub args: Vec<String>,
    pub current_directory: String,
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub startup_info: Value,
}

/// Point-in-time view of a process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessInfo {
    pub pid: ProcessId,
    pub handle: Handle,
    pub name: String,
    #[serde(skip_serializing_if = "is_none")]
    pub version: Option<String>,
    pub executable_path: String,
    pub command_line: String,
    #[serde(skip_serializing_if = "is_empty_vec")]
    pub args: Vec<String>,
    pub current_directory: String,
    pub environment: BTreeMap<String, String>,
    pub state: ProcessState,
    #[serde(skip_serializing_if = "is_false")]
    pub critical: bool,
    #[serde(skip_serializing_if = "is_empty_vec")]
    pub subsystems: Vec<String>,
    #[serde(skip_serializing_if = "is_none")]
    pub exit: Option<ExitStatus>,
}

/// Split a command line into arguments
///
/// Whitespace separates arguments; double quotes group, and are stripped.
pub fn split_command_line(command_line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut pending = false;

    for c in command_line.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                pending = true;
            }
            c if c.is_whitespace() && !quoted => {
                if pending {
                    args.push(std::mem::take(&mut current));
                    pending = false;
                }
            }
            c => {
                current.push(c);
                pending = true;
            }
        }
    }
    if pending {
        args.push(current);
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_command_line() {
        assert_eq!(
            split_command_line(r#"notepad.exe  "C:/My Docs/a.txt" /p"#),
            vec!["notepad.exe", "C:/My Docs/a.txt", "/p"]
        );
        assert_eq!(split_command_line(r#"app """#), vec!["app", ""]);
        assert!(split_command_line("   ").is_empty());
    }

    #[test]
    fn test_only_quit_is_expected() {
        assert!(!ExitStatus::quit(3).is_unexpected());
        assert!(ExitStatus::terminated(0, None).is_unexpected());
        assert!(ExitStatus::crashed("boom").is_unexpected());
        assert!(ExitStatus::owner_destroyed().is_unexpected());
    }

    #[test]
    fn test_create_info_defaults_from_sparse_json() {
        let info: CreateProcessInfo =
            serde_json::from_value(serde_json::json!({"application_path": "calc.exe"})).unwrap();
        assert_eq!(info.application_path, "calc.exe");
        assert!(!info.inherit_handles);
        assert!(info.environment.is_empty());
    }
}
