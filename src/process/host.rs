/*!
 * Execution Hosts
 * Where the user-mode end of a process channel runs
 */

use super::types::{ProcessError, ProcessResult};
use crate::core::limits::STANDARD_REQUEST_TIMEOUT;
use crate::core::types::ProcessId;
use crate::ipc::MessagePort;
use crate::usermode::{ProgramRegistry, UserRuntime};
use ahash::RandomState;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Everything a host needs to start one execution context
#[derive(Debug)]
pub struct ContextLaunch {
    pub pid: ProcessId,
    /// Program named by the executable's descriptor
    pub entry_point: Option<String>,
    /// User-mode end of the process channel; the `CREATE` message is already queued
    pub port: MessagePort,
}

/// Starts execution contexts
pub trait ExecutionHost: Send + Sync {
    /// Start the context; a returned task is aborted when the process is torn down
    fn start(&self, launch: ContextLaunch) -> ProcessResult<Option<JoinHandle<()>>>;

    fn name(&self) -> &str;
}

/// Runs each context as a tokio task executing a registered `UserProgram`
#[derive(Clone)]
pub struct TaskHost {
    programs: ProgramRegistry,
    request_timeout: Duration,
}

impl TaskHost {
    pub fn new(programs: ProgramRegistry) -> Self {
        Self {
            programs,
            request_timeout: STANDARD_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn programs(&self) -> &ProgramRegistry {
        &self.programs
    }
}

impl ExecutionHost for TaskHost {
    fn start(&self, launch: ContextLaunch) -> ProcessResult<Option<JoinHandle<()>>> {
        let entry = launch
            .entry_point
            .ok_or_else(|| ProcessError::ContextFailed("executable has no entry point".into()))?;
        let program = self
            .programs
            .get(&entry)
            .ok_or_else(|| ProcessError::ContextFailed(format!("no program registered as '{}'", entry)))?;

        debug!(pid = launch.pid, entry = %entry, "Starting task context");
        let runtime = UserRuntime::new(launch.port, program, self.request_timeout);
        Ok(Some(tokio::spawn(runtime.run())))
    }

    fn name(&self) -> &str {
        "task"
    }
}

/// Hands the user-mode end of each channel to an embedder
///
/// The embedder (a worker bridge, a test driver) takes the port with
/// `take_port` and speaks the wire protocol itself.
#[derive(Clone, Default)]
pub struct ExternalHost {
    ports: Arc<DashMap<ProcessId, MessagePort, RandomState>>,
}

impl ExternalHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_port(&self, pid: ProcessId) -> Option<MessagePort> {
        self.ports.remove(&pid).map(|(_, port)| port)
    }

    pub fn pending(&self) -> usize {
        self.ports.len()
    }
}

impl ExecutionHost for ExternalHost {
    fn start(&self, launch: ContextLaunch) -> ProcessResult<Option<JoinHandle<()>>> {
        self.ports.insert(launch.pid, launch.port);
        Ok(None)
    }

    fn name(&self) -> &str {
        "external"
    }
}
