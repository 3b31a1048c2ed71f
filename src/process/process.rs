/*!
 * Process
 * Kernel-side bookkeeping for one isolated execution context
 */

use super::types::{ExitStatus, ProcessInfo, ProcessState};
use crate::core::types::KernelResult;
use crate::core::types::{Handle, ProcessId};
use crate::ipc::{Message, Requester, WeakMessageSender};
use crate::kernel::KernelShared;
use crate::subsystem::ntdll::{self, QUIT_REQUESTED_SLOT};
use crate::subsystem::{SubsystemId, SubsystemState};
use ahash::RandomState;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, info};

type TerminationHook = Box<dyn FnOnce(&ExitStatus) + Send>;

/// Static description of what the process runs
#[derive(Debug, Clone, Default)]
pub struct ProcessImage {
    pub name: String,
    pub version: Option<String>,
    pub executable_path: String,
    pub command_line: String,
    pub args: Vec<String>,
    pub current_directory: String,
    pub environment: BTreeMap<String, String>,
}

/// A subsystem instance and the handle of its object entry
#[derive(Debug, Clone)]
pub struct LoadedSubsystem {
    pub handle: Handle,
    pub state: Arc<SubsystemState>,
}

/// A module in the process's private map and the references it holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleRef {
    pub handle: Handle,
    pub refs: usize,
}

/// A process
///
/// Registered in the object table as a `PROC` entry; destroying that entry
/// (quit, terminate, owner cascade, fatal halt) is the only way a process ends.
pub struct Process {
    id: ProcessId,
    handle: OnceLock<Handle>,
    image: RwLock<ProcessImage>,
    state: RwLock<ProcessState>,
    critical: AtomicBool,
    requester: Requester,
    inbound: WeakMessageSender,
    subsystems: Mutex<HashMap<SubsystemId, LoadedSubsystem, RandomState>>,
    modules: Mutex<HashMap<String, ModuleRef, RandomState>>,
    tasks: Mutex<Vec<AbortHandle>>,
    pending_exit: Mutex<Option<ExitStatus>>,
    exit: watch::Sender<Option<ExitStatus>>,
    hooks: Mutex<Vec<TerminationHook>>,
    kernel: Weak<KernelShared>,
}

impl Process {
    pub(crate) fn new(
        id: ProcessId,
        image: ProcessImage,
        requester: Requester,
        inbound: WeakMessageSender,
        kernel: Weak<KernelShared>,
    ) -> Self {
        let (exit, _) = watch::channel(None);
        Self {
            id,
            handle: OnceLock::new(),
            image: RwLock::new(image),
            state: RwLock::new(ProcessState::Starting),
            critical: AtomicBool::new(false),
            requester,
            inbound,
            subsystems: Mutex::new(HashMap::with_hasher(RandomState::new())),
            modules: Mutex::new(HashMap::with_hasher(RandomState::new())),
            tasks: Mutex::new(Vec::new()),
            pending_exit: Mutex::new(None),
            exit,
            hooks: Mutex::new(Vec::new()),
            kernel,
        }
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// The process's own object handle (`NULL` until registered)
    pub fn handle(&self) -> Handle {
        self.handle.get().copied().unwrap_or(Handle::NULL)
    }

    pub(crate) fn set_handle(&self, handle: Handle) {
        let _ = self.handle.set(handle);
    }

    pub fn name(&self) -> String {
        self.image.read().name.clone()
    }

    pub fn image(&self) -> ProcessImage {
        self.image.read().clone()
    }

    pub(crate) fn update_image(&self, f: impl FnOnce(&mut ProcessImage)) {
        f(&mut self.image.write());
    }

    /// Environment lookup, case-insensitive on the key
    pub fn env_var(&self, key: &str) -> Option<String> {
        self.image
            .read()
            .environment
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.clone())
    }

    pub fn state(&self) -> ProcessState {
        *self.state.read()
    }

    pub(crate) fn set_state(&self, state: ProcessState) {
        *self.state.write() = state;
    }

    pub fn is_critical(&self) -> bool {
        self.critical.load(Ordering::SeqCst)
    }

    /// Mark the process critical: its unexpected death halts the kernel
    pub fn set_critical(&self, critical: bool) {
        self.critical.store(critical, Ordering::SeqCst);
        info!(pid = self.id, critical, "Process criticality changed");
    }

    pub fn is_terminated(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Status once teardown finished
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit.borrow().clone()
    }

    /// Wait for the process to be torn down
    pub async fn wait(&self) -> ExitStatus {
        let mut rx = self.exit.subscribe();
        loop {
            if let Some(status) = rx.borrow_and_update().clone() {
                return status;
            }
            if rx.changed().await.is_err() {
                return ExitStatus::owner_destroyed();
            }
        }
    }

    /// Run `hook` once the process is torn down (immediately if it already is)
    pub fn on_terminate<F>(&self, hook: F)
    where
        F: FnOnce(&ExitStatus) + Send + 'static,
    {
        if let Some(status) = self.exit_status() {
            hook(&status);
            return;
        }
        self.hooks.lock().push(Box::new(hook));
    }

    /// Ask the process to exit after in-flight work completes
    ///
    /// The quit signal is queued behind messages already received, and the
    /// ntdll quit flag is raised for user code polling it.
    pub fn quit(&self, code: i32) -> bool {
        if let Some(segment) = self.subsystem(SubsystemId::Ntdll).and_then(|s| s.state.segment().cloned()) {
            segment.store(QUIT_REQUESTED_SLOT, 1);
        }
        let sent = self
            .inbound
            .send(Message::post(
                SubsystemId::Ntdll.as_str(),
                ntdll::ops::QUIT,
                json!({ "code": code }),
            ))
            .is_ok();
        debug!(pid = self.id, code, sent, "Quit requested");
        sent
    }

    /// Abort the execution context and tear the process down now
    pub fn terminate(&self, code: i32, error: Option<String>) -> KernelResult<bool> {
        self.record_exit(ExitStatus::terminated(code, error));
        self.abort_tasks();
        match self.kernel.upgrade() {
            Some(kernel) => Ok(kernel.objects.destroy_handle(self.handle())?),
            None => Ok(false),
        }
    }

    /// Remember why the process is ending; the first reason wins
    pub(crate) fn record_exit(&self, status: ExitStatus) -> bool {
        let mut pending = self.pending_exit.lock();
        if pending.is_some() || self.is_terminated() {
            return false;
        }
        *pending = Some(status);
        true
    }

    /// Publish the final status and hand back the hooks to run
    pub(crate) fn finish(&self) -> (ExitStatus, Vec<TerminationHook>) {
        let status = self
            .pending_exit
            .lock()
            .take()
            .unwrap_or_else(ExitStatus::owner_destroyed);
        self.set_state(ProcessState::Terminated);
        self.exit.send_replace(Some(status.clone()));
        let hooks = std::mem::take(&mut *self.hooks.lock());
        (status, hooks)
    }

    pub(crate) fn requester(&self) -> &Requester {
        &self.requester
    }

    pub(crate) fn attach_task(&self, task: AbortHandle) {
        self.tasks.lock().push(task);
    }

    pub(crate) fn abort_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    pub fn subsystem(&self, id: SubsystemId) -> Option<LoadedSubsystem> {
        self.subsystems.lock().get(&id).cloned()
    }

    pub fn loaded_subsystems(&self) -> Vec<SubsystemId> {
        let mut ids: Vec<SubsystemId> = self.subsystems.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    pub(crate) fn subsystems(&self) -> &Mutex<HashMap<SubsystemId, LoadedSubsystem, RandomState>> {
        &self.subsystems
    }

    pub(crate) fn modules(&self) -> &Mutex<HashMap<String, ModuleRef, RandomState>> {
        &self.modules
    }

    /// Module handle in the private map, if loaded
    pub fn module(&self, name: &str) -> Option<ModuleRef> {
        self.modules.lock().get(name).copied()
    }

    pub fn info(&self) -> ProcessInfo {
        let image = self.image.read();
        ProcessInfo {
            pid: self.id,
            handle: self.handle(),
            name: image.name.clone(),
            version: image.version.clone(),
            executable_path: image.executable_path.clone(),
            command_line: image.command_line.clone(),
            args: image.args.clone(),
            current_directory: image.current_directory.clone(),
            environment: image.environment.clone(),
            state: self.state(),
            critical: self.is_critical(),
            subsystems: self
                .loaded_subsystems()
                .into_iter()
                .map(|id| id.to_string())
                .collect(),
            exit: self.exit_status(),
        }
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("handle", &self.handle())
            .field("name", &self.image.read().name)
            .field("state", &self.state())
            .field("critical", &self.is_critical())
            .finish()
    }
}
