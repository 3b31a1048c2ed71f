/*!
 * Kernel
 * Service root: object manager, subsystems, loader, callbacks and the
 * process table, wired together once and shared by every process
 */

use crate::callback::CallbackBridge;
use crate::core::config::KernelConfig;
use crate::core::errors::KernelError;
use crate::core::types::KernelResult;
use crate::core::id::{IdGenerator, PidGenerator};
use crate::core::types::{Handle, ProcessId};
use crate::ipc::{Message, MessagePort, PendingReplies, Requester};
use crate::loader::search::{module_file_name, parent_dir};
use crate::loader::{Loader, MemStorage, ModuleKind, Storage};
use crate::monitoring::KernelMetrics;
use crate::object::{ObjectManager, ObjectType};
use crate::process::dispatch::run_dispatch_loop;
use crate::process::{
    split_command_line, ContextLaunch, CreateProcessInfo, ExecutionHost, ExitStatus, Process, ProcessContext,
    ProcessError, ProcessImage, ProcessInfo, ProcessState, StartupInfo, TaskHost,
};
use crate::subsystem::ntdll::{self, Ntdll};
use crate::subsystem::{Subsystem, SubsystemId, SubsystemRegistry};
use crate::usermode::{ProgramRegistry, UserProgram};
use ahash::RandomState;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

pub(crate) struct KernelShared {
    pub(crate) config: Arc<KernelConfig>,
    pub(crate) objects: ObjectManager,
    pub(crate) subsystems: SubsystemRegistry,
    pub(crate) loader: Loader,
    pub(crate) callbacks: CallbackBridge,
    pub(crate) host: Arc<dyn ExecutionHost>,
    pub(crate) processes: DashMap<ProcessId, Arc<Process>, RandomState>,
    pub(crate) metrics: Arc<KernelMetrics>,
    next_pid: PidGenerator,
    halted: AtomicBool,
    halt: watch::Sender<Option<String>>,
}

/// The kernel; cheap to clone, clones share all state
#[derive(Clone)]
pub struct Kernel {
    shared: Arc<KernelShared>,
}

/// Builder for Kernel
pub struct KernelBuilder {
    config: KernelConfig,
    storage: Option<Arc<dyn Storage>>,
    host: Option<Arc<dyn ExecutionHost>>,
    programs: ProgramRegistry,
    subsystems: Vec<Arc<dyn Subsystem>>,
}

impl KernelBuilder {
    pub fn new() -> Self {
        Self {
            config: KernelConfig::default(),
            storage: None,
            host: None,
            programs: ProgramRegistry::new(),
            subsystems: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    /// Module storage (default: empty in-memory storage)
    pub fn with_storage<S: Storage + 'static>(mut self, storage: S) -> Self {
        self.storage = Some(Arc::new(storage));
        self
    }

    /// Execution host (default: a `TaskHost` over the registered programs)
    pub fn with_host<H: ExecutionHost + 'static>(mut self, host: H) -> Self {
        self.host = Some(Arc::new(host));
        self
    }

    pub fn with_program<P: UserProgram + 'static>(self, entry_point: &str, program: P) -> Self {
        self.programs.register(entry_point, program);
        self
    }

    pub fn with_subsystem<S: Subsystem + 'static>(mut self, subsystem: S) -> Self {
        self.subsystems.push(Arc::new(subsystem));
        self
    }

    pub fn build(self) -> Kernel {
        let config = Arc::new(self.config);
        let objects = ObjectManager::new();
        let metrics = Arc::new(KernelMetrics::new());
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemStorage::new()));
        let host = self.host.unwrap_or_else(|| {
            Arc::new(TaskHost::new(self.programs.clone()).with_request_timeout(config.request_timeout))
        });

        let subsystems = SubsystemRegistry::new();
        subsystems.register(Arc::new(Ntdll));
        for subsystem in self.subsystems {
            if subsystem.id() == SubsystemId::Ntdll {
                warn!("ntdll is built in; replacement ignored");
                continue;
            }
            subsystems.register(subsystem);
        }

        let loader = Loader::new(storage, objects.clone(), Arc::clone(&config), Arc::clone(&metrics));
        let (halt, _) = watch::channel(None);

        let shared = Arc::new_cyclic(|weak| KernelShared {
            config,
            objects,
            subsystems,
            loader,
            callbacks: CallbackBridge::new(weak.clone()),
            host,
            processes: DashMap::with_hasher(RandomState::new()),
            metrics,
            next_pid: PidGenerator::default_start(),
            halted: AtomicBool::new(false),
            halt,
        });

        info!(host = shared.host.name(), subsystems = ?shared.subsystems.ids(), "Kernel initialized");
        Kernel { shared }
    }
}

impl Default for KernelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    pub fn builder() -> KernelBuilder {
        KernelBuilder::new()
    }

    pub fn new(config: KernelConfig) -> Self {
        KernelBuilder::new().with_config(config).build()
    }

    pub fn config(&self) -> &KernelConfig {
        &self.shared.config
    }

    pub fn objects(&self) -> &ObjectManager {
        &self.shared.objects
    }

    pub fn subsystems(&self) -> &SubsystemRegistry {
        &self.shared.subsystems
    }

    pub fn loader(&self) -> &Loader {
        &self.shared.loader
    }

    pub fn callbacks(&self) -> &CallbackBridge {
        &self.shared.callbacks
    }

    pub fn metrics(&self) -> &KernelMetrics {
        &self.shared.metrics
    }

    /// PsCreateProcess: create a kernel-owned process
    pub fn create_process(&self, info: CreateProcessInfo) -> KernelResult<Arc<Process>> {
        self.create_process_owned(info, Handle::NULL)
    }

    /// Create a process whose object entry is owned by `owner`
    ///
    /// Destroying `owner` tears the new process down with it.
    pub fn create_process_owned(&self, info: CreateProcessInfo, owner: Handle) -> KernelResult<Arc<Process>> {
        let shared = &self.shared;
        if let Some(reason) = self.halt_reason() {
            return Err(ProcessError::SystemHalted(reason).into());
        }
        let current = shared.processes.len();
        if current >= shared.config.max_processes {
            return Err(ProcessError::LimitReached {
                current,
                limit: shared.config.max_processes,
            }
            .into());
        }

        let pid = shared.next_pid.next();
        let (kernel_port, user_port) = MessagePort::pair();
        let (to_user, inbound) = kernel_port.split();
        let requester = Requester::new(to_user, Arc::new(PendingReplies::new()));

        let command_line = info
            .command_line
            .clone()
            .unwrap_or_else(|| info.application_path.clone());
        let image = ProcessImage {
            name: module_file_name(&info.application_path),
            version: None,
            executable_path: info.application_path.clone(),
            args: split_command_line(&command_line),
            command_line,
            current_directory: info.current_directory.clone().unwrap_or_default(),
            environment: info.environment.clone(),
        };

        let process = Arc::new(Process::new(
            pid,
            image,
            requester,
            user_port.sender().downgrade(),
            Arc::downgrade(shared),
        ));

        let weak = Arc::downgrade(shared);
        let handle = shared.objects.set_object_with_destructor(
            Arc::clone(&process),
            ObjectType::PROCESS,
            owner,
            move |process: Arc<Process>| match weak.upgrade() {
                Some(shared) => Kernel { shared }.finalize(&process),
                None => {
                    let (status, hooks) = process.finish();
                    hooks.into_iter().for_each(|hook| hook(&status));
                    Ok(())
                }
            },
        );
        process.set_handle(handle);
        shared.processes.insert(pid, Arc::clone(&process));

        let ctx = ProcessContext::new(self.clone(), Arc::clone(&process), None);
        let ntdll_state = match ctx.load_subsystem(SubsystemId::Ntdll, None, Value::Null) {
            Ok(loaded) => loaded,
            Err(e) => return Err(self.abort_start(&process, KernelError::Subsystem(e))),
        };

        let Some(module) = shared.loader.load_library(&process, &info.application_path) else {
            let err = ProcessError::ExecutableNotFound(info.application_path.clone());
            return Err(self.abort_start(&process, err.into()));
        };
        if module.descriptor.kind != ModuleKind::Exe {
            let err = ProcessError::NotExecutable(module.name.clone());
            return Err(self.abort_start(&process, err.into()));
        }

        process.update_image(|image| {
            image.name = module.descriptor.name.clone().unwrap_or_else(|| module.name.clone());
            image.version = module.descriptor.version.clone();
            image.executable_path = module.path.clone();
            if image.current_directory.is_empty() {
                image.current_directory = parent_dir(&module.path).unwrap_or_default();
            }
        });
        let image = process.image();

        let task = tokio::spawn(run_dispatch_loop(self.clone(), Arc::clone(&process), inbound));
        process.attach_task(task.abort_handle());

        let startup = StartupInfo {
            pid,
            handle,
            module: module.clone(),
            command_line: image.command_line.clone(),
            args: image.args.clone(),
            current_directory: image.current_directory.clone(),
            environment: image.environment.clone(),
            startup_info: info.startup_info,
        };
        let data = match serde_json::to_value(&startup) {
            Ok(data) => data,
            Err(e) => return Err(self.abort_start(&process, KernelError::Internal(e.to_string()))),
        };
        let mut create = Message::post(SubsystemId::Ntdll.as_str(), ntdll::ops::CREATE, data);
        if let Some(segment) = ntdll_state.state.segment() {
            create = create.with_transfer(segment.clone());
        }
        if let Err(e) = process.requester().post(create) {
            return Err(self.abort_start(&process, e.into()));
        }

        let launch = ContextLaunch {
            pid,
            entry_point: module.descriptor.entry_point.clone(),
            port: user_port,
        };
        match shared.host.start(launch) {
            Ok(Some(context)) => process.attach_task(context.abort_handle()),
            Ok(None) => {}
            Err(e) => return Err(self.abort_start(&process, e.into())),
        }

        process.set_state(ProcessState::Running);
        shared.metrics.process_created();
        info!(pid, %handle, %owner, name = %image.name, path = %image.executable_path, "Process created");
        Ok(process)
    }

    fn abort_start(&self, process: &Process, err: KernelError) -> KernelError {
        warn!(pid = process.id(), error = %err, "Process creation failed");
        process.record_exit(ExitStatus::start_failed(err.to_string()));
        process.abort_tasks();
        if let Err(e) = self.shared.objects.destroy_handle(process.handle()) {
            error!(pid = process.id(), error = %e, "Teardown of half-created process failed");
        }
        err
    }

    /// Destructor of every `PROC` entry
    fn finalize(&self, process: &Arc<Process>) -> anyhow::Result<()> {
        let shared = &self.shared;
        process.abort_tasks();
        let abandoned = process.requester().pending().fail_all();
        shared.processes.remove(&process.id());
        let released = shared.loader.release_process(process);

        let (status, hooks) = process.finish();
        for hook in hooks {
            hook(&status);
        }
        shared.metrics.process_exited();
        info!(
            pid = process.id(),
            code = status.code,
            reason = ?status.reason,
            abandoned,
            "Process exited"
        );

        if process.is_critical() && status.is_unexpected() {
            self.bugcheck(format!(
                "critical process {} ({}) died: {}",
                process.id(),
                process.name(),
                status.error.as_deref().unwrap_or("unexpected termination")
            ));
        }

        released?;
        Ok(())
    }

    pub fn get_process(&self, pid: ProcessId) -> Option<Arc<Process>> {
        self.shared
            .processes
            .get(&pid)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn process_by_handle(&self, handle: Handle) -> Option<Arc<Process>> {
        self.shared.objects.get_object::<Process>(handle)
    }

    pub fn processes(&self) -> Vec<Arc<Process>> {
        let mut processes: Vec<Arc<Process>> = self
            .shared
            .processes
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        processes.sort_by_key(|p| p.id());
        processes
    }

    pub fn list_processes(&self) -> Vec<ProcessInfo> {
        self.processes().iter().map(|p| p.info()).collect()
    }

    pub fn process_count(&self) -> usize {
        self.shared.processes.len()
    }

    pub fn terminate_process(&self, pid: ProcessId, code: i32, error: Option<String>) -> KernelResult<bool> {
        self.get_process(pid)
            .ok_or(ProcessError::NotFound(pid))?
            .terminate(code, error)
    }

    pub fn is_halted(&self) -> bool {
        self.shared.halted.load(Ordering::SeqCst)
    }

    pub fn halt_reason(&self) -> Option<String> {
        self.shared.halt.borrow().clone()
    }

    /// Wait until the kernel halts; returns the reason
    pub async fn wait_for_halt(&self) -> String {
        let mut rx = self.shared.halt.subscribe();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return String::from("kernel dropped");
            }
        }
    }

    /// Fatal halt: terminate every process, destroy every handle, refuse new work
    pub fn bugcheck(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.shared.halted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.halt.send_replace(Some(reason.clone()));
        error!(reason = %reason, "*** STOP: kernel halted");

        for process in self.processes() {
            process.record_exit(ExitStatus::halted(reason.clone()));
            process.abort_tasks();
        }
        for e in self.shared.objects.destroy_all() {
            error!(error = %e, "Destructor failed during halt");
        }
        self.shared.processes.clear();
    }

    /// Orderly stop: clear critical flags, then terminate everything
    pub fn shutdown(&self) {
        for process in self.processes() {
            process.set_critical(false);
            if let Err(e) = process.terminate(0, Some("shutdown".into())) {
                warn!(pid = process.id(), error = %e, "Shutdown teardown failed");
            }
        }
        info!("Kernel shut down");
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("processes", &self.shared.processes.len())
            .field("objects", &self.shared.objects.len())
            .field("halted", &self.is_halted())
            .finish()
    }
}
