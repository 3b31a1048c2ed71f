/*!
 * Process Context
 * What a subsystem handler sees of the kernel and its calling process
 */

use super::process::{LoadedSubsystem, Process};
use crate::core::limits::{LAST_ERROR_SLOT, MAX_SHARED_SLOTS};
use crate::core::types::{ChannelId, Handle, ProcessId};
use crate::ipc::{IpcResult, SharedSegment};
use crate::kernel::Kernel;
use crate::object::{ObjectManager, ObjectType};
use crate::subsystem::{SubsystemError, SubsystemId, SubsystemResult, SubsystemState};
use parking_lot::Mutex;
use serde_json::Value;
use std::any::Any;
use std::sync::Arc;
use tracing::info;

/// Handler-side view of one dispatched message
#[derive(Clone)]
pub struct ProcessContext {
    kernel: Kernel,
    process: Arc<Process>,
    channel: Option<ChannelId>,
    transfers: Arc<Mutex<Vec<SharedSegment>>>,
}

impl ProcessContext {
    pub fn new(kernel: Kernel, process: Arc<Process>, channel: Option<ChannelId>) -> Self {
        Self {
            kernel,
            process,
            channel,
            transfers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }

    pub fn process_id(&self) -> ProcessId {
        self.process.id()
    }

    pub fn process_handle(&self) -> Handle {
        self.process.handle()
    }

    pub fn objects(&self) -> &ObjectManager {
        self.kernel.objects()
    }

    /// Channel of the request being served; `None` for posts
    pub fn channel(&self) -> Option<ChannelId> {
        self.channel
    }

    /// Attach a shared segment to the reply
    pub fn transfer(&self, segment: SharedSegment) {
        self.transfers.lock().push(segment);
    }

    pub(crate) fn take_transfers(&self) -> Vec<SharedSegment> {
        std::mem::take(&mut *self.transfers.lock())
    }

    /// Register a value owned by the calling process
    pub fn create_object<T>(&self, value: T, object_type: ObjectType) -> Handle
    where
        T: Any + Send + Sync,
    {
        self.objects()
            .set_object(value, object_type, self.process.handle())
    }

    /// Fail unless the calling process owns `handle`, directly or transitively
    ///
    /// `CURRENT_PROCESS` names the caller itself.
    pub fn check_owned(&self, handle: Handle) -> SubsystemResult<Handle> {
        let own = self.process.handle();
        let handle = if handle == Handle::CURRENT_PROCESS { own } else { handle };
        if !self.objects().contains(handle) {
            return Err(SubsystemError::InvalidHandle(handle));
        }
        if handle == own || self.objects().is_owned_by(handle, own) {
            Ok(handle)
        } else {
            Err(SubsystemError::AccessDenied {
                handle,
                process: self.process.id(),
            })
        }
    }

    /// Typed lookup of a handle the calling process owns
    pub fn owned_object<T>(&self, handle: Handle) -> SubsystemResult<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let handle = self.check_owned(handle)?;
        self.objects()
            .get_object::<T>(handle)
            .ok_or(SubsystemError::InvalidHandle(handle))
    }

    /// Write the thread-style last error into the kernel32 segment
    ///
    /// Returns false when kernel32 is not loaded or has no segment.
    pub fn set_last_error(&self, code: u32) -> bool {
        self.segment(SubsystemId::Kernel32)
            .map(|segment| segment.store(LAST_ERROR_SLOT, code))
            .unwrap_or(false)
    }

    pub fn last_error(&self) -> Option<u32> {
        self.segment(SubsystemId::Kernel32)
            .and_then(|segment| segment.load(LAST_ERROR_SLOT))
    }

    /// Shared segment of a subsystem loaded by this process
    pub fn segment(&self, id: SubsystemId) -> Option<SharedSegment> {
        self.process
            .subsystem(id)
            .and_then(|loaded| loaded.state.segment().cloned())
    }

    /// Invoke a callback registered by any process
    pub async fn invoke_callback(&self, callback: Handle, args: Vec<Value>) -> IpcResult<Value> {
        self.kernel.callbacks().invoke(callback, args).await
    }

    /// Load `id` into the calling process, or return the existing instance
    ///
    /// `slots` overrides the subsystem's own segment size; `0` means none.
    pub fn load_subsystem(
        &self,
        id: SubsystemId,
        slots: Option<usize>,
        params: Value,
    ) -> SubsystemResult<LoadedSubsystem> {
        let subsystem = self
            .kernel
            .subsystems()
            .get(id)
            .ok_or(SubsystemError::NotRegistered(id))?;

        if let Some(existing) = self.process.subsystem(id) {
            return Ok(existing);
        }

        let mut slots = slots
            .unwrap_or_else(|| subsystem.shared_slots())
            .min(MAX_SHARED_SLOTS);
        // kernel32 always carries the last-error slot
        if id == SubsystemId::Kernel32 && slots <= LAST_ERROR_SLOT {
            slots = self.kernel.config().default_shared_slots.max(LAST_ERROR_SLOT + 1);
        }
        let segment = (slots > 0).then(|| SharedSegment::new(slots));

        // Hooks may call back into this context, so no lock is held here
        subsystem.init(self, &params)?;

        let mut loaded = self.process.subsystems().lock();
        if let Some(existing) = loaded.get(&id) {
            return Ok(existing.clone());
        }

        let state = Arc::new(SubsystemState::new(
            self.process.id(),
            Arc::clone(&subsystem),
            segment,
            params,
        ));
        let weak_process = Arc::downgrade(&self.process);
        let handle = self.objects().set_object_with_destructor(
            Arc::clone(&state),
            ObjectType::SUBSYSTEM,
            self.process.handle(),
            move |state: Arc<SubsystemState>| {
                if let Some(process) = weak_process.upgrade() {
                    process.subsystems().lock().remove(&state.id());
                }
                state.subsystem().exit(state.process());
                Ok(())
            },
        );

        let entry = LoadedSubsystem { handle, state };
        loaded.insert(id, entry.clone());
        drop(loaded);

        self.kernel.metrics().subsystem_loaded();
        info!(pid = self.process.id(), subsystem = %id, %handle, slots, "Subsystem loaded");
        Ok(entry)
    }
}

impl std::fmt::Debug for ProcessContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessContext")
            .field("pid", &self.process.id())
            .field("channel", &self.channel)
            .finish()
    }
}
