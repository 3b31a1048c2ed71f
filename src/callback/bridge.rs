/*!
 * Callback Bridge
 * Kernel-initiated calls into functions registered by user-mode code
 */

use crate::core::types::{Handle, ProcessId};
use crate::ipc::{IpcError, IpcResult, Message, RequestOutcome};
use crate::kernel::KernelShared;
use crate::object::ObjectType;
use crate::subsystem::ntdll::ops;
use crate::subsystem::SubsystemId;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Object behind a `CALLBACK` handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackObject {
    /// Process whose context runs the callback
    pub process: ProcessId,
}

/// Routes callback invocations to the owning process's context
#[derive(Clone)]
pub struct CallbackBridge {
    kernel: Weak<KernelShared>,
}

impl CallbackBridge {
    pub(crate) fn new(kernel: Weak<KernelShared>) -> Self {
        Self { kernel }
    }

    /// Register a callback for `process`; the handle is the callback id
    ///
    /// Destroying the handle posts `CALLBACK_CLOSED` to the owning context so
    /// it stops running the function locally.
    pub fn register(&self, process: ProcessId) -> Option<Handle> {
        let kernel = self.kernel.upgrade()?;
        let owner = kernel.processes.get(&process).map(|p| Arc::clone(p.value()))?;
        let target = Arc::downgrade(&owner);
        let assigned: Arc<OnceLock<Handle>> = Arc::new(OnceLock::new());
        let closed = Arc::clone(&assigned);

        let handle = kernel.objects.set_object_with_destructor(
            Arc::new(CallbackObject { process }),
            ObjectType::CALLBACK,
            owner.handle(),
            move |_object: Arc<CallbackObject>| {
                if let (Some(process), Some(callback)) = (target.upgrade(), closed.get()) {
                    let notice = Message::post(
                        SubsystemId::Ntdll.as_str(),
                        ops::CALLBACK_CLOSED,
                        json!({ "callback": callback }),
                    );
                    if let Err(e) = process.requester().post(notice) {
                        debug!(pid = process.id(), %callback, error = %e, "Callback close notice undeliverable");
                    }
                }
                Ok(())
            },
        );
        let _ = assigned.set(handle);
        info!(pid = process, %handle, "Callback registered");
        Some(handle)
    }

    /// Owning process of a live callback
    pub fn owner(&self, callback: Handle) -> Option<ProcessId> {
        let kernel = self.kernel.upgrade()?;
        kernel
            .objects
            .get_object::<CallbackObject>(callback)
            .map(|object| object.process)
    }

    /// Invoke with the configured request timeout
    pub async fn invoke(&self, callback: Handle, args: Vec<Value>) -> IpcResult<Value> {
        let timeout = match self.kernel.upgrade() {
            Some(kernel) => kernel.config.request_timeout,
            None => return Ok(Value::Null),
        };
        self.invoke_with_timeout(callback, args, timeout).await
    }

    /// Round-trip a callback through its owner's context
    ///
    /// A callback whose owner is gone (or that was closed) yields `Null`
    /// rather than an error, as does a context torn down mid-call.
    pub async fn invoke_with_timeout(
        &self,
        callback: Handle,
        args: Vec<Value>,
        timeout: Duration,
    ) -> IpcResult<Value> {
        let Some(kernel) = self.kernel.upgrade() else {
            return Ok(Value::Null);
        };
        let Some(object) = kernel.objects.get_object::<CallbackObject>(callback) else {
            debug!(%callback, "Callback is gone");
            return Ok(Value::Null);
        };
        let Some(process) = kernel.processes.get(&object.process).map(|p| Arc::clone(p.value())) else {
            return Ok(Value::Null);
        };
        if process.is_terminated() {
            return Ok(Value::Null);
        }
        kernel.metrics.callback_invoked();
        drop(kernel);

        let started = Instant::now();
        let outcome = process
            .requester()
            .callback_message(Message::callback(callback, 0, args), Some(timeout))
            .await;

        match outcome {
            Ok(RequestOutcome::Reply(reply)) => reply.into_result(),
            Ok(RequestOutcome::TimedOut) => {
                if let Some(kernel) = self.kernel.upgrade() {
                    kernel.metrics.request_timed_out();
                }
                Err(IpcError::Timeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            Err(IpcError::ChannelClosed(reason)) => {
                debug!(%callback, reason, "Callback owner went away mid-call");
                Ok(Value::Null)
            }
            Err(e) => Err(e),
        }
    }
}
