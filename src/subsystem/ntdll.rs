/*!
 * ntdll
 * Built-in subsystem carrying the kernel plumbing every context needs
 */

use super::registry::Subsystem;
use super::types::{SubsystemError, SubsystemId, SubsystemResult};
use crate::core::errors::KernelError;
use crate::core::types::{Handle, OpCode, ProcessId};
use crate::object::ObjectType;
use crate::process::{CreateProcessInfo, CreatedProcess, ProcessContext, ProcessError};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::future::Future;
use std::pin::Pin;

/// Operation codes
pub mod ops {
    use crate::core::types::OpCode;

    /// Kernel -> context: startup info, sent once before anything else
    pub const CREATE: OpCode = 1;
    pub const LOAD_SUBSYSTEM: OpCode = 2;
    /// Context -> kernel post: cooperative exit
    pub const QUIT: OpCode = 3;
    /// Context -> kernel post: unhandled failure in user code
    pub const CRASH: OpCode = 4;
    pub const LOAD_LIBRARY: OpCode = 5;
    pub const FREE_LIBRARY: OpCode = 6;
    pub const CLOSE_HANDLE: OpCode = 7;
    pub const DUPLICATE_HANDLE: OpCode = 8;
    pub const CREATE_PROCESS: OpCode = 9;
    pub const TERMINATE_PROCESS: OpCode = 10;
    pub const REGISTER_CALLBACK: OpCode = 11;
    pub const INVOKE_CALLBACK: OpCode = 12;
    pub const GET_PROCESS_INFO: OpCode = 13;
    /// Kernel -> context post: a callback handle was closed
    pub const CALLBACK_CLOSED: OpCode = 14;
}

/// Slot raised in the ntdll segment when the kernel asks the process to quit
pub const QUIT_REQUESTED_SLOT: usize = 0;

const NTDLL_SHARED_SLOTS: usize = 1;

#[derive(Debug, Deserialize)]
struct LoadSubsystemRequest {
    name: String,
    #[serde(default)]
    slots: Option<usize>,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Deserialize)]
struct NameRequest {
    name: String,
}

#[derive(Debug, Deserialize)]
struct HandleRequest {
    handle: Handle,
}

#[derive(Debug, Deserialize)]
struct TerminateRequest {
    handle: Handle,
    #[serde(default)]
    code: i32,
}

#[derive(Debug, Deserialize)]
struct InvokeRequest {
    callback: Handle,
    #[serde(default)]
    args: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct ProcessInfoRequest {
    #[serde(default)]
    pid: Option<ProcessId>,
}

fn payload<T: DeserializeOwned>(value: Value) -> SubsystemResult<T> {
    Ok(serde_json::from_value(value)?)
}

fn kernel_error(err: KernelError) -> SubsystemError {
    match err {
        KernelError::Process(ProcessError::ExecutableNotFound(path)) => SubsystemError::NotFound(path),
        KernelError::Subsystem(e) => e,
        other => SubsystemError::Failed(other.to_string()),
    }
}

/// The ntdll export surface
#[derive(Debug, Default, Clone, Copy)]
pub struct Ntdll;

impl Ntdll {
    fn load_subsystem(ctx: &ProcessContext, request: LoadSubsystemRequest) -> SubsystemResult<Value> {
        let id = SubsystemId::parse(&request.name)?;
        let loaded = ctx.load_subsystem(id, request.slots, request.params)?;
        if let Some(segment) = loaded.state.segment() {
            ctx.transfer(segment.clone());
        }
        Ok(serde_json::to_value(loaded.state.summary(loaded.handle))?)
    }

    fn load_library(ctx: &ProcessContext, name: &str) -> SubsystemResult<Value> {
        match ctx.kernel().loader().load_library(ctx.process(), name) {
            Some(module) => Ok(serde_json::to_value(module)?),
            None => Ok(Value::Null),
        }
    }

    fn close_handle(ctx: &ProcessContext, handle: Handle) -> SubsystemResult<Value> {
        let objects = ctx.objects();
        if objects.object_type(handle) == Some(ObjectType::MODULE) {
            let freed = ctx.kernel().loader().free_handle(ctx.process(), handle);
            return Ok(json!(freed));
        }
        let handle = ctx.check_owned(handle)?;
        if handle == ctx.process_handle() {
            return Err(SubsystemError::AccessDenied {
                handle,
                process: ctx.process_id(),
            });
        }
        let closed = objects
            .close_handle(handle)
            .map_err(|e| SubsystemError::Failed(e.to_string()))?;
        Ok(json!(closed))
    }

    fn duplicate_handle(ctx: &ProcessContext, handle: Handle) -> SubsystemResult<Value> {
        let handle = ctx.check_owned(handle)?;
        Ok(json!(ctx.objects().duplicate_handle(handle)))
    }

    fn create_process(ctx: &ProcessContext, info: CreateProcessInfo) -> SubsystemResult<Value> {
        let child = ctx
            .kernel()
            .create_process_owned(info, ctx.process_handle())
            .map_err(kernel_error)?;
        Ok(serde_json::to_value(CreatedProcess {
            pid: child.id(),
            handle: child.handle(),
        })?)
    }

    fn terminate_process(ctx: &ProcessContext, request: TerminateRequest) -> SubsystemResult<Value> {
        let handle = ctx.check_owned(request.handle)?;
        let target = ctx
            .kernel()
            .process_by_handle(handle)
            .ok_or(SubsystemError::InvalidHandle(handle))?;
        let terminated = target
            .terminate(request.code, None)
            .map_err(kernel_error)?;
        Ok(json!(terminated))
    }

    fn register_callback(ctx: &ProcessContext) -> SubsystemResult<Value> {
        let handle = ctx
            .kernel()
            .callbacks()
            .register(ctx.process_id())
            .ok_or_else(|| SubsystemError::Failed("process is not registered".into()))?;
        Ok(json!({ "handle": handle }))
    }

    fn process_info(ctx: &ProcessContext, request: ProcessInfoRequest) -> SubsystemResult<Value> {
        let info = match request.pid {
            Some(pid) => ctx.kernel().get_process(pid).map(|p| p.info()),
            None => Some(ctx.process().info()),
        };
        Ok(serde_json::to_value(info)?)
    }
}

impl Subsystem for Ntdll {
    fn id(&self) -> SubsystemId {
        SubsystemId::Ntdll
    }

    fn call(
        &self,
        ctx: ProcessContext,
        op: OpCode,
        payload_value: Value,
    ) -> Pin<Box<dyn Future<Output = SubsystemResult<Value>> + Send + '_>> {
        Box::pin(async move {
            match op {
                ops::LOAD_SUBSYSTEM => Self::load_subsystem(&ctx, payload(payload_value)?),
                ops::LOAD_LIBRARY => {
                    let request: NameRequest = payload(payload_value)?;
                    Self::load_library(&ctx, &request.name)
                }
                ops::FREE_LIBRARY => {
                    let request: NameRequest = payload(payload_value)?;
                    Ok(json!(ctx.kernel().loader().free_library(ctx.process(), &request.name)))
                }
                ops::CLOSE_HANDLE => {
                    let request: HandleRequest = payload(payload_value)?;
                    Self::close_handle(&ctx, request.handle)
                }
                ops::DUPLICATE_HANDLE => {
                    let request: HandleRequest = payload(payload_value)?;
                    Self::duplicate_handle(&ctx, request.handle)
                }
                ops::CREATE_PROCESS => Self::create_process(&ctx, payload(payload_value)?),
                ops::TERMINATE_PROCESS => Self::terminate_process(&ctx, payload(payload_value)?),
                ops::REGISTER_CALLBACK => Self::register_callback(&ctx),
                ops::INVOKE_CALLBACK => {
                    let request: InvokeRequest = payload(payload_value)?;
                    Ok(ctx.invoke_callback(request.callback, request.args).await?)
                }
                ops::GET_PROCESS_INFO => {
                    let request = if payload_value.is_null() {
                        ProcessInfoRequest::default()
                    } else {
                        payload(payload_value)?
                    };
                    Self::process_info(&ctx, request)
                }
                // QUIT and CRASH are consumed by the dispatch loop; CREATE and CALLBACK_CLOSED only flow outward
                op => Err(SubsystemError::UnknownOperation {
                    subsystem: SubsystemId::Ntdll.to_string(),
                    op,
                }),
            }
        })
    }

    fn shared_slots(&self) -> usize {
        NTDLL_SHARED_SLOTS
    }
}
