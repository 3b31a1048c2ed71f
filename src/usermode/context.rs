/*!
 * User Context
 * The API a user program calls; every kernel service is a message round-trip
 */

use crate::callback::{CallbackTable, UserCallback};
use crate::core::errors::SerializableError;
use crate::core::limits::LAST_ERROR_SLOT;
use crate::core::types::{Handle, OpCode, ProcessId};
use crate::ipc::{IpcError, IpcResult, Message, Requester, RequestOutcome, SharedSegment};
use crate::loader::ModuleInfo;
use crate::process::{CreateProcessInfo, CreatedProcess, ProcessInfo, StartupInfo};
use crate::subsystem::ntdll::{ops, QUIT_REQUESTED_SLOT};
use crate::subsystem::{SubsystemId, SubsystemSummary};
use ahash::RandomState;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

struct UserInner {
    requester: Requester,
    startup: StartupInfo,
    process_segment: Option<SharedSegment>,
    segments: Mutex<HashMap<SubsystemId, SharedSegment, RandomState>>,
    callbacks: CallbackTable,
    request_timeout: Duration,
}

/// Handle to the running process, from inside it
#[derive(Clone)]
pub struct UserContext {
    inner: Arc<UserInner>,
}

fn decode<T: DeserializeOwned>(value: Value) -> IpcResult<T> {
    Ok(serde_json::from_value(value)?)
}

impl UserContext {
    pub(crate) fn new(
        requester: Requester,
        startup: StartupInfo,
        process_segment: Option<SharedSegment>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(UserInner {
                requester,
                startup,
                process_segment,
                segments: Mutex::new(HashMap::with_hasher(RandomState::new())),
                callbacks: CallbackTable::new(),
                request_timeout,
            }),
        }
    }

    pub fn process_id(&self) -> ProcessId {
        self.inner.startup.pid
    }

    pub fn process_handle(&self) -> Handle {
        self.inner.startup.handle
    }

    pub fn startup(&self) -> &StartupInfo {
        &self.inner.startup
    }

    pub fn args(&self) -> &[String] {
        &self.inner.startup.args
    }

    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.inner
            .startup
            .environment
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Request with the default timeout; error replies become `IpcError::Remote`
    pub async fn call(&self, subsystem: SubsystemId, op: OpCode, data: Value) -> IpcResult<Value> {
        let timeout = self.inner.request_timeout;
        let started = Instant::now();
        match self.call_with_timeout(subsystem, op, data, timeout).await? {
            RequestOutcome::Reply(reply) => reply.into_result(),
            RequestOutcome::TimedOut => Err(IpcError::Timeout {
                elapsed_ms: started.elapsed().as_millis() as u64,
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Request raced against `timeout`; a late reply is dropped
    pub async fn call_with_timeout(
        &self,
        subsystem: SubsystemId,
        op: OpCode,
        data: Value,
        timeout: Duration,
    ) -> IpcResult<RequestOutcome> {
        self.inner
            .requester
            .request_with_timeout(subsystem.as_str(), op, data, timeout)
            .await
    }

    /// Fire-and-forget
    pub fn post(&self, subsystem: SubsystemId, op: OpCode, data: Value) -> IpcResult<()> {
        self.inner
            .requester
            .post(Message::post(subsystem.as_str(), op, data))
    }

    /// Load a subsystem explicitly and keep its shared segment
    pub async fn load_subsystem(&self, id: SubsystemId) -> IpcResult<Option<SharedSegment>> {
        self.load_subsystem_with(id, None, Value::Null).await
    }

    pub async fn load_subsystem_with(
        &self,
        id: SubsystemId,
        slots: Option<usize>,
        params: Value,
    ) -> IpcResult<Option<SharedSegment>> {
        if let Some(segment) = self.segment(id) {
            return Ok(Some(segment));
        }
        let reply = self
            .inner
            .requester
            .request(
                SubsystemId::Ntdll.as_str(),
                ops::LOAD_SUBSYSTEM,
                json!({ "name": id, "slots": slots, "params": params }),
            )
            .await?;
        let segment = reply.transfer.first().cloned();
        let summary: SubsystemSummary = decode(reply.into_result()?)?;
        debug!(pid = self.process_id(), subsystem = %summary.name, slots = summary.slots, "Subsystem attached");

        if let Some(segment) = &segment {
            self.inner.segments.lock().insert(id, segment.clone());
        }
        Ok(segment)
    }

    pub fn segment(&self, id: SubsystemId) -> Option<SharedSegment> {
        self.inner.segments.lock().get(&id).cloned()
    }

    /// Last error from the kernel32 segment (`None` until kernel32 is loaded)
    pub fn last_error(&self) -> Option<u32> {
        self.segment(SubsystemId::Kernel32)
            .and_then(|segment| segment.load(LAST_ERROR_SLOT))
    }

    pub fn set_last_error(&self, code: u32) -> bool {
        self.segment(SubsystemId::Kernel32)
            .map(|segment| segment.store(LAST_ERROR_SLOT, code))
            .unwrap_or(false)
    }

    /// True once the kernel has asked this process to quit
    pub fn quit_requested(&self) -> bool {
        self.inner
            .process_segment
            .as_ref()
            .and_then(|segment| segment.load(QUIT_REQUESTED_SLOT))
            .map_or(false, |flag| flag != 0)
    }

    async fn ntdll(&self, op: OpCode, data: Value) -> IpcResult<Value> {
        self.call(SubsystemId::Ntdll, op, data).await
    }

    pub async fn load_library(&self, name: &str) -> IpcResult<Option<ModuleInfo>> {
        decode(self.ntdll(ops::LOAD_LIBRARY, json!({ "name": name })).await?)
    }

    pub async fn free_library(&self, name: &str) -> IpcResult<bool> {
        decode(self.ntdll(ops::FREE_LIBRARY, json!({ "name": name })).await?)
    }

    pub async fn close_handle(&self, handle: Handle) -> IpcResult<bool> {
        decode(self.ntdll(ops::CLOSE_HANDLE, json!({ "handle": handle })).await?)
    }

    pub async fn duplicate_handle(&self, handle: Handle) -> IpcResult<Option<Handle>> {
        decode(self.ntdll(ops::DUPLICATE_HANDLE, json!({ "handle": handle })).await?)
    }

    pub async fn create_process(&self, info: CreateProcessInfo) -> IpcResult<CreatedProcess> {
        decode(self.ntdll(ops::CREATE_PROCESS, serde_json::to_value(info)?).await?)
    }

    pub async fn terminate_process(&self, handle: Handle, code: i32) -> IpcResult<bool> {
        decode(
            self.ntdll(ops::TERMINATE_PROCESS, json!({ "handle": handle, "code": code }))
                .await?,
        )
    }

    /// Snapshot of `pid`, or of this process when `None`
    pub async fn process_info(&self, pid: Option<ProcessId>) -> IpcResult<Option<ProcessInfo>> {
        decode(self.ntdll(ops::GET_PROCESS_INFO, json!({ "pid": pid })).await?)
    }

    /// Register a function other code (kernel or processes) can invoke by handle
    pub async fn register_callback<F, Fut>(&self, function: F) -> IpcResult<Handle>
    where
        F: Fn(UserContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let reply = self.ntdll(ops::REGISTER_CALLBACK, Value::Null).await?;
        let handle: Handle = decode(reply.get("handle").cloned().unwrap_or(Value::Null))?;
        let function: UserCallback = Arc::new(move |ctx, args| function(ctx, args).boxed());
        self.inner.callbacks.insert(handle, function);
        Ok(handle)
    }

    pub async fn unregister_callback(&self, handle: Handle) -> IpcResult<bool> {
        if !self.inner.callbacks.remove(handle) {
            return Ok(false);
        }
        self.close_handle(handle).await
    }

    /// Invoke a callback by handle
    ///
    /// Callbacks this process registered (and the kernel has not closed) run
    /// in place; others round-trip through the kernel to their owner. A dead
    /// owner or closed callback yields `Null`.
    pub async fn invoke_callback(&self, callback: Handle, args: Vec<Value>) -> IpcResult<Value> {
        if let Some(function) = self.inner.callbacks.get(callback) {
            trace!(%callback, "Invoking local callback");
            return function(self.clone(), args)
                .await
                .map_err(|e| IpcError::Remote(SerializableError::new("callback_failed", format!("{:#}", e))));
        }
        self.ntdll(ops::INVOKE_CALLBACK, json!({ "callback": callback, "args": args }))
            .await
    }

    /// Ask the kernel to end this process after in-flight work completes
    pub fn exit(&self, code: i32) -> IpcResult<()> {
        self.post(SubsystemId::Ntdll, ops::QUIT, json!({ "code": code }))
    }

    pub(crate) fn requester(&self) -> &Requester {
        &self.inner.requester
    }

    /// Route one inbound message: callback requests run, replies resolve
    pub(crate) fn handle_inbound(&self, message: Message) {
        if message.is_callback() && !message.is_error() && message.reply_channel.is_some() {
            let ctx = self.clone();
            tokio::spawn(async move { ctx.serve_callback(message).await });
            return;
        }
        if message.op == ops::CALLBACK_CLOSED && message.subsystem == SubsystemId::Ntdll.as_str() {
            if let Some(callback) = message.data.get("callback").and_then(|v| decode::<Handle>(v.clone()).ok()) {
                if self.inner.callbacks.remove(callback) {
                    debug!(pid = self.process_id(), %callback, "Callback closed by the kernel");
                }
            }
            return;
        }
        if !self.inner.requester.pending().resolve(message) {
            trace!(pid = self.process_id(), "Reply without waiter dropped");
        }
    }

    async fn serve_callback(&self, message: Message) {
        let args = match &message.data {
            Value::Array(args) => args.clone(),
            Value::Null => Vec::new(),
            other => vec![other.clone()],
        };
        let entry = message
            .callback_handle()
            .and_then(|handle| self.inner.callbacks.get(handle));

        let reply = match entry {
            Some(function) => match function(self.clone(), args).await {
                Ok(value) => message.reply(value),
                Err(e) => message.error_reply(SerializableError::new("callback_failed", format!("{:#}", e))),
            },
            None => message.error_reply(SerializableError::new(
                "invalid_handle",
                format!("no callback {:?} in process {}", message.callback_handle(), self.process_id()),
            )),
        };
        if let Err(e) = self.inner.requester.post(reply) {
            debug!(pid = self.process_id(), error = %e, "Callback reply undeliverable");
        }
    }
}

impl std::fmt::Debug for UserContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserContext")
            .field("pid", &self.process_id())
            .field("callbacks", &self.inner.callbacks.len())
            .finish()
    }
}
