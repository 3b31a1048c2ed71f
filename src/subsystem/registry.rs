/*!
 * Subsystem Registry
 * Pluggable API surfaces addressed by allow-listed name
 */

use super::types::{SubsystemError, SubsystemId, SubsystemResult};
use crate::core::limits::{CALLBACK_OP, ERROR_REPLY_BIT};
use crate::core::types::{OpCode, ProcessId};
use crate::process::ProcessContext;
use ahash::RandomState;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{info, warn};

/// A subsystem: exported operations plus optional per-process hooks
pub trait Subsystem: Send + Sync {
    fn id(&self) -> SubsystemId;

    /// Run one exported operation for the calling process
    fn call(
        &self,
        ctx: ProcessContext,
        op: OpCode,
        payload: Value,
    ) -> Pin<Box<dyn Future<Output = SubsystemResult<Value>> + Send + '_>>;

    /// Slots in the shared segment each instance gets (0 = none)
    fn shared_slots(&self) -> usize {
        0
    }

    /// Runs once when a process loads this subsystem
    fn init(&self, _ctx: &ProcessContext, _params: &Value) -> SubsystemResult<()> {
        Ok(())
    }

    /// Runs when the per-process instance is destroyed
    fn exit(&self, _process: ProcessId) {}
}

type ExportFn = Arc<dyn Fn(ProcessContext, Value) -> BoxFuture<'static, SubsystemResult<Value>> + Send + Sync>;
type InitHook = Box<dyn Fn(&ProcessContext, &Value) -> SubsystemResult<()> + Send + Sync>;
type ExitHook = Box<dyn Fn(ProcessId) + Send + Sync>;

/// Closure-backed subsystem built from an op code -> handler table
///
/// ```ignore
/// let kernel32 = ExportTable::new(SubsystemId::Kernel32)
///     .with_shared_slots(4)
///     .export_sync(GET_TICK_COUNT, |_ctx, _payload| Ok(json!(42)));
/// ```
pub struct ExportTable {
    id: SubsystemId,
    exports: HashMap<OpCode, ExportFn, RandomState>,
    shared_slots: usize,
    init: Option<InitHook>,
    exit: Option<ExitHook>,
}

impl ExportTable {
    pub fn new(id: SubsystemId) -> Self {
        Self {
            id,
            exports: HashMap::with_hasher(RandomState::new()),
            shared_slots: 0,
            init: None,
            exit: None,
        }
    }

    /// Export an async operation
    pub fn export<F, Fut>(mut self, op: OpCode, handler: F) -> Self
    where
        F: Fn(ProcessContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SubsystemResult<Value>> + Send + 'static,
    {
        if op == CALLBACK_OP || op & ERROR_REPLY_BIT != 0 {
            warn!(subsystem = %self.id, op, "Reserved op code, export ignored");
            return self;
        }
        self.exports
            .insert(op, Arc::new(move |ctx, payload| handler(ctx, payload).boxed()));
        self
    }

    /// Export an operation that completes without awaiting
    pub fn export_sync<F>(self, op: OpCode, handler: F) -> Self
    where
        F: Fn(ProcessContext, Value) -> SubsystemResult<Value> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        self.export(op, move |ctx, payload| {
            let handler = Arc::clone(&handler);
            async move { handler(ctx, payload) }
        })
    }

    pub fn with_shared_slots(mut self, slots: usize) -> Self {
        self.shared_slots = slots;
        self
    }

    pub fn on_init<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ProcessContext, &Value) -> SubsystemResult<()> + Send + Sync + 'static,
    {
        self.init = Some(Box::new(hook));
        self
    }

    pub fn on_exit<F>(mut self, hook: F) -> Self
    where
        F: Fn(ProcessId) + Send + Sync + 'static,
    {
        self.exit = Some(Box::new(hook));
        self
    }

    /// Exported op codes, ascending
    pub fn ops(&self) -> Vec<OpCode> {
        let mut ops: Vec<OpCode> = self.exports.keys().copied().collect();
        ops.sort_unstable();
        ops
    }
}

impl Subsystem for ExportTable {
    fn id(&self) -> SubsystemId {
        self.id
    }

    fn call(
        &self,
        ctx: ProcessContext,
        op: OpCode,
        payload: Value,
    ) -> Pin<Box<dyn Future<Output = SubsystemResult<Value>> + Send + '_>> {
        match self.exports.get(&op) {
            Some(handler) => handler(ctx, payload),
            None => {
                let err = SubsystemError::UnknownOperation {
                    subsystem: self.id.to_string(),
                    op,
                };
                Box::pin(async move { Err(err) })
            }
        }
    }

    fn shared_slots(&self) -> usize {
        self.shared_slots
    }

    fn init(&self, ctx: &ProcessContext, params: &Value) -> SubsystemResult<()> {
        match &self.init {
            Some(hook) => hook(ctx, params),
            None => Ok(()),
        }
    }

    fn exit(&self, process: ProcessId) {
        if let Some(hook) = &self.exit {
            hook(process);
        }
    }
}

impl fmt::Debug for ExportTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportTable")
            .field("id", &self.id)
            .field("ops", &self.ops())
            .field("shared_slots", &self.shared_slots)
            .finish()
    }
}

/// Kernel-wide map from subsystem id to its implementation
#[derive(Clone, Default)]
pub struct SubsystemRegistry {
    entries: Arc<DashMap<SubsystemId, Arc<dyn Subsystem>, RandomState>>,
}

impl SubsystemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install an implementation, returning the one it replaces
    pub fn register(&self, subsystem: Arc<dyn Subsystem>) -> Option<Arc<dyn Subsystem>> {
        let id = subsystem.id();
        info!(subsystem = %id, "Subsystem registered");
        self.entries.insert(id, subsystem)
    }

    pub fn get(&self, id: SubsystemId) -> Option<Arc<dyn Subsystem>> {
        self.entries.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Resolve a wire name: allow-list first, then registration
    pub fn resolve(&self, name: &str) -> SubsystemResult<Arc<dyn Subsystem>> {
        let id = SubsystemId::parse(name)?;
        self.get(id).ok_or(SubsystemError::NotRegistered(id))
    }

    pub fn contains(&self, id: SubsystemId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<SubsystemId> {
        let mut ids: Vec<SubsystemId> = self.entries.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }
}

impl fmt::Debug for SubsystemRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubsystemRegistry")
            .field("ids", &self.ids())
            .finish()
    }
}
