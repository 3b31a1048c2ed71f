/*!
 * Callback Table
 * User-mode functions a context has registered, by callback handle
 */

use crate::core::types::Handle;
use crate::usermode::UserContext;
use ahash::RandomState;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;

/// A registered user-mode function
pub type UserCallback = Arc<dyn Fn(UserContext, Vec<Value>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Callbacks registered by one execution context
#[derive(Clone, Default)]
pub struct CallbackTable {
    entries: Arc<DashMap<Handle, UserCallback, RandomState>>,
}

impl CallbackTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, handle: Handle, function: UserCallback) {
        self.entries.insert(handle, function);
    }

    pub(crate) fn get(&self, handle: Handle) -> Option<UserCallback> {
        self.entries.get(&handle).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, handle: Handle) -> bool {
        self.entries.remove(&handle).is_some()
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.entries.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
