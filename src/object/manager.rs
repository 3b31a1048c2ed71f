/*!
 * Object Manager
 * Handle table, ownership forest, reference counting and destructor dispatch
 *
 * Every mutation takes the table lock, completes, and releases it before any
 * destructor runs, so destructors may call back into the manager.
 */

use super::types::{HandleInfo, ObjectError, ObjectResult, ObjectType};
use crate::core::id::{HandleGenerator, IdGenerator};
use crate::core::types::Handle;
use ahash::RandomState;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

type AnyObject = Arc<dyn Any + Send + Sync>;
type ErasedDestructor = Box<dyn FnOnce(AnyObject) -> anyhow::Result<()> + Send>;

struct Entry {
    value: AnyObject,
    object_type: ObjectType,
    owner: Handle,
    ref_count: usize,
    owned: Vec<Handle>,
    destructor: Option<ErasedDestructor>,
}

/// Next move of the teardown walk
enum Step {
    Descend(Handle),
    Remove,
    Gone,
}

struct Inner {
    table: Mutex<HashMap<Handle, Entry, RandomState>>,
    next_handle: HandleGenerator,
}

/// Kernel object manager
///
/// Cheap to clone; clones share the same table. Construct one per kernel
/// (or per test) and inject it where needed.
#[derive(Clone)]
pub struct ObjectManager {
    inner: Arc<Inner>,
}

impl ObjectManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                table: Mutex::new(HashMap::with_hasher(RandomState::new())),
                next_handle: HandleGenerator::default_start(),
            }),
        }
    }

    /// Register a value and return its fresh handle
    ///
    /// An owner that does not exist is recorded as the kernel root so every
    /// ownership chain ends at `Handle::NULL`.
    pub fn set_object<T>(&self, value: T, object_type: ObjectType, owner: Handle) -> Handle
    where
        T: Any + Send + Sync,
    {
        self.insert(Arc::new(value), object_type, owner, None)
    }

    /// Register an already shared value
    pub fn set_shared<T>(&self, value: Arc<T>, object_type: ObjectType, owner: Handle) -> Handle
    where
        T: Any + Send + Sync,
    {
        self.insert(value, object_type, owner, None)
    }

    /// Register a shared value with a destructor run once the entry dies
    pub fn set_object_with_destructor<T, F>(
        &self,
        value: Arc<T>,
        object_type: ObjectType,
        owner: Handle,
        destructor: F,
    ) -> Handle
    where
        T: Any + Send + Sync,
        F: FnOnce(Arc<T>) -> anyhow::Result<()> + Send + 'static,
    {
        let erased: ErasedDestructor = Box::new(move |value: AnyObject| match value.downcast::<T>() {
            Ok(value) => destructor(value),
            Err(_) => Ok(()),
        });
        self.insert(value, object_type, owner, Some(erased))
    }

    fn insert(
        &self,
        value: AnyObject,
        object_type: ObjectType,
        owner: Handle,
        destructor: Option<ErasedDestructor>,
    ) -> Handle {
        let mut table = self.inner.table.lock();

        let handle = loop {
            let candidate = self.inner.next_handle.next();
            if !table.contains_key(&candidate) {
                break candidate;
            }
        };

        let owner = match table.get_mut(&owner) {
            Some(parent) => {
                parent.owned.push(handle);
                owner
            }
            None => {
                if !owner.is_null() {
                    warn!(%handle, %owner, "Owner does not exist, parenting to kernel root");
                }
                Handle::NULL
            }
        };

        table.insert(
            handle,
            Entry {
                value,
                object_type: object_type.clone(),
                owner,
                ref_count: 1,
                owned: Vec::new(),
                destructor,
            },
        );

        debug!(%handle, %object_type, %owner, "Object created");
        handle
    }

    /// Typed lookup. Unknown, destroyed or differently typed handles yield `None`.
    pub fn get_object<T>(&self, handle: Handle) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let value = {
            let table = self.inner.table.lock();
            table.get(&handle).map(|entry| Arc::clone(&entry.value))?
        };
        value.downcast::<T>().ok()
    }

    /// Bump the reference count. The same handle value is returned.
    ///
    /// Returns `None` for unknown handles and for entries already on their
    /// way out (reference count dropped to zero).
    pub fn duplicate_handle(&self, handle: Handle) -> Option<Handle> {
        let mut table = self.inner.table.lock();
        let entry = table.get_mut(&handle)?;
        if entry.ref_count == 0 {
            return None;
        }
        entry.ref_count += 1;
        trace!(%handle, ref_count = entry.ref_count, "Handle duplicated");
        Some(handle)
    }

    /// Drop one reference; destroys the entry when the count reaches zero
    ///
    /// Returns `Ok(false)` for unknown handles.
    pub fn close_handle(&self, handle: Handle) -> ObjectResult<bool> {
        let destroy = {
            let mut table = self.inner.table.lock();
            let Some(entry) = table.get_mut(&handle) else {
                return Ok(false);
            };
            entry.ref_count = entry.ref_count.saturating_sub(1);
            trace!(%handle, ref_count = entry.ref_count, "Handle closed");
            entry.ref_count == 0
        };

        if destroy {
            self.destroy_handle(handle)?;
        }
        Ok(true)
    }

    /// Move a handle under a different owner
    ///
    /// Fails (returns false) for unknown handles, unknown owners, and moves
    /// that would make a handle its own ancestor.
    pub fn set_handle_owner(&self, handle: Handle, new_owner: Handle) -> bool {
        let mut table = self.inner.table.lock();

        let Some(old_owner) = table.get(&handle).map(|entry| entry.owner) else {
            return false;
        };
        if !new_owner.is_null() && !table.contains_key(&new_owner) {
            return false;
        }

        let mut cursor = new_owner;
        while !cursor.is_null() {
            if cursor == handle {
                warn!(%handle, %new_owner, "Refusing ownership cycle");
                return false;
            }
            cursor = match table.get(&cursor) {
                Some(entry) => entry.owner,
                None => break,
            };
        }

        if let Some(parent) = table.get_mut(&old_owner) {
            parent.owned.retain(|h| *h != handle);
        }
        if let Some(parent) = table.get_mut(&new_owner) {
            parent.owned.push(handle);
        }
        if let Some(entry) = table.get_mut(&handle) {
            entry.owner = new_owner;
        }

        debug!(%handle, from = %old_owner, to = %new_owner, "Handle re-parented");
        true
    }

    /// Tear down a handle regardless of its reference count
    ///
    /// Every owned handle is destroyed first (depth first), then the entry is
    /// removed, then its destructor runs. A failing destructor stops the
    /// teardown and its error is returned; entries not reached stay live.
    /// The walk keeps its own stack, so ownership depth is unbounded.
    pub fn destroy_handle(&self, handle: Handle) -> ObjectResult<bool> {
        let mut stack = vec![handle];
        let mut destroyed = false;

        while let Some(&top) = stack.last() {
            let step = {
                let mut table = self.inner.table.lock();
                let first = match table.get(&top) {
                    Some(entry) => entry.owned.first().copied(),
                    None => None,
                };
                match first {
                    Some(child) if table.contains_key(&child) => Step::Descend(child),
                    Some(child) => {
                        // Stale link; drop it so the sweep terminates
                        if let Some(entry) = table.get_mut(&top) {
                            entry.owned.retain(|h| *h != child);
                        }
                        continue;
                    }
                    None if table.contains_key(&top) => Step::Remove,
                    None => Step::Gone,
                }
            };

            match step {
                Step::Descend(child) => stack.push(child),
                Step::Remove => {
                    stack.pop();
                    let removed = self.remove_entry(top)?;
                    if top == handle {
                        destroyed = removed;
                    }
                }
                Step::Gone => {
                    stack.pop();
                }
            }
        }
        Ok(destroyed)
    }

    /// Unlink one childless entry and run its destructor
    fn remove_entry(&self, handle: Handle) -> ObjectResult<bool> {
        let entry = {
            let mut table = self.inner.table.lock();
            let Some(mut entry) = table.remove(&handle) else {
                return Ok(false);
            };
            if let Some(parent) = table.get_mut(&entry.owner) {
                parent.owned.retain(|h| *h != handle);
            }
            // Children attached by another thread after the sweep
            for orphan in entry.owned.drain(..) {
                if let Some(child) = table.get_mut(&orphan) {
                    child.owner = Handle::NULL;
                }
            }
            entry
        };

        debug!(%handle, object_type = %entry.object_type, "Object destroyed");

        if let Some(destructor) = entry.destructor {
            destructor(entry.value).map_err(|e| ObjectError::DestructorFailed {
                handle,
                object_type: entry.object_type.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(true)
    }

    /// Force-destroy every live handle (fatal path)
    ///
    /// Unlike `destroy_handle` this keeps going past failing destructors and
    /// returns every error it met. Entries a failed teardown left behind are
    /// dropped without running their destructors.
    pub fn destroy_all(&self) -> Vec<ObjectError> {
        let mut errors = Vec::new();

        let roots: Vec<Handle> = {
            let table = self.inner.table.lock();
            table
                .iter()
                .filter(|(_, entry)| entry.owner.is_null())
                .map(|(handle, _)| *handle)
                .collect()
        };
        for root in roots {
            if let Err(e) = self.destroy_handle(root) {
                errors.push(e);
            }
        }

        let leftovers: Vec<(Handle, Entry)> = self.inner.table.lock().drain().collect();
        if !leftovers.is_empty() {
            warn!(
                count = leftovers.len(),
                "Dropping handles left behind by failed destructors"
            );
        }
        drop(leftovers);
        errors
    }

    pub fn object_type(&self, handle: Handle) -> Option<ObjectType> {
        let table = self.inner.table.lock();
        table.get(&handle).map(|entry| entry.object_type.clone())
    }

    pub fn owner(&self, handle: Handle) -> Option<Handle> {
        let table = self.inner.table.lock();
        table.get(&handle).map(|entry| entry.owner)
    }

    pub fn ref_count(&self, handle: Handle) -> Option<usize> {
        let table = self.inner.table.lock();
        table.get(&handle).map(|entry| entry.ref_count)
    }

    /// Direct children of `handle`, in insertion order
    pub fn owned_handles(&self, handle: Handle) -> Vec<Handle> {
        let table = self.inner.table.lock();
        table
            .get(&handle)
            .map(|entry| entry.owned.clone())
            .unwrap_or_default()
    }

    pub fn info(&self, handle: Handle) -> Option<HandleInfo> {
        let table = self.inner.table.lock();
        table.get(&handle).map(|entry| HandleInfo {
            handle,
            object_type: entry.object_type.clone(),
            owner: entry.owner,
            ref_count: entry.ref_count,
            owned: entry.owned.clone(),
        })
    }

    /// True if `owner` appears anywhere on the ownership chain of `handle`
    pub fn is_owned_by(&self, handle: Handle, owner: Handle) -> bool {
        let table = self.inner.table.lock();
        let mut cursor = match table.get(&handle) {
            Some(entry) => entry.owner,
            None => return false,
        };
        loop {
            if cursor == owner {
                return true;
            }
            if cursor.is_null() {
                return false;
            }
            cursor = match table.get(&cursor) {
                Some(entry) => entry.owner,
                None => return false,
            };
        }
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.inner.table.lock().contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.inner.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every live handle
    pub fn enum_handles(&self) -> impl Iterator<Item = Handle> {
        let snapshot: Vec<Handle> = self.inner.table.lock().keys().copied().collect();
        snapshot.into_iter()
    }

    /// Snapshot of every live handle of one type
    pub fn enum_handles_by_type(&self, object_type: &ObjectType) -> impl Iterator<Item = Handle> {
        let snapshot: Vec<Handle> = {
            let table = self.inner.table.lock();
            table
                .iter()
                .filter(|(_, entry)| &entry.object_type == object_type)
                .map(|(handle, _)| *handle)
                .collect()
        };
        snapshot.into_iter()
    }

    /// Snapshot of the direct children of `handle` with the given type
    pub fn enum_child_handles_by_type(
        &self,
        handle: Handle,
        object_type: &ObjectType,
    ) -> impl Iterator<Item = Handle> {
        let snapshot: Vec<Handle> = {
            let table = self.inner.table.lock();
            table
                .get(&handle)
                .map(|entry| {
                    entry
                        .owned
                        .iter()
                        .filter(|child| {
                            table
                                .get(child)
                                .is_some_and(|c| &c.object_type == object_type)
                        })
                        .copied()
                        .collect()
                })
                .unwrap_or_default()
        };
        snapshot.into_iter()
    }
}

impl Default for ObjectManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ObjectManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectManager")
            .field("handles", &self.len())
            .finish()
    }
}
