/*!
 * Object Types
 * Type tags, handle snapshots and errors for the object manager
 */

use crate::core::types::Handle;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;

/// Object manager operation result
pub type ObjectResult<T> = Result<T, ObjectError>;

/// Type tag attached to every table entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectType(Cow<'static, str>);

impl ObjectType {
    /// Process objects (the process handle itself)
    pub const PROCESS: ObjectType = ObjectType(Cow::Borrowed("PROC"));
    /// Loaded modules
    pub const MODULE: ObjectType = ObjectType(Cow::Borrowed("MODULE"));
    /// Per-process subsystem instances
    pub const SUBSYSTEM: ObjectType = ObjectType(Cow::Borrowed("SUBSYSTEM"));
    /// Registered user-mode callbacks
    pub const CALLBACK: ObjectType = ObjectType(Cow::Borrowed("CALLBACK"));
    /// Open files (produced by the filesystem subsystem)
    pub const FILE: ObjectType = ObjectType(Cow::Borrowed("FILE"));

    pub fn new(tag: impl Into<Cow<'static, str>>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&'static str> for ObjectType {
    fn from(tag: &'static str) -> Self {
        Self(Cow::Borrowed(tag))
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Point-in-time view of one table entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct HandleInfo {
    pub handle: Handle,
    pub object_type: ObjectType,
    pub owner: Handle,
    pub ref_count: usize,
    #[serde(skip_serializing_if = "crate::core::serde::is_empty_vec", default)]
    pub owned: Vec<Handle>,
}

/// Object manager errors
///
/// Lookups never fail: unknown handles are reported through `Option`/`bool`.
/// The only error is a destructor refusing to run, which aborts the teardown
/// it happened in.
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Diagnostic)]
#[serde(rename_all = "snake_case", tag = "error", content = "details")]
pub enum ObjectError {
    #[error("Destructor for {object_type} handle {handle} failed: {reason}")]
    #[diagnostic(
        code(object::destructor_failed),
        help("Teardown stopped at this handle; its remaining subtree is still live.")
    )]
    DestructorFailed {
        handle: Handle,
        object_type: ObjectType,
        reason: String,
    },
}
