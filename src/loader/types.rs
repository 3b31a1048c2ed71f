/*!
 * Loader Types
 * Module metadata, loaded-module records and loader errors
 */

use crate::core::serde::{is_empty_vec, is_none};
use crate::core::types::Handle;
use bytes::Bytes;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Loader result
pub type LoaderResult<T> = Result<T, LoaderError>;

/// Storage and image errors met while resolving a module
///
/// These never escape `load_library`, which reports not-found instead; they
/// are logged with the candidate that produced them.
#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum LoaderError {
    #[error("Not found: {0}")]
    #[diagnostic(code(loader::not_found))]
    NotFound(String),

    #[error("I/O error: {0}")]
    #[diagnostic(code(loader::io))]
    Io(String),

    #[error("Module too large: {size} bytes (limit {limit})")]
    #[diagnostic(code(loader::too_large))]
    TooLarge { size: u64, limit: u64 },

    #[error("Bad module magic")]
    #[diagnostic(
        code(loader::bad_magic),
        help("Module images start with the 4-byte signature MZJS.")
    )]
    BadMagic,

    #[error("Truncated module image: {0}")]
    #[diagnostic(code(loader::truncated))]
    Truncated(String),

    #[error("Invalid module header: {0}")]
    #[diagnostic(code(loader::header))]
    InvalidHeader(String),

    #[error("Dependency '{dependency}' of '{module}' could not be loaded")]
    #[diagnostic(code(loader::dependency))]
    Dependency { module: String, dependency: String },
}

impl From<std::io::Error> for LoaderError {
    fn from(err: std::io::Error) -> Self {
        LoaderError::Io(err.to_string())
    }
}

/// Executable or library
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    Exe,
    #[default]
    Dll,
}

/// Subsystem the image targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageSubsystem {
    #[default]
    Console,
    Gui,
    Native,
}

/// Metadata header of a module image
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleDescriptor {
    #[serde(skip_serializing_if = "is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "is_none")]
    pub version: Option<String>,
    pub kind: ModuleKind,
    pub subsystem: ImageSubsystem,
    #[serde(skip_serializing_if = "is_none")]
    pub architecture: Option<String>,
    /// Program name the execution host starts for executables
    #[serde(skip_serializing_if = "is_none")]
    pub entry_point: Option<String>,
    /// Libraries loaded (into the same process) before this one
    #[serde(skip_serializing_if = "is_empty_vec")]
    pub dependencies: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<String, String>,
}

impl ModuleDescriptor {
    pub fn executable(entry_point: impl Into<String>) -> Self {
        Self {
            kind: ModuleKind::Exe,
            entry_point: Some(entry_point.into()),
            ..Default::default()
        }
    }

    pub fn library() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_subsystem(mut self, subsystem: ImageSubsystem) -> Self {
        self.subsystem = subsystem;
        self
    }

    pub fn with_dependency(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(name.into());
        self
    }
}

/// A module resident in the global cache
#[derive(Debug)]
pub struct LoadedModule {
    /// Normalized lowercase file name (the cache key)
    pub name: String,
    /// Storage path it was read from
    pub path: String,
    pub descriptor: ModuleDescriptor,
    /// Blob url the body is published under
    pub entry_url: String,
    pub bytes: Bytes,
}

/// What a load returns to the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub handle: Handle,
    pub name: String,
    pub path: String,
    pub descriptor: ModuleDescriptor,
    pub entry_url: String,
    pub size: usize,
    #[serde(skip)]
    pub module: Option<Arc<LoadedModule>>,
}

impl ModuleInfo {
    pub(crate) fn new(handle: Handle, module: Arc<LoadedModule>) -> Self {
        Self {
            handle,
            name: module.name.clone(),
            path: module.path.clone(),
            descriptor: module.descriptor.clone(),
            entry_url: module.entry_url.clone(),
            size: module.bytes.len(),
            module: Some(module),
        }
    }
}
