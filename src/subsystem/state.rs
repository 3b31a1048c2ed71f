/*!
 * Subsystem State
 * One loaded subsystem instance inside one process
 */

use super::registry::Subsystem;
use super::types::SubsystemId;
use crate::core::types::{Handle, ProcessId};
use crate::ipc::shm::SharedSegment;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Per-process instance of a subsystem
///
/// Lives in the object table as a `SUBSYSTEM` entry owned by its process.
pub struct SubsystemState {
    id: SubsystemId,
    process: ProcessId,
    segment: Option<SharedSegment>,
    subsystem: Arc<dyn Subsystem>,
    params: Value,
}

impl SubsystemState {
    pub fn new(
        process: ProcessId,
        subsystem: Arc<dyn Subsystem>,
        segment: Option<SharedSegment>,
        params: Value,
    ) -> Self {
        Self {
            id: subsystem.id(),
            process,
            segment,
            subsystem,
            params,
        }
    }

    pub fn id(&self) -> SubsystemId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.id.as_str()
    }

    pub fn process(&self) -> ProcessId {
        self.process
    }

    pub fn segment(&self) -> Option<&SharedSegment> {
        self.segment.as_ref()
    }

    pub fn subsystem(&self) -> &Arc<dyn Subsystem> {
        &self.subsystem
    }

    pub fn params(&self) -> &Value {
        &self.params
    }

    pub fn summary(&self, handle: Handle) -> SubsystemSummary {
        SubsystemSummary {
            name: self.id,
            handle,
            slots: self.segment.as_ref().map_or(0, SharedSegment::len),
        }
    }
}

impl fmt::Debug for SubsystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubsystemState")
            .field("id", &self.id)
            .field("process", &self.process)
            .field("segment", &self.segment)
            .field("params", &self.params)
            .finish()
    }
}

/// Reply payload describing a loaded instance
#[derive(Debug, Clone, Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct SubsystemSummary {
    pub name: SubsystemId,
    pub handle: Handle,
    pub slots: usize,
}
