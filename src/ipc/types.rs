/*!
 * IPC Types
 * Wire message shape and IPC errors
 */

use super::shm::SharedSegment;
use crate::core::errors::SerializableError;
use crate::core::limits::{CALLBACK_OP, ERROR_REPLY_BIT};
use crate::core::types::{ChannelId, Handle, OpCode};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// IPC operation result
pub type IpcResult<T> = Result<T, IpcError>;

/// Subsystem name callbacks travel under
pub const CALLBACK_SUBSYSTEM: &str = "ntdll";

/// Unified IPC error type with miette diagnostics
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Diagnostic)]
#[serde(rename_all = "snake_case", tag = "error", content = "details")]
pub enum IpcError {
    /// The other end of the channel is gone
    #[error("IPC channel closed: {0}")]
    #[diagnostic(
        code(ipc::closed),
        help("The peer execution context has exited or was torn down.")
    )]
    ChannelClosed(String),

    /// No reply within the allotted time
    #[error("IPC request timed out after {elapsed_ms}ms (timeout: {timeout_ms}ms)")]
    #[diagnostic(
        code(ipc::timeout),
        help("The request is still in flight; a late reply will be dropped.")
    )]
    Timeout { elapsed_ms: u64, timeout_ms: u64 },

    /// The peer answered with an error reply
    #[error("Remote error: {0}")]
    #[diagnostic(code(ipc::remote))]
    Remote(SerializableError),

    /// Payload did not have the expected shape
    #[error("Invalid IPC payload: {0}")]
    #[diagnostic(
        code(ipc::invalid_payload),
        help("Check the message data against the operation's expected payload.")
    )]
    InvalidPayload(String),
}

impl From<serde_json::Error> for IpcError {
    fn from(err: serde_json::Error) -> Self {
        IpcError::InvalidPayload(err.to_string())
    }
}

/// One IPC message
///
/// A request carries `channel` and expects exactly one reply tagged with the
/// same channel. A post carries no channel. A callback request uses the
/// reserved `CALLBACK_OP` type, names the callback in `channel` and expects
/// its reply on `reply_channel`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub subsystem: String,
    #[serde(rename = "type")]
    pub op: OpCode,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub channel: Option<ChannelId>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reply_channel: Option<ChannelId>,
    #[serde(default)]
    pub data: Value,
    /// Shared segments handed over with the message (never serialized)
    #[serde(skip)]
    pub transfer: Vec<SharedSegment>,
}

impl Message {
    /// Fire-and-forget message
    pub fn post(subsystem: impl Into<String>, op: OpCode, data: Value) -> Self {
        Self {
            subsystem: subsystem.into(),
            op,
            channel: None,
            reply_channel: None,
            data,
            transfer: Vec::new(),
        }
    }

    /// Message expecting one reply on `channel`
    pub fn request(subsystem: impl Into<String>, op: OpCode, channel: ChannelId, data: Value) -> Self {
        Self {
            channel: Some(channel),
            ..Self::post(subsystem, op, data)
        }
    }

    /// Kernel -> user-mode invocation of a registered callback
    pub fn callback(callback: Handle, reply_channel: ChannelId, args: Vec<Value>) -> Self {
        Self {
            channel: Some(callback.raw() as ChannelId),
            reply_channel: Some(reply_channel),
            ..Self::post(CALLBACK_SUBSYSTEM, CALLBACK_OP, Value::Array(args))
        }
    }

    /// Successful reply to this request
    pub fn reply(&self, data: Value) -> Self {
        Self {
            subsystem: self.subsystem.clone(),
            op: self.base_op(),
            channel: self.reply_target(),
            reply_channel: None,
            data,
            transfer: Vec::new(),
        }
    }

    /// Error reply to this request (`type | 0x80000000`)
    pub fn error_reply(&self, error: SerializableError) -> Self {
        let data = serde_json::to_value(&error).unwrap_or(Value::Null);
        Self {
            op: self.base_op() | ERROR_REPLY_BIT,
            ..self.reply(data)
        }
    }

    pub fn with_transfer(mut self, segment: SharedSegment) -> Self {
        self.transfer.push(segment);
        self
    }

    /// Operation type without the error bit
    #[inline]
    pub fn base_op(&self) -> OpCode {
        self.op & !ERROR_REPLY_BIT
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.op & ERROR_REPLY_BIT != 0
    }

    #[inline]
    pub fn is_callback(&self) -> bool {
        self.base_op() == CALLBACK_OP
    }

    /// Callback handle named by a callback request
    pub fn callback_handle(&self) -> Option<Handle> {
        if self.is_callback() {
            self.channel.map(|c| Handle(c as i32))
        } else {
            None
        }
    }

    /// Channel the reply to this message must carry
    pub fn reply_target(&self) -> Option<ChannelId> {
        if self.is_callback() {
            self.reply_channel
        } else {
            self.channel
        }
    }

    /// True if a reply is owed for this message
    pub fn expects_reply(&self) -> bool {
        self.reply_target().is_some()
    }

    /// Unwrap a reply into its payload, mapping error replies to `IpcError::Remote`
    pub fn into_result(self) -> IpcResult<Value> {
        if self.is_error() {
            let remote = serde_json::from_value::<SerializableError>(self.data.clone())
                .unwrap_or_else(|_| SerializableError::new("remote_error", self.data.to_string()));
            Err(IpcError::Remote(remote))
        } else {
            Ok(self.data)
        }
    }
}

/// Result of a request raced against a timer
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    Reply(Message),
    TimedOut,
}

impl RequestOutcome {
    pub fn is_timed_out(&self) -> bool {
        matches!(self, RequestOutcome::TimedOut)
    }

    pub fn into_reply(self) -> Option<Message> {
        match self {
            RequestOutcome::Reply(message) => Some(message),
            RequestOutcome::TimedOut => None,
        }
    }
}
