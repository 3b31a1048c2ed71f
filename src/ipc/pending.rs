/*!
 * Pending Replies
 * Correlates replies with outstanding requests by (subsystem, channel)
 */

use super::channel::MessageSender;
use super::types::{IpcError, IpcResult, Message, RequestOutcome};
use crate::core::id::{ChannelGenerator, IdGenerator};
use crate::core::types::{ChannelId, OpCode};
use ahash::RandomState;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, trace};

type ReplyKey = (String, ChannelId);

/// Outstanding requests waiting for their reply
#[derive(Debug)]
pub struct PendingReplies {
    waiters: DashMap<ReplyKey, oneshot::Sender<Message>, RandomState>,
    next_channel: ChannelGenerator,
}

impl PendingReplies {
    pub fn new() -> Self {
        Self {
            waiters: DashMap::with_hasher(RandomState::new()),
            next_channel: ChannelGenerator::default_start(),
        }
    }

    /// Allocate a channel id under `subsystem` and a receiver for its reply
    pub fn register(&self, subsystem: &str) -> (ChannelId, oneshot::Receiver<Message>) {
        let (tx, rx) = oneshot::channel();
        let channel = loop {
            let candidate = self.next_channel.next();
            if let Entry::Vacant(slot) = self.waiters.entry((subsystem.to_string(), candidate)) {
                slot.insert(tx);
                break candidate;
            }
        };
        (channel, rx)
    }

    /// Hand a reply to its waiter
    ///
    /// Returns false when nobody waits for it (unknown channel, timed out or
    /// cancelled); the reply is dropped.
    pub fn resolve(&self, reply: Message) -> bool {
        let Some(channel) = reply.channel else {
            return false;
        };
        let key = (reply.subsystem.clone(), channel);
        match self.waiters.remove(&key) {
            Some((_, waiter)) => {
                trace!(subsystem = %key.0, channel, "Reply matched");
                waiter.send(reply).is_ok()
            }
            None => {
                debug!(subsystem = %key.0, channel, "Dropping reply with no waiter");
                false
            }
        }
    }

    /// Forget a waiter; a later reply on that channel is dropped
    pub fn cancel(&self, subsystem: &str, channel: ChannelId) -> bool {
        self.waiters
            .remove(&(subsystem.to_string(), channel))
            .is_some()
    }

    /// Drop every waiter; their requests fail with `ChannelClosed`
    pub fn fail_all(&self) -> usize {
        let count = self.waiters.len();
        self.waiters.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

impl Default for PendingReplies {
    fn default() -> Self {
        Self::new()
    }
}

/// Request/reply helper over one outbound sender
#[derive(Debug, Clone)]
pub struct Requester {
    sender: MessageSender,
    pending: Arc<PendingReplies>,
}

impl Requester {
    pub fn new(sender: MessageSender, pending: Arc<PendingReplies>) -> Self {
        Self { sender, pending }
    }

    pub fn pending(&self) -> &Arc<PendingReplies> {
        &self.pending
    }

    pub fn sender(&self) -> &MessageSender {
        &self.sender
    }

    /// Fire-and-forget
    pub fn post(&self, message: Message) -> IpcResult<()> {
        self.sender.send(message)
    }

    /// Send a request and wait for its reply (error replies included)
    pub async fn request(&self, subsystem: &str, op: OpCode, data: Value) -> IpcResult<Message> {
        self.request_message(Message::post(subsystem, op, data), None)
            .await
            .and_then(|outcome| outcome.into_reply().ok_or_else(unbounded_timeout))
    }

    /// Send a request raced against `timeout`
    ///
    /// On timeout the request is not retracted; its late reply is dropped.
    pub async fn request_with_timeout(
        &self,
        subsystem: &str,
        op: OpCode,
        data: Value,
        timeout: Duration,
    ) -> IpcResult<RequestOutcome> {
        self.request_message(Message::post(subsystem, op, data), Some(timeout))
            .await
    }

    /// Send a prepared message as a request; its `channel` is assigned here
    pub async fn request_message(
        &self,
        mut message: Message,
        timeout: Option<Duration>,
    ) -> IpcResult<RequestOutcome> {
        let (channel, rx) = self.pending.register(&message.subsystem);
        message.channel = Some(channel);
        let subsystem = message.subsystem.clone();
        self.send_and_wait(message, &subsystem, channel, rx, timeout)
            .await
    }

    /// Send a callback request; its `reply_channel` is assigned here
    pub async fn callback_message(
        &self,
        mut message: Message,
        timeout: Option<Duration>,
    ) -> IpcResult<RequestOutcome> {
        let (channel, rx) = self.pending.register(&message.subsystem);
        message.reply_channel = Some(channel);
        let subsystem = message.subsystem.clone();
        self.send_and_wait(message, &subsystem, channel, rx, timeout)
            .await
    }

    async fn send_and_wait(
        &self,
        message: Message,
        subsystem: &str,
        channel: ChannelId,
        rx: oneshot::Receiver<Message>,
        timeout: Option<Duration>,
    ) -> IpcResult<RequestOutcome> {
        if let Err(e) = self.sender.send(message) {
            self.pending.cancel(subsystem, channel);
            return Err(e);
        }

        let closed = || IpcError::ChannelClosed(format!("{} channel {} abandoned", subsystem, channel));

        match timeout {
            None => rx.await.map(RequestOutcome::Reply).map_err(|_| closed()),
            Some(limit) => {
                let started = Instant::now();
                match tokio::time::timeout(limit, rx).await {
                    Ok(reply) => reply.map(RequestOutcome::Reply).map_err(|_| closed()),
                    Err(_) => {
                        self.pending.cancel(subsystem, channel);
                        debug!(
                            subsystem,
                            channel,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "Request timed out"
                        );
                        Ok(RequestOutcome::TimedOut)
                    }
                }
            }
        }
    }
}

// A request without a limit never reports a timeout
fn unbounded_timeout() -> IpcError {
    IpcError::Timeout {
        elapsed_ms: 0,
        timeout_ms: 0,
    }
}
