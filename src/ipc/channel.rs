/*!
 * Message Channel
 * FIFO transport between the kernel side of a process and its execution context
 */

use super::types::{IpcError, IpcResult, Message};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};

/// Sending half of a port; cheap to clone
#[derive(Debug, Clone)]
pub struct MessageSender {
    tx: UnboundedSender<Message>,
}

impl MessageSender {
    /// Enqueue a message for the peer. Fails only once the peer port is gone.
    pub fn send(&self, message: Message) -> IpcResult<()> {
        self.tx
            .send(message)
            .map_err(|e| IpcError::ChannelClosed(format!("{} op {:#x}", e.0.subsystem, e.0.op)))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Sender that does not keep the receiving port open
    pub fn downgrade(&self) -> WeakMessageSender {
        WeakMessageSender {
            tx: self.tx.downgrade(),
        }
    }
}

/// Non-owning sender; sending fails once every strong sender is gone
#[derive(Debug, Clone)]
pub struct WeakMessageSender {
    tx: WeakUnboundedSender<Message>,
}

impl WeakMessageSender {
    pub fn send(&self, message: Message) -> IpcResult<()> {
        match self.tx.upgrade() {
            Some(tx) => MessageSender { tx }.send(message),
            None => Err(IpcError::ChannelClosed(format!(
                "{} op {:#x}: port released",
                message.subsystem, message.op
            ))),
        }
    }
}

/// One end of a bidirectional channel
///
/// Messages sent from this end arrive, in order, at the peer's `recv`.
#[derive(Debug)]
pub struct MessagePort {
    sender: MessageSender,
    receiver: UnboundedReceiver<Message>,
}

impl MessagePort {
    /// Create two connected ports
    pub fn pair() -> (MessagePort, MessagePort) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            MessagePort {
                sender: MessageSender { tx: a_tx },
                receiver: b_rx,
            },
            MessagePort {
                sender: MessageSender { tx: b_tx },
                receiver: a_rx,
            },
        )
    }

    /// Sender feeding the peer
    pub fn sender(&self) -> MessageSender {
        self.sender.clone()
    }

    pub fn send(&self, message: Message) -> IpcResult<()> {
        self.sender.send(message)
    }

    /// Next inbound message; `None` once every peer sender is dropped
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    /// Non-blocking receive
    pub fn try_recv(&mut self) -> Option<Message> {
        self.receiver.try_recv().ok()
    }

    pub fn split(self) -> (MessageSender, UnboundedReceiver<Message>) {
        (self.sender, self.receiver)
    }
}
