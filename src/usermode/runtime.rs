/*!
 * User Runtime
 * Drives one execution context: waits for startup, runs the program,
 * services callbacks and replies, reports how the program ended
 */

use super::context::UserContext;
use super::program::UserProgram;
use crate::ipc::{Message, MessagePort, PendingReplies, Requester};
use crate::process::StartupInfo;
use crate::subsystem::ntdll::ops;
use crate::subsystem::SubsystemId;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

pub struct UserRuntime {
    port: MessagePort,
    program: Arc<dyn UserProgram>,
    request_timeout: Duration,
}

/// Aborts the program task when the runtime itself is dropped or aborted
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn crash(reason: impl Into<String>) -> Message {
    Message::post(
        SubsystemId::Ntdll.as_str(),
        ops::CRASH,
        json!({ "message": reason.into() }),
    )
}

impl UserRuntime {
    pub fn new(port: MessagePort, program: Arc<dyn UserProgram>, request_timeout: Duration) -> Self {
        Self {
            port,
            program,
            request_timeout,
        }
    }

    pub async fn run(self) {
        let (sender, mut inbound) = self.port.split();
        let requester = Requester::new(sender, Arc::new(PendingReplies::new()));

        let create = loop {
            match inbound.recv().await {
                Some(message) if message.op == ops::CREATE && message.subsystem == SubsystemId::Ntdll.as_str() => {
                    break message;
                }
                Some(message) => {
                    debug!(subsystem = %message.subsystem, op = message.op, "Message before startup ignored");
                }
                None => return,
            }
        };

        let segment = create.transfer.first().cloned();
        let startup: StartupInfo = match serde_json::from_value(create.data) {
            Ok(startup) => startup,
            Err(e) => {
                warn!(error = %e, "Malformed startup info");
                if let Err(e) = requester.post(crash(format!("malformed startup info: {}", e))) {
                    debug!(error = %e, "Crash notification undeliverable");
                }
                return;
            }
        };

        let pid = startup.pid;
        let ctx = UserContext::new(requester, startup, segment, self.request_timeout);
        let mut main = tokio::spawn(self.program.main(ctx.clone()));
        let _guard = AbortOnDrop(main.abort_handle());
        info!(pid, "Execution context started");

        loop {
            tokio::select! {
                message = inbound.recv() => match message {
                    Some(message) => ctx.handle_inbound(message),
                    None => {
                        debug!(pid, "Kernel side closed the channel");
                        return;
                    }
                },
                joined = &mut main => {
                    let exit = match joined {
                        Ok(Ok(code)) => Message::post(SubsystemId::Ntdll.as_str(), ops::QUIT, json!({ "code": code })),
                        Ok(Err(e)) => crash(format!("{:#}", e)),
                        Err(e) if e.is_panic() => crash("user program panicked"),
                        Err(_) => return,
                    };
                    if let Err(e) = ctx.requester().post(exit) {
                        debug!(pid, error = %e, "Exit notification undeliverable");
                    }
                    return;
                }
            }
        }
    }
}
