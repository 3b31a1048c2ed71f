/*!
 * Dispatch Loop
 * Routes a process's inbound messages to exports or pending callbacks
 *
 * Handlers are polled on the loop's own task, started in arrival order, so a
 * process's messages are served FIFO. The loop keeps reading while handlers
 * are pending, so a handler can await a callback reply that arrives on this
 * same inbound queue.
 */

use super::context::ProcessContext;
use super::process::Process;
use super::types::{ExitStatus, ProcessState};
use crate::core::errors::SerializableError;
use crate::ipc::Message;
use crate::kernel::Kernel;
use crate::monitoring::DispatchSpan;
use crate::subsystem::{ntdll, SubsystemError, SubsystemId, SubsystemState};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

type Handlers = FuturesUnordered<BoxFuture<'static, ()>>;

enum Flow {
    Continue,
    Quit(ExitStatus),
    Crash(ExitStatus),
}

/// Serve `process` until it quits, crashes or its context goes away, then
/// tear it down through the object manager
pub(crate) async fn run_dispatch_loop(
    kernel: Kernel,
    process: Arc<Process>,
    mut inbound: UnboundedReceiver<Message>,
) {
    let mut handlers = Handlers::new();
    let mut quitting: Option<ExitStatus> = None;
    let mut deadline: Option<Instant> = None;
    let grace = kernel.config().request_timeout;

    let status = loop {
        if let Some(status) = &quitting {
            if handlers.is_empty() {
                break status.clone();
            }
        }

        tokio::select! {
            message = inbound.recv() => match message {
                Some(message) => match route(&kernel, &process, message, &mut handlers) {
                    Flow::Continue => {}
                    Flow::Quit(status) => {
                        if quitting.is_none() {
                            debug!(pid = process.id(), in_flight = handlers.len(), "Draining before exit");
                            process.set_state(ProcessState::Exiting);
                            deadline = Some(Instant::now() + grace);
                            quitting = Some(status);
                        }
                    }
                    Flow::Crash(status) => break status,
                },
                None => {
                    break quitting
                        .take()
                        .unwrap_or_else(|| ExitStatus::crashed("execution context closed its channel"))
                }
            },
            Some(()) = handlers.next(), if !handlers.is_empty() => {}
            _ = until(deadline) => {
                warn!(pid = process.id(), in_flight = handlers.len(), "Handlers did not drain before exit");
                break quitting.take().unwrap_or_else(|| ExitStatus::quit(0));
            }
        }
    };

    info!(pid = process.id(), code = status.code, reason = ?status.reason, "Dispatch loop finished");
    process.record_exit(status);
    if let Err(e) = kernel.objects().destroy_handle(process.handle()) {
        error!(pid = process.id(), error = %e, "Process teardown failed");
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn route(kernel: &Kernel, process: &Arc<Process>, message: Message, handlers: &mut Handlers) -> Flow {
    // Replies to callbacks this kernel sent into the context
    if message.is_callback() {
        if !process.requester().pending().resolve(message) {
            kernel.metrics().reply_dropped();
        }
        return Flow::Continue;
    }

    if message.subsystem.eq_ignore_ascii_case(SubsystemId::Ntdll.as_str()) {
        match message.op {
            ntdll::ops::QUIT => {
                let code = message.data.get("code").and_then(Value::as_i64).unwrap_or(0);
                return Flow::Quit(ExitStatus::quit(code as i32));
            }
            ntdll::ops::CRASH => {
                let reason = message
                    .data
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unhandled failure in execution context");
                warn!(pid = process.id(), reason, "Execution context crashed");
                return Flow::Crash(ExitStatus::crashed(reason));
            }
            _ => {}
        }
    }

    if message.is_error() {
        warn!(pid = process.id(), subsystem = %message.subsystem, op = message.base_op(), "Unsolicited error reply dropped");
        kernel.metrics().reply_dropped();
        return Flow::Continue;
    }

    kernel.metrics().message_dispatched();
    let ctx = ProcessContext::new(kernel.clone(), Arc::clone(process), message.channel);
    let loaded = SubsystemId::parse(&message.subsystem)
        .and_then(|id| ctx.load_subsystem(id, None, Value::Null));

    match loaded {
        Ok(loaded) => {
            handlers.push(serve(ctx, loaded.state, message).boxed());
        }
        Err(err) => {
            debug!(pid = process.id(), subsystem = %message.subsystem, error = %err, "Message not routable");
            respond_error(kernel, process, &message, &err);
        }
    }
    Flow::Continue
}

async fn serve(ctx: ProcessContext, state: Arc<SubsystemState>, mut message: Message) {
    let span = DispatchSpan::new(ctx.process_id(), &message.subsystem, message.op, message.channel);
    let payload = std::mem::take(&mut message.data);

    let result = AssertUnwindSafe(state.subsystem().call(ctx.clone(), message.op, payload))
        .catch_unwind()
        .instrument(span.span().clone())
        .await
        .unwrap_or_else(|_| Err(SubsystemError::Failed("handler panicked".into())));

    match result {
        Ok(value) => {
            span.record_success();
            if message.expects_reply() {
                let mut reply = message.reply(value);
                reply.transfer = ctx.take_transfers();
                if let Err(e) = ctx.process().requester().post(reply) {
                    debug!(pid = ctx.process_id(), error = %e, "Reply undeliverable");
                }
            }
        }
        Err(err) => {
            span.record_error(err.kind());
            respond_error(ctx.kernel(), ctx.process(), &message, &err);
        }
    }
}

fn respond_error(kernel: &Kernel, process: &Process, message: &Message, err: &SubsystemError) {
    if !message.expects_reply() {
        warn!(
            pid = process.id(),
            subsystem = %message.subsystem,
            op = message.op,
            error = %err,
            "Post failed"
        );
        return;
    }
    kernel.metrics().error_reply();
    let reply = message.error_reply(SerializableError::from(err));
    if let Err(e) = process.requester().post(reply) {
        debug!(pid = process.id(), error = %e, "Error reply undeliverable");
    }
}
