/*!
 * Dispatch Tests
 * Wire-level request/reply, error replies, correlation and timeouts
 */

use crate::common::*;
use ntweb_kernel::ipc::RequestOutcome;
use ntweb_kernel::subsystem::ntdll;
use ntweb_kernel::{
    CreateProcessInfo, ExportTable, ExternalHost, Handle, Kernel, Message, ObjectType, SubsystemError, SubsystemId,
    UserContext,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const GET_ID: u32 = 1;
const ECHO_AFTER: u32 = 2;
const SET_LAST_ERROR: u32 = 3;

fn kernel32() -> ExportTable {
    ExportTable::new(SubsystemId::Kernel32)
        .export_sync(GET_ID, |_ctx, _payload| Ok(json!({ "id": 42 })))
        .export(ECHO_AFTER, |_ctx, payload: Value| async move {
            let delay = payload.get("delay").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(payload.get("tag").cloned().unwrap_or(Value::Null))
        })
        .export_sync(SET_LAST_ERROR, |ctx, payload| {
            let code = payload.as_u64().ok_or_else(|| SubsystemError::InvalidPayload("code".into()))?;
            Ok(json!(ctx.set_last_error(code as u32)))
        })
}

fn external_kernel() -> (Kernel, ExternalHost) {
    let host = ExternalHost::new();
    let kernel = Kernel::builder()
        .with_storage(storage_with_app())
        .with_host(host.clone())
        .with_subsystem(kernel32())
        .build();
    (kernel, host)
}

#[tokio::test]
async fn test_raw_request_gets_matching_reply() {
    let (kernel, host) = external_kernel();
    let process = kernel.create_process(CreateProcessInfo::new("app.exe")).unwrap();
    let mut port = host.take_port(process.id()).unwrap();

    let create = expect_create(&mut port).await;
    assert_eq!(create.data["pid"], json!(process.id()));
    assert_eq!(create.transfer.len(), 1);

    port.send(Message::request("kernel32", GET_ID, 7, Value::Null)).unwrap();
    let reply = recv(&mut port).await;
    assert_eq!(
        serde_json::to_value(&reply).unwrap(),
        json!({ "subsystem": "kernel32", "type": 1, "channel": 7, "data": { "id": 42 } })
    );
    assert_eq!(process.loaded_subsystems(), vec![SubsystemId::Ntdll, SubsystemId::Kernel32]);
}

#[tokio::test]
async fn test_unknown_operation_gets_error_reply() {
    let (kernel, host) = external_kernel();
    let process = kernel.create_process(CreateProcessInfo::new("app.exe")).unwrap();
    let mut port = host.take_port(process.id()).unwrap();
    expect_create(&mut port).await;

    port.send(Message::request("kernel32", 99, 3, Value::Null)).unwrap();
    let reply = recv(&mut port).await;
    assert_eq!(reply.op, 99 | 0x8000_0000);
    assert_eq!(reply.channel, Some(3));
    assert_eq!(reply.data["error_type"], json!("unknown_operation"));

    // The loop survives the protocol violation
    port.send(Message::request("kernel32", GET_ID, 4, Value::Null)).unwrap();
    assert_eq!(recv(&mut port).await.data, json!({ "id": 42 }));
    assert_eq!(kernel.metrics().snapshot().error_replies, 1);
}

#[tokio::test]
async fn test_unroutable_subsystems_get_error_replies() {
    let (kernel, host) = external_kernel();
    let process = kernel.create_process(CreateProcessInfo::new("app.exe")).unwrap();
    let mut port = host.take_port(process.id()).unwrap();
    expect_create(&mut port).await;

    port.send(Message::request("win32k", 1, 10, Value::Null)).unwrap();
    let reply = recv(&mut port).await;
    assert!(reply.is_error());
    assert_eq!(reply.data["error_type"], json!("not_allowed"));

    port.send(Message::request("user32", 1, 11, Value::Null)).unwrap();
    let reply = recv(&mut port).await;
    assert_eq!(reply.channel, Some(11));
    assert_eq!(reply.data["error_type"], json!("not_registered"));
}

#[tokio::test]
async fn test_closing_foreign_handle_is_denied() {
    let (kernel, host) = external_kernel();
    let owner = kernel.create_process(CreateProcessInfo::new("app.exe")).unwrap();
    let intruder = kernel.create_process(CreateProcessInfo::new("app.exe")).unwrap();
    let file = kernel
        .objects()
        .set_object(String::from("secret"), ObjectType::FILE, owner.handle());

    let mut port = host.take_port(intruder.id()).unwrap();
    expect_create(&mut port).await;

    port.send(Message::request("ntdll", ntdll::ops::CLOSE_HANDLE, 5, json!({ "handle": file })))
        .unwrap();
    let reply = recv(&mut port).await;
    assert_eq!(reply.data["error_type"], json!("access_denied"));
    assert!(kernel.objects().contains(file));

    port.send(Message::request("ntdll", ntdll::ops::CLOSE_HANDLE, 6, json!({ "handle": Handle(98765) })))
        .unwrap();
    assert_eq!(recv(&mut port).await.data["error_type"], json!("invalid_handle"));
}

#[tokio::test]
async fn test_concurrent_replies_resolve_their_own_callers() {
    let (results_tx, mut results) = mpsc::unbounded_channel();
    let kernel = Kernel::builder()
        .with_storage(storage_with_app())
        .with_subsystem(kernel32())
        .with_program("app", move |ctx: UserContext| {
            let results_tx = results_tx.clone();
            async move {
                // A is slow, B is fast: B's reply arrives first
                let a = ctx.call(SubsystemId::Kernel32, ECHO_AFTER, json!({ "delay": 80, "tag": "A" }));
                let b = ctx.call(SubsystemId::Kernel32, ECHO_AFTER, json!({ "delay": 5, "tag": "B" }));
                let (a, b) = tokio::join!(a, b);
                results_tx.send((a?, b?))?;
                anyhow::Ok(0)
            }
        })
        .build();

    let process = kernel.create_process(CreateProcessInfo::new("app.exe")).unwrap();
    let (a, b) = results.recv().await.unwrap();
    assert_eq!(a, json!("A"));
    assert_eq!(b, json!("B"));
    assert_eq!(wait_exit(&process).await.code, 0);
}

#[tokio::test]
async fn test_timeout_then_late_reply_is_dropped() {
    let (results_tx, mut results) = mpsc::unbounded_channel();
    let kernel = Kernel::builder()
        .with_storage(storage_with_app())
        .with_subsystem(kernel32())
        .with_program("app", move |ctx: UserContext| {
            let results_tx = results_tx.clone();
            async move {
                let outcome = ctx
                    .call_with_timeout(
                        SubsystemId::Kernel32,
                        ECHO_AFTER,
                        json!({ "delay": 100, "tag": "late" }),
                        Duration::from_millis(50),
                    )
                    .await?;
                // Let the late reply arrive, then make sure the channel still works
                tokio::time::sleep(Duration::from_millis(120)).await;
                let next = ctx.call(SubsystemId::Kernel32, GET_ID, Value::Null).await?;
                results_tx.send((outcome, next))?;
                anyhow::Ok(0)
            }
        })
        .build();

    let process = kernel.create_process(CreateProcessInfo::new("app.exe")).unwrap();
    let (outcome, next) = results.recv().await.unwrap();
    assert_eq!(outcome, RequestOutcome::TimedOut);
    assert_eq!(next, json!({ "id": 42 }));
    assert_eq!(wait_exit(&process).await.code, 0);
}

#[tokio::test]
async fn test_last_error_slot_is_shared() {
    let (results_tx, mut results) = mpsc::unbounded_channel();
    let kernel = Kernel::builder()
        .with_storage(storage_with_app())
        .with_subsystem(kernel32())
        .with_program("app", move |ctx: UserContext| {
            let results_tx = results_tx.clone();
            async move {
                let segment = ctx.load_subsystem(SubsystemId::Kernel32).await?;
                ctx.call(SubsystemId::Kernel32, SET_LAST_ERROR, json!(5)).await?;
                results_tx.send((segment.is_some(), ctx.last_error()))?;
                anyhow::Ok(0)
            }
        })
        .build();

    let process = kernel.create_process(CreateProcessInfo::new("app.exe")).unwrap();
    let (has_segment, last_error) = results.recv().await.unwrap();
    assert!(has_segment);
    assert_eq!(last_error, Some(5));
    wait_exit(&process).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_posts_are_handled_in_arrival_order() {
    const RECORD: u32 = 1;
    const COUNT: u64 = 2000;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    let host = ExternalHost::new();
    let kernel = Kernel::builder()
        .with_storage(storage_with_app())
        .with_host(host.clone())
        .with_subsystem(ExportTable::new(SubsystemId::Kernel32).export_sync(RECORD, move |_ctx, payload| {
            recorder.lock().push(payload.as_u64().unwrap_or(u64::MAX));
            Ok(Value::Null)
        }))
        .build();

    let process = kernel.create_process(CreateProcessInfo::new("app.exe")).unwrap();
    let mut port = host.take_port(process.id()).unwrap();
    expect_create(&mut port).await;

    for n in 0..COUNT {
        port.send(Message::post("kernel32", RECORD, json!(n))).unwrap();
    }
    // Answered only after every earlier post has been handled
    port.send(Message::request("kernel32", RECORD, 1, json!(COUNT))).unwrap();
    assert_eq!(recv(&mut port).await.channel, Some(1));

    let seen = seen.lock().clone();
    assert_eq!(seen, (0..=COUNT).collect::<Vec<_>>());
}
