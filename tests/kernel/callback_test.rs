/*!
 * Callback Tests
 * Local short-circuit, kernel-initiated and cross-process invocation
 */

use crate::common::*;
use ntweb_kernel::{CreateProcessInfo, Handle, Kernel, ObjectType, UserContext};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

async fn double(_ctx: UserContext, args: Vec<Value>) -> anyhow::Result<Value> {
    let n = args.first().and_then(Value::as_i64).unwrap_or(0);
    Ok(json!(n * 2))
}

#[tokio::test]
async fn test_local_and_kernel_invocation() {
    let (handle_tx, mut handles) = mpsc::unbounded_channel();
    let release = Arc::new(Notify::new());
    let done = Arc::clone(&release);

    let kernel = Kernel::builder()
        .with_storage(storage_with_app())
        .with_program("app", move |ctx: UserContext| {
            let handle_tx = handle_tx.clone();
            let done = Arc::clone(&done);
            async move {
                let handle = ctx.register_callback(double).await?;
                let local = ctx.invoke_callback(handle, vec![json!(4)]).await?;
                handle_tx.send((handle, local))?;
                done.notified().await;
                anyhow::Ok(0)
            }
        })
        .build();

    let process = kernel.create_process(CreateProcessInfo::new("app.exe")).unwrap();
    let (handle, local) = handles.recv().await.unwrap();
    assert_eq!(local, json!(8));
    assert_eq!(kernel.objects().object_type(handle), Some(ObjectType::CALLBACK));
    assert_eq!(kernel.callbacks().owner(handle), Some(process.id()));

    let remote = kernel.callbacks().invoke(handle, vec![json!(20)]).await.unwrap();
    assert_eq!(remote, json!(40));
    assert_eq!(kernel.metrics().snapshot().callbacks_invoked, 1);

    release.notify_one();
    wait_exit(&process).await;
    assert_eq!(kernel.callbacks().owner(handle), None);
    assert_eq!(kernel.callbacks().invoke(handle, vec![]).await.unwrap(), Value::Null);
}

#[tokio::test]
async fn test_callback_closed_by_kernel_stops_running_locally() {
    let (handle_tx, mut handles) = mpsc::unbounded_channel();
    let (result_tx, mut results) = mpsc::unbounded_channel();
    let closed = Arc::new(Notify::new());
    let resume = Arc::clone(&closed);

    let kernel = Kernel::builder()
        .with_storage(storage_with_app())
        .with_program("app", move |ctx: UserContext| {
            let handle_tx = handle_tx.clone();
            let result_tx = result_tx.clone();
            let resume = Arc::clone(&resume);
            async move {
                let handle = ctx.register_callback(double).await?;
                handle_tx.send(handle)?;
                resume.notified().await;
                // Any reply comes after the close notice on the channel
                ctx.process_info(None).await?;
                result_tx.send(ctx.invoke_callback(handle, vec![json!(4)]).await?)?;
                anyhow::Ok(0)
            }
        })
        .build();

    let process = kernel.create_process(CreateProcessInfo::new("app.exe")).unwrap();
    let handle = handles.recv().await.unwrap();
    assert_eq!(kernel.objects().close_handle(handle).unwrap(), true);
    closed.notify_one();

    assert_eq!(results.recv().await.unwrap(), Value::Null);
    assert_eq!(wait_exit(&process).await.code, 0);
}

#[tokio::test]
async fn test_cross_process_invocation() {
    let storage = storage_with_app();
    storage.insert(&format!("{}/child.exe", SYSTEM_DIR), exe("child"));
    let (result_tx, mut results) = mpsc::unbounded_channel();
    let release = Arc::new(Notify::new());
    let done = Arc::clone(&release);

    let kernel = Kernel::builder()
        .with_storage(storage)
        .with_program("app", move |ctx: UserContext| {
            let done = Arc::clone(&done);
            async move {
                let handle = ctx.register_callback(double).await?;
                let info = CreateProcessInfo::new("child.exe").with_startup_info(json!({ "callback": handle }));
                ctx.create_process(info).await?;
                done.notified().await;
                anyhow::Ok(0)
            }
        })
        .with_program("child", move |ctx: UserContext| {
            let result_tx = result_tx.clone();
            async move {
                let handle: Handle = serde_json::from_value(ctx.startup().startup_info["callback"].clone())?;
                let value = ctx.invoke_callback(handle, vec![json!(21)]).await?;
                result_tx.send(value)?;
                anyhow::Ok(0)
            }
        })
        .build();

    let parent = kernel.create_process(CreateProcessInfo::new("app.exe")).unwrap();
    assert_eq!(results.recv().await.unwrap(), json!(42));

    release.notify_one();
    wait_exit(&parent).await;
    assert_eq!(kernel.process_count(), 0);
}

#[tokio::test]
async fn test_unknown_callback_yields_null() {
    let kernel = Kernel::builder().build();
    assert_eq!(kernel.callbacks().invoke(Handle(4321), vec![json!(1)]).await.unwrap(), Value::Null);
    assert_eq!(kernel.callbacks().register(77), None);
}
